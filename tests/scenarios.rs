//! End-to-end scenarios against a real server on a unix socket, backed by
//! the headless scanout backend.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};

use cube_server::client_agent::ClientCaps;
use cube_server::config::Config;
use cube_server::ipc;
use cube_server::protocol::{
    self, BufferInfo, BufferType, CanvasLayout, CommitInfo, LayoutMode, Message, PixelFormat,
    Rect, ShellInfo, SurfaceInfo, ViewInfo, COMMIT_OK, COMMIT_REPLACE, RESULT_FAILURE,
};
use cube_server::server::Server;

fn unique_seat() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    let base = std::process::id() % 10_000;
    50_000 + base * 10 + NEXT.fetch_add(1, Ordering::SeqCst)
}

fn spawn_server() -> PathBuf {
    let cfg = Config {
        seat: unique_seat(),
        device: "headless".to_string(),
        ..Config::default()
    };
    let path = cfg.socket_path();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut server = Server::new(&cfg).expect("server start");
        tx.send(()).unwrap();
        let _ = server.run();
    });
    rx.recv().expect("server came up");
    path
}

struct TestClient {
    sock: OwnedFd,
    inbox: VecDeque<Message>,
    fds: Vec<OwnedFd>,
    pending: Vec<u8>,
    hangup: bool,
}

impl TestClient {
    fn connect(path: &Path) -> TestClient {
        let mut last = None;
        for _ in 0..100 {
            match ipc::connect(path) {
                Ok(sock) => {
                    return TestClient {
                        sock,
                        inbox: VecDeque::new(),
                        fds: Vec::new(),
                        pending: Vec::new(),
                        hangup: false,
                    }
                }
                Err(e) => {
                    last = Some(e);
                    thread::sleep(Duration::from_millis(20));
                }
            }
        }
        panic!("could not connect to {}: {:?}", path.display(), last);
    }

    fn send(&self, msg: &Message) {
        let frame = protocol::encode(msg);
        let mut off = 0;
        while off < frame.len() {
            match ipc::send_with_fds(self.sock.as_raw_fd(), &frame[off..], &[]) {
                Ok(n) => off += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("send: {e}"),
            }
        }
    }

    fn pump(&mut self) {
        let mut buf = vec![0u8; 1 << 16];
        loop {
            match ipc::recv_with_fds(self.sock.as_raw_fd(), &mut buf, &mut self.fds) {
                Ok(0) => {
                    self.hangup = true;
                    break;
                }
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("recv: {e}"),
            }
        }
        while self.pending.len() >= 8 {
            let len = LittleEndian::read_u64(&self.pending[..8]) as usize;
            if self.pending.len() < 8 + len {
                break;
            }
            let frame: Vec<u8> = self.pending.drain(..8 + len).collect();
            self.inbox
                .extend(protocol::decode(&frame[8..]).expect("well-formed server frame"));
        }
    }

    fn next_msg(&mut self) -> Message {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            if let Some(msg) = self.inbox.pop_front() {
                return msg;
            }
            if Instant::now() > deadline {
                panic!("timed out waiting for a message");
            }
            self.pump();
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Wait until `want` arrives, returning everything seen before it.
    fn wait_for(&mut self, want: &Message) -> Vec<Message> {
        let mut seen = Vec::new();
        loop {
            let msg = self.next_msg();
            if &msg == want {
                return seen;
            }
            seen.push(msg);
        }
    }

    fn wait_hangup(&mut self) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            self.pump();
            if self.hangup {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn linkup(&mut self) -> u64 {
        match self.next_msg() {
            Message::LinkupAck(link) => link,
            other => panic!("expected linkup-ack, got {other:?}"),
        }
    }

    fn create_surface(&mut self) -> u64 {
        self.send(&Message::CreateSurface(SurfaceInfo {
            surface_id: 0,
            is_opaque: true,
            damage: Rect::new(0, 0, 1920, 1080),
            width: 1920,
            height: 1080,
            opaque: Rect::new(0, 0, 1920, 1080),
        }));
        match self.next_msg() {
            Message::CreateSurfaceAck(id) => {
                assert_ne!(id, RESULT_FAILURE);
                id
            }
            other => panic!("expected surface ack, got {other:?}"),
        }
    }

    fn create_view(&mut self) -> u64 {
        self.send(&Message::CreateView(ViewInfo {
            view_id: 0,
            full_screen: true,
            top_level: false,
            area: Rect::new(0, 0, 1920, 1080),
            alpha: 1.0,
            output_mask: !0,
            primary_output: 0,
        }));
        match self.next_msg() {
            Message::CreateViewAck(id) => {
                assert_ne!(id, RESULT_FAILURE);
                id
            }
            other => panic!("expected view ack, got {other:?}"),
        }
    }

    fn create_shm_bo(&mut self, surface_id: u64, name: &str) -> u64 {
        self.send(&Message::CreateBo(BufferInfo {
            format: PixelFormat::Argb8888,
            kind: BufferType::Shm,
            shm_name: name.to_string(),
            width: 1920,
            height: 1080,
            strides: [1920 * 4, 0, 0, 0],
            offsets: [0; 4],
            sizes: [1920 * 4 * 1080, 0, 0, 0],
            planes: 1,
            surface_id,
        }));
        match self.next_msg() {
            Message::CreateBoAck(id) => {
                assert_ne!(id, RESULT_FAILURE);
                id
            }
            other => panic!("expected bo ack, got {other:?}"),
        }
    }

    fn commit(&self, bo: u64) {
        self.send(&Message::Commit(CommitInfo {
            bo_id: bo,
            bo_damage: Rect::new(0, 0, 1920, 1080),
            shown: true,
            view_x: 0,
            view_y: 0,
            view_hot_x: 0,
            view_hot_y: 0,
            view_width: 1920,
            view_height: 1080,
            delta_z: 0,
        }));
    }

    fn set_caps(&self, caps: ClientCaps, raw_input_en: bool) {
        self.send(&Message::Shell(ShellInfo::Capability {
            cap: caps.bits(),
            raw_input_en,
        }));
    }
}

#[test]
fn scenario_create_display_commit() {
    let path = spawn_server();
    let mut client = TestClient::connect(&path);

    let link = client.linkup();
    assert_ne!(link, 0);

    let sid = client.create_surface();
    let vid = client.create_view();
    assert_ne!(sid, vid);

    let bo = client.create_shm_bo(sid, "scenario-a");
    // The pool descriptor travels with the ack.
    assert_eq!(client.fds.len(), 1);

    client.commit(bo);
    match client.next_msg() {
        Message::CommitAck(v) => assert_eq!(v, COMMIT_OK),
        other => panic!("expected commit ack, got {other:?}"),
    }
    let before_flip = client.wait_for(&Message::BoFlipped(bo));
    assert!(before_flip.is_empty(), "unexpected traffic {before_flip:?}");
}

#[test]
fn scenario_replace_before_flip() {
    let path = spawn_server();
    let mut client = TestClient::connect(&path);
    client.linkup();
    let sid = client.create_surface();
    client.create_view();
    let b1 = client.create_shm_bo(sid, "replace-1");
    let b2 = client.create_shm_bo(sid, "replace-2");

    client.commit(b1);
    client.commit(b2);

    let earlier = client.wait_for(&Message::BoFlipped(b2));
    let acks: Vec<u64> = earlier
        .iter()
        .filter_map(|m| match m {
            Message::CommitAck(v) => Some(*v),
            _ => None,
        })
        .collect();
    assert_eq!(acks, vec![COMMIT_REPLACE, COMMIT_OK]);
    assert!(
        earlier.contains(&Message::BoComplete(b1)),
        "first buffer released immediately: {earlier:?}"
    );
    assert!(!earlier.contains(&Message::BoFlipped(b1)));
}

#[test]
fn scenario_layout_duplicate_to_extend() {
    let path = spawn_server();
    let mut client = TestClient::connect(&path);
    client.linkup();
    client.set_caps(ClientCaps::NOTIFY_LAYOUT, false);

    let wanted = vec![
        Rect::new(0, 0, 1920, 1080),
        Rect::new(1920, 0, 1920, 1080),
    ];
    client.send(&Message::Shell(ShellInfo::CanvasLayoutSetting(
        CanvasLayout {
            mode: LayoutMode::Extended,
            rects: wanted.clone(),
        },
    )));

    match client.next_msg() {
        Message::Shell(ShellInfo::CanvasLayoutSetting(layout)) => {
            assert_eq!(layout.rects, wanted);
            assert_eq!(layout.canvas().w, 3840);
        }
        other => panic!("expected layout-changed, got {other:?}"),
    }
}

#[test]
fn scenario_layout_query_answers_current_table() {
    let path = spawn_server();
    let mut client = TestClient::connect(&path);
    client.linkup();

    client.send(&Message::Shell(ShellInfo::CanvasLayoutQuery));
    match client.next_msg() {
        Message::Shell(ShellInfo::CanvasLayoutSetting(layout)) => {
            assert_eq!(layout.mode, LayoutMode::Duplicated);
            assert_eq!(layout.rects.len(), 2);
        }
        other => panic!("expected layout reply, got {other:?}"),
    }
}

#[test]
fn scenario_destroy_bo_during_scanout() {
    let path = spawn_server();
    let mut client = TestClient::connect(&path);
    client.linkup();
    let sid = client.create_surface();
    client.create_view();
    let b1 = client.create_shm_bo(sid, "destroy-1");

    client.commit(b1);
    client.wait_for(&Message::BoFlipped(b1));

    // The buffer is being scanned out; destruction must defer.
    client.send(&Message::DestroyBo(b1));
    match client.next_msg() {
        Message::DestroyBoAck(v) => assert_eq!(v, 0),
        other => panic!("expected destroy-bo ack, got {other:?}"),
    }

    let b2 = client.create_shm_bo(sid, "destroy-2");
    client.commit(b2);
    let earlier = client.wait_for(&Message::BoComplete(b1));
    assert!(
        earlier.contains(&Message::BoFlipped(b2)),
        "successor flips before the old buffer is freed: {earlier:?}"
    );
}

#[test]
fn scenario_malformed_frame_disconnects_only_sender() {
    let path = spawn_server();
    let mut bad = TestClient::connect(&path);
    let mut good = TestClient::connect(&path);
    bad.linkup();
    good.linkup();

    // Outer TLV declares more bytes than the frame carries.
    let mut frame = protocol::encode(&Message::DestroyBo(7));
    let short = frame.len() - 4;
    frame.truncate(short);
    LittleEndian::write_u64(&mut frame[..8], (short - 8) as u64);
    ipc::send_with_fds(bad.sock.as_raw_fd(), &frame, &[]).unwrap();

    assert!(bad.wait_hangup(), "server should drop the bad client");

    // The well-behaved client still gets service.
    let sid = good.create_surface();
    assert_ne!(sid, 0);
}

#[test]
fn responses_arrive_in_request_order() {
    let path = spawn_server();
    let mut client = TestClient::connect(&path);
    client.linkup();

    for _ in 0..8 {
        client.send(&Message::CreateSurface(SurfaceInfo {
            surface_id: 0,
            is_opaque: false,
            damage: Rect::new(0, 0, 64, 64),
            width: 64,
            height: 64,
            opaque: Rect::default(),
        }));
    }

    let mut ids = Vec::new();
    for _ in 0..8 {
        match client.next_msg() {
            Message::CreateSurfaceAck(id) => ids.push(id),
            other => panic!("expected surface ack, got {other:?}"),
        }
    }
    // Monotonic server-side allocation means in-order acks carry
    // strictly increasing ids.
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "{ids:?}");
}

#[test]
fn disconnect_is_quiet_for_the_server() {
    let path = spawn_server();
    let mut client = TestClient::connect(&path);
    client.linkup();
    let sid = client.create_surface();
    client.create_view();
    let bo = client.create_shm_bo(sid, "quiet");
    client.commit(bo);
    drop(client);

    // The server keeps serving new clients after a mid-commit disconnect.
    let mut second = TestClient::connect(&path);
    second.linkup();
    let sid = second.create_surface();
    assert_ne!(sid, 0);
}
