//! Per-connection protocol state machine.
//!
//! Each connected peer owns a receive parser (two-phase: 8-byte length, then
//! payload), an egress queue of ready-to-send frames, pre-built send
//! templates for the result commands, and its capability bits. The agent
//! never touches compositor state; parsed commands go up, frames come back
//! down.

use std::collections::VecDeque;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace, warn};
use thiserror::Error;

use crate::event_loop::SourceId;
use crate::buffer::BufferId;
use crate::ipc;
use crate::protocol::{self, CmdKind, Message, ProtocolError, TxTemplate};
use crate::surface::SurfaceId;

/// Hard cap on one frame, matching the receive buffer of the reference
/// clients.
pub const MAX_FRAME_LEN: usize = 1 << 19;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClientCaps: u64 {
        /// Wants layout-change broadcasts.
        const NOTIFY_LAYOUT = 1 << 0;
        /// Wants hotplug notifications.
        const HPD = 1 << 1;
        /// May receive raw input events (still gated by `raw_input_en`).
        const RAW_INPUT = 1 << 2;
        /// May drive the mouse-cursor plane.
        const MC = 1 << 3;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

impl fmt::Debug for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkId({:#x})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Socket accepted, linkup-ack not on the wire yet.
    Connected,
    /// linkup-ack queued; waiting for the first command.
    Linked,
    /// Processing commands.
    Active,
    /// Destroy requested or socket broken; outstanding scanout references
    /// keep buffers alive until their natural completion.
    TeardownPending,
    /// All references dropped; the slot is reclaimed on the next idle pass.
    Gone,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("peer hung up")]
    Hangup,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Egress queue drained.
    Idle,
    /// Kernel buffer full; re-arm WRITABLE interest and retry.
    NeedWritable,
    /// Peer is gone; tear the client down.
    Broken,
}

enum RxPhase {
    Length,
    Payload,
}

struct RxState {
    phase: RxPhase,
    need: usize,
    got: usize,
    buf: Vec<u8>,
    fds: Vec<OwnedFd>,
}

impl RxState {
    fn new() -> RxState {
        RxState {
            phase: RxPhase::Length,
            need: 8,
            got: 0,
            buf: vec![0; 8],
            fds: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.phase = RxPhase::Length;
        self.need = 8;
        self.got = 0;
        self.buf.resize(8, 0);
    }
}

struct TxFrame {
    data: Vec<u8>,
    fds: Vec<OwnedFd>,
    sent: usize,
}

/// One pre-built frame per outbound result command.
struct TxTemplates {
    linkup: TxTemplate,
    surface_ack: TxTemplate,
    view_ack: TxTemplate,
    bo_ack: TxTemplate,
    bo_destroy_ack: TxTemplate,
    commit_ack: TxTemplate,
    bo_flipped: TxTemplate,
    bo_complete: TxTemplate,
    destroy_ack: TxTemplate,
    hpd: TxTemplate,
}

impl TxTemplates {
    fn new() -> TxTemplates {
        TxTemplates {
            linkup: TxTemplate::result(CmdKind::LinkupAck),
            surface_ack: TxTemplate::result(CmdKind::CreateSurfaceAck),
            view_ack: TxTemplate::result(CmdKind::CreateViewAck),
            bo_ack: TxTemplate::result(CmdKind::CreateBoAck),
            bo_destroy_ack: TxTemplate::result(CmdKind::DestroyBoAck),
            commit_ack: TxTemplate::result(CmdKind::CommitAck),
            bo_flipped: TxTemplate::result(CmdKind::BoFlipped),
            bo_complete: TxTemplate::result(CmdKind::BoComplete),
            destroy_ack: TxTemplate::result(CmdKind::DestroyAck),
            hpd: TxTemplate::result(CmdKind::Hpd),
        }
    }
}

pub struct ClientAgent {
    pub link: LinkId,
    sock: OwnedFd,
    pub source: SourceId,
    pub state: AgentState,
    rx: RxState,
    tx: VecDeque<TxFrame>,
    templates: TxTemplates,
    pub caps: ClientCaps,
    pub raw_input_en: bool,
    pub surfaces: Vec<SurfaceId>,
    pub buffers: Vec<BufferId>,
    /// destroy-ack queued; close once the egress queue drains.
    pub close_after_flush: bool,
    /// WRITABLE interest currently armed for this socket.
    pub armed_writable: bool,
}

impl ClientAgent {
    pub fn new(link: LinkId, sock: OwnedFd, source: SourceId) -> ClientAgent {
        ClientAgent {
            link,
            sock,
            source,
            state: AgentState::Connected,
            rx: RxState::new(),
            tx: VecDeque::new(),
            templates: TxTemplates::new(),
            caps: ClientCaps::empty(),
            raw_input_en: false,
            surfaces: Vec::new(),
            buffers: Vec::new(),
            close_after_flush: false,
            armed_writable: false,
        }
    }

    pub fn sock_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    pub fn wants_raw_input(&self) -> bool {
        self.caps.contains(ClientCaps::RAW_INPUT) && self.raw_input_en
    }

    pub fn alive(&self) -> bool {
        !matches!(self.state, AgentState::TeardownPending | AgentState::Gone)
    }

    /// Drain the socket; short reads keep partial state for the next
    /// readable wakeup. Returns complete commands with their out-of-band
    /// descriptors spliced in the order they arrived.
    pub fn handle_readable(&mut self) -> Result<Vec<(Message, Vec<OwnedFd>)>, AgentError> {
        let mut out = Vec::new();
        loop {
            let rx = &mut self.rx;
            let want = rx.need - rx.got;
            let n = match ipc::recv_with_fds(
                self.sock.as_raw_fd(),
                &mut rx.buf[rx.got..rx.got + want],
                &mut rx.fds,
            ) {
                Ok(0) => return Err(AgentError::Hangup),
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(AgentError::Io(e)),
            };
            rx.got += n;
            if rx.got < rx.need {
                continue;
            }

            match rx.phase {
                RxPhase::Length => {
                    let len = LittleEndian::read_u64(&rx.buf[..8]) as usize;
                    if len < 12 || len > MAX_FRAME_LEN {
                        return Err(AgentError::Protocol(ProtocolError::Truncated));
                    }
                    rx.phase = RxPhase::Payload;
                    rx.need = len;
                    rx.got = 0;
                    rx.buf.resize(len, 0);
                }
                RxPhase::Payload => {
                    let messages = protocol::decode(&rx.buf)?;
                    let fds = std::mem::take(&mut rx.fds);
                    let mut fds = Some(fds);
                    for msg in messages {
                        trace!("client {:?} rx {:?}", self.link, msg);
                        // Descriptors belong to the create-bo command when
                        // one is present in the frame.
                        let take = matches!(msg, Message::CreateBo(_));
                        let attached = if take {
                            fds.take().unwrap_or_default()
                        } else {
                            Vec::new()
                        };
                        out.push((msg, attached));
                    }
                    rx.reset();
                }
            }
        }
        Ok(out)
    }

    fn queue(&mut self, data: Vec<u8>, fds: Vec<OwnedFd>) {
        if !self.alive() && !self.close_after_flush {
            return;
        }
        self.tx.push_back(TxFrame { data, fds, sent: 0 });
    }

    /// Push queued frames out. `WouldBlock` leaves the remainder queued.
    pub fn flush(&mut self) -> FlushStatus {
        while let Some(frame) = self.tx.front_mut() {
            let fds: Vec<RawFd> = if frame.sent == 0 {
                frame.fds.iter().map(|fd| fd.as_raw_fd()).collect()
            } else {
                Vec::new()
            };
            match ipc::send_with_fds(self.sock.as_raw_fd(), &frame.data[frame.sent..], &fds) {
                Ok(n) => {
                    frame.sent += n;
                    if frame.sent >= frame.data.len() {
                        self.tx.pop_front();
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return FlushStatus::NeedWritable;
                }
                Err(e) => {
                    warn!("client {:?} send failed: {e}", self.link);
                    return FlushStatus::Broken;
                }
            }
        }
        FlushStatus::Idle
    }

    pub fn has_pending_tx(&self) -> bool {
        !self.tx.is_empty()
    }

    pub fn send_linkup(&mut self) {
        let frame = self.templates.linkup.fill(self.link.0);
        self.queue(frame, Vec::new());
        if self.state == AgentState::Connected {
            self.state = AgentState::Linked;
        }
    }

    pub fn send_surface_ack(&mut self, result: u64) {
        let frame = self.templates.surface_ack.fill(result);
        self.queue(frame, Vec::new());
    }

    pub fn send_view_ack(&mut self, result: u64) {
        let frame = self.templates.view_ack.fill(result);
        self.queue(frame, Vec::new());
    }

    /// The SHM pool descriptor rides along with a successful bo ack.
    pub fn send_bo_ack(&mut self, result: u64, fds: Vec<OwnedFd>) {
        let frame = self.templates.bo_ack.fill(result);
        self.queue(frame, fds);
    }

    pub fn send_bo_destroy_ack(&mut self, result: u64) {
        let frame = self.templates.bo_destroy_ack.fill(result);
        self.queue(frame, Vec::new());
    }

    pub fn send_commit_ack(&mut self, result: u64) {
        let frame = self.templates.commit_ack.fill(result);
        self.queue(frame, Vec::new());
    }

    pub fn send_bo_flipped(&mut self, bo: BufferId) {
        let frame = self.templates.bo_flipped.fill(bo.0);
        self.queue(frame, Vec::new());
    }

    pub fn send_bo_complete(&mut self, bo: BufferId) {
        let frame = self.templates.bo_complete.fill(bo.0);
        self.queue(frame, Vec::new());
    }

    pub fn send_destroy_ack(&mut self, result: u64) {
        self.close_after_flush = true;
        let frame = self.templates.destroy_ack.fill(result);
        self.queue(frame, Vec::new());
    }

    pub fn send_hpd(&mut self, info: u64) {
        let frame = self.templates.hpd.fill(info);
        self.queue(frame, Vec::new());
    }

    pub fn send_shell(&mut self, info: &protocol::ShellInfo) {
        let frame = protocol::encode(&Message::Shell(info.clone()));
        self.queue(frame, Vec::new());
    }

    pub fn send_raw_input(&mut self, events: &[protocol::RawInputEvent]) {
        let frame = protocol::encode(&Message::RawInput(events.to_vec()));
        self.queue(frame, Vec::new());
    }

    pub fn begin_teardown(&mut self) {
        if self.alive() {
            debug!("client {:?} entering teardown", self.link);
            self.state = AgentState::TeardownPending;
        }
    }
}

impl fmt::Debug for ClientAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientAgent")
            .field("link", &self.link)
            .field("state", &self.state)
            .field("caps", &self.caps)
            .field("surfaces", &self.surfaces.len())
            .field("buffers", &self.buffers.len())
            .field("tx_queued", &self.tx.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommitInfo;

    fn pair() -> (ClientAgent, OwnedFd) {
        let (server_side, client_side) = ipc::socketpair_stream().unwrap();
        let agent = ClientAgent::new(LinkId(0x1000), server_side, SourceId::default());
        (agent, client_side)
    }

    fn read_frames(fd: &OwnedFd) -> Vec<Message> {
        let mut buf = vec![0u8; 1 << 16];
        let mut fds = Vec::new();
        let mut collected = Vec::new();
        let mut pending: Vec<u8> = Vec::new();
        loop {
            match ipc::recv_with_fds(fd.as_raw_fd(), &mut buf, &mut fds) {
                Ok(0) => break,
                Ok(n) => pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("recv: {e}"),
            }
        }
        let mut off = 0;
        while pending.len() - off >= 8 {
            let len = LittleEndian::read_u64(&pending[off..off + 8]) as usize;
            let frame = &pending[off + 8..off + 8 + len];
            collected.extend(protocol::decode(frame).unwrap());
            off += 8 + len;
        }
        collected
    }

    #[test]
    fn linkup_then_acks_arrive_in_order() {
        let (mut agent, peer) = pair();
        agent.send_linkup();
        agent.send_surface_ack(5);
        agent.send_commit_ack(protocol::COMMIT_OK);
        assert_eq!(agent.flush(), FlushStatus::Idle);

        let msgs = read_frames(&peer);
        assert_eq!(
            msgs,
            vec![
                Message::LinkupAck(0x1000),
                Message::CreateSurfaceAck(5),
                Message::CommitAck(protocol::COMMIT_OK),
            ]
        );
        assert_eq!(agent.state, AgentState::Linked);
    }

    #[test]
    fn split_frame_reassembles() {
        let (mut agent, peer) = pair();
        let frame = protocol::encode(&Message::Commit(CommitInfo {
            bo_id: 9,
            ..CommitInfo::default()
        }));

        // Deliver the length prefix and payload in three slices; short reads
        // must keep partial state between wakeups.
        let mut msgs = Vec::new();
        for chunk in [&frame[..3], &frame[3..20], &frame[20..]] {
            ipc::send_with_fds(peer.as_raw_fd(), chunk, &[]).unwrap();
            msgs.extend(agent.handle_readable().unwrap());
        }
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0].0, Message::Commit(c) if c.bo_id == 9));
    }

    #[test]
    fn oversized_length_is_a_protocol_error() {
        let (mut agent, peer) = pair();
        let mut prefix = [0u8; 8];
        LittleEndian::write_u64(&mut prefix, (MAX_FRAME_LEN + 1) as u64);
        ipc::send_with_fds(peer.as_raw_fd(), &prefix, &[]).unwrap();
        assert!(matches!(
            agent.handle_readable(),
            Err(AgentError::Protocol(_))
        ));
    }

    #[test]
    fn hangup_is_reported() {
        let (mut agent, peer) = pair();
        drop(peer);
        assert!(matches!(agent.handle_readable(), Err(AgentError::Hangup)));
    }

    #[test]
    fn back_to_back_frames_drain_in_one_wakeup() {
        let (mut agent, peer) = pair();
        let a = protocol::encode(&Message::DestroyBo(1));
        let b = protocol::encode(&Message::DestroyBo(2));
        ipc::send_with_fds(peer.as_raw_fd(), &a, &[]).unwrap();
        ipc::send_with_fds(peer.as_raw_fd(), &b, &[]).unwrap();
        let msgs = agent.handle_readable().unwrap();
        let ids: Vec<_> = msgs
            .iter()
            .map(|(m, _)| match m {
                Message::DestroyBo(id) => *id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
