//! Central orchestrator.
//!
//! Owns the clients, the surface/view graph, every buffer object, the mouse
//! cursor and the desktop layout, and drives the repaint/scanout pipeline.
//! All work happens on the loop thread; the server routes socket, timer and
//! backend wakeups into the handlers here.

use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::time::Instant;

use log::{debug, info, trace, warn};
use rustc_hash::FxHashMap;

use crate::buffer::{Buffer, BufferId, BufferLayout, BufferStorage};
use crate::client_agent::{AgentError, AgentState, ClientAgent, ClientCaps, FlushStatus, LinkId};
use crate::config::Config;
use crate::cursor::CursorState;
use crate::error::RequestError;
use crate::event_loop::{EventLoop, Readiness, SourceId};
use crate::listener::ListenerId;
use crate::protocol::{
    BufferInfo, BufferType, CanvasLayout, CommitInfo, HpdInfo, LayoutMode, Message, Rect,
    RawInputEvent, ShellInfo, SurfaceInfo, ViewInfo, COMMIT_OK, COMMIT_REPLACE, RESULT_FAILURE,
};
use crate::renderer::{RenderElement, Renderer};
use crate::scanout::{
    CommitBatch, FbEntry, Mode, ModeFilter, ModeTiming, PlaneKind, ScanoutBackend, ScanoutEvent,
    ScanoutHandle,
};
use crate::shm::ShmPool;
use crate::surface::{PendingCommit, Surface, SurfaceId, View, ViewId, ViewStack};

const EV_REL: u16 = 0x02;
const EV_ABS: u16 = 0x03;

/// Delay between a commit and the repaint pass that latches it; commits
/// arriving within the window coalesce into one pass.
const REPAINT_DELAY_MS: i64 = 4;

/// One watchdog period; the atomic commit is retried until the total bound.
const WATCHDOG_TICK_MS: i64 = 100;
const WATCHDOG_BOUND_MS: u128 = 500;

/// Raw input records per outbound frame.
const RAW_INPUT_CHUNK: usize = 64;

/// Soft cap on buffer objects per client.
const BUFFER_QUOTA: usize = 64;

struct OutputState {
    pipe: usize,
    desktop: Rect,
    composition: ScanoutHandle,
    /// Buffers composited into the batch currently awaiting its flip.
    composited_pending: Vec<BufferId>,
    /// Buffers whose content the screen currently shows via composition.
    composited_current: Vec<BufferId>,
    pending_mode: Option<Mode>,
    repaint_needed: bool,
    /// Last submitted batch, kept for the watchdog retry.
    last_batch: Option<CommitBatch>,
    in_flight: bool,
    first_attempt: Option<Instant>,
}

pub struct Compositor {
    cfg: Config,
    backend: Box<dyn ScanoutBackend>,
    renderer: Box<dyn Renderer>,
    clients: FxHashMap<LinkId, ClientAgent>,
    surfaces: FxHashMap<SurfaceId, Surface>,
    views: FxHashMap<ViewId, View>,
    stack: ViewStack,
    buffers: FxHashMap<BufferId, Buffer>,
    handles: FxHashMap<ScanoutHandle, BufferId>,
    outputs: Vec<OutputState>,
    layout: CanvasLayout,
    cursor: CursorState,
    next_id: u64,
    next_seq: u64,
    repaint_timer: SourceId,
    repaint_scheduled: bool,
    watchdog_timer: SourceId,
    destroying: bool,
}

impl Compositor {
    pub fn new(
        cfg: &Config,
        mut backend: Box<dyn ScanoutBackend>,
        mut renderer: Box<dyn Renderer>,
        el: &mut EventLoop,
    ) -> std::io::Result<Compositor> {
        let mut outputs = Vec::with_capacity(backend.pipe_count());
        let mut rects = Vec::new();
        for pipe in 0..backend.pipe_count() {
            if backend.head(pipe).connected {
                backend
                    .enable(pipe, None)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            }
            let mode_rect = backend
                .current_mode(pipe)
                .map(|m| Rect::new(0, 0, m.width, m.height))
                .unwrap_or(Rect::new(0, 0, 1920, 1080));
            let composition = backend
                .import_composition(pipe)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            renderer
                .output_create(pipe, backend.composition_target(pipe))
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            outputs.push(OutputState {
                pipe,
                desktop: mode_rect,
                composition,
                composited_pending: Vec::new(),
                composited_current: Vec::new(),
                pending_mode: None,
                repaint_needed: false,
                last_batch: None,
                in_flight: false,
                first_attempt: None,
            });
            rects.push(mode_rect);
        }

        // Every head shows the same canvas until a layout command says
        // otherwise.
        let layout = CanvasLayout {
            mode: LayoutMode::Duplicated,
            rects,
        };

        let cursor = CursorState::new(cfg.seat, backend.as_mut())?;
        let repaint_timer = el.add_timer()?;
        let watchdog_timer = el.add_timer()?;

        info!(
            "compositor up: {} pipes, device {}",
            outputs.len(),
            cfg.device
        );

        Ok(Compositor {
            cfg: cfg.clone(),
            backend,
            renderer,
            clients: FxHashMap::default(),
            surfaces: FxHashMap::default(),
            views: FxHashMap::default(),
            stack: ViewStack::new(),
            buffers: FxHashMap::default(),
            handles: FxHashMap::default(),
            outputs,
            layout,
            cursor,
            next_id: 1,
            next_seq: 1,
            repaint_timer,
            repaint_scheduled: false,
            watchdog_timer,
            destroying: false,
        })
    }

    fn fresh_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn backend_fd(&self) -> RawFd {
        self.backend.event_fd()
    }

    pub fn repaint_timer(&self) -> SourceId {
        self.repaint_timer
    }

    pub fn watchdog_timer(&self) -> SourceId {
        self.watchdog_timer
    }

    pub fn current_layout(&self) -> &CanvasLayout {
        &self.layout
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn has_client(&self, link: LinkId) -> bool {
        self.clients.contains_key(&link)
    }

    pub fn add_mc_flip_listener<F: FnMut(&()) + 'static>(&mut self, f: F) -> ListenerId {
        self.cursor.add_flip_listener(f)
    }

    // ---- client lifecycle -------------------------------------------------

    /// Take over an accepted connection: register its socket, create the
    /// agent, and put the linkup-ack on the wire.
    pub fn add_client(
        &mut self,
        el: &mut EventLoop,
        sock: OwnedFd,
    ) -> std::io::Result<(LinkId, SourceId)> {
        let source = el.add_fd(sock.as_raw_fd(), Readiness::READABLE)?;
        let link = LinkId(0x10_0000 | self.fresh_id());
        let mut agent = ClientAgent::new(link, sock, source);
        agent.send_linkup();
        debug!("client {link:?} connected");
        self.clients.insert(link, agent);
        self.flush_client(el, link);
        Ok((link, source))
    }

    pub fn on_client_readable(&mut self, el: &mut EventLoop, link: LinkId) {
        let messages = match self.clients.get_mut(&link) {
            Some(agent) if agent.alive() => match agent.handle_readable() {
                Ok(messages) => messages,
                Err(AgentError::Hangup) => {
                    debug!("client {link:?} hung up");
                    self.teardown_client(el, link);
                    return;
                }
                Err(err) => {
                    // Protocol violation or socket error: disconnect this
                    // client, nobody else.
                    warn!("client {link:?} dropped: {err}");
                    self.teardown_client(el, link);
                    return;
                }
            },
            _ => return,
        };

        for (msg, fds) in messages {
            self.handle_message(el, link, msg, fds);
            if self
                .clients
                .get(&link)
                .map_or(true, |agent| !agent.alive())
            {
                break;
            }
        }
        self.flush_client(el, link);
    }

    pub fn on_client_writable(&mut self, el: &mut EventLoop, link: LinkId) {
        self.flush_client(el, link);
    }

    fn flush_client(&mut self, el: &mut EventLoop, link: LinkId) {
        let Some(agent) = self.clients.get_mut(&link) else {
            return;
        };
        match agent.flush() {
            FlushStatus::Idle => {
                if agent.armed_writable {
                    agent.armed_writable = false;
                    let _ = el.update_fd(agent.source, Readiness::READABLE);
                }
                if agent.close_after_flush {
                    self.teardown_client(el, link);
                }
            }
            FlushStatus::NeedWritable => {
                if !agent.armed_writable {
                    agent.armed_writable = true;
                    let _ =
                        el.update_fd(agent.source, Readiness::READABLE | Readiness::WRITABLE);
                }
            }
            FlushStatus::Broken => self.teardown_client(el, link),
        }
    }

    fn teardown_client(&mut self, el: &mut EventLoop, link: LinkId) {
        let (surfaces, buffers) = match self.clients.get_mut(&link) {
            Some(agent) if agent.state != AgentState::Gone => {
                agent.begin_teardown();
                el.remove(agent.source);
                (agent.surfaces.clone(), agent.buffers.clone())
            }
            _ => return,
        };

        for sid in surfaces {
            self.destroy_surface(sid);
        }
        for bid in buffers {
            self.destroy_or_defer_buffer(bid);
        }
        self.schedule_repaint(el);
        self.finalize_clients();
    }

    /// Reclaim teardown-pending clients whose last scanout reference is
    /// gone.
    fn finalize_clients(&mut self) {
        let done: Vec<LinkId> = self
            .clients
            .iter()
            .filter(|(_, agent)| {
                agent.state == AgentState::TeardownPending && agent.buffers.is_empty()
            })
            .map(|(link, _)| *link)
            .collect();
        for link in done {
            debug!("client {link:?} gone");
            self.clients.remove(&link);
        }
    }

    fn with_agent(&mut self, link: LinkId, f: impl FnOnce(&mut ClientAgent)) {
        if let Some(agent) = self.clients.get_mut(&link) {
            f(agent);
        }
    }

    // ---- command dispatch -------------------------------------------------

    fn handle_message(
        &mut self,
        el: &mut EventLoop,
        link: LinkId,
        msg: Message,
        fds: Vec<OwnedFd>,
    ) {
        if let Some(agent) = self.clients.get_mut(&link) {
            if agent.state == AgentState::Linked {
                agent.state = AgentState::Active;
            }
        }
        match msg {
            Message::CreateSurface(info) => self.handle_create_surface(link, info),
            Message::CreateView(info) => self.handle_create_view(el, link, info),
            Message::CreateBo(info) => self.handle_create_bo(link, info, fds),
            Message::DestroyBo(bo) => self.handle_destroy_bo(link, BufferId(bo)),
            Message::Commit(info) => self.handle_commit(el, link, info),
            Message::Destroy(_) => {
                self.with_agent(link, |agent| agent.send_destroy_ack(0));
            }
            Message::Shell(info) => self.handle_shell(el, link, info),
            other => {
                // Server-to-client kinds are protocol violations from a peer.
                warn!("client {link:?} sent server command {other:?}");
                self.teardown_client(el, link);
            }
        }
    }

    fn handle_create_surface(&mut self, link: LinkId, info: SurfaceInfo) {
        let sid = SurfaceId(self.fresh_id());
        let mut surface = Surface::new(sid, link, info.width, info.height);
        surface.is_opaque = info.is_opaque;
        surface.damage = info.damage;
        surface.opaque = info.opaque;
        self.surfaces.insert(sid, surface);
        self.with_agent(link, |agent| {
            agent.surfaces.push(sid);
            agent.send_surface_ack(sid.0);
        });
        trace!("client {link:?} surface {sid:?}");
    }

    /// The wire carries no surface reference; a view binds the client's
    /// oldest surface that has none yet, matching the one-view-per-surface
    /// usage of the reference clients.
    fn handle_create_view(&mut self, el: &mut EventLoop, link: LinkId, info: ViewInfo) {
        let target = self
            .clients
            .get(&link)
            .into_iter()
            .flat_map(|agent| agent.surfaces.iter())
            .find(|sid| {
                self.surfaces
                    .get(*sid)
                    .is_some_and(|s| s.views.is_empty())
            })
            .copied();

        let Some(sid) = target else {
            self.with_agent(link, |agent| agent.send_view_ack(RESULT_FAILURE));
            return;
        };

        let vid = ViewId(self.fresh_id());
        let seq = self.next_seq;
        self.next_seq += 1;
        let view = View {
            id: vid,
            surface: sid,
            area: info.area,
            zpos: 0,
            alpha: info.alpha,
            float_view: info.top_level,
            full_screen: info.full_screen,
            requested_mask: info.output_mask,
            primary_output: info.primary_output,
            visible_mask: 0,
            shown: false,
            plane: None,
            dirty: false,
            seq,
        };
        self.views.insert(vid, view);
        self.stack.insert(&mut self.views, vid);
        self.surfaces.get_mut(&sid).unwrap().views.push(vid);
        self.recompute_visibility();
        self.with_agent(link, |agent| agent.send_view_ack(vid.0));
        self.schedule_repaint(el);
        trace!("client {link:?} view {vid:?} on {sid:?}");
    }

    fn create_buffer(
        &mut self,
        link: LinkId,
        info: &BufferInfo,
        fds: Vec<OwnedFd>,
    ) -> Result<(BufferId, Vec<OwnedFd>), RequestError> {
        let quota_full = self
            .clients
            .get(&link)
            .is_some_and(|a| a.buffers.len() >= BUFFER_QUOTA);
        if quota_full {
            return Err(RequestError::QuotaExceeded);
        }

        let sid = SurfaceId(info.surface_id);
        if !self
            .surfaces
            .get(&sid)
            .is_some_and(|s| s.owner == link)
        {
            return Err(RequestError::NotOwned(info.surface_id));
        }

        let layout = BufferLayout::from_info(info);
        let bid = BufferId(self.fresh_id());

        let (storage, scanout, reply_fds) = match info.kind {
            BufferType::Shm => {
                // SHM content is composited; the format must be one the
                // renderer can sample.
                if !self.renderer.supports(layout.format) {
                    return Err(RequestError::UnsupportedFormat);
                }
                let name = format!("cube-{}-{:x}-{}", self.cfg.seat, link.0, bid.0);
                let pool = ShmPool::create(&name, layout.total_size())
                    .map_err(RequestError::ShmPool)?;
                let fd = pool
                    .fd()
                    .try_clone_to_owned()
                    .map_err(RequestError::ShmPool)?;
                (BufferStorage::Shm(pool), None, vec![fd])
            }
            BufferType::Dma => {
                let borrowed: Vec<_> = fds.iter().map(|fd| fd.as_fd()).collect();
                let handle = self.backend.import_dmabuf(&layout, &borrowed)?;
                (BufferStorage::Dma { fds }, Some(handle), Vec::new())
            }
        };

        let buffer = Buffer::new(bid, link, sid, layout, storage, scanout);
        if let Some(handle) = scanout {
            self.handles.insert(handle, bid);
        }
        self.buffers.insert(bid, buffer);
        Ok((bid, reply_fds))
    }

    fn handle_create_bo(&mut self, link: LinkId, info: BufferInfo, fds: Vec<OwnedFd>) {
        match self.create_buffer(link, &info, fds) {
            Ok((bid, reply_fds)) => {
                self.with_agent(link, |agent| {
                    agent.buffers.push(bid);
                    agent.send_bo_ack(bid.0, reply_fds);
                });
                trace!("client {link:?} bo {bid:?} ({:?})", info.kind);
            }
            Err(err) => {
                debug!("client {link:?} create-bo failed: {err}");
                self.with_agent(link, |agent| agent.send_bo_ack(RESULT_FAILURE, Vec::new()));
            }
        }
    }

    fn handle_destroy_bo(&mut self, link: LinkId, bid: BufferId) {
        let owned = self
            .buffers
            .get(&bid)
            .is_some_and(|b| b.owner == link);
        if !owned {
            self.with_agent(link, |agent| agent.send_bo_destroy_ack(RESULT_FAILURE));
            return;
        }
        self.destroy_or_defer_buffer(bid);
        self.with_agent(link, |agent| agent.send_bo_destroy_ack(0));
    }

    fn handle_commit(&mut self, el: &mut EventLoop, link: LinkId, info: CommitInfo) {
        let bid = BufferId(info.bo_id);
        let sid = match self.buffers.get(&bid) {
            Some(buffer) if buffer.owner == link => {
                if buffer.in_sync_window {
                    debug!("client {link:?} commit inside sync window");
                    self.with_agent(link, |agent| agent.send_commit_ack(RESULT_FAILURE));
                    return;
                }
                buffer.surface
            }
            _ => {
                self.with_agent(link, |agent| agent.send_commit_ack(RESULT_FAILURE));
                return;
            }
        };

        // A commit racing an earlier uncommitted one for the same surface
        // supersedes it: the replaced buffer goes back to the client now.
        let replaced = self
            .surfaces
            .get_mut(&sid)
            .and_then(|surface| surface.pending.replace(PendingCommit { buffer: bid, info }));
        if let Some(old) = replaced {
            self.with_agent(link, |agent| agent.send_commit_ack(COMMIT_REPLACE));
            if old.buffer != bid {
                self.release_unflipped(old.buffer);
            }
        }

        self.schedule_repaint(el);
    }

    fn handle_shell(&mut self, el: &mut EventLoop, link: LinkId, info: ShellInfo) {
        match info {
            ShellInfo::DebugSetting(flags) => {
                info!("debug levels set to {flags:?}");
                self.cfg.debug = flags;
            }
            ShellInfo::CanvasLayoutSetting(layout) => {
                if let Err(reason) = self.apply_layout(el, layout) {
                    warn!("client {link:?} layout rejected: {reason}");
                }
            }
            ShellInfo::CanvasLayoutQuery => {
                let reply = ShellInfo::CanvasLayoutSetting(self.layout.clone());
                self.with_agent(link, |agent| agent.send_shell(&reply));
            }
            ShellInfo::Capability { cap, raw_input_en } => {
                self.with_agent(link, |agent| {
                    agent.caps = ClientCaps::from_bits_truncate(cap);
                    agent.raw_input_en = raw_input_en;
                });
                debug!("client {link:?} caps {cap:#x} raw_input {raw_input_en}");
            }
        }
    }

    // ---- layout & hotplug -------------------------------------------------

    fn apply_layout(
        &mut self,
        el: &mut EventLoop,
        layout: CanvasLayout,
    ) -> Result<(), &'static str> {
        if layout.rects.len() != self.outputs.len() {
            return Err("rectangle count does not match pipe count");
        }
        for rect in &layout.rects {
            if rect.x < 0 || rect.y < 0 {
                return Err("negative desktop coordinates");
            }
            if rect.is_empty() {
                return Err("zero-area desktop rectangle");
            }
        }

        for (output, rect) in self.outputs.iter_mut().zip(&layout.rects) {
            output.desktop = *rect;
        }
        self.layout = layout;
        self.recompute_visibility();
        self.schedule_repaint(el);

        // Everyone subscribed sees the new table in one update.
        let update = ShellInfo::CanvasLayoutSetting(self.layout.clone());
        let subscribed: Vec<LinkId> = self
            .clients
            .iter()
            .filter(|(_, a)| a.alive() && a.caps.contains(ClientCaps::NOTIFY_LAYOUT))
            .map(|(l, _)| *l)
            .collect();
        for link in subscribed {
            self.with_agent(link, |agent| agent.send_shell(&update));
            self.flush_client(el, link);
        }
        info!("desktop layout changed: {:?}", self.layout.rects);
        Ok(())
    }

    fn dispatch_hotplug(&mut self, el: &mut EventLoop, pipe: usize) {
        let connected = self.backend.head(pipe).connected;
        info!(
            "head {} ({}) {}",
            pipe,
            self.backend.head(pipe).connector_name,
            if connected { "connected" } else { "disconnected" }
        );

        if connected {
            if let Err(e) = self.backend.enable(pipe, None) {
                warn!("re-enable pipe {pipe} failed: {e}");
            }
        } else {
            self.backend.disable(pipe);
            // Composited content of this output is displaced wholesale.
            let shown: Vec<BufferId> =
                std::mem::take(&mut self.outputs[pipe].composited_current);
            let bit = 1u32 << pipe;
            for bid in shown {
                if let Some(buffer) = self.buffers.get_mut(&bid) {
                    buffer.shown_on &= !bit;
                }
                self.maybe_release(bid);
            }
            self.outputs[pipe].in_flight = false;
            self.outputs[pipe].last_batch = None;
        }

        self.recompute_visibility();
        self.schedule_repaint(el);

        let mut info = HpdInfo::default();
        for p in 0..self.outputs.len() {
            info.set(p, self.backend.head(p).connected);
        }
        let subscribed: Vec<LinkId> = self
            .clients
            .iter()
            .filter(|(_, a)| a.alive() && a.caps.contains(ClientCaps::HPD))
            .map(|(l, _)| *l)
            .collect();
        for link in subscribed {
            self.with_agent(link, |agent| agent.send_hpd(info.0));
            self.flush_client(el, link);
        }
    }

    /// Per-output visibility: the view intersects the output's desktop
    /// rectangle, the output is up, and the client asked for it.
    fn recompute_visibility(&mut self) {
        for view in self.views.values_mut() {
            let mut mask = 0u32;
            for (i, output) in self.outputs.iter().enumerate() {
                if !self.backend.is_enabled(output.pipe) || !self.backend.head(output.pipe).connected
                {
                    continue;
                }
                if view.requested_mask & (1 << i) == 0 {
                    continue;
                }
                if view.area.intersect(&output.desktop).is_some() {
                    mask |= 1 << i;
                }
            }
            if mask != view.visible_mask {
                view.visible_mask = mask;
                view.dirty = true;
            }
        }
    }

    // ---- commit latching & repaint ----------------------------------------

    pub fn schedule_repaint(&mut self, el: &mut EventLoop) {
        if self.repaint_scheduled {
            return;
        }
        self.repaint_scheduled = true;
        let _ = el.timer_update(self.repaint_timer, REPAINT_DELAY_MS, 0);
    }

    pub fn on_repaint_tick(&mut self, el: &mut EventLoop) {
        self.repaint_scheduled = false;
        self.latch_commits(el);
        self.build_scanout(el);
    }

    fn latch_commits(&mut self, el: &mut EventLoop) {
        let pending: Vec<SurfaceId> = self
            .surfaces
            .iter()
            .filter(|(_, s)| s.pending.is_some())
            .map(|(id, _)| *id)
            .collect();

        for sid in pending {
            let Some(commit) = self.surfaces.get_mut(&sid).and_then(|s| s.pending.take()) else {
                continue;
            };
            self.latch_one(el, sid, commit);
        }
    }

    fn latch_one(&mut self, el: &mut EventLoop, sid: SurfaceId, commit: PendingCommit) {
        let PendingCommit { buffer: bid, info } = commit;
        let Some(owner) = self.buffers.get(&bid).map(|b| b.owner) else {
            return;
        };

        // Update the view(s) bound to this surface.
        let view_ids: Vec<ViewId> = self
            .surfaces
            .get(&sid)
            .map(|s| s.views.clone())
            .unwrap_or_default();
        for vid in &view_ids {
            if let Some(view) = self.views.get_mut(vid) {
                view.area = Rect::new(info.view_x, info.view_y, info.view_width, info.view_height);
                view.shown = info.shown;
                view.dirty = true;
            }
            match info.delta_z {
                1 => self.stack.bring_to_top(&mut self.views, *vid),
                -1 => self.stack.fall(&mut self.views, *vid),
                _ => {}
            }
        }

        // Displace the previous content.
        let old = self.surfaces.get_mut(&sid).and_then(|s| {
            let old = s.current.replace(bid);
            s.damage = info.bo_damage;
            old
        });
        if let Some(old_bid) = old {
            if old_bid != bid {
                let unflipped = self
                    .buffers
                    .get(&old_bid)
                    .is_some_and(|b| b.needs_flip_event);
                if unflipped {
                    // Latched but never presented: pretend it flipped so the
                    // owner's state machine can move on.
                    self.retire_unflipped(old_bid);
                }
            }
        }

        self.recompute_visibility();

        let visible: u32 = view_ids
            .iter()
            .filter_map(|vid| self.views.get(vid))
            .filter(|v| v.shown)
            .map(|v| v.visible_mask)
            .fold(0, |a, m| a | m);

        // Texture upload for composited content; a zero-area damage
        // rectangle means the pixels are unchanged and only geometry or
        // stacking moved.
        let is_shm = self
            .buffers
            .get(&bid)
            .is_some_and(|b| matches!(b.storage, BufferStorage::Shm(_)));
        if is_shm && visible != 0 && !info.bo_damage.is_empty() {
            let buffer = self.buffers.get(&bid).unwrap();
            let layout = buffer.layout.clone();
            if let BufferStorage::Shm(pool) = &buffer.storage {
                if let Err(e) = self.renderer.attach_shm(sid, &layout, pool.bytes()) {
                    warn!("attach of {bid:?} failed: {e}");
                }
                self.renderer.flush_damage(sid, info.bo_damage);
                if let Some(surface) = self.surfaces.get_mut(&sid) {
                    surface.renderer_attached = true;
                }
            }
        }

        if let Some(buffer) = self.buffers.get_mut(&bid) {
            buffer.dirty = visible;
            buffer.needs_flip_event = true;
            buffer.complete_sent = false;
        }

        self.with_agent(owner, |agent| agent.send_commit_ack(COMMIT_OK));

        if visible == 0 {
            // Off-canvas or hidden: the dirty bitmap is already empty, so
            // flip and release collapse into the latch.
            if let Some(buffer) = self.buffers.get_mut(&bid) {
                buffer.needs_flip_event = false;
            }
            self.with_agent(owner, |agent| agent.send_bo_flipped(bid));
            self.maybe_release(bid);
        } else {
            for i in 0..self.outputs.len() {
                if visible & (1 << i) != 0 {
                    self.outputs[i].repaint_needed = true;
                }
            }
        }
        self.flush_client(el, owner);
    }

    /// Walk the stack top-down and hand eligible views a hardware plane:
    /// opaque content, full constant alpha, uncut by the output edge, and a
    /// format the plane scans out. Everything else is composited.
    fn assign_planes(&mut self, output_index: usize) -> (Vec<FbEntry>, Vec<(ViewId, BufferId)>) {
        let output = &self.outputs[output_index];
        let desktop = output.desktop;
        let pipe = output.pipe;
        let bit = 1u32 << output_index;

        let planes = self.backend.planes(pipe).to_vec();
        let mut free_overlays: Vec<usize> = planes
            .iter()
            .enumerate()
            .filter(|(_, p)| p.kind == PlaneKind::Overlay)
            .map(|(i, _)| i)
            .collect();

        let mut direct = Vec::new();
        let mut composited = Vec::new();

        let ordered: Vec<ViewId> = self.stack.top_down().collect();
        for vid in ordered {
            let Some(view) = self.views.get(&vid) else {
                continue;
            };
            if !view.shown || view.visible_mask & bit == 0 {
                continue;
            }
            let Some(surface) = self.surfaces.get(&view.surface) else {
                continue;
            };
            let Some(bid) = surface.current else {
                continue;
            };
            let Some(buffer) = self.buffers.get(&bid) else {
                continue;
            };

            let scanout_direct = buffer.scanout.is_some()
                && view.alpha >= 1.0
                && (surface.is_opaque || !buffer.layout.format.has_alpha())
                && desktop.contains(&view.area)
                && !free_overlays.is_empty()
                && planes[free_overlays[0]].supports(buffer.layout.format);

            if scanout_direct {
                let plane = free_overlays.remove(0);
                direct.push(FbEntry {
                    handle: buffer.scanout.unwrap(),
                    output: output_index,
                    plane,
                    src: Rect::new(0, 0, buffer.layout.width, buffer.layout.height),
                    dst: Rect::new(
                        view.area.x - desktop.x,
                        view.area.y - desktop.y,
                        view.area.w,
                        view.area.h,
                    ),
                    zpos: planes[plane].zpos as i32,
                });
                self.views.get_mut(&vid).unwrap().plane = Some((output_index, plane));
            } else {
                composited.push((vid, bid));
                self.views.get_mut(&vid).unwrap().plane = None;
            }
        }
        (direct, composited)
    }

    fn build_scanout(&mut self, el: &mut EventLoop) {
        for output_index in 0..self.outputs.len() {
            let pipe = self.outputs[output_index].pipe;
            if !self.outputs[output_index].repaint_needed {
                continue;
            }
            if !self.backend.is_enabled(pipe) || !self.backend.head(pipe).connected {
                // Suppressed while the head is down; the commit succeeded on
                // the connected pipes already.
                self.outputs[output_index].repaint_needed = false;
                continue;
            }

            let (mut entries, composited) = self.assign_planes(output_index);

            // Composition always owns the primary plane, bottom-most.
            let elements: Vec<RenderElement> = composited
                .iter()
                .rev() // stack walk was top-down; compose bottom-up
                .filter_map(|(vid, _)| {
                    let view = self.views.get(vid)?;
                    let desktop = self.outputs[output_index].desktop;
                    Some(RenderElement {
                        surface: view.surface,
                        dst: Rect::new(
                            view.area.x - desktop.x,
                            view.area.y - desktop.y,
                            view.area.w,
                            view.area.h,
                        ),
                        alpha: view.alpha,
                    })
                })
                .collect();
            if let Err(e) = self.renderer.repaint_output(pipe, &elements) {
                warn!("renderer repaint on pipe {pipe} failed: {e}");
            }

            let output = &mut self.outputs[output_index];
            let mode_rect = Rect::new(0, 0, output.desktop.w, output.desktop.h);
            entries.push(FbEntry {
                handle: output.composition,
                output: output_index,
                plane: 0,
                src: mode_rect,
                dst: mode_rect,
                zpos: 0,
            });
            output.composited_pending = composited.iter().map(|(_, bid)| *bid).collect();

            // The cursor rides its own plane, top-most.
            let cursor_plane = self
                .backend
                .planes(pipe)
                .iter()
                .position(|p| p.kind == PlaneKind::Cursor);
            if let Some(plane) = cursor_plane {
                let desktop = self.outputs[output_index].desktop;
                if let Some(entry) = self.cursor.plane_entry(output_index, plane, &desktop) {
                    entries.push(entry);
                }
            }

            let mut batch = CommitBatch {
                entries,
                modesets: Vec::new(),
            };
            if let Some(mode) = self.outputs[output_index].pending_mode.take() {
                batch.modesets.push((pipe, mode));
            }

            match self.backend.commit(batch.clone()) {
                Ok(()) => {
                    let output = &mut self.outputs[output_index];
                    output.repaint_needed = false;
                    output.in_flight = true;
                    output.last_batch = Some(batch);
                    if output.first_attempt.is_none() {
                        output.first_attempt = Some(Instant::now());
                    }
                    self.cursor.programmed();
                    let _ = el.timer_update(self.watchdog_timer, WATCHDOG_TICK_MS, 0);
                }
                Err(e) => {
                    // Kernel rejected the request; the watchdog retries
                    // until its bound, the previous frame stays up.
                    warn!("scanout commit on pipe {pipe} failed: {e}");
                    let output = &mut self.outputs[output_index];
                    output.last_batch = Some(batch);
                    output.in_flight = false;
                    if output.first_attempt.is_none() {
                        output.first_attempt = Some(Instant::now());
                    }
                    let _ = el.timer_update(self.watchdog_timer, WATCHDOG_TICK_MS, 0);
                }
            }
        }
    }

    pub fn on_watchdog_tick(&mut self, el: &mut EventLoop) {
        let mut rearm = false;
        for output_index in 0..self.outputs.len() {
            let Some(started) = self.outputs[output_index].first_attempt else {
                continue;
            };
            if self.outputs[output_index].in_flight {
                if started.elapsed().as_millis() <= WATCHDOG_BOUND_MS {
                    rearm = true;
                    continue;
                }
            }

            if started.elapsed().as_millis() > WATCHDOG_BOUND_MS {
                warn!("commit watchdog expired on output {output_index}");
                self.fail_pending_commit(el, output_index);
                continue;
            }

            // Not in flight and inside the bound: retry the batch.
            if let Some(batch) = self.outputs[output_index].last_batch.clone() {
                match self.backend.commit(batch) {
                    Ok(()) => {
                        self.outputs[output_index].in_flight = true;
                    }
                    Err(e) => {
                        debug!("watchdog retry failed on output {output_index}: {e}");
                    }
                }
                rearm = true;
            }
        }
        if rearm {
            let _ = el.timer_update(self.watchdog_timer, WATCHDOG_TICK_MS, 0);
        }
    }

    /// The bound ran out: answer the owners with a failure ack, release the
    /// never-presented buffers, and leave the previous frame on screen.
    fn fail_pending_commit(&mut self, el: &mut EventLoop, output_index: usize) {
        let bit = 1u32 << output_index;
        let stuck: Vec<(BufferId, LinkId)> = self
            .buffers
            .iter()
            .filter(|(_, b)| b.dirty & bit != 0)
            .map(|(id, b)| (*id, b.owner))
            .collect();
        for (bid, owner) in stuck {
            if let Some(buffer) = self.buffers.get_mut(&bid) {
                buffer.dirty &= !bit;
                if buffer.dirty == 0 {
                    buffer.needs_flip_event = false;
                }
            }
            self.with_agent(owner, |agent| agent.send_commit_ack(RESULT_FAILURE));
            self.maybe_release(bid);
            self.flush_client(el, owner);
        }
        let output = &mut self.outputs[output_index];
        output.in_flight = false;
        output.first_attempt = None;
        output.last_batch = None;
        output.composited_pending.clear();
    }

    // ---- backend events ---------------------------------------------------

    pub fn on_backend_wakeup(&mut self, el: &mut EventLoop) {
        for event in self.backend.drain_events() {
            match event {
                ScanoutEvent::Flip { output, handle } => self.on_flip(el, output, handle),
                ScanoutEvent::Complete { output, handle } => self.on_complete(el, output, handle),
                ScanoutEvent::HeadChanged { pipe } => self.dispatch_hotplug(el, pipe),
            }
        }
        if self.destroying {
            self.finalize_clients();
        }
    }

    fn on_flip(&mut self, el: &mut EventLoop, output_index: usize, handle: ScanoutHandle) {
        let bit = 1u32 << output_index;

        if self.outputs[output_index].in_flight {
            self.outputs[output_index].in_flight = false;
            self.outputs[output_index].first_attempt = None;
        }

        self.cursor.on_flip(handle);

        if handle == self.outputs[output_index].composition {
            // One composition flip covers every buffer composited into it.
            let fresh = std::mem::take(&mut self.outputs[output_index].composited_pending);
            let previous =
                std::mem::replace(&mut self.outputs[output_index].composited_current, fresh.clone());
            for bid in &fresh {
                self.buffer_flipped_on(el, *bid, bit);
            }
            for bid in previous {
                if !fresh.contains(&bid) {
                    if let Some(buffer) = self.buffers.get_mut(&bid) {
                        buffer.shown_on &= !bit;
                    }
                    self.maybe_release(bid);
                }
            }
            return;
        }

        if let Some(bid) = self.handles.get(&handle).copied() {
            self.buffer_flipped_on(el, bid, bit);
        }
    }

    fn buffer_flipped_on(&mut self, el: &mut EventLoop, bid: BufferId, bit: u32) {
        let Some(buffer) = self.buffers.get_mut(&bid) else {
            return;
        };
        buffer.dirty &= !bit;
        buffer.shown_on |= bit;
        let owner = buffer.owner;
        // One flip event per commit, once the last target output confirms.
        if buffer.dirty == 0 && buffer.needs_flip_event {
            buffer.needs_flip_event = false;
            self.with_agent(owner, |agent| agent.send_bo_flipped(bid));
            self.flush_client(el, owner);
        }
    }

    fn on_complete(&mut self, el: &mut EventLoop, output_index: usize, handle: ScanoutHandle) {
        let bit = 1u32 << output_index;
        let Some(bid) = self.handles.get(&handle).copied() else {
            return;
        };
        if let Some(buffer) = self.buffers.get_mut(&bid) {
            buffer.shown_on &= !bit;
        }
        let owner = self.buffers.get(&bid).map(|b| b.owner);
        self.maybe_release(bid);
        if let Some(owner) = owner {
            self.flush_client(el, owner);
        }
    }

    // ---- buffer release & destruction -------------------------------------

    /// Send `bo-complete` once nothing references the buffer, then finish a
    /// deferred destroy if one is queued.
    fn maybe_release(&mut self, bid: BufferId) {
        let Some(buffer) = self.buffers.get_mut(&bid) else {
            return;
        };
        if !buffer.releasable() {
            return;
        }
        buffer.complete_sent = true;
        let owner = buffer.owner;
        let destroy = buffer.pending_destroy;
        self.with_agent(owner, |agent| agent.send_bo_complete(bid));
        if destroy {
            self.destroy_buffer(bid);
        }
    }

    /// Supersession path: the buffer never reached the screen, return it
    /// without a flip event.
    fn release_unflipped(&mut self, bid: BufferId) {
        if let Some(buffer) = self.buffers.get_mut(&bid) {
            buffer.dirty = 0;
            buffer.needs_flip_event = false;
            buffer.complete_sent = false;
        }
        self.maybe_release(bid);
    }

    /// Latched-but-never-presented content displaced by a newer latch:
    /// report the flip it will never get, then release.
    fn retire_unflipped(&mut self, bid: BufferId) {
        let owner = match self.buffers.get_mut(&bid) {
            Some(buffer) => {
                buffer.dirty = 0;
                buffer.needs_flip_event = false;
                buffer.complete_sent = false;
                buffer.owner
            }
            None => return,
        };
        self.with_agent(owner, |agent| agent.send_bo_flipped(bid));
        self.maybe_release(bid);
    }

    fn destroy_or_defer_buffer(&mut self, bid: BufferId) {
        let in_scanout = match self.buffers.get_mut(&bid) {
            Some(buffer) => {
                if buffer.in_scanout() {
                    buffer.pending_destroy = true;
                    true
                } else {
                    false
                }
            }
            None => return,
        };
        if !in_scanout {
            self.destroy_buffer(bid);
        }
    }

    fn destroy_buffer(&mut self, bid: BufferId) {
        let Some(buffer) = self.buffers.remove(&bid) else {
            return;
        };
        if let Some(handle) = buffer.scanout {
            self.handles.remove(&handle);
            self.backend.release_buffer(handle);
        }
        // Detach from the owning surface so stale content is not recommitted.
        if let Some(surface) = self.surfaces.get_mut(&buffer.surface) {
            if surface.current == Some(bid) {
                surface.current = None;
            }
            if surface
                .pending
                .as_ref()
                .is_some_and(|p| p.buffer == bid)
            {
                surface.pending = None;
            }
        }
        self.with_agent(buffer.owner, |agent| {
            agent.buffers.retain(|b| *b != bid);
        });
        trace!("buffer {bid:?} destroyed");
        self.finalize_clients();
    }

    fn destroy_surface(&mut self, sid: SurfaceId) {
        let Some(surface) = self.surfaces.remove(&sid) else {
            return;
        };
        for vid in surface.views {
            self.stack.remove(&mut self.views, vid);
            self.views.remove(&vid);
        }
        if surface.renderer_attached {
            self.renderer.drop_surface(sid);
        }
        self.with_agent(surface.owner, |agent| {
            agent.surfaces.retain(|s| *s != sid);
        });
        for output in &mut self.outputs {
            output.repaint_needed = true;
        }
    }

    // ---- raw input & cursor -----------------------------------------------

    /// Feed raw HID events in: move the cursor, then fan the batch out to
    /// clients that both hold the capability and enabled the stream.
    pub fn inject_raw_input(&mut self, el: &mut EventLoop, events: &[RawInputEvent]) {
        let canvas = self.layout.canvas();
        let accel = self.cfg.mouse_accel;
        let mut moved = false;
        for event in events {
            match event.kind {
                EV_REL => {
                    let (_, _, dx, dy) = event.pos();
                    self.cursor.offset_by(dx as i32, dy as i32, accel, &canvas);
                    moved = true;
                }
                EV_ABS => {
                    let (x, y, _, _) = event.pos();
                    let touch = self
                        .outputs
                        .get(self.cfg.touch_pipe)
                        .map(|o| o.desktop)
                        .unwrap_or(canvas);
                    self.cursor
                        .move_to(touch.x + x as i32, touch.y + y as i32, &canvas);
                    moved = true;
                }
                _ => {}
            }
        }
        if moved {
            for output in &mut self.outputs {
                output.repaint_needed = true;
            }
            self.schedule_repaint(el);
        }

        let eligible: Vec<LinkId> = self
            .clients
            .iter()
            .filter(|(_, a)| a.alive() && a.wants_raw_input())
            .map(|(l, _)| *l)
            .collect();
        for link in eligible {
            for chunk in events.chunks(RAW_INPUT_CHUNK) {
                self.with_agent(link, |agent| agent.send_raw_input(chunk));
            }
            self.flush_client(el, link);
        }
    }

    pub fn set_mouse_cursor(
        &mut self,
        el: &mut EventLoop,
        data: &[u8],
        width: u32,
        height: u32,
        stride: u32,
        hot_x: i32,
        hot_y: i32,
    ) -> std::io::Result<()> {
        self.cursor.set_image(data, width, height, stride, hot_x, hot_y)?;
        for output in &mut self.outputs {
            output.repaint_needed = true;
        }
        self.schedule_repaint(el);
        Ok(())
    }

    pub fn hide_mouse_cursor(&mut self, el: &mut EventLoop) {
        self.cursor.hide();
        for output in &mut self.outputs {
            output.repaint_needed = true;
        }
        self.schedule_repaint(el);
    }

    pub fn show_mouse_cursor(&mut self, el: &mut EventLoop) {
        self.cursor.show();
        for output in &mut self.outputs {
            output.repaint_needed = true;
        }
        self.schedule_repaint(el);
    }

    // ---- head queries -----------------------------------------------------

    pub fn head_connected(&self, pipe: usize) -> bool {
        self.backend.head(pipe).connected
    }

    pub fn connector_name(&self, pipe: usize) -> &str {
        &self.backend.head(pipe).connector_name
    }

    pub fn monitor_name(&self, pipe: usize) -> &str {
        &self.backend.head(pipe).monitor_name
    }

    /// Raw EDID blob of the connected monitor, passed through opaque.
    pub fn retrieve_edid(&self, pipe: usize) -> Option<&[u8]> {
        let head = self.backend.head(pipe);
        if head.connected && !head.edid.is_empty() {
            Some(&head.edid)
        } else {
            None
        }
    }

    // ---- dma-buf cpu sync -------------------------------------------------

    /// Bracket for client cpu writes to a mapped cachable DMA-BUF. While the
    /// window is open, commits of this buffer are refused.
    pub fn buffer_sync_window(&mut self, link: LinkId, bo: BufferId, open: bool) -> bool {
        match self.buffers.get_mut(&bo) {
            Some(buffer) if buffer.owner == link => {
                buffer.in_sync_window = open;
                true
            }
            _ => false,
        }
    }

    // ---- modes ------------------------------------------------------------

    pub fn enumerate_timings(&self, pipe: usize, filter: Option<&ModeFilter>) -> Vec<Mode> {
        self.backend.enumerate_modes(pipe, filter)
    }

    pub fn current_timing(&self, pipe: usize) -> Option<&Mode> {
        self.backend.current_mode(pipe)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_custom_timing(
        &mut self,
        pipe: usize,
        clock_khz: u32,
        width: u32,
        height: u32,
        vrefresh_mhz: u32,
        timing: ModeTiming,
        name: &str,
    ) -> Result<Mode, crate::scanout::ScanoutError> {
        self.backend
            .create_custom_mode(pipe, clock_khz, width, height, vrefresh_mhz, timing, name)
    }

    /// Asynchronous: the mode rides along with the next scanout commit.
    pub fn switch_timing(&mut self, el: &mut EventLoop, pipe: usize, mode: Mode) {
        if let Some(output) = self.outputs.iter_mut().find(|o| o.pipe == pipe) {
            output.pending_mode = Some(mode);
            output.repaint_needed = true;
        }
        self.schedule_repaint(el);
    }

    // ---- teardown ---------------------------------------------------------

    /// Begin shutdown: stop scanning out and wait for outstanding buffer
    /// references. Returns true when everything has drained; the caller
    /// retries from a short timer otherwise.
    pub fn prepare_destroy(&mut self) -> bool {
        if !self.destroying {
            self.destroying = true;
            for pipe in 0..self.backend.pipe_count() {
                self.backend.disable(pipe);
            }
        }
        // Completes for disabled pipes arrive through the backend fd; once
        // they do, nothing holds a scanout reference.
        let busy = self.buffers.values().any(|b| b.in_scanout());
        !busy
    }
}
