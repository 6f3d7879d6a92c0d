//! Process wiring: listening socket, signal handling, event routing.
//!
//! The server owns the event loop and the compositor and routes every wakeup
//! to its handler. Shutdown is two-phase: signals flip the exit flag, then
//! compositor teardown is retried from a short timer until the last scanout
//! reference drains.

use std::os::fd::{AsRawFd, OwnedFd};

use log::{debug, info, warn};
use rustc_hash::FxHashMap;

use crate::compositor::Compositor;
use crate::client_agent::LinkId;
use crate::config::Config;
use crate::error::ServerError;
use crate::event_loop::{set_nonblock, EventLoop, Readiness, SourceId, Wake};
use crate::ipc;
use crate::renderer::SoftwareRenderer;
use crate::scanout::{self, PipelineConfig};

/// Default head/output/plane reservation, one pipeline per head.
pub const PIPELINES: [PipelineConfig; 2] = [
    PipelineConfig {
        head_index: 0,
        output_index: 0,
        primary_plane_index: 0,
        cursor_plane_index: 1,
    },
    PipelineConfig {
        head_index: 1,
        output_index: 1,
        primary_plane_index: 0,
        cursor_plane_index: 1,
    },
];

/// Retry interval for deferred compositor destruction.
const DESTROY_RETRY_MS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Listen,
    Client(LinkId),
    Backend,
    Repaint,
    Watchdog,
    Stop,
    DestroyRetry,
}

pub struct Server {
    el: EventLoop,
    comp: Compositor,
    listen: OwnedFd,
    routes: FxHashMap<SourceId, Route>,
    destroy_timer: SourceId,
    exit: bool,
    stopping: bool,
}

impl Server {
    pub fn new(cfg: &Config) -> Result<Server, ServerError> {
        let mut el = EventLoop::new()?;

        let backend = scanout::create(&cfg.device, &PIPELINES)?;
        let renderer = Box::new(SoftwareRenderer::new());
        let comp = Compositor::new(cfg, backend, renderer, &mut el)?;

        let listen = ipc::socket_cloexec()?;
        set_nonblock(listen.as_raw_fd())?;
        let path = cfg.socket_path();
        ipc::bind_listen(&listen, &path).map_err(|source| ServerError::SocketBind {
            path: path.display().to_string(),
            source,
        })?;
        info!("listening on {}", path.display());

        let mut routes = FxHashMap::default();
        let listen_source = el.add_fd(listen.as_raw_fd(), Readiness::READABLE)?;
        routes.insert(listen_source, Route::Listen);

        let backend_source = el.add_fd(comp.backend_fd(), Readiness::READABLE)?;
        routes.insert(backend_source, Route::Backend);
        routes.insert(comp.repaint_timer(), Route::Repaint);
        routes.insert(comp.watchdog_timer(), Route::Watchdog);

        for signum in [libc::SIGINT, libc::SIGTERM] {
            let source = el.add_signal(signum)?;
            routes.insert(source, Route::Stop);
        }

        let destroy_timer = el.add_timer()?;
        routes.insert(destroy_timer, Route::DestroyRetry);

        Ok(Server {
            el,
            comp,
            listen,
            routes,
            destroy_timer,
            exit: false,
            stopping: false,
        })
    }

    pub fn run(&mut self) -> Result<(), ServerError> {
        while !self.exit {
            let wakes = self.el.dispatch(None)?;
            for wake in wakes {
                self.handle_wake(wake);
            }
        }
        info!("server stopped");
        Ok(())
    }

    fn handle_wake(&mut self, wake: Wake) {
        let Some(route) = self.routes.get(&wake.source).copied() else {
            return;
        };
        match route {
            Route::Listen => self.accept_clients(),
            Route::Client(link) => {
                if wake
                    .mask
                    .intersects(Readiness::READABLE | Readiness::HANGUP | Readiness::ERROR)
                {
                    self.comp.on_client_readable(&mut self.el, link);
                }
                if wake.mask.contains(Readiness::WRITABLE) {
                    self.comp.on_client_writable(&mut self.el, link);
                }
                if !self.comp.has_client(link) {
                    self.routes.remove(&wake.source);
                }
            }
            Route::Backend => self.comp.on_backend_wakeup(&mut self.el),
            Route::Repaint => self.comp.on_repaint_tick(&mut self.el),
            Route::Watchdog => self.comp.on_watchdog_tick(&mut self.el),
            Route::Stop => {
                if let Some(signum) = wake.signal {
                    info!("received signal {signum}, exiting");
                }
                self.begin_stop();
            }
            Route::DestroyRetry => self.try_finish_stop(),
        }
    }

    fn accept_clients(&mut self) {
        loop {
            let sock = match ipc::accept_cloexec(self.listen.as_raw_fd()) {
                Ok(sock) => sock,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            };
            match self.comp.add_client(&mut self.el, sock) {
                Ok((link, source)) => {
                    self.routes.insert(source, Route::Client(link));
                }
                Err(e) => warn!("client setup failed: {e}"),
            }
        }
    }

    fn begin_stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        self.try_finish_stop();
    }

    fn try_finish_stop(&mut self) {
        if !self.stopping {
            return;
        }
        if self.comp.prepare_destroy() {
            self.exit = true;
        } else {
            debug!("scanout still draining, retrying destroy");
            let _ = self.el.timer_update(self.destroy_timer, DESTROY_RETRY_MS, 0);
        }
    }

    pub fn stop(&mut self) {
        self.begin_stop();
    }
}
