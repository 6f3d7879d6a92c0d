//! Single-threaded readiness dispatcher.
//!
//! Sources are file descriptors, one-shot timers (timerfd), POSIX signals
//! (signalfd) and idle callbacks run once at the next dispatch. `dispatch`
//! reports which sources fired; routing the wakeup to the owning state
//! machine is the caller's job. All callbacks and all source owners live on
//! the loop thread.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use bitflags::bitflags;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use rustc_hash::FxHashMap;

use crate::listener::{ListenerId, Signal};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: u32 {
        const READABLE = 0x01;
        const WRITABLE = 0x02;
        const HANGUP   = 0x04;
        const ERROR    = 0x08;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SourceId(usize);

/// One fired source, as reported by `dispatch`.
#[derive(Debug)]
pub struct Wake {
    pub source: SourceId,
    pub mask: Readiness,
    /// Set for signal sources only.
    pub signal: Option<i32>,
}

enum SourceKind {
    /// Caller-owned descriptor; never closed by the loop.
    Fd(RawFd),
    Timer(OwnedFd),
    Signal { fd: OwnedFd, signum: i32 },
}

struct Source {
    kind: SourceKind,
}

impl Source {
    fn raw_fd(&self) -> RawFd {
        match &self.kind {
            SourceKind::Fd(fd) => *fd,
            SourceKind::Timer(fd) => fd.as_raw_fd(),
            SourceKind::Signal { fd, .. } => fd.as_raw_fd(),
        }
    }
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    sources: FxHashMap<usize, Source>,
    next_token: usize,
    idle: VecDeque<Box<dyn FnOnce()>>,
    /// Sources unregistered mid-pass; freed at the top of the next dispatch.
    destroy_list: Vec<Source>,
    destroy_signal: Signal<()>,
}

fn interest_for(mask: Readiness) -> Interest {
    let mut interest = None;
    if mask.contains(Readiness::READABLE) {
        interest = Some(Interest::READABLE);
    }
    if mask.contains(Readiness::WRITABLE) {
        interest = Some(match interest {
            Some(i) => i | Interest::WRITABLE,
            None => Interest::WRITABLE,
        });
    }
    // Hangup and error are always reported by epoll; an interest-less
    // registration still needs one bit for mio's sake.
    interest.unwrap_or(Interest::READABLE)
}

pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn set_nonblock(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        Ok(EventLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
            sources: FxHashMap::default(),
            next_token: 1,
            idle: VecDeque::new(),
            destroy_list: Vec::new(),
            destroy_signal: Signal::new(),
        })
    }

    fn insert(&mut self, source: Source, mask: Readiness) -> io::Result<SourceId> {
        let token = self.next_token;
        self.next_token += 1;
        let fd = source.raw_fd();
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(token), interest_for(mask))?;
        self.sources.insert(token, source);
        Ok(SourceId(token))
    }

    /// Register a caller-owned descriptor. The loop watches it but does not
    /// close it; `remove` only unregisters.
    pub fn add_fd(&mut self, fd: RawFd, mask: Readiness) -> io::Result<SourceId> {
        self.insert(
            Source {
                kind: SourceKind::Fd(fd),
            },
            mask,
        )
    }

    pub fn update_fd(&mut self, id: SourceId, mask: Readiness) -> io::Result<()> {
        let source = self
            .sources
            .get(&id.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown source"))?;
        let fd = source.raw_fd();
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(id.0), interest_for(mask))
    }

    /// Create a disarmed one-shot timer. Arm it with `timer_update`.
    pub fn add_timer(&mut self) -> io::Result<SourceId> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        self.insert(
            Source {
                kind: SourceKind::Timer(fd),
            },
            Readiness::READABLE,
        )
    }

    /// Arm (or with 0/0, disarm) a timer source, relative one-shot.
    pub fn timer_update(&mut self, id: SourceId, ms: i64, us: i64) -> io::Result<()> {
        let source = self
            .sources
            .get(&id.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown source"))?;
        let fd = source.raw_fd();
        let its = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: ms / 1000,
                tv_nsec: (ms % 1000) * 1_000_000 + us * 1000,
            },
        };
        if unsafe { libc::timerfd_settime(fd, 0, &its, std::ptr::null_mut()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Route a POSIX signal into the loop. The signal is blocked for the
    /// whole process from here on and delivered via the returned source.
    pub fn add_signal(&mut self, signum: i32) -> io::Result<SourceId> {
        unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, signum);
            let fd = libc::signalfd(-1, &mask, libc::SFD_CLOEXEC | libc::SFD_NONBLOCK);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            libc::sigprocmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut());
            let fd = OwnedFd::from_raw_fd(fd);
            self.insert(
                Source {
                    kind: SourceKind::Signal { fd, signum },
                },
                Readiness::READABLE,
            )
        }
    }

    /// Queue a callback to run once at the next dispatch.
    pub fn add_idle<F: FnOnce() + 'static>(&mut self, f: F) {
        self.idle.push_back(Box::new(f));
    }

    /// Unregister a source. The descriptor stops being watched immediately;
    /// timer/signal fds stay open until the current dispatch pass has
    /// drained, so a wake already collected for this source is harmless.
    pub fn remove(&mut self, id: SourceId) {
        if let Some(source) = self.sources.remove(&id.0) {
            let fd = source.raw_fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            self.destroy_list.push(source);
        }
    }

    pub fn add_destroy_listener<F: FnMut(&()) + 'static>(&mut self, f: F) -> ListenerId {
        self.destroy_signal.add(f)
    }

    fn run_idle(&mut self) {
        while let Some(cb) = self.idle.pop_front() {
            cb();
        }
    }

    /// One dispatch pass: idle, wait, collect ready sources, free removed
    /// sources, idle again. Returns the fired sources in readiness order.
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Wake>> {
        self.run_idle();
        self.destroy_list.clear();

        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut wakes = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            let token = event.token().0;
            let source = match self.sources.get(&token) {
                Some(s) => s,
                None => continue,
            };

            let mut mask = Readiness::empty();
            if event.is_readable() {
                mask |= Readiness::READABLE;
            }
            if event.is_writable() {
                mask |= Readiness::WRITABLE;
            }
            if event.is_read_closed() || event.is_write_closed() {
                mask |= Readiness::HANGUP;
            }
            if event.is_error() {
                mask |= Readiness::ERROR;
            }

            let signal = match &source.kind {
                SourceKind::Fd(_) => None,
                SourceKind::Timer(fd) => {
                    let mut expirations = 0u64;
                    unsafe {
                        libc::read(
                            fd.as_raw_fd(),
                            &mut expirations as *mut u64 as *mut libc::c_void,
                            mem::size_of::<u64>(),
                        );
                    }
                    None
                }
                SourceKind::Signal { fd, signum } => {
                    let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
                    unsafe {
                        libc::read(
                            fd.as_raw_fd(),
                            &mut info as *mut _ as *mut libc::c_void,
                            mem::size_of::<libc::signalfd_siginfo>(),
                        );
                    }
                    Some(*signum)
                }
            };

            wakes.push(Wake {
                source: SourceId(token),
                mask,
                signal,
            });
        }

        self.destroy_list.clear();
        self.run_idle();

        Ok(wakes)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let mut signal = mem::take(&mut self.destroy_signal);
        signal.emit(&());
    }
}
