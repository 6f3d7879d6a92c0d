//! Timer-driven scanout backend.
//!
//! Stands in for a kernel-mode-setting device: two virtual heads, a vblank
//! tick from a timerfd, and the same flip/complete event ordering a real
//! atomic backend delivers. Used when the server runs with
//! `--device headless` and by the test suite.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use log::debug;
use rustc_hash::FxHashMap;

use super::{
    CommitBatch, CompositionTarget, FbEntry, HeadInfo, Mode, ModeFilter, ModeTiming,
    NativeSurface, PipelineConfig, PlaneInfo, PlaneKind, ScanoutBackend, ScanoutError,
    ScanoutEvent, ScanoutHandle,
};
use crate::buffer::BufferLayout;
use crate::protocol::PixelFormat;

const REFRESH_INTERVAL_US: i64 = 16_667;

/// Shared knob for toggling virtual connector state; picked up at the next
/// vblank tick and reported as `HeadChanged`.
#[derive(Clone)]
pub struct HotplugHandle(Rc<RefCell<Vec<bool>>>);

impl HotplugHandle {
    pub fn set_connected(&self, pipe: usize, connected: bool) {
        if let Some(slot) = self.0.borrow_mut().get_mut(pipe) {
            *slot = connected;
        }
    }
}

enum Imported {
    Dma(BufferLayout),
    Shm(BufferLayout),
    Composition(usize),
}

impl Imported {
    /// Source bounds for commit validation; composition targets track their
    /// output's mode instead.
    fn dimensions(&self) -> Option<(u32, u32)> {
        match self {
            Imported::Dma(layout) | Imported::Shm(layout) => Some((layout.width, layout.height)),
            Imported::Composition(_) => None,
        }
    }
}

struct Pipe {
    head: HeadInfo,
    planes: Vec<PlaneInfo>,
    modes: Vec<Mode>,
    custom_modes: Vec<Mode>,
    enabled: bool,
    current_mode: Option<Mode>,
    pending_mode: Option<Mode>,
    /// Entries queued by the last commit, latched at the next vblank.
    pending: Option<Vec<FbEntry>>,
    presenting: Vec<ScanoutHandle>,
    composition: NativeSurface,
    composition_handle: Option<ScanoutHandle>,
}

pub struct HeadlessScanout {
    pipes: Vec<Pipe>,
    timer: OwnedFd,
    next_handle: u64,
    imports: FxHashMap<u64, Imported>,
    events: VecDeque<ScanoutEvent>,
    hotplug: HotplugHandle,
    seen_connected: Vec<bool>,
}

fn mode_1080p() -> Mode {
    Mode {
        width: 1920,
        height: 1080,
        vrefresh_mhz: 60_000,
        clock_khz: 148_500,
        timing: ModeTiming {
            hsync_start: 2008,
            hsync_end: 2052,
            htotal: 2200,
            hskew: 0,
            vsync_start: 1084,
            vsync_end: 1089,
            vtotal: 1125,
            vscan: 0,
            interlaced: false,
            pos_hsync: true,
            pos_vsync: true,
        },
        preferred: true,
        custom: false,
        name: "1920x1080".to_string(),
    }
}

fn mode_720p() -> Mode {
    Mode {
        width: 1280,
        height: 720,
        vrefresh_mhz: 60_000,
        clock_khz: 74_250,
        timing: ModeTiming {
            hsync_start: 1390,
            hsync_end: 1430,
            htotal: 1650,
            hskew: 0,
            vsync_start: 725,
            vsync_end: 730,
            vtotal: 750,
            vscan: 0,
            interlaced: false,
            pos_hsync: true,
            pos_vsync: true,
        },
        preferred: false,
        custom: false,
        name: "1280x720".to_string(),
    }
}

/// A 128-byte stub EDID: valid header, vendor "HDL", zeroed descriptors.
fn stub_edid(serial: u8) -> Vec<u8> {
    let mut edid = vec![0u8; 128];
    edid[..8].copy_from_slice(&[0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00]);
    edid[8] = 0x22;
    edid[9] = 0x0c;
    edid[12] = serial;
    let sum: u8 = edid[..127].iter().fold(0u8, |a, b| a.wrapping_add(*b));
    edid[127] = 0u8.wrapping_sub(sum);
    edid
}

fn composition_for(mode: &Mode) -> CompositionTarget {
    CompositionTarget {
        width: mode.width,
        height: mode.height,
        stride: mode.width * 4,
        format: PixelFormat::Xrgb8888,
        pixels: vec![0; (mode.width * mode.height * 4) as usize],
    }
}

impl HeadlessScanout {
    pub fn new(cfgs: &[PipelineConfig]) -> Result<HeadlessScanout, ScanoutError> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
            )
        };
        if fd < 0 {
            return Err(ScanoutError::DeviceOpen {
                path: "headless".to_string(),
                reason: io::Error::last_os_error().to_string(),
            });
        }
        let timer = unsafe { OwnedFd::from_raw_fd(fd) };
        let its = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: REFRESH_INTERVAL_US * 1000,
            },
            it_value: libc::timespec {
                tv_sec: 0,
                tv_nsec: REFRESH_INTERVAL_US * 1000,
            },
        };
        if unsafe { libc::timerfd_settime(timer.as_raw_fd(), 0, &its, std::ptr::null_mut()) } < 0 {
            return Err(ScanoutError::DeviceOpen {
                path: "headless".to_string(),
                reason: io::Error::last_os_error().to_string(),
            });
        }

        let mut pipes = Vec::with_capacity(cfgs.len());
        for (i, _cfg) in cfgs.iter().enumerate() {
            let preferred = mode_1080p();
            let planes = vec![
                PlaneInfo {
                    kind: PlaneKind::Primary,
                    zpos: 0,
                    formats: vec![
                        PixelFormat::Xrgb8888,
                        PixelFormat::Argb8888,
                        PixelFormat::Rgb888,
                        PixelFormat::Rgb565,
                    ],
                },
                PlaneInfo {
                    kind: PlaneKind::Cursor,
                    zpos: 255,
                    formats: vec![PixelFormat::Argb8888],
                },
                PlaneInfo {
                    kind: PlaneKind::Overlay,
                    zpos: 1,
                    formats: vec![
                        PixelFormat::Argb8888,
                        PixelFormat::Xrgb8888,
                        PixelFormat::Nv12,
                        PixelFormat::Nv16,
                    ],
                },
            ];
            pipes.push(Pipe {
                head: HeadInfo {
                    connected: true,
                    connector_name: format!("Virtual-{}", i + 1),
                    monitor_name: format!("Headless {}", i + 1),
                    edid: stub_edid(i as u8 + 1),
                },
                planes,
                modes: vec![preferred.clone(), mode_720p()],
                custom_modes: Vec::new(),
                enabled: false,
                current_mode: None,
                pending_mode: None,
                pending: None,
                presenting: Vec::new(),
                composition: Rc::new(RefCell::new(composition_for(&preferred))),
                composition_handle: None,
            });
        }

        let connected = vec![true; pipes.len()];
        Ok(HeadlessScanout {
            pipes,
            timer,
            next_handle: 1,
            imports: FxHashMap::default(),
            events: VecDeque::new(),
            hotplug: HotplugHandle(Rc::new(RefCell::new(connected.clone()))),
            seen_connected: connected,
        })
    }

    pub fn hotplug_handle(&self) -> HotplugHandle {
        self.hotplug.clone()
    }

    fn pipe(&self, pipe: usize) -> Result<&Pipe, ScanoutError> {
        self.pipes.get(pipe).ok_or(ScanoutError::InvalidPipe(pipe))
    }

    fn pipe_mut(&mut self, pipe: usize) -> Result<&mut Pipe, ScanoutError> {
        self.pipes
            .get_mut(pipe)
            .ok_or(ScanoutError::InvalidPipe(pipe))
    }

    fn alloc_handle(&mut self) -> ScanoutHandle {
        let h = ScanoutHandle(self.next_handle);
        self.next_handle += 1;
        h
    }

    fn scanout_supports(format: PixelFormat) -> bool {
        matches!(
            format,
            PixelFormat::Argb8888
                | PixelFormat::Xrgb8888
                | PixelFormat::Rgb888
                | PixelFormat::Rgb565
                | PixelFormat::Nv12
                | PixelFormat::Nv16
        )
    }

    fn vblank(&mut self) {
        // Pick up hotplug toggles first so head state is settled before any
        // flips are reported.
        let wanted = self.hotplug.0.borrow().clone();
        for (i, connected) in wanted.iter().enumerate() {
            if self.seen_connected[i] != *connected {
                self.seen_connected[i] = *connected;
                self.pipes[i].head.connected = *connected;
                self.events.push_back(ScanoutEvent::HeadChanged { pipe: i });
            }
        }

        for (index, pipe) in self.pipes.iter_mut().enumerate() {
            if let Some(mode) = pipe.pending_mode.take() {
                debug!(
                    "headless: pipe {index} modeset to {}x{}",
                    mode.width, mode.height
                );
                *pipe.composition.borrow_mut() = composition_for(&mode);
                pipe.current_mode = Some(mode);
            }

            if !pipe.enabled {
                continue;
            }
            let Some(entries) = pipe.pending.take() else {
                continue;
            };

            let now_presenting: Vec<ScanoutHandle> = entries.iter().map(|e| e.handle).collect();
            for handle in &now_presenting {
                self.events.push_back(ScanoutEvent::Flip {
                    output: index,
                    handle: *handle,
                });
            }
            for old in &pipe.presenting {
                if !now_presenting.contains(old) {
                    self.events.push_back(ScanoutEvent::Complete {
                        output: index,
                        handle: *old,
                    });
                }
            }
            pipe.presenting = now_presenting;
        }
    }
}

impl ScanoutBackend for HeadlessScanout {
    fn pipe_count(&self) -> usize {
        self.pipes.len()
    }

    fn head(&self, pipe: usize) -> &HeadInfo {
        &self.pipes[pipe].head
    }

    fn planes(&self, pipe: usize) -> &[PlaneInfo] {
        &self.pipes[pipe].planes
    }

    fn enumerate_modes(&self, pipe: usize, filter: Option<&ModeFilter>) -> Vec<Mode> {
        let Ok(p) = self.pipe(pipe) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for m in p.modes.iter().chain(p.custom_modes.iter()) {
            if m.preferred || filter.map_or(true, |f| f.matches(m)) {
                out.push(m.clone());
            }
        }
        out.sort_by_key(|m| !m.preferred);
        out
    }

    fn current_mode(&self, pipe: usize) -> Option<&Mode> {
        self.pipes.get(pipe)?.current_mode.as_ref()
    }

    fn create_custom_mode(
        &mut self,
        pipe: usize,
        clock_khz: u32,
        width: u32,
        height: u32,
        vrefresh_mhz: u32,
        timing: ModeTiming,
        name: &str,
    ) -> Result<Mode, ScanoutError> {
        let p = self.pipe_mut(pipe)?;
        let mode = Mode {
            width,
            height,
            vrefresh_mhz,
            clock_khz,
            timing,
            preferred: false,
            custom: true,
            name: name.to_string(),
        };
        p.custom_modes.push(mode.clone());
        Ok(mode)
    }

    fn switch_mode(&mut self, pipe: usize, mode: &Mode) -> Result<(), ScanoutError> {
        let p = self.pipe_mut(pipe)?;
        if p.pending.is_some() {
            return Err(ScanoutError::Busy);
        }
        p.pending_mode = Some(mode.clone());
        Ok(())
    }

    fn enable(&mut self, pipe: usize, mode: Option<&Mode>) -> Result<(), ScanoutError> {
        let p = self.pipe_mut(pipe)?;
        let mode = mode
            .cloned()
            .or_else(|| p.current_mode.clone())
            .or_else(|| p.modes.iter().find(|m| m.preferred).cloned())
            .ok_or(ScanoutError::CommitRejected)?;
        *p.composition.borrow_mut() = composition_for(&mode);
        p.current_mode = Some(mode);
        p.enabled = true;
        Ok(())
    }

    fn disable(&mut self, pipe: usize) {
        let Ok(p) = self.pipe_mut(pipe) else {
            return;
        };
        p.enabled = false;
        p.pending = None;
        let displaced = mem::take(&mut p.presenting);
        for handle in displaced {
            self.events
                .push_back(ScanoutEvent::Complete { output: pipe, handle });
        }
    }

    fn is_enabled(&self, pipe: usize) -> bool {
        self.pipes.get(pipe).is_some_and(|p| p.enabled)
    }

    fn import_dmabuf(
        &mut self,
        layout: &BufferLayout,
        fds: &[BorrowedFd],
    ) -> Result<ScanoutHandle, ScanoutError> {
        if !Self::scanout_supports(layout.format) {
            return Err(ScanoutError::UnsupportedFormat);
        }
        if fds.is_empty() || fds.len() > 4 || fds.len() > layout.planes {
            return Err(ScanoutError::Import(format!(
                "{} fds for {} planes",
                fds.len(),
                layout.planes
            )));
        }
        let handle = self.alloc_handle();
        self.imports.insert(handle.0, Imported::Dma(layout.clone()));
        Ok(handle)
    }

    fn import_shm(
        &mut self,
        layout: &BufferLayout,
        _fd: BorrowedFd,
    ) -> Result<ScanoutHandle, ScanoutError> {
        if !Self::scanout_supports(layout.format) {
            return Err(ScanoutError::UnsupportedFormat);
        }
        let handle = self.alloc_handle();
        self.imports.insert(handle.0, Imported::Shm(layout.clone()));
        Ok(handle)
    }

    fn import_composition(&mut self, pipe: usize) -> Result<ScanoutHandle, ScanoutError> {
        if let Some(handle) = self.pipe(pipe)?.composition_handle {
            return Ok(handle);
        }
        let handle = self.alloc_handle();
        self.imports.insert(handle.0, Imported::Composition(pipe));
        self.pipe_mut(pipe)?.composition_handle = Some(handle);
        Ok(handle)
    }

    fn composition_target(&self, pipe: usize) -> NativeSurface {
        self.pipes[pipe].composition.clone()
    }

    fn release_buffer(&mut self, handle: ScanoutHandle) {
        if let Some(Imported::Composition(pipe)) = self.imports.remove(&handle.0) {
            if let Some(p) = self.pipes.get_mut(pipe) {
                p.composition_handle = None;
            }
        }
    }

    fn commit(&mut self, batch: CommitBatch) -> Result<(), ScanoutError> {
        for (pipe, mode) in &batch.modesets {
            let p = self.pipe_mut(*pipe)?;
            p.pending_mode = Some(mode.clone());
        }

        let mut per_pipe: FxHashMap<usize, Vec<FbEntry>> = FxHashMap::default();
        for entry in batch.entries {
            if entry.output >= self.pipes.len() {
                return Err(ScanoutError::InvalidPipe(entry.output));
            }
            if !self.pipes[entry.output].enabled {
                return Err(ScanoutError::CommitRejected);
            }
            let Some(imported) = self.imports.get(&entry.handle.0) else {
                return Err(ScanoutError::CommitRejected);
            };
            if let Some((w, h)) = imported.dimensions() {
                if entry.src.right() > w as i32 || entry.src.bottom() > h as i32 {
                    return Err(ScanoutError::CommitRejected);
                }
            }
            per_pipe.entry(entry.output).or_default().push(entry);
        }

        for (pipe, mut entries) in per_pipe {
            entries.sort_by_key(|e| e.zpos);
            self.pipes[pipe].pending = Some(entries);
        }
        Ok(())
    }

    fn event_fd(&self) -> RawFd {
        self.timer.as_raw_fd()
    }

    fn drain_events(&mut self) -> Vec<ScanoutEvent> {
        let mut expirations = 0u64;
        let n = unsafe {
            libc::read(
                self.timer.as_raw_fd(),
                &mut expirations as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if n == mem::size_of::<u64>() as isize {
            self.vblank();
        }
        self.events.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Rect;

    fn cfgs() -> Vec<PipelineConfig> {
        vec![
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
        ]
    }

    fn shm_layout() -> BufferLayout {
        BufferLayout {
            format: PixelFormat::Argb8888,
            width: 64,
            height: 64,
            planes: 1,
            strides: [256, 0, 0, 0],
            offsets: [0; 4],
            sizes: [0; 4],
        }
    }

    fn entry(handle: ScanoutHandle, output: usize) -> FbEntry {
        FbEntry {
            handle,
            output,
            plane: 0,
            src: Rect::new(0, 0, 64, 64),
            dst: Rect::new(0, 0, 64, 64),
            zpos: 0,
        }
    }

    #[test]
    fn flip_then_complete_ordering() {
        let mut so = HeadlessScanout::new(&cfgs()).unwrap();
        so.enable(0, None).unwrap();

        let pool_a = crate::shm::ShmPool::create("headless-test-a", 64 * 256).unwrap();
        let pool_b = crate::shm::ShmPool::create("headless-test-b", 64 * 256).unwrap();
        let a = so.import_shm(&shm_layout(), pool_a.fd()).unwrap();
        let b = so.import_shm(&shm_layout(), pool_b.fd()).unwrap();

        so.commit(CommitBatch {
            entries: vec![entry(a, 0)],
            modesets: Vec::new(),
        })
        .unwrap();
        so.vblank();
        let events: Vec<_> = so.events.drain(..).collect();
        assert_eq!(events, vec![ScanoutEvent::Flip { output: 0, handle: a }]);

        // Replacing a with b yields flip(b) then complete(a).
        so.commit(CommitBatch {
            entries: vec![entry(b, 0)],
            modesets: Vec::new(),
        })
        .unwrap();
        so.vblank();
        let events: Vec<_> = so.events.drain(..).collect();
        assert_eq!(
            events,
            vec![
                ScanoutEvent::Flip { output: 0, handle: b },
                ScanoutEvent::Complete { output: 0, handle: a },
            ]
        );
    }

    #[test]
    fn switch_mode_busy_while_commit_pending() {
        let mut so = HeadlessScanout::new(&cfgs()).unwrap();
        so.enable(0, None).unwrap();
        let pool = crate::shm::ShmPool::create("headless-test-busy", 64 * 256).unwrap();
        let h = so.import_shm(&shm_layout(), pool.fd()).unwrap();
        so.commit(CommitBatch {
            entries: vec![entry(h, 0)],
            modesets: Vec::new(),
        })
        .unwrap();

        let target = mode_720p();
        assert!(matches!(
            so.switch_mode(0, &target),
            Err(ScanoutError::Busy)
        ));
        so.vblank();
        so.events.clear();
        so.switch_mode(0, &target).unwrap();
        so.vblank();
        assert_eq!(so.current_mode(0).unwrap().width, 1280);
    }

    #[test]
    fn hotplug_toggle_reports_head_changed() {
        let mut so = HeadlessScanout::new(&cfgs()).unwrap();
        let handle = so.hotplug_handle();
        handle.set_connected(1, false);
        so.vblank();
        let events: Vec<_> = so.events.drain(..).collect();
        assert_eq!(events, vec![ScanoutEvent::HeadChanged { pipe: 1 }]);
        assert!(!so.head(1).connected);

        // No repeated event without another transition.
        so.vblank();
        assert!(so.events.is_empty());
    }

    #[test]
    fn disable_completes_presenting_buffers() {
        let mut so = HeadlessScanout::new(&cfgs()).unwrap();
        so.enable(0, None).unwrap();
        let pool = crate::shm::ShmPool::create("headless-test-disable", 64 * 256).unwrap();
        let h = so.import_shm(&shm_layout(), pool.fd()).unwrap();
        so.commit(CommitBatch {
            entries: vec![entry(h, 0)],
            modesets: Vec::new(),
        })
        .unwrap();
        so.vblank();
        so.events.clear();

        so.disable(0);
        let events: Vec<_> = so.events.drain(..).collect();
        assert_eq!(
            events,
            vec![ScanoutEvent::Complete { output: 0, handle: h }]
        );
    }

    #[test]
    fn unsupported_dma_format_is_rejected() {
        let mut so = HeadlessScanout::new(&cfgs()).unwrap();
        let mut layout = shm_layout();
        layout.format = PixelFormat::Yuv444;
        layout.planes = 3;
        let pool = crate::shm::ShmPool::create("headless-test-fmt", 4096).unwrap();
        let fds = [pool.fd()];
        assert!(matches!(
            so.import_dmabuf(&layout, &fds),
            Err(ScanoutError::UnsupportedFormat)
        ));
    }

    #[test]
    fn mode_enumeration_prefers_preferred() {
        let so = HeadlessScanout::new(&cfgs()).unwrap();
        let modes = so.enumerate_modes(0, None);
        assert!(modes[0].preferred);
        assert_eq!(modes[0].width, 1920);

        let filter = ModeFilter {
            rule: super::super::ModeFilterRule::SizeAndClock,
            min_width: 0,
            max_width: 1300,
            min_height: 0,
            max_height: 800,
            min_clock: 0,
            max_clock: 100_000,
        };
        let modes = so.enumerate_modes(0, Some(&filter));
        // Preferred always enumerated, the rest filtered.
        assert_eq!(modes.len(), 2);
        assert!(modes[0].preferred);
        assert_eq!(modes[1].width, 1280);
    }
}
