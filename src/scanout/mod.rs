//! Scanout backend contract.
//!
//! A backend owns the kernel-side display objects and serializes all access
//! to them. The compositor talks to it through pipe indices: a pipeline maps
//! a head (connector) to an output (CRTC) and reserves its primary and
//! cursor planes. Buffer flips come back asynchronously: the backend's event
//! fd is registered in the event loop, and `drain_events` yields ordered
//! `Flip`/`Complete`/`HeadChanged` events.

mod headless;

pub use headless::{HeadlessScanout, HotplugHandle};

use std::cell::RefCell;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;

use thiserror::Error;

use crate::buffer::BufferLayout;
use crate::protocol::{PixelFormat, Rect};

/// Static mapping from a head to an output and its reserved planes.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub head_index: usize,
    pub output_index: usize,
    pub primary_plane_index: usize,
    pub cursor_plane_index: usize,
}

/// Full CVT-style timing for one video mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeTiming {
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub interlaced: bool,
    pub pos_hsync: bool,
    pub pos_vsync: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mode {
    pub width: u32,
    pub height: u32,
    /// Vertical refresh in milli-hertz.
    pub vrefresh_mhz: u32,
    /// Pixel clock in kilohertz.
    pub clock_khz: u32,
    pub timing: ModeTiming,
    pub preferred: bool,
    pub custom: bool,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeFilterRule {
    SizeOrClock,
    SizeAndClock,
}

/// Restricts mode enumeration; modes outside the window are skipped.
#[derive(Debug, Clone, Copy)]
pub struct ModeFilter {
    pub rule: ModeFilterRule,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
    pub min_clock: u32,
    pub max_clock: u32,
}

impl ModeFilter {
    pub fn matches(&self, mode: &Mode) -> bool {
        let size_ok = mode.width >= self.min_width
            && mode.width <= self.max_width
            && mode.height >= self.min_height
            && mode.height <= self.max_height;
        let clock_ok = mode.clock_khz >= self.min_clock && mode.clock_khz <= self.max_clock;
        match self.rule {
            ModeFilterRule::SizeOrClock => size_ok || clock_ok,
            ModeFilterRule::SizeAndClock => size_ok && clock_ok,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneKind {
    Primary,
    Cursor,
    Overlay,
}

#[derive(Debug, Clone)]
pub struct PlaneInfo {
    pub kind: PlaneKind,
    pub zpos: u64,
    pub formats: Vec<PixelFormat>,
}

impl PlaneInfo {
    pub fn supports(&self, format: PixelFormat) -> bool {
        self.formats.contains(&format)
    }
}

/// Monitor-facing state of one pipeline.
#[derive(Debug, Clone)]
pub struct HeadInfo {
    pub connected: bool,
    pub connector_name: String,
    pub monitor_name: String,
    /// Raw EDID blob, passed through opaque.
    pub edid: Vec<u8>,
}

/// Backend-assigned framebuffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanoutHandle(pub u64);

/// One plane assignment inside an atomic commit.
#[derive(Debug, Clone)]
pub struct FbEntry {
    pub handle: ScanoutHandle,
    pub output: usize,
    pub plane: usize,
    pub src: Rect,
    pub dst: Rect,
    pub zpos: i32,
}

/// One atomic request: plane entries plus any pending modesets.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub entries: Vec<FbEntry>,
    pub modesets: Vec<(usize, Mode)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanoutEvent {
    /// Scanout started presenting the buffer on this output; the next
    /// commit may be scheduled.
    Flip { output: usize, handle: ScanoutHandle },
    /// Scanout ceased presenting the buffer on this output; it may be
    /// released once every output has let go.
    Complete { output: usize, handle: ScanoutHandle },
    /// Connector state changed on this pipe.
    HeadChanged { pipe: usize },
}

#[derive(Debug, Error)]
pub enum ScanoutError {
    #[error("backend busy, try again")]
    Busy,

    #[error("no pipe {0}")]
    InvalidPipe(usize),

    #[error("pixel format not supported by scanout")]
    UnsupportedFormat,

    #[error("buffer import rejected: {0}")]
    Import(String),

    #[error("atomic commit rejected")]
    CommitRejected,

    #[error("cannot open scanout device {path}: {reason}")]
    DeviceOpen { path: String, reason: String },
}

/// Pixel target the renderer composites into; the backend scans it out as
/// the primary-plane framebuffer when views fall back to composition.
#[derive(Debug)]
pub struct CompositionTarget {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
}

pub type NativeSurface = Rc<RefCell<CompositionTarget>>;

pub trait ScanoutBackend {
    fn pipe_count(&self) -> usize;

    fn head(&self, pipe: usize) -> &HeadInfo;

    fn planes(&self, pipe: usize) -> &[PlaneInfo];

    /// Preferred mode first, then remaining modes passing the filter.
    fn enumerate_modes(&self, pipe: usize, filter: Option<&ModeFilter>) -> Vec<Mode>;

    fn current_mode(&self, pipe: usize) -> Option<&Mode>;

    /// Register a custom mode built from a full timing tuple. The mode is
    /// only registered here; it takes effect through `switch_mode`.
    fn create_custom_mode(
        &mut self,
        pipe: usize,
        clock_khz: u32,
        width: u32,
        height: u32,
        vrefresh_mhz: u32,
        timing: ModeTiming,
        name: &str,
    ) -> Result<Mode, ScanoutError>;

    /// Asynchronous modeset; `Busy` means a previous commit is still in
    /// flight and the caller should retry on the next repaint tick.
    fn switch_mode(&mut self, pipe: usize, mode: &Mode) -> Result<(), ScanoutError>;

    fn enable(&mut self, pipe: usize, mode: Option<&Mode>) -> Result<(), ScanoutError>;

    fn disable(&mut self, pipe: usize);

    fn is_enabled(&self, pipe: usize) -> bool;

    /// Import an external DMA-BUF as a scanout framebuffer.
    fn import_dmabuf(
        &mut self,
        layout: &BufferLayout,
        fds: &[BorrowedFd],
    ) -> Result<ScanoutHandle, ScanoutError>;

    /// Wrap a cpu-visible staging buffer (such as the cursor ring) as a
    /// scanout framebuffer. A kernel backend copies into a dumb buffer.
    fn import_shm(
        &mut self,
        layout: &BufferLayout,
        fd: BorrowedFd,
    ) -> Result<ScanoutHandle, ScanoutError>;

    /// Framebuffer handle for the per-output composition target.
    fn import_composition(&mut self, pipe: usize) -> Result<ScanoutHandle, ScanoutError>;

    /// The renderer-visible pixels behind `import_composition`.
    fn composition_target(&self, pipe: usize) -> NativeSurface;

    fn release_buffer(&mut self, handle: ScanoutHandle);

    /// Queue one atomic commit. Flips are reported through `drain_events`.
    fn commit(&mut self, batch: CommitBatch) -> Result<(), ScanoutError>;

    /// Readable whenever `drain_events` may yield something.
    fn event_fd(&self) -> RawFd;

    fn drain_events(&mut self) -> Vec<ScanoutEvent>;
}

/// Open the backend for a device path. `headless` selects the built-in
/// timer-driven backend; kernel-mode-setting backends attach behind the same
/// trait out of tree.
pub fn create(
    device: &str,
    pipes: &[PipelineConfig],
) -> Result<Box<dyn ScanoutBackend>, ScanoutError> {
    match device {
        "headless" => Ok(Box::new(HeadlessScanout::new(pipes)?)),
        path => Err(ScanoutError::DeviceOpen {
            path: path.to_string(),
            reason: "no built-in backend for this device".to_string(),
        }),
    }
}
