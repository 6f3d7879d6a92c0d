//! Buffer objects.
//!
//! A buffer is either a server-created named shared-memory pool or a set of
//! imported DMA-BUF descriptors. Either way it carries a dirty bitmap of the
//! outputs it still has to appear on, and is handed back to its owner
//! (`bo-complete`) only after every output that presented it has flipped to
//! a successor.

use std::fmt;
use std::os::fd::OwnedFd;

use crate::client_agent::LinkId;
use crate::protocol::{BufferInfo, BufferType, PixelFormat};
use crate::scanout::ScanoutHandle;
use crate::shm::ShmPool;
use crate::surface::SurfaceId;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

impl fmt::Debug for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferId({:#x})", self.0)
    }
}

/// Geometry and per-plane layout, independent of where the bytes live.
#[derive(Debug, Clone)]
pub struct BufferLayout {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: usize,
    pub strides: [u32; 4],
    pub offsets: [u32; 4],
    pub sizes: [u64; 4],
}

impl BufferLayout {
    pub fn from_info(info: &BufferInfo) -> BufferLayout {
        let planes = (info.planes.max(0) as usize)
            .min(4)
            .max(info.format.plane_count());
        BufferLayout {
            format: info.format,
            width: info.width,
            height: info.height,
            planes,
            strides: info.strides,
            offsets: info.offsets,
            sizes: info.sizes,
        }
    }

    /// Total byte size across planes, falling back to stride*height when the
    /// client left the size fields zero.
    pub fn total_size(&self) -> usize {
        let declared: u64 = self.sizes[..self.planes].iter().sum();
        if declared > 0 {
            return declared as usize;
        }
        let stride = if self.strides[0] != 0 {
            self.strides[0]
        } else {
            self.width * self.format.bpp()
        };
        (stride as u64 * self.height as u64) as usize
    }
}

pub enum BufferStorage {
    Shm(ShmPool),
    Dma { fds: Vec<OwnedFd> },
}

impl fmt::Debug for BufferStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferStorage::Shm(pool) => f.debug_tuple("Shm").field(pool).finish(),
            BufferStorage::Dma { fds } => f.debug_tuple("Dma").field(&fds.len()).finish(),
        }
    }
}

impl BufferStorage {
    pub fn kind(&self) -> BufferType {
        match self {
            BufferStorage::Shm(_) => BufferType::Shm,
            BufferStorage::Dma { .. } => BufferType::Dma,
        }
    }
}

#[derive(Debug)]
pub struct Buffer {
    pub id: BufferId,
    pub owner: LinkId,
    pub surface: SurfaceId,
    pub layout: BufferLayout,
    pub storage: BufferStorage,
    /// Framebuffer handle when the buffer can be put on a plane directly.
    pub scanout: Option<ScanoutHandle>,
    /// Bitmap of outputs still owing a flip for the latest commit.
    pub dirty: u32,
    /// Bitmap of outputs currently presenting this buffer.
    pub shown_on: u32,
    /// A commit latched this buffer and its flip has not been reported yet.
    pub needs_flip_event: bool,
    /// `bo-complete` already delivered for the latest commit.
    pub complete_sent: bool,
    /// Client asked to destroy while scanout still references the buffer.
    pub pending_destroy: bool,
    /// Inside a client cpu sync window; commits are refused.
    pub in_sync_window: bool,
}

impl Buffer {
    pub fn new(
        id: BufferId,
        owner: LinkId,
        surface: SurfaceId,
        layout: BufferLayout,
        storage: BufferStorage,
        scanout: Option<ScanoutHandle>,
    ) -> Buffer {
        Buffer {
            id,
            owner,
            surface,
            layout,
            storage,
            scanout,
            dirty: 0,
            shown_on: 0,
            needs_flip_event: false,
            complete_sent: true,
            pending_destroy: false,
            in_sync_window: false,
        }
    }

    /// Scanout still holds a reference; destruction must be deferred.
    pub fn in_scanout(&self) -> bool {
        self.shown_on != 0 || self.dirty != 0
    }

    /// All target outputs have flipped and nothing presents the buffer any
    /// more: it may be returned to the owner.
    pub fn releasable(&self) -> bool {
        !self.needs_flip_event && !self.complete_sent && self.dirty == 0 && self.shown_on == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(format: PixelFormat, w: u32, h: u32, stride: u32) -> BufferLayout {
        BufferLayout {
            format,
            width: w,
            height: h,
            planes: format.plane_count(),
            strides: [stride, 0, 0, 0],
            offsets: [0; 4],
            sizes: [0; 4],
        }
    }

    #[test]
    fn total_size_falls_back_to_stride() {
        let l = layout(PixelFormat::Argb8888, 640, 480, 2560);
        assert_eq!(l.total_size(), 2560 * 480);
    }

    #[test]
    fn declared_sizes_win() {
        let mut l = layout(PixelFormat::Nv12, 1280, 720, 1280);
        l.planes = 2;
        l.sizes = [921600, 460800, 0, 0];
        assert_eq!(l.total_size(), 921600 + 460800);
    }

    #[test]
    fn release_gating() {
        let l = layout(PixelFormat::Argb8888, 64, 64, 256);
        let mut b = Buffer::new(
            BufferId(1),
            LinkId(1),
            SurfaceId(1),
            l,
            BufferStorage::Dma { fds: Vec::new() },
            Some(ScanoutHandle(9)),
        );
        // Fresh commit: flip outstanding on output 0.
        b.dirty = 0b01;
        b.needs_flip_event = true;
        b.complete_sent = false;
        assert!(!b.releasable());
        assert!(b.in_scanout());

        // Flip lands; buffer now on screen.
        b.dirty = 0;
        b.needs_flip_event = false;
        b.shown_on = 0b01;
        assert!(!b.releasable());

        // Successor displaces it.
        b.shown_on = 0;
        assert!(b.releasable());
    }
}
