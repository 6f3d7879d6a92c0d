//! Mouse-cursor plane path.
//!
//! The cursor never goes through the client commit pipeline: it owns a
//! two-deep ring of ARGB staging buffers, updates land in the back buffer,
//! and the swapped buffer is programmed straight onto each output's cursor
//! plane at the next repaint. Subscribers hear about the flip once the
//! scanout confirms it.

use std::io;

use log::debug;

use crate::buffer::BufferLayout;
use crate::listener::{ListenerId, Signal};
use crate::protocol::{PixelFormat, Rect};
use crate::scanout::{FbEntry, ScanoutBackend, ScanoutHandle};
use crate::shm::ShmPool;

pub const CURSOR_SIZE: u32 = 64;

const CURSOR_STRIDE: u32 = CURSOR_SIZE * 4;
const CURSOR_BYTES: usize = (CURSOR_STRIDE * CURSOR_SIZE) as usize;

struct CursorBuffer {
    pool: ShmPool,
    handle: ScanoutHandle,
}

pub struct CursorState {
    ring: Vec<CursorBuffer>,
    /// Front buffer index; updates write into `1 - front`.
    front: usize,
    pub x: i32,
    pub y: i32,
    pub hot_x: i32,
    pub hot_y: i32,
    pub visible: bool,
    /// Image or position changed since the last programmed commit.
    pub dirty: bool,
    /// Programmed but not yet confirmed by a flip.
    awaiting_flip: bool,
    flip_signal: Signal<()>,
}

fn cursor_layout() -> BufferLayout {
    BufferLayout {
        format: PixelFormat::Argb8888,
        width: CURSOR_SIZE,
        height: CURSOR_SIZE,
        planes: 1,
        strides: [CURSOR_STRIDE, 0, 0, 0],
        offsets: [0; 4],
        sizes: [CURSOR_BYTES as u64, 0, 0, 0],
    }
}

impl CursorState {
    pub fn new(seat: u32, backend: &mut dyn ScanoutBackend) -> io::Result<CursorState> {
        let layout = cursor_layout();
        let mut ring = Vec::with_capacity(2);
        for i in 0..2 {
            let pool = ShmPool::create(&format!("cube-{seat}-mc-{i}"), CURSOR_BYTES)?;
            let handle = backend
                .import_shm(&layout, pool.fd())
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            ring.push(CursorBuffer { pool, handle });
        }
        Ok(CursorState {
            ring,
            front: 0,
            x: 0,
            y: 0,
            hot_x: 0,
            hot_y: 0,
            visible: false,
            dirty: false,
            awaiting_flip: false,
            flip_signal: Signal::new(),
        })
    }

    /// Upload a new cursor image (ARGB, at most 64x64) into the back buffer
    /// and make it current.
    pub fn set_image(
        &mut self,
        data: &[u8],
        width: u32,
        height: u32,
        stride: u32,
        hot_x: i32,
        hot_y: i32,
    ) -> io::Result<()> {
        if width > CURSOR_SIZE || height > CURSOR_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cursor image too large",
            ));
        }
        if data.len() < (stride * height) as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cursor image truncated",
            ));
        }
        let back = 1 - self.front;
        let dst = self.ring[back].pool.bytes_mut();
        dst.fill(0);
        for row in 0..height as usize {
            let src_off = row * stride as usize;
            let dst_off = row * CURSOR_STRIDE as usize;
            dst[dst_off..dst_off + (width * 4) as usize]
                .copy_from_slice(&data[src_off..src_off + (width * 4) as usize]);
        }
        self.front = back;
        self.hot_x = hot_x;
        self.hot_y = hot_y;
        self.visible = true;
        self.dirty = true;
        debug!("cursor image {width}x{height} hot ({hot_x},{hot_y})");
        Ok(())
    }

    pub fn move_to(&mut self, x: i32, y: i32, bounds: &Rect) {
        self.x = x.clamp(bounds.x, bounds.right().saturating_sub(1));
        self.y = y.clamp(bounds.y, bounds.bottom().saturating_sub(1));
        self.dirty = true;
    }

    pub fn offset_by(&mut self, dx: i32, dy: i32, accel: f32, bounds: &Rect) {
        let x = self.x + (dx as f32 * accel) as i32;
        let y = self.y + (dy as f32 * accel) as i32;
        self.move_to(x, y, bounds);
    }

    pub fn hide(&mut self) {
        if self.visible {
            self.visible = false;
            self.dirty = true;
        }
    }

    pub fn show(&mut self) {
        if !self.visible {
            self.visible = true;
            self.dirty = true;
        }
    }

    pub fn current_handle(&self) -> ScanoutHandle {
        self.ring[self.front].handle
    }

    fn is_ring_handle(&self, handle: ScanoutHandle) -> bool {
        self.ring.iter().any(|b| b.handle == handle)
    }

    /// Cursor-plane entry for one output, when the hotspot-adjusted image
    /// touches its desktop rectangle.
    pub fn plane_entry(&self, output: usize, plane: usize, desktop: &Rect) -> Option<FbEntry> {
        if !self.visible {
            return None;
        }
        let dst = Rect::new(
            self.x - self.hot_x,
            self.y - self.hot_y,
            CURSOR_SIZE,
            CURSOR_SIZE,
        );
        dst.intersect(desktop)?;
        Some(FbEntry {
            handle: self.current_handle(),
            output,
            plane,
            src: Rect::new(0, 0, CURSOR_SIZE, CURSOR_SIZE),
            dst: Rect::new(dst.x - desktop.x, dst.y - desktop.y, CURSOR_SIZE, CURSOR_SIZE),
            zpos: 255,
        })
    }

    /// Called when a repaint pass programmed the cursor plane.
    pub fn programmed(&mut self) {
        if self.dirty {
            self.dirty = false;
            self.awaiting_flip = true;
        }
    }

    /// Feed a flip confirmation from the backend; fires the update-complete
    /// signal when it covers a pending cursor program.
    pub fn on_flip(&mut self, handle: ScanoutHandle) {
        if self.awaiting_flip && self.is_ring_handle(handle) {
            self.awaiting_flip = false;
            self.flip_signal.emit(&());
        }
    }

    pub fn add_flip_listener<F: FnMut(&()) + 'static>(&mut self, f: F) -> ListenerId {
        self.flip_signal.add(f)
    }

    pub fn remove_flip_listener(&mut self, id: ListenerId) {
        self.flip_signal.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanout::{HeadlessScanout, PipelineConfig};

    fn backend() -> HeadlessScanout {
        HeadlessScanout::new(&[PipelineConfig {
            head_index: 0,
            output_index: 0,
            primary_plane_index: 0,
            cursor_plane_index: 1,
        }])
        .unwrap()
    }

    #[test]
    fn image_upload_swaps_the_ring() {
        let mut so = backend();
        let mut cursor = CursorState::new(900, &mut so).unwrap();
        let first = cursor.current_handle();
        let img = vec![0xffu8; (32 * 32 * 4) as usize];
        cursor.set_image(&img, 32, 32, 32 * 4, 4, 4).unwrap();
        assert_ne!(cursor.current_handle(), first);
        assert!(cursor.visible);
        assert!(cursor.dirty);
    }

    #[test]
    fn oversized_image_is_rejected() {
        let mut so = backend();
        let mut cursor = CursorState::new(901, &mut so).unwrap();
        let img = vec![0u8; (128 * 128 * 4) as usize];
        assert!(cursor.set_image(&img, 128, 128, 128 * 4, 0, 0).is_err());
    }

    #[test]
    fn movement_clamps_to_canvas() {
        let mut so = backend();
        let mut cursor = CursorState::new(902, &mut so).unwrap();
        let bounds = Rect::new(0, 0, 1920, 1080);
        cursor.move_to(-50, 5000, &bounds);
        assert_eq!((cursor.x, cursor.y), (0, 1079));
        cursor.offset_by(10, 0, 2.0, &bounds);
        assert_eq!(cursor.x, 20);
    }

    #[test]
    fn hidden_cursor_produces_no_plane_entry() {
        let mut so = backend();
        let mut cursor = CursorState::new(903, &mut so).unwrap();
        let desktop = Rect::new(0, 0, 1920, 1080);
        assert!(cursor.plane_entry(0, 1, &desktop).is_none());
        let img = vec![0xffu8; (16 * 16 * 4) as usize];
        cursor.set_image(&img, 16, 16, 64, 0, 0).unwrap();
        assert!(cursor.plane_entry(0, 1, &desktop).is_some());
        cursor.hide();
        assert!(cursor.plane_entry(0, 1, &desktop).is_none());
    }

    #[test]
    fn flip_signal_fires_after_program_and_flip() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut so = backend();
        let mut cursor = CursorState::new(904, &mut so).unwrap();
        let flips = Rc::new(RefCell::new(0));
        let f = flips.clone();
        cursor.add_flip_listener(move |_| *f.borrow_mut() += 1);

        let img = vec![0xffu8; (16 * 16 * 4) as usize];
        cursor.set_image(&img, 16, 16, 64, 0, 0).unwrap();
        cursor.programmed();
        cursor.on_flip(cursor.current_handle());
        assert_eq!(*flips.borrow(), 1);

        // A flip with no pending program stays quiet.
        cursor.on_flip(cursor.current_handle());
        assert_eq!(*flips.borrow(), 1);
    }
}
