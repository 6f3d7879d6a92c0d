//! Renderer contract.
//!
//! Views that cannot be put on a hardware plane are composited into a
//! per-output target. The GLES renderer lives out of tree; the in-tree
//! software renderer covers headless runs and the test suite.

mod software;

pub use software::SoftwareRenderer;

use thiserror::Error;

use crate::buffer::BufferLayout;
use crate::protocol::{PixelFormat, Rect};
use crate::scanout::NativeSurface;
use crate::surface::SurfaceId;

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("pixel format not importable as a texture")]
    UnsupportedFormat,

    #[error("no render target for output {0}")]
    NoOutput(usize),

    #[error("surface has no attached content")]
    NoContent,
}

/// One composition step: blit this surface's content at `dst` (output-local
/// coordinates) with the given constant alpha.
#[derive(Debug, Clone)]
pub struct RenderElement {
    pub surface: SurfaceId,
    pub dst: Rect,
    pub alpha: f32,
}

pub trait Renderer {
    fn output_create(&mut self, output: usize, target: NativeSurface) -> Result<(), RendererError>;

    fn output_destroy(&mut self, output: usize);

    /// Formats acceptable to `attach_shm` / usable as external textures.
    fn supports(&self, format: PixelFormat) -> bool;

    /// Upload surface content. The bytes are consumed here; the committed
    /// buffer is not needed again until the next attach.
    fn attach_shm(
        &mut self,
        surface: SurfaceId,
        layout: &BufferLayout,
        pixels: &[u8],
    ) -> Result<(), RendererError>;

    fn flush_damage(&mut self, surface: SurfaceId, damage: Rect);

    /// Composite the elements bottom-to-top into the output's target.
    fn repaint_output(
        &mut self,
        output: usize,
        elements: &[RenderElement],
    ) -> Result<(), RendererError>;

    fn drop_surface(&mut self, surface: SurfaceId);
}
