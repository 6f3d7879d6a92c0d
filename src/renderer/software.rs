//! CPU compositing fallback.
//!
//! Surface content is converted to ARGB32 at attach time (the moral
//! equivalent of a texture upload) and alpha-blended into the per-output
//! composition target on repaint.

use rustc_hash::FxHashMap;

use super::{RenderElement, Renderer, RendererError};
use crate::buffer::BufferLayout;
use crate::protocol::{PixelFormat, Rect};
use crate::scanout::NativeSurface;
use crate::surface::SurfaceId;

struct Texture {
    width: u32,
    height: u32,
    /// ARGB32, row-major, not premultiplied.
    argb: Vec<u32>,
}

pub struct SoftwareRenderer {
    targets: FxHashMap<usize, NativeSurface>,
    textures: FxHashMap<SurfaceId, Texture>,
}

impl SoftwareRenderer {
    pub fn new() -> SoftwareRenderer {
        SoftwareRenderer {
            targets: FxHashMap::default(),
            textures: FxHashMap::default(),
        }
    }
}

impl Default for SoftwareRenderer {
    fn default() -> Self {
        Self::new()
    }
}

fn to_argb(layout: &BufferLayout, pixels: &[u8], x: usize, y: usize) -> u32 {
    let stride = layout.strides[0] as usize;
    match layout.format {
        PixelFormat::Argb8888 => {
            let off = y * stride + x * 4;
            u32::from_le_bytes([
                pixels[off],
                pixels[off + 1],
                pixels[off + 2],
                pixels[off + 3],
            ])
        }
        PixelFormat::Xrgb8888 => {
            let off = y * stride + x * 4;
            0xff00_0000
                | u32::from_le_bytes([pixels[off], pixels[off + 1], pixels[off + 2], 0])
        }
        PixelFormat::Rgb888 => {
            let off = y * stride + x * 3;
            0xff00_0000
                | (pixels[off + 2] as u32) << 16
                | (pixels[off + 1] as u32) << 8
                | pixels[off] as u32
        }
        PixelFormat::Rgb565 => {
            let off = y * stride + x * 2;
            let v = u16::from_le_bytes([pixels[off], pixels[off + 1]]) as u32;
            let r = ((v >> 11) & 0x1f) * 255 / 31;
            let g = ((v >> 5) & 0x3f) * 255 / 63;
            let b = (v & 0x1f) * 255 / 31;
            0xff00_0000 | (r << 16) | (g << 8) | b
        }
        _ => 0,
    }
}

fn blend(dst: u32, src: u32, alpha: u32) -> u32 {
    // alpha is 0..=255, combined with the source pixel's own alpha.
    let sa = ((src >> 24) & 0xff) * alpha / 255;
    if sa == 0 {
        return dst;
    }
    if sa == 255 {
        return 0xff00_0000 | (src & 0x00ff_ffff);
    }
    let na = 255 - sa;
    let sr = (src >> 16) & 0xff;
    let sg = (src >> 8) & 0xff;
    let sb = src & 0xff;
    let dr = (dst >> 16) & 0xff;
    let dg = (dst >> 8) & 0xff;
    let db = dst & 0xff;
    let r = (sr * sa + dr * na) / 255;
    let g = (sg * sa + dg * na) / 255;
    let b = (sb * sa + db * na) / 255;
    0xff00_0000 | (r << 16) | (g << 8) | b
}

impl Renderer for SoftwareRenderer {
    fn output_create(&mut self, output: usize, target: NativeSurface) -> Result<(), RendererError> {
        self.targets.insert(output, target);
        Ok(())
    }

    fn output_destroy(&mut self, output: usize) {
        self.targets.remove(&output);
    }

    fn supports(&self, format: PixelFormat) -> bool {
        matches!(
            format,
            PixelFormat::Argb8888
                | PixelFormat::Xrgb8888
                | PixelFormat::Rgb888
                | PixelFormat::Rgb565
        )
    }

    fn attach_shm(
        &mut self,
        surface: SurfaceId,
        layout: &BufferLayout,
        pixels: &[u8],
    ) -> Result<(), RendererError> {
        if !self.supports(layout.format) {
            return Err(RendererError::UnsupportedFormat);
        }
        let w = layout.width as usize;
        let h = layout.height as usize;
        let needed = layout.strides[0] as usize * h;
        if pixels.len() < needed {
            return Err(RendererError::NoContent);
        }
        let mut argb = Vec::with_capacity(w * h);
        for y in 0..h {
            for x in 0..w {
                argb.push(to_argb(layout, pixels, x, y));
            }
        }
        self.textures.insert(
            surface,
            Texture {
                width: layout.width,
                height: layout.height,
                argb,
            },
        );
        Ok(())
    }

    fn flush_damage(&mut self, _surface: SurfaceId, _damage: Rect) {
        // Whole-texture uploads in attach_shm; nothing to flush separately.
    }

    fn repaint_output(
        &mut self,
        output: usize,
        elements: &[RenderElement],
    ) -> Result<(), RendererError> {
        let target = self
            .targets
            .get(&output)
            .ok_or(RendererError::NoOutput(output))?;
        let mut target = target.borrow_mut();
        let tw = target.width as i32;
        let th = target.height as i32;
        let stride_px = (target.stride / 4) as usize;

        for px in target.pixels.chunks_exact_mut(4) {
            px.copy_from_slice(&0xff00_0000u32.to_le_bytes());
        }

        for element in elements {
            let tex = match self.textures.get(&element.surface) {
                Some(t) => t,
                None => continue,
            };
            let alpha = (element.alpha.clamp(0.0, 1.0) * 255.0) as u32;
            let dst = element.dst;
            for ty in 0..dst.h.min(tex.height) as i32 {
                let oy = dst.y + ty;
                if oy < 0 || oy >= th {
                    continue;
                }
                for tx in 0..dst.w.min(tex.width) as i32 {
                    let ox = dst.x + tx;
                    if ox < 0 || ox >= tw {
                        continue;
                    }
                    let src = tex.argb[(ty as u32 * tex.width + tx as u32) as usize];
                    let idx = (oy as usize * stride_px + ox as usize) * 4;
                    let cur = u32::from_le_bytes([
                        target.pixels[idx],
                        target.pixels[idx + 1],
                        target.pixels[idx + 2],
                        target.pixels[idx + 3],
                    ]);
                    let out = blend(cur, src, alpha);
                    target.pixels[idx..idx + 4].copy_from_slice(&out.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    fn drop_surface(&mut self, surface: SurfaceId) {
        self.textures.remove(&surface);
    }
}
