// Widgets - what a frame is made of
//
// Layout and event handling live elsewhere; by the time a widget gets here it
// knows its rectangle in window pixels. `place_vertices` writes straight into
// the three pipelines' mapped vertex buffers for this frame.

use anyhow::Result;
use ash::vk;
use glam::Vec2;

use crate::atlas::{Image, ImageState, PageQuad, PixelMap};
use crate::device::Device;
use crate::error::RenderError;
use crate::pipeline::flat::{self, FlatVertex};
use crate::pipeline::image::{page_vertices, ImageVertex};
use crate::pipeline::sdf::{glyph_vertices, GlyphKey, SdfVertex};
use crate::pipeline::VertexSpan;

/// One frame's vertex spans, one per pipeline, plus the swapchain extent.
pub struct FrameVertices<'a> {
    pub flat: VertexSpan<'a, FlatVertex>,
    pub image: VertexSpan<'a, ImageVertex>,
    pub sdf: VertexSpan<'a, SdfVertex>,
    pub extent: vk::Extent2D,
}

impl FrameVertices<'_> {
    /// Clip rectangle covering the whole window
    pub fn window_clip(&self) -> [f32; 4] {
        window_clip(self.extent)
    }
}

pub fn window_clip(extent: vk::Extent2D) -> [f32; 4] {
    [0.0, 0.0, extent.width as f32, extent.height as f32]
}

pub trait Renderable {
    /// Append this frame's vertices. Overflowing a span is an error; anything the
    /// atlas could not hold is simply not drawn.
    fn place_vertices(&mut self, device: &Device, vertices: &mut FrameVertices<'_>) -> Result<()>;
}

/// Draws children in order; the first error stops the walk.
impl Renderable for Vec<Box<dyn Renderable>> {
    fn place_vertices(&mut self, device: &Device, vertices: &mut FrameVertices<'_>) -> Result<()> {
        for child in self.iter_mut() {
            child.place_vertices(device, vertices)?;
        }
        Ok(())
    }
}

// =============================================================================
// FLAT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorRect {
    pub min: Vec2,
    pub max: Vec2,
    pub color: [f32; 4],
    /// Window clip when None
    pub clip: Option<[f32; 4]>,
}

impl ColorRect {
    pub fn new(min: Vec2, max: Vec2, color: [f32; 4]) -> Self {
        Self {
            min,
            max,
            color,
            clip: None,
        }
    }

    pub fn push(
        &self,
        span: &mut VertexSpan<'_, FlatVertex>,
        window: [f32; 4],
    ) -> Result<(), RenderError> {
        span.push_quad(flat::quad(
            self.min.to_array(),
            self.max.to_array(),
            self.clip.unwrap_or(window),
            self.color,
        ))
    }
}

impl Renderable for ColorRect {
    fn place_vertices(&mut self, _device: &Device, vertices: &mut FrameVertices<'_>) -> Result<()> {
        let window = vertices.window_clip();
        self.push(&mut vertices.flat, window)?;
        Ok(())
    }
}

// =============================================================================
// IMAGE
// =============================================================================

/// An RGBA picture drawn from the device's image atlas.
pub struct ImageWidget {
    pub image: Image,
    pub pixels: PixelMap<[u8; 4]>,
    pub origin: Vec2,
    pub scale: f32,
    pub alpha: f32,
}

impl ImageWidget {
    pub fn new(name: &str, pixels: PixelMap<[u8; 4]>, origin: Vec2) -> Self {
        Self {
            image: Image::new(name),
            pixels,
            origin,
            scale: 1.0,
            alpha: 1.0,
        }
    }
}

pub fn push_image_quads(
    span: &mut VertexSpan<'_, ImageVertex>,
    quads: &[PageQuad],
    clip: [f32; 4],
    alpha: f32,
) -> Result<(), RenderError> {
    for quad in quads {
        span.push_quad(page_vertices(quad, clip, alpha))?;
    }
    Ok(())
}

impl Renderable for ImageWidget {
    fn place_vertices(&mut self, device: &Device, vertices: &mut FrameVertices<'_>) -> Result<()> {
        let prepared = device
            .shared()
            .image
            .prepare(&device.vulkan, &mut self.image, &self.pixels);
        match prepared {
            Ok(ImageState::Uploaded) => {}
            Ok(state) => {
                log::trace!("Image '{}' not drawn: {:?}", self.image.name(), state);
                return Ok(());
            }
            // A lost device has to reach the window
            Err(e) if e.downcast_ref::<RenderError>().is_some() => return Err(e),
            Err(e) => {
                log::warn!("Image '{}' not drawn: {:#}", self.image.name(), e);
                return Ok(());
            }
        }

        let clip = vertices.window_clip();
        let quads = self.image.quads(self.origin, self.scale);
        push_image_quads(&mut vertices.image, &quads, clip, self.alpha)?;
        Ok(())
    }
}

// =============================================================================
// SDF
// =============================================================================

/// Produces the distance field for a glyph the first time a device needs it.
pub type Rasterizer = Box<dyn Fn(GlyphKey) -> Result<PixelMap<u8>>>;

/// One glyph from the device's glyph atlas. Shaping happens upstream; this only
/// knows where the glyph's top-left corner goes.
pub struct SdfGlyph {
    pub key: GlyphKey,
    pub origin: Vec2,
    /// Screen pixels per atlas texel
    pub scale: f32,
    pub color: [f32; 4],
    rasterize: Rasterizer,
}

impl SdfGlyph {
    pub fn new(
        key: GlyphKey,
        origin: Vec2,
        scale: f32,
        color: [f32; 4],
        rasterize: Rasterizer,
    ) -> Self {
        Self {
            key,
            origin,
            scale,
            color,
            rasterize,
        }
    }
}

pub fn push_glyph_quads(
    span: &mut VertexSpan<'_, SdfVertex>,
    quads: &[PageQuad],
    clip: [f32; 4],
    color: [f32; 4],
    scale: f32,
) -> Result<(), RenderError> {
    for quad in quads {
        span.push_quad(glyph_vertices(quad, clip, color, scale))?;
    }
    Ok(())
}

impl Renderable for SdfGlyph {
    fn place_vertices(&mut self, device: &Device, vertices: &mut FrameVertices<'_>) -> Result<()> {
        let key = self.key;
        let rasterize = &self.rasterize;
        let quads = device
            .shared()
            .sdf
            .glyph_quads(&device.vulkan, key, self.origin, self.scale, || rasterize(key));
        let quads = match quads {
            Ok(quads) => quads,
            Err(e) if e.downcast_ref::<RenderError>().is_some() => return Err(e),
            Err(e) => {
                log::warn!("Glyph {}:{} not drawn: {:#}", key.font, key.glyph, e);
                return Ok(());
            }
        };

        let clip = vertices.window_clip();
        push_glyph_quads(&mut vertices.sdf, &quads, clip, self.color, self.scale)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineKind;
    use bytemuck::Zeroable;

    fn page(x: f32, layer: u32) -> PageQuad {
        PageQuad {
            min: Vec2::new(x, 0.0),
            max: Vec2::new(x + 32.0, 32.0),
            atlas_min: Vec2::ZERO,
            atlas_max: Vec2::new(32.0, 32.0),
            layer,
        }
    }

    #[test]
    fn rect_uses_window_clip_unless_given_one() {
        let mut storage = [FlatVertex::zeroed(); 8];
        let mut span = VertexSpan::new(PipelineKind::Flat, &mut storage);
        let window = window_clip(vk::Extent2D {
            width: 640,
            height: 480,
        });
        assert_eq!(window, [0.0, 0.0, 640.0, 480.0]);

        let mut rect = ColorRect::new(Vec2::new(1.0, 2.0), Vec2::new(3.0, 4.0), [1.0; 4]);
        rect.push(&mut span, window).unwrap();
        rect.clip = Some([0.0, 0.0, 2.0, 2.0]);
        rect.push(&mut span, window).unwrap();

        let vertices = span.as_slice();
        assert_eq!(vertices.len(), 8);
        assert_eq!(vertices[0].clip, window);
        assert_eq!(vertices[4].clip, [0.0, 0.0, 2.0, 2.0]);
        assert_eq!(vertices[6].position, [3.0, 4.0]);
    }

    #[test]
    fn full_span_rejects_the_next_rect() {
        let mut storage = [FlatVertex::zeroed(); 6];
        let mut span = VertexSpan::new(PipelineKind::Flat, &mut storage);
        let rect = ColorRect::new(Vec2::ZERO, Vec2::ONE, [1.0; 4]);
        rect.push(&mut span, [0.0; 4]).unwrap();
        assert_eq!(
            rect.push(&mut span, [0.0; 4]),
            Err(RenderError::VertexOverflow {
                pipeline: PipelineKind::Flat,
                capacity: 6
            })
        );
        assert_eq!(span.len(), 4);
    }

    #[test]
    fn every_resident_page_becomes_a_quad() {
        let mut storage = [ImageVertex::zeroed(); 12];
        let mut span = VertexSpan::new(PipelineKind::Image, &mut storage);
        push_image_quads(&mut span, &[page(0.0, 0), page(32.0, 1)], [0.0; 4], 0.75).unwrap();
        let vertices = span.as_slice();
        assert_eq!(vertices.len(), 8);
        assert_eq!(vertices[4].layer, 1);
        assert!(vertices.iter().all(|v| v.alpha == 0.75));
    }

    #[test]
    fn glyph_quads_carry_scale_as_distance_multiplier() {
        let mut storage = [SdfVertex::zeroed(); 4];
        let mut span = VertexSpan::new(PipelineKind::Sdf, &mut storage);
        let color = [0.9, 0.9, 1.0, 1.0];
        push_glyph_quads(&mut span, &[page(0.0, 0)], [0.0; 4], color, 2.0).unwrap();
        assert!(span
            .as_slice()
            .iter()
            .all(|v| v.distance_multiplier == 2.0 && v.color == color));

        // No room for a second glyph
        let err = push_glyph_quads(&mut span, &[page(64.0, 0)], [0.0; 4], color, 2.0).unwrap_err();
        assert!(matches!(err, RenderError::VertexOverflow { pipeline: PipelineKind::Sdf, .. }));
    }
}
