// Signed-distance-field glyphs.
//
// The glyph atlas stores one byte per texel: 0.5 on the outline, rising inside.
// `SDF_DISTANCE_RANGE` texels of distance span the whole 0..1 range; the
// fragment stage scales that by each vertex's distance multiplier (screen
// pixels per atlas texel) to get a one-pixel anti-aliasing ramp at any size.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::mem::offset_of;

use super::image::{atlas_bounds, atlas_push_values};
use super::{
    atlas_bindings, attribute, quad_corners, viewport_scale, window_extent, DescriptorWrite,
    Pipeline, PipelineBase, PipelineKind,
};
use crate::atlas::{Atlas, Image, ImageState, PageQuad, PixelMap};
use crate::backend::VulkanDevice;
use crate::config::AtlasConfig;
use crate::device::Device;

pub const SDF_DISTANCE_RANGE: f32 = 8.0;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SdfVertex {
    pub position: [f32; 2],
    pub clip: [f32; 4],
    pub atlas_position: [f32; 2],
    pub layer: u32,
    pub color: [f32; 4],
    pub distance_multiplier: f32,
    pub atlas_bounds: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SdfPushConstants {
    pub window_extent: [f32; 2],
    pub viewport_scale: [f32; 2],
    pub atlas_extent: [f32; 2],
    pub atlas_scale: [f32; 2],
    pub distance_range: f32,
}

/// Four vertices drawing one page of a glyph.
pub fn glyph_vertices(
    quad: &PageQuad,
    clip: [f32; 4],
    color: [f32; 4],
    distance_multiplier: f32,
) -> [SdfVertex; 4] {
    let screen = quad_corners(quad.min.to_array(), quad.max.to_array());
    let atlas = quad_corners(quad.atlas_min.to_array(), quad.atlas_max.to_array());
    std::array::from_fn(|corner| SdfVertex {
        position: screen[corner],
        clip,
        atlas_position: atlas[corner],
        layer: quad.layer,
        color,
        distance_multiplier,
        atlas_bounds: atlas_bounds(quad),
    })
}

/// Identifies one rasterized glyph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlyphKey {
    pub font: u32,
    pub glyph: u32,
}

/// Glyphs already rasterized for one device.
#[derive(Debug, Default)]
pub struct GlyphCache {
    glyphs: HashMap<GlyphKey, Image>,
}

impl GlyphCache {
    /// The image for `key`, rasterized and uploaded first when it is missing or its
    /// atlas was reset.
    ///
    /// A glyph whose upload failed stays cached and is not rasterized again; the
    /// error is still returned the first time.
    pub fn resident(
        &mut self,
        key: GlyphKey,
        rasterize: impl FnOnce() -> Result<PixelMap<u8>>,
        upload: impl FnOnce(&mut Image, &PixelMap<u8>) -> Result<ImageState>,
    ) -> Result<&Image> {
        let cached = self
            .glyphs
            .get(&key)
            .is_some_and(|image| image.state() != ImageState::Uninitialized);
        if !cached {
            let pixels = rasterize()?;
            let mut image = Image::new(format!("glyph {}:{}", key.font, key.glyph));
            let uploaded = upload(&mut image, &pixels);
            self.glyphs.insert(key, image);
            uploaded?;
        }
        self.glyphs.get(&key).context("glyph vanished from its cache")
    }

    pub fn clear(&mut self) {
        self.glyphs.clear();
    }
}

/// The glyph atlas and the glyphs already resident in it.
pub struct SdfDeviceShared {
    atlas: Mutex<Atlas<u8>>,
    glyphs: Mutex<GlyphCache>,
}

impl SdfDeviceShared {
    pub fn new(device: &VulkanDevice, config: &AtlasConfig) -> Result<Self> {
        Ok(Self {
            atlas: Mutex::new(Atlas::new(device, config, "glyph")?),
            glyphs: Mutex::new(GlyphCache::default()),
        })
    }

    pub fn atlas(&self) -> parking_lot::MutexGuard<'_, Atlas<u8>> {
        self.atlas.lock()
    }

    /// Quads for glyph `key` with its top-left at `origin`.
    ///
    /// `rasterize` runs the first time a glyph is seen on this device, and again
    /// after the atlas was reset. A glyph the atlas had no room for yields no quads.
    pub fn glyph_quads(
        &self,
        device: &VulkanDevice,
        key: GlyphKey,
        origin: Vec2,
        scale: f32,
        rasterize: impl FnOnce() -> Result<PixelMap<u8>>,
    ) -> Result<Vec<PageQuad>> {
        let mut glyphs = self.glyphs.lock();
        let image = glyphs.resident(key, rasterize, |image, pixels| {
            self.atlas.lock().prepare(device, image, pixels)
        })?;
        match image.state() {
            ImageState::Uploaded => Ok(image.quads(origin, scale)),
            _ => Ok(Vec::new()),
        }
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        self.glyphs.get_mut().clear();
        self.atlas.get_mut().destroy(device);
    }
}

#[derive(Default)]
pub struct SdfPipeline {
    base: PipelineBase<SdfVertex>,
}

impl Pipeline for SdfPipeline {
    type Vertex = SdfVertex;
    type PushConstants = SdfPushConstants;
    const KIND: PipelineKind = PipelineKind::Sdf;

    fn base(&self) -> &PipelineBase<SdfVertex> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut PipelineBase<SdfVertex> {
        &mut self.base
    }

    fn descriptor_set_layout_bindings(
        &self,
        device: &Device,
    ) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        atlas_bindings(device.shared().sdf.atlas().layout().max_layers)
    }

    fn write_descriptor_sets(&self, device: &Device) -> Vec<DescriptorWrite> {
        let atlas = device.shared().sdf.atlas();
        vec![
            DescriptorWrite::Sampler(atlas.sampler()),
            DescriptorWrite::SampledImages(atlas.layer_views()),
        ]
    }

    fn descriptor_set_version(&self, device: &Device) -> u64 {
        device.shared().sdf.atlas().version()
    }

    fn push_constants(&self, device: &Device, extent: vk::Extent2D) -> SdfPushConstants {
        let (atlas_extent, atlas_scale) = atlas_push_values(device.shared().sdf.atlas().extent());
        SdfPushConstants {
            window_extent: window_extent(extent),
            viewport_scale: viewport_scale(extent),
            atlas_extent,
            atlas_scale,
            distance_range: SDF_DISTANCE_RANGE,
        }
    }

    fn fragment_specialization(&self, device: &Device) -> Vec<u32> {
        vec![device.shared().sdf.atlas().layout().max_layers]
    }

    fn vertex_attributes() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            attribute(0, vk::Format::R32G32_SFLOAT, offset_of!(SdfVertex, position)),
            attribute(1, vk::Format::R32G32B32A32_SFLOAT, offset_of!(SdfVertex, clip)),
            attribute(2, vk::Format::R32G32_SFLOAT, offset_of!(SdfVertex, atlas_position)),
            attribute(3, vk::Format::R32_UINT, offset_of!(SdfVertex, layer)),
            attribute(4, vk::Format::R32G32B32A32_SFLOAT, offset_of!(SdfVertex, color)),
            attribute(5, vk::Format::R32_SFLOAT, offset_of!(SdfVertex, distance_multiplier)),
            attribute(6, vk::Format::R32G32B32A32_SFLOAT, offset_of!(SdfVertex, atlas_bounds)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::{AtlasLayout, PageAllocator};
    use std::sync::Arc;

    #[test]
    fn vertex_layout_matches_shader_inputs() {
        assert_eq!(std::mem::size_of::<SdfVertex>(), 72);
        let offsets: Vec<u32> = SdfPipeline::vertex_attributes()
            .iter()
            .map(|a| a.offset)
            .collect();
        assert_eq!(offsets, vec![0, 8, 24, 32, 36, 52, 56]);
    }

    #[test]
    fn distance_range_follows_the_atlas_block() {
        // std430 places the trailing float right after the four vec2s
        assert_eq!(offset_of!(SdfPushConstants, distance_range), 32);
        assert_eq!(SdfPipeline::push_constant_ranges()[0].size, 36);
    }

    fn key() -> GlyphKey {
        GlyphKey { font: 1, glyph: 7 }
    }

    #[test]
    fn failed_glyph_is_rasterized_once() {
        let mut cache = GlyphCache::default();
        let mut rasterized = 0;

        let first = cache.resident(
            key(),
            || {
                rasterized += 1;
                Ok(PixelMap::new(8, 8))
            },
            |image, _| {
                image.fail();
                anyhow::bail!("staging buffer lost")
            },
        );
        assert!(first.is_err());

        for _ in 0..3 {
            let image = cache
                .resident(
                    key(),
                    || {
                        rasterized += 1;
                        Ok(PixelMap::new(8, 8))
                    },
                    |_, _| panic!("a failed glyph is not uploaded again"),
                )
                .unwrap();
            assert_eq!(image.state(), ImageState::Failed);
        }
        assert_eq!(rasterized, 1);
    }

    #[test]
    fn glyph_is_rasterized_again_after_an_atlas_reset() {
        let allocator = Arc::new(PageAllocator::new(AtlasLayout {
            pages_per_row: 2,
            max_layers: 1,
        }));
        let mut staging = vec![0u8; 128 * 128];
        let mut rasterized = 0;
        let mut upload = |image: &mut Image, pixels: &PixelMap<u8>| -> Result<ImageState> {
            image.begin_upload(&allocator, pixels.width(), pixels.height(), pixels.source_key());
            image.stage(pixels, &mut staging, 128)?;
            image.finish_upload()?;
            Ok(image.state())
        };

        let mut cache = GlyphCache::default();
        let mut raster = || {
            rasterized += 1;
            Ok(PixelMap::new(8, 8))
        };
        let state = cache.resident(key(), &mut raster, &mut upload).unwrap().state();
        assert_eq!(state, ImageState::Uploaded);
        let state = cache.resident(key(), &mut raster, &mut upload).unwrap().state();
        assert_eq!(state, ImageState::Uploaded);

        allocator.reset();
        let state = cache.resident(key(), &mut raster, &mut upload).unwrap().state();
        assert_eq!(state, ImageState::Uploaded);
        drop(raster);
        assert_eq!(rasterized, 2);
    }

    #[test]
    fn glyph_vertices_carry_color_and_multiplier() {
        let quad = PageQuad {
            min: Vec2::ZERO,
            max: Vec2::new(16.0, 16.0),
            atlas_min: Vec2::new(0.0, 64.0),
            atlas_max: Vec2::new(32.0, 96.0),
            layer: 0,
        };
        let color = [1.0, 1.0, 1.0, 1.0];
        let vertices = glyph_vertices(&quad, [0.0; 4], color, 0.5);
        assert_eq!(vertices[1].position, [16.0, 0.0]);
        assert_eq!(vertices[1].atlas_position, [32.0, 64.0]);
        assert!(vertices
            .iter()
            .all(|v| v.color == color && v.distance_multiplier == 0.5));
        assert!(vertices
            .iter()
            .all(|v| v.atlas_bounds == [0.0, 64.0, 32.0, 96.0]));
    }
}
