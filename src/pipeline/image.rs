// Atlas-backed RGBA images: icons, pictures, anything drawn from pixels.

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use std::mem::offset_of;

use super::{
    atlas_bindings, attribute, quad_corners, viewport_scale, window_extent, DescriptorWrite,
    Pipeline, PipelineBase, PipelineKind,
};
use crate::atlas::{Atlas, Image, ImageState, PageQuad, PixelMap};
use crate::backend::VulkanDevice;
use crate::config::AtlasConfig;
use crate::device::Device;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ImageVertex {
    pub position: [f32; 2],
    pub clip: [f32; 4],
    /// Texel coordinates inside the atlas layer
    pub atlas_position: [f32; 2],
    pub layer: u32,
    pub alpha: f32,
    /// Texel rectangle of the page this quad samples; filtering stays inside it
    pub atlas_bounds: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ImagePushConstants {
    pub window_extent: [f32; 2],
    pub viewport_scale: [f32; 2],
    pub atlas_extent: [f32; 2],
    /// Texels to normalized texture coordinates
    pub atlas_scale: [f32; 2],
}

/// Four vertices drawing one resident page.
pub fn page_vertices(quad: &PageQuad, clip: [f32; 4], alpha: f32) -> [ImageVertex; 4] {
    let screen = quad_corners(quad.min.to_array(), quad.max.to_array());
    let atlas = quad_corners(quad.atlas_min.to_array(), quad.atlas_max.to_array());
    std::array::from_fn(|corner| ImageVertex {
        position: screen[corner],
        clip,
        atlas_position: atlas[corner],
        layer: quad.layer,
        alpha,
        atlas_bounds: atlas_bounds(quad),
    })
}

/// `quad`'s atlas rectangle as min x, min y, max x, max y.
pub fn atlas_bounds(quad: &PageQuad) -> [f32; 4] {
    [quad.atlas_min.x, quad.atlas_min.y, quad.atlas_max.x, quad.atlas_max.y]
}

pub fn atlas_push_values(extent: u32) -> ([f32; 2], [f32; 2]) {
    let extent = extent as f32;
    ([extent, extent], [1.0 / extent, 1.0 / extent])
}

/// The RGBA atlas every image pipeline on a device samples from.
pub struct ImageDeviceShared {
    atlas: Mutex<Atlas<[u8; 4]>>,
}

impl ImageDeviceShared {
    pub fn new(device: &VulkanDevice, config: &AtlasConfig) -> Result<Self> {
        Ok(Self {
            atlas: Mutex::new(Atlas::new(device, config, "image")?),
        })
    }

    /// Upload `pixels` into `image` if they changed. See `Atlas::prepare`.
    pub fn prepare(
        &self,
        device: &VulkanDevice,
        image: &mut Image,
        pixels: &PixelMap<[u8; 4]>,
    ) -> Result<ImageState> {
        self.atlas.lock().prepare(device, image, pixels)
    }

    pub fn atlas(&self) -> parking_lot::MutexGuard<'_, Atlas<[u8; 4]>> {
        self.atlas.lock()
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        self.atlas.get_mut().destroy(device);
    }
}

#[derive(Default)]
pub struct ImagePipeline {
    base: PipelineBase<ImageVertex>,
}

impl Pipeline for ImagePipeline {
    type Vertex = ImageVertex;
    type PushConstants = ImagePushConstants;
    const KIND: PipelineKind = PipelineKind::Image;

    fn base(&self) -> &PipelineBase<ImageVertex> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut PipelineBase<ImageVertex> {
        &mut self.base
    }

    fn descriptor_set_layout_bindings(
        &self,
        device: &Device,
    ) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        atlas_bindings(device.shared().image.atlas().layout().max_layers)
    }

    fn write_descriptor_sets(&self, device: &Device) -> Vec<DescriptorWrite> {
        let atlas = device.shared().image.atlas();
        vec![
            DescriptorWrite::Sampler(atlas.sampler()),
            DescriptorWrite::SampledImages(atlas.layer_views()),
        ]
    }

    fn descriptor_set_version(&self, device: &Device) -> u64 {
        device.shared().image.atlas().version()
    }

    fn push_constants(&self, device: &Device, extent: vk::Extent2D) -> ImagePushConstants {
        let (atlas_extent, atlas_scale) = atlas_push_values(device.shared().image.atlas().extent());
        ImagePushConstants {
            window_extent: window_extent(extent),
            viewport_scale: viewport_scale(extent),
            atlas_extent,
            atlas_scale,
        }
    }

    fn fragment_specialization(&self, device: &Device) -> Vec<u32> {
        vec![device.shared().image.atlas().layout().max_layers]
    }

    fn vertex_attributes() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            attribute(0, vk::Format::R32G32_SFLOAT, offset_of!(ImageVertex, position)),
            attribute(1, vk::Format::R32G32B32A32_SFLOAT, offset_of!(ImageVertex, clip)),
            attribute(2, vk::Format::R32G32_SFLOAT, offset_of!(ImageVertex, atlas_position)),
            attribute(3, vk::Format::R32_UINT, offset_of!(ImageVertex, layer)),
            attribute(4, vk::Format::R32_SFLOAT, offset_of!(ImageVertex, alpha)),
            attribute(5, vk::Format::R32G32B32A32_SFLOAT, offset_of!(ImageVertex, atlas_bounds)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec2;

    #[test]
    fn vertex_layout_matches_shader_inputs() {
        assert_eq!(std::mem::size_of::<ImageVertex>(), 56);
        let offsets: Vec<u32> = ImagePipeline::vertex_attributes()
            .iter()
            .map(|a| a.offset)
            .collect();
        assert_eq!(offsets, vec![0, 8, 24, 32, 36, 40]);
        assert_eq!(ImagePipeline::push_constant_ranges()[0].size, 32);
    }

    #[test]
    fn page_vertices_pair_screen_and_atlas_corners() {
        let quad = PageQuad {
            min: Vec2::new(10.0, 10.0),
            max: Vec2::new(74.0, 42.0),
            atlas_min: Vec2::new(128.0, 0.0),
            atlas_max: Vec2::new(192.0, 32.0),
            layer: 2,
        };
        let vertices = page_vertices(&quad, [0.0, 0.0, 100.0, 100.0], 0.5);
        assert_eq!(vertices[0].position, [10.0, 10.0]);
        assert_eq!(vertices[0].atlas_position, [128.0, 0.0]);
        assert_eq!(vertices[2].position, [74.0, 42.0]);
        assert_eq!(vertices[2].atlas_position, [192.0, 32.0]);
        assert!(vertices.iter().all(|v| v.layer == 2 && v.alpha == 0.5));
        // Every corner clamps to the same page
        assert!(vertices
            .iter()
            .all(|v| v.atlas_bounds == [128.0, 0.0, 192.0, 32.0]));
    }

    #[test]
    fn atlas_scale_inverts_extent() {
        let (extent, scale) = atlas_push_values(1024);
        assert_eq!(extent, [1024.0, 1024.0]);
        assert_eq!(scale, [1.0 / 1024.0, 1.0 / 1024.0]);
    }
}
