// Flat-color quads: backgrounds, borders, selection rectangles.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::mem::offset_of;

use super::{
    attribute, quad_corners, viewport_scale, window_extent, DescriptorWrite, Pipeline,
    PipelineBase, PipelineKind,
};
use crate::device::Device;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FlatVertex {
    /// Pixels from the window's top-left corner
    pub position: [f32; 2],
    /// min x, min y, max x, max y in pixels; fragments outside are discarded
    pub clip: [f32; 4],
    pub color: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FlatPushConstants {
    pub window_extent: [f32; 2],
    pub viewport_scale: [f32; 2],
}

/// Four vertices of a solid rectangle.
pub fn quad(min: [f32; 2], max: [f32; 2], clip: [f32; 4], color: [f32; 4]) -> [FlatVertex; 4] {
    quad_corners(min, max).map(|position| FlatVertex {
        position,
        clip,
        color,
    })
}

#[derive(Default)]
pub struct FlatPipeline {
    base: PipelineBase<FlatVertex>,
}

impl Pipeline for FlatPipeline {
    type Vertex = FlatVertex;
    type PushConstants = FlatPushConstants;
    const KIND: PipelineKind = PipelineKind::Flat;

    fn base(&self) -> &PipelineBase<FlatVertex> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut PipelineBase<FlatVertex> {
        &mut self.base
    }

    fn descriptor_set_layout_bindings(
        &self,
        _device: &Device,
    ) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        Vec::new()
    }

    fn write_descriptor_sets(&self, _device: &Device) -> Vec<DescriptorWrite> {
        Vec::new()
    }

    fn descriptor_set_version(&self, _device: &Device) -> u64 {
        0
    }

    fn push_constants(&self, _device: &Device, extent: vk::Extent2D) -> FlatPushConstants {
        FlatPushConstants {
            window_extent: window_extent(extent),
            viewport_scale: viewport_scale(extent),
        }
    }

    fn vertex_attributes() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            attribute(0, vk::Format::R32G32_SFLOAT, offset_of!(FlatVertex, position)),
            attribute(1, vk::Format::R32G32B32A32_SFLOAT, offset_of!(FlatVertex, clip)),
            attribute(2, vk::Format::R32G32B32A32_SFLOAT, offset_of!(FlatVertex, color)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_shader_inputs() {
        assert_eq!(std::mem::size_of::<FlatVertex>(), 40);
        let binding = FlatPipeline::vertex_binding();
        assert_eq!(binding.stride, 40);

        let attributes = FlatPipeline::vertex_attributes();
        let offsets: Vec<u32> = attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 8, 24]);
        let locations: Vec<u32> = attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![0, 1, 2]);
    }

    #[test]
    fn push_constant_range_covers_the_block() {
        let [range] = FlatPipeline::push_constant_ranges();
        assert_eq!(range.offset, 0);
        assert_eq!(range.size, 16);
        assert!(range.stage_flags.contains(vk::ShaderStageFlags::VERTEX));
    }

    #[test]
    fn quad_keeps_color_and_clip_on_every_corner() {
        let clip = [0.0, 0.0, 100.0, 100.0];
        let color = [1.0, 0.5, 0.25, 1.0];
        let vertices = quad([10.0, 20.0], [30.0, 40.0], clip, color);
        assert_eq!(vertices[2].position, [30.0, 40.0]);
        assert!(vertices.iter().all(|v| v.clip == clip && v.color == color));
    }
}
