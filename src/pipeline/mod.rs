// Pipelines - one draw category per frame
//
// Every pipeline owns a mapped vertex buffer, its descriptor set, a pipeline
// layout with one push-constant block, and the command buffer it records each
// frame. `render` flushes the vertices, records, and submits, waiting on the
// previous pipeline's semaphore and signalling its own:
//
//   image_available -> flat -> image -> sdf -> present
//
// The variants differ only in what the `Pipeline` trait's required methods
// return; everything else lives in the provided methods below.

pub mod flat;
pub mod image;
pub mod sdf;

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::MemoryLocation;
use std::path::Path;

use crate::backend::shader::ShaderStages;
use crate::backend::sync::{create_semaphore, map_device_error};
use crate::backend::MappedBuffer;
use crate::device::{Device, QUAD_INDICES};
use crate::error::RenderError;

pub use flat::{FlatPipeline, FlatVertex};
pub use image::{ImagePipeline, ImageVertex};
pub use sdf::{SdfPipeline, SdfVertex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Flat,
    Image,
    Sdf,
}

impl PipelineKind {
    /// Draw order within a frame
    pub const ALL: [PipelineKind; 3] = [PipelineKind::Flat, PipelineKind::Image, PipelineKind::Sdf];

    /// Base name of the SPIR-V files under the shader directory
    pub fn shader_name(self) -> &'static str {
        match self {
            PipelineKind::Flat => "flat",
            PipelineKind::Image => "image",
            PipelineKind::Sdf => "sdf",
        }
    }
}

/// Everything a pipeline needs to know about the image it draws into.
#[derive(Debug, Clone, Copy)]
pub struct FrameTarget {
    pub framebuffer: vk::Framebuffer,
    pub render_pass: vk::RenderPass,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    /// Signalled by the last submission of the frame, null for the others.
    pub fence: vk::Fence,
}

/// One descriptor binding's contents, by binding index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorWrite {
    Sampler(vk::Sampler),
    SampledImages(Vec<vk::ImageView>),
}

impl DescriptorWrite {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            DescriptorWrite::Sampler(_) => vk::DescriptorType::SAMPLER,
            DescriptorWrite::SampledImages(_) => vk::DescriptorType::SAMPLED_IMAGE,
        }
    }

    fn image_infos(&self) -> Vec<vk::DescriptorImageInfo> {
        match self {
            DescriptorWrite::Sampler(sampler) => {
                vec![vk::DescriptorImageInfo::default().sampler(*sampler)]
            }
            DescriptorWrite::SampledImages(views) => views
                .iter()
                .map(|&view| {
                    vk::DescriptorImageInfo::default()
                        .image_view(view)
                        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                })
                .collect(),
        }
    }
}

/// Sampler at binding 0, `layers` sampled images at binding 1, fragment stage only.
pub fn atlas_bindings(layers: u32) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
    vec![
        vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT),
        vk::DescriptorSetLayoutBinding::default()
            .binding(1)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .descriptor_count(layers)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT),
    ]
}

// =============================================================================
// VERTEX SPANS
// =============================================================================

/// The part of a pipeline's mapped vertex buffer a frame writes into.
///
/// Capacity is fixed; running past it is an error, never a silent drop.
pub struct VertexSpan<'a, V> {
    kind: PipelineKind,
    data: &'a mut [V],
    len: usize,
}

impl<'a, V: Copy> VertexSpan<'a, V> {
    pub fn new(kind: PipelineKind, data: &'a mut [V]) -> Self {
        Self { kind, data, len: 0 }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[V] {
        &self.data[..self.len]
    }

    /// Push all four corners or none of them.
    pub fn push_quad(&mut self, corners: [V; 4]) -> Result<(), RenderError> {
        if self.len + corners.len() > self.data.len() {
            return Err(RenderError::VertexOverflow {
                pipeline: self.kind,
                capacity: self.data.len(),
            });
        }
        self.data[self.len..self.len + corners.len()].copy_from_slice(&corners);
        self.len += corners.len();
        Ok(())
    }
}

/// Corners of an axis-aligned quad in index-buffer order: top-left, top-right,
/// bottom-right, bottom-left.
pub fn quad_corners(min: [f32; 2], max: [f32; 2]) -> [[f32; 2]; 4] {
    [
        [min[0], min[1]],
        [max[0], min[1]],
        [max[0], max[1]],
        [min[0], max[1]],
    ]
}

/// Indices drawn for `vertex_count` quad vertices: two triangles per four vertices.
pub fn index_count(vertex_count: usize) -> u32 {
    ((vertex_count / 4) * QUAD_INDICES.len()) as u32
}

/// Pixel-to-clip-space scale pushed to every vertex shader.
pub fn viewport_scale(extent: vk::Extent2D) -> [f32; 2] {
    [2.0 / extent.width as f32, 2.0 / extent.height as f32]
}

pub fn window_extent(extent: vk::Extent2D) -> [f32; 2] {
    [extent.width as f32, extent.height as f32]
}

// =============================================================================
// SHARED STATE
// =============================================================================

/// GPU objects every pipeline owns. All handles are null outside ReadyToDraw.
pub struct PipelineBase<V> {
    vertex_buffer: Option<MappedBuffer<V>>,
    vertex_count: usize,

    descriptor_pool: vk::DescriptorPool,
    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_set: vk::DescriptorSet,
    descriptor_version: Option<u64>,

    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,

    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    render_finished: vk::Semaphore,
}

impl<V> Default for PipelineBase<V> {
    fn default() -> Self {
        Self {
            vertex_buffer: None,
            vertex_count: 0,
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            descriptor_set: vk::DescriptorSet::null(),
            descriptor_version: None,
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            render_finished: vk::Semaphore::null(),
        }
    }
}

impl<V> PipelineBase<V> {
    pub fn is_built(&self) -> bool {
        self.pipeline != vk::Pipeline::null()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    pub fn descriptor_version(&self) -> Option<u64> {
        self.descriptor_version
    }
}

// =============================================================================
// PIPELINE CONTRACT
// =============================================================================

pub trait Pipeline {
    type Vertex: Pod;
    type PushConstants: Pod;
    const KIND: PipelineKind;

    fn base(&self) -> &PipelineBase<Self::Vertex>;
    fn base_mut(&mut self) -> &mut PipelineBase<Self::Vertex>;

    fn descriptor_set_layout_bindings(
        &self,
        device: &Device,
    ) -> Vec<vk::DescriptorSetLayoutBinding<'static>>;

    /// Contents for each binding of `descriptor_set_layout_bindings`, in order.
    fn write_descriptor_sets(&self, device: &Device) -> Vec<DescriptorWrite>;

    /// Changes whenever `write_descriptor_sets` would return something new.
    fn descriptor_set_version(&self, device: &Device) -> u64;

    fn push_constants(&self, device: &Device, extent: vk::Extent2D) -> Self::PushConstants;

    fn vertex_attributes() -> Vec<vk::VertexInputAttributeDescription>;

    /// Fragment specialization constants, by constant_id.
    fn fragment_specialization(&self, _device: &Device) -> Vec<u32> {
        Vec::new()
    }

    fn vertex_binding() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(std::mem::size_of::<Self::Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    fn push_constant_ranges() -> [vk::PushConstantRange; 1] {
        [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(std::mem::size_of::<Self::PushConstants>() as u32)]
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    fn build_vertex_buffers(&mut self, device: &Device) -> Result<()> {
        let capacity = device.max_vertices();
        let create_info = MappedBuffer::<Self::Vertex>::create_info(
            &device.vulkan,
            capacity,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        );
        let (buffer, allocation) = device.create_buffer(
            &create_info,
            MemoryLocation::CpuToGpu,
            &format!("{:?} vertices", Self::KIND),
        )?;
        let buffer = MappedBuffer::from_parts(buffer, allocation, capacity);
        let base = self.base_mut();
        base.vertex_buffer = Some(buffer);
        base.vertex_count = 0;
        Ok(())
    }

    fn teardown_vertex_buffers(&mut self, device: &Device) {
        let base = self.base_mut();
        if let Some(mut buffer) = base.vertex_buffer.take() {
            buffer.destroy(&device.vulkan);
        }
        base.vertex_count = 0;
    }

    /// Create every GPU object of the pipeline. On failure nothing is left behind.
    fn build(&mut self, device: &Device, render_pass: vk::RenderPass) -> Result<()> {
        if self.base().is_built() {
            anyhow::bail!("{:?} pipeline built twice", Self::KIND);
        }
        let result = self
            .build_vertex_buffers(device)
            .and_then(|_| self.build_descriptors(device))
            .and_then(|_| self.build_graphics_pipeline(device, render_pass))
            .and_then(|_| self.build_commands(device));
        if let Err(e) = result {
            self.teardown(device);
            return Err(e.context(format!("Failed to build {:?} pipeline", Self::KIND)));
        }
        log::debug!("{:?} pipeline built", Self::KIND);
        Ok(())
    }

    fn build_descriptors(&mut self, device: &Device) -> Result<()> {
        let bindings = self.descriptor_set_layout_bindings(device);
        if bindings.is_empty() {
            return Ok(());
        }
        let dev = &device.vulkan.device;

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let set_layout = unsafe { dev.create_descriptor_set_layout(&layout_info, None) }
            .context("Failed to create descriptor set layout")?;
        self.base_mut().descriptor_set_layout = set_layout;

        let pool_sizes: Vec<vk::DescriptorPoolSize> = bindings
            .iter()
            .map(|binding| vk::DescriptorPoolSize {
                ty: binding.descriptor_type,
                descriptor_count: binding.descriptor_count,
            })
            .collect();
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { dev.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;
        self.base_mut().descriptor_pool = pool;

        let set_layouts = [set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        let set = unsafe { dev.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor set")?[0];
        self.base_mut().descriptor_set = set;

        self.update_descriptor_sets(device)
    }

    /// Rewrite the descriptor set if its contents changed since the last write.
    fn update_descriptor_sets(&mut self, device: &Device) -> Result<()> {
        if self.base().descriptor_set == vk::DescriptorSet::null() {
            return Ok(());
        }
        let version = self.descriptor_set_version(device);
        if self.base().descriptor_version == Some(version) {
            return Ok(());
        }

        let writes = self.write_descriptor_sets(device);
        let bindings = self.descriptor_set_layout_bindings(device);
        if writes.len() != bindings.len() {
            anyhow::bail!(
                "{:?} pipeline has {} descriptor bindings but {} writes",
                Self::KIND,
                bindings.len(),
                writes.len()
            );
        }

        let image_infos: Vec<Vec<vk::DescriptorImageInfo>> =
            writes.iter().map(DescriptorWrite::image_infos).collect();
        let set = self.base().descriptor_set;
        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .zip(&bindings)
            .zip(&image_infos)
            .map(|((write, binding), infos)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(binding.binding)
                    .descriptor_type(write.descriptor_type())
                    .image_info(infos)
            })
            .collect();

        unsafe { device.vulkan.device.update_descriptor_sets(&vk_writes, &[]) };
        self.base_mut().descriptor_version = Some(version);
        log::debug!("{:?} descriptors written (version {})", Self::KIND, version);
        Ok(())
    }

    fn build_graphics_pipeline(
        &mut self,
        device: &Device,
        render_pass: vk::RenderPass,
    ) -> Result<()> {
        let dev = &device.vulkan.device;

        // Pipeline layout
        let set_layouts: Vec<vk::DescriptorSetLayout> = Some(self.base().descriptor_set_layout)
            .filter(|layout| *layout != vk::DescriptorSetLayout::null())
            .into_iter()
            .collect();
        let push_constant_ranges = Self::push_constant_ranges();
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let layout = unsafe { dev.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;
        self.base_mut().layout = layout;

        // Shader stages
        let shader_dir: &Path = &device.config().graphics.shader_dir;
        let shaders = ShaderStages::load(&device.vulkan, shader_dir, Self::KIND.shader_name())?;
        let mut stages = shaders.create_infos();

        let constants = self.fragment_specialization(device);
        let map_entries: Vec<vk::SpecializationMapEntry> = (0..constants.len())
            .map(|id| {
                vk::SpecializationMapEntry::default()
                    .constant_id(id as u32)
                    .offset((id * std::mem::size_of::<u32>()) as u32)
                    .size(std::mem::size_of::<u32>())
            })
            .collect();
        let specialization = vk::SpecializationInfo::default()
            .map_entries(&map_entries)
            .data(bytemuck::cast_slice(&constants));
        if !constants.is_empty() {
            stages[1] = stages[1].specialization_info(&specialization);
        }

        // Vertex input
        let bindings = [Self::vertex_binding()];
        let attributes = Self::vertex_attributes();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport and scissor follow the swapchain extent at record time
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        // 2D quads: no culling, no depth
        let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        // Straight alpha over what earlier pipelines drew
        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD);
        let color_blend_attachments = [color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);

        let created = unsafe {
            dev.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| e);
        shaders.destroy(&device.vulkan);

        let pipelines = created.context("Failed to create graphics pipeline")?;
        self.base_mut().pipeline = pipelines[0];
        Ok(())
    }

    fn build_commands(&mut self, device: &Device) -> Result<()> {
        let dev = &device.vulkan.device;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.vulkan.graphics_queue.family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { dev.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;
        self.base_mut().command_pool = pool;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { dev.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffer")?[0];
        self.base_mut().command_buffer = command_buffer;

        self.base_mut().render_finished = create_semaphore(&device.vulkan)?;
        Ok(())
    }

    /// Destroy everything `build` created. Safe to call more than once and on a
    /// partially built pipeline. The caller makes sure no submission is pending.
    fn teardown(&mut self, device: &Device) {
        self.teardown_vertex_buffers(device);
        let dev = &device.vulkan.device;
        let base = self.base_mut();
        unsafe {
            if base.render_finished != vk::Semaphore::null() {
                dev.destroy_semaphore(base.render_finished, None);
            }
            if base.command_pool != vk::CommandPool::null() {
                // Frees the command buffer too
                dev.destroy_command_pool(base.command_pool, None);
            }
            if base.pipeline != vk::Pipeline::null() {
                dev.destroy_pipeline(base.pipeline, None);
            }
            if base.layout != vk::PipelineLayout::null() {
                dev.destroy_pipeline_layout(base.layout, None);
            }
            if base.descriptor_pool != vk::DescriptorPool::null() {
                // Frees the descriptor set too
                dev.destroy_descriptor_pool(base.descriptor_pool, None);
            }
            if base.descriptor_set_layout != vk::DescriptorSetLayout::null() {
                dev.destroy_descriptor_set_layout(base.descriptor_set_layout, None);
            }
        }
        *base = PipelineBase::default();
    }

    // =========================================================================
    // PER FRAME
    // =========================================================================

    /// The vertex span widgets fill for this frame. Starts empty.
    fn vertex_span(&mut self, device: &Device) -> Result<VertexSpan<'_, Self::Vertex>> {
        let base = self.base_mut();
        base.vertex_count = 0;
        let buffer = base
            .vertex_buffer
            .as_mut()
            .with_context(|| format!("{:?} pipeline has no vertex buffer", Self::KIND))?;
        let capacity = buffer.capacity();
        let data = device.map_memory::<Self::Vertex>(buffer.allocation_mut()?)?;
        Ok(VertexSpan::new(Self::KIND, &mut data[..capacity]))
    }

    /// Record how many vertices the span received.
    fn commit_vertices(&mut self, count: usize) {
        self.base_mut().vertex_count = count;
    }

    /// Flush, record and submit. Waits on `input_semaphore` and returns the
    /// semaphore this pipeline signals.
    fn render(
        &mut self,
        device: &Device,
        frame: &FrameTarget,
        input_semaphore: vk::Semaphore,
    ) -> Result<vk::Semaphore> {
        self.record(device, frame)?;
        self.submit(device, frame, input_semaphore)
    }

    /// Flush this frame's vertices, refresh descriptors and record the command buffer.
    fn record(&mut self, device: &Device, frame: &FrameTarget) -> Result<()> {
        if !self.base().is_built() {
            anyhow::bail!("{:?} pipeline rendered before it was built", Self::KIND);
        }

        // Step 1: make this frame's vertices visible to the GPU
        let count = self.base().vertex_count;
        if let Some(buffer) = &self.base().vertex_buffer {
            let stride = std::mem::size_of::<Self::Vertex>() as vk::DeviceSize;
            device.flush_allocation(buffer.allocation()?, 0, count as vk::DeviceSize * stride)?;
        }

        // Step 2: pick up new atlas layers
        self.update_descriptor_sets(device)?;

        // Step 3: record
        let dev = &device.vulkan.device;
        let cmd = self.base().command_buffer;
        unsafe {
            dev.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            dev.begin_command_buffer(cmd, &begin_info)?;

            let clear_values = [vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: frame.clear_color,
                },
            }];
            let render_pass_info = vk::RenderPassBeginInfo::default()
                .render_pass(frame.render_pass)
                .framebuffer(frame.framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: frame.extent,
                })
                .clear_values(&clear_values);
            dev.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
        }
        if count > 0 {
            self.draw_in_command_buffer(device, cmd, frame.extent);
        }
        unsafe {
            dev.cmd_end_render_pass(cmd);
            dev.end_command_buffer(cmd)?;
        }
        Ok(())
    }

    /// Submit what `record` recorded, chained on the previous pipeline.
    fn submit(
        &self,
        device: &Device,
        frame: &FrameTarget,
        input_semaphore: vk::Semaphore,
    ) -> Result<vk::Semaphore> {
        let wait_semaphores = [input_semaphore];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.base().render_finished];
        let command_buffers = [self.base().command_buffer];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        device
            .vulkan
            .queue_submit(device.vulkan.graphics_queue.queue, &[submit_info], frame.fence)
            .map_err(map_device_error)
            .with_context(|| format!("Failed to submit {:?} pipeline", Self::KIND))?;

        Ok(self.base().render_finished)
    }

    /// Bind, push constants, and draw this frame's quads.
    fn draw_in_command_buffer(
        &self,
        device: &Device,
        cmd: vk::CommandBuffer,
        extent: vk::Extent2D,
    ) {
        let base = self.base();
        let Some(buffer) = &base.vertex_buffer else {
            return;
        };
        let dev = &device.vulkan.device;
        let push_constants = self.push_constants(device, extent);

        unsafe {
            dev.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, base.pipeline);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            dev.cmd_set_viewport(cmd, 0, &[viewport]);
            dev.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                }],
            );

            dev.cmd_bind_vertex_buffers(cmd, 0, &[buffer.buffer], &[0]);
            dev.cmd_bind_index_buffer(cmd, device.quad_index_buffer(), 0, vk::IndexType::UINT16);

            if base.descriptor_set != vk::DescriptorSet::null() {
                dev.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    base.layout,
                    0,
                    &[base.descriptor_set],
                    &[],
                );
            }

            dev.cmd_push_constants(
                cmd,
                base.layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                bytemuck::bytes_of(&push_constants),
            );

            dev.cmd_draw_indexed(cmd, index_count(base.vertex_count), 1, 0, 0, 0);
        }
    }
}

/// Vertex attribute at `location` reading `format` from byte `offset`.
pub fn attribute(
    location: u32,
    format: vk::Format,
    offset: usize,
) -> vk::VertexInputAttributeDescription {
    vk::VertexInputAttributeDescription::default()
        .binding(0)
        .location(location)
        .format(format)
        .offset(offset as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn viewport_scale_is_two_over_extent() {
        for (w, h) in [(800, 600), (1, 1), (1920, 1080), (333, 7)] {
            let scale = viewport_scale(extent(w, h));
            assert_eq!(scale, [2.0 / w as f32, 2.0 / h as f32]);
        }
        assert_eq!(window_extent(extent(800, 600)), [800.0, 600.0]);
    }

    #[test]
    fn two_triangles_per_quad() {
        assert_eq!(index_count(0), 0);
        assert_eq!(index_count(4), 6);
        assert_eq!(index_count(40), 60);
        // A trailing partial quad is not drawn
        assert_eq!(index_count(7), 6);
    }

    #[test]
    fn span_overflow_is_an_error() {
        let mut storage = [0u32; 5];
        let mut span = VertexSpan::new(PipelineKind::Flat, &mut storage);
        span.push_quad([1, 2, 3, 4]).unwrap();
        assert_eq!(
            span.push_quad([5, 6, 7, 8]),
            Err(RenderError::VertexOverflow {
                pipeline: PipelineKind::Flat,
                capacity: 5
            })
        );
        // The failed quad left nothing behind
        assert_eq!(span.len(), 4);
        assert_eq!(span.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(span.capacity(), 5);
    }

    #[test]
    fn quad_corners_follow_index_order() {
        let corners = quad_corners([1.0, 2.0], [3.0, 4.0]);
        assert_eq!(corners, [[1.0, 2.0], [3.0, 2.0], [3.0, 4.0], [1.0, 4.0]]);
    }

    #[test]
    fn atlas_bindings_cover_sampler_and_layers() {
        let bindings = atlas_bindings(4);
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].descriptor_type, vk::DescriptorType::SAMPLER);
        assert_eq!(bindings[1].descriptor_count, 4);
        assert_eq!(
            DescriptorWrite::SampledImages(vec![]).descriptor_type(),
            vk::DescriptorType::SAMPLED_IMAGE
        );
    }
}
