// Vulkan presentation for one OS window
//
// VulkanSurface owns the VkSurfaceKHR; SurfaceTarget owns everything built on
// top of it (swapchain, render passes, framebuffers, frame sync and the three
// pipelines) and only exists while the window is ReadyToDraw.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use super::{PresentationBackend, SurfaceLink};
use crate::backend::render_pass::{create_framebuffers, create_render_pass, AttachmentStart};
use crate::backend::{FrameSync, Swapchain, SwapchainPlan};
use crate::device::Device;
use crate::error::RenderError;
use crate::instance::Instance;
use crate::pipeline::{FlatPipeline, FrameTarget, ImagePipeline, Pipeline, SdfPipeline};
use crate::widget::{FrameVertices, Renderable};

pub struct VulkanSurface {
    instance: Arc<Instance>,
    surface: vk::SurfaceKHR,
}

impl VulkanSurface {
    pub fn new(
        instance: Arc<Instance>,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Self> {
        let surface = instance.create_surface(display, window)?;
        Ok(Self { instance, surface })
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }
}

impl Drop for VulkanSurface {
    fn drop(&mut self) {
        log::debug!("Destroying window surface");
        self.instance.destroy_surface(self.surface);
    }
}

impl PresentationBackend for VulkanSurface {
    type Device = Device;
    type Target = SurfaceTarget;
    type Scene = dyn Renderable;

    fn link(&self, device: &Arc<Device>) -> Result<SurfaceLink> {
        device.surface_link(self.surface)
    }

    fn surface_capabilities(&self, device: &Device) -> Result<vk::SurfaceCapabilitiesKHR> {
        device.surface_capabilities(self.surface)
    }

    fn build(&self, device: &Arc<Device>, plan: &SwapchainPlan) -> Result<SurfaceTarget> {
        SurfaceTarget::new(device, self.surface, plan)
    }

    fn teardown(&self, device: &Device, mut target: SurfaceTarget) {
        // The last frame may still be in flight
        if let Err(e) = device.vulkan.wait_idle() {
            log::warn!("Wait for idle before teardown failed: {}", e);
        }
        target.destroy(device);
    }

    fn draw(
        &self,
        device: &Device,
        target: &mut SurfaceTarget,
        scene: &mut (dyn Renderable + 'static),
    ) -> Result<()> {
        target.draw(device, scene)
    }
}

pub struct SurfaceTarget {
    swapchain: Swapchain,
    /// Used by the first pipeline of the frame
    clear_pass: vk::RenderPass,
    load_pass: vk::RenderPass,
    // Built against clear_pass; load_pass is compatible with it
    framebuffers: Vec<vk::Framebuffer>,
    sync: FrameSync,
    flat: FlatPipeline,
    image: ImagePipeline,
    sdf: SdfPipeline,
}

impl SurfaceTarget {
    pub fn new(device: &Device, surface: vk::SurfaceKHR, plan: &SwapchainPlan) -> Result<Self> {
        let swapchain = Swapchain::new(&device.vulkan, surface, plan)?;
        let mut target = Self {
            swapchain,
            clear_pass: vk::RenderPass::null(),
            load_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            sync: FrameSync {
                image_available: vk::Semaphore::null(),
                in_flight_fence: vk::Fence::null(),
            },
            flat: FlatPipeline::default(),
            image: ImagePipeline::default(),
            sdf: SdfPipeline::default(),
        };
        if let Err(e) = target.create_resources(device) {
            target.destroy(device);
            return Err(e);
        }
        Ok(target)
    }

    fn create_resources(&mut self, device: &Device) -> Result<()> {
        let vulkan = &device.vulkan;
        self.sync = FrameSync::new(vulkan)?;
        self.clear_pass =
            create_render_pass(vulkan, self.swapchain.format, AttachmentStart::Clear)?;
        self.load_pass = create_render_pass(vulkan, self.swapchain.format, AttachmentStart::Load)?;
        self.framebuffers = create_framebuffers(
            vulkan,
            &self.swapchain.image_views,
            self.clear_pass,
            self.swapchain.extent,
        )?;

        self.flat.build(device, self.clear_pass)?;
        self.image.build(device, self.load_pass)?;
        self.sdf.build(device, self.load_pass)?;
        Ok(())
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    /// Release everything, pipelines first. Handles that were never created are skipped.
    pub fn destroy(&mut self, device: &Device) {
        self.sdf.teardown(device);
        self.image.teardown(device);
        self.flat.teardown(device);

        let vulkan = &device.vulkan;
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                vulkan.device.destroy_framebuffer(framebuffer, None);
            }
            for pass in [&mut self.load_pass, &mut self.clear_pass] {
                if *pass != vk::RenderPass::null() {
                    vulkan.device.destroy_render_pass(*pass, None);
                    *pass = vk::RenderPass::null();
                }
            }
        }
        self.sync.destroy(vulkan);
        self.swapchain.destroy(vulkan);
    }

    /// One frame: acquire, let the scene place vertices, render every pipeline in
    /// order, present.
    ///
    /// A scene error still renders and presents what was placed, then is returned.
    /// Any other failure after acquire comes back as `RenderError::FrameAbandoned`,
    /// since the frame's semaphores and fence can only be trusted again after a
    /// rebuild.
    pub fn draw(&mut self, device: &Device, scene: &mut dyn Renderable) -> Result<()> {
        let vulkan = &device.vulkan;

        // Step 1: wait for the previous frame, then grab an image
        self.sync.wait(vulkan)?;
        let (image_index, _) = self
            .swapchain
            .acquire_next_image(vulkan, self.sync.image_available)?;

        self.render_and_present(device, scene, image_index)
            .map_err(|e| match e.downcast_ref::<RenderError>() {
                Some(RenderError::SwapchainOutOfDate | RenderError::DeviceLost) => e,
                _ => e.context(RenderError::FrameAbandoned),
            })?
    }

    /// Steps 2 to 4 of `draw`. The outer result is the frame itself, the inner one
    /// is what the scene reported while placing vertices.
    fn render_and_present(
        &mut self,
        device: &Device,
        scene: &mut dyn Renderable,
        image_index: u32,
    ) -> Result<Result<()>> {
        // Step 2: widgets write straight into the mapped vertex buffers
        let extent = self.swapchain.extent;
        let (placed, counts) = {
            let mut frame = FrameVertices {
                flat: self.flat.vertex_span(device)?,
                image: self.image.vertex_span(device)?,
                sdf: self.sdf.vertex_span(device)?,
                extent,
            };
            let placed = scene.place_vertices(device, &mut frame);
            (placed, [frame.flat.len(), frame.image.len(), frame.sdf.len()])
        };
        self.flat.commit_vertices(counts[0]);
        self.image.commit_vertices(counts[1]);
        self.sdf.commit_vertices(counts[2]);

        // Step 3: flat -> image -> sdf, the last one signals the frame fence
        let framebuffer = *self
            .framebuffers
            .get(image_index as usize)
            .context("Swapchain returned an unknown image index")?;
        let clear_color = device.config().graphics.clear_color;
        let target = |render_pass, fence| FrameTarget {
            framebuffer,
            render_pass,
            extent,
            clear_color,
            fence,
        };

        let flat_done = self.flat.render(
            device,
            &target(self.clear_pass, vk::Fence::null()),
            self.sync.image_available,
        )?;
        let image_done = self
            .image
            .render(device, &target(self.load_pass, vk::Fence::null()), flat_done)?;
        // The fence is reset only once the submit that signals it is next
        let last = target(self.load_pass, self.sync.in_flight_fence);
        self.sdf.record(device, &last)?;
        self.sync.reset(&device.vulkan)?;
        let sdf_done = self.sdf.submit(device, &last, image_done)?;

        // Step 4: present
        let suboptimal = self
            .swapchain
            .present(&device.vulkan, image_index, &[sdf_done])?;
        if suboptimal {
            return Err(RenderError::SwapchainOutOfDate.into());
        }
        Ok(placed)
    }
}
