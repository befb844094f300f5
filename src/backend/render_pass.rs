// Render passes and framebuffers for swapchain images
//
// The first pipeline of a frame clears the image; every later pipeline loads
// what the previous one drew. Both passes end in PRESENT_SRC so any of them
// can be the last one before present.

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentStart {
    Clear,
    Load,
}

impl AttachmentStart {
    fn load_op(self) -> vk::AttachmentLoadOp {
        match self {
            AttachmentStart::Clear => vk::AttachmentLoadOp::CLEAR,
            AttachmentStart::Load => vk::AttachmentLoadOp::LOAD,
        }
    }

    fn initial_layout(self) -> vk::ImageLayout {
        match self {
            AttachmentStart::Clear => vk::ImageLayout::UNDEFINED, // Don't care about old contents
            AttachmentStart::Load => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }
}

/// Create a single-subpass render pass over one color attachment
pub fn create_render_pass(
    device: &VulkanDevice,
    format: vk::Format,
    start: AttachmentStart,
) -> Result<vk::RenderPass> {
    // Color attachment (the swapchain image)
    let color_attachment = vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(start.load_op())
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(start.initial_layout())
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

    let color_attachment_ref = vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

    let color_attachments = [color_attachment_ref];
    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachments);

    // Earlier passes of the same frame wrote this attachment
    let dependency = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        );

    let attachments = [color_attachment];
    let subpasses = [subpass];
    let dependencies = [dependency];

    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe {
        device
            .device
            .create_render_pass(&render_pass_info, None)
            .context("Failed to create render pass")
    }
}

/// Create one framebuffer per swapchain image
pub fn create_framebuffers(
    device: &VulkanDevice,
    image_views: &[vk::ImageView],
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    image_views
        .iter()
        .map(|&image_view| {
            let attachments = [image_view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            unsafe {
                device
                    .device
                    .create_framebuffer(&framebuffer_info, None)
                    .context("Failed to create framebuffer")
            }
        })
        .collect()
}
