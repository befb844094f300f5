// Synchronization primitives
//
// One acquire semaphore and one fence per window. Each pipeline owns the
// semaphore it signals, so the frame forms a chain:
// image_available -> flat -> image -> sdf -> present.

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;

/// Frame synchronization for a single frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        // Start signaled
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        Ok(Self {
            image_available: create_semaphore(device)?,
            in_flight_fence: unsafe { device.device.create_fence(&fence_info, None) }
                .context("Failed to create fence")?,
        })
    }

    /// Block until the previous frame's last submission has completed.
    pub fn wait(&self, device: &VulkanDevice) -> Result<()> {
        unsafe {
            device
                .device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
        }
        .map_err(map_device_error)
    }

    pub fn reset(&self, device: &VulkanDevice) -> Result<()> {
        unsafe { device.device.reset_fences(&[self.in_flight_fence]) }.map_err(map_device_error)
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            if self.image_available != vk::Semaphore::null() {
                device.device.destroy_semaphore(self.image_available, None);
                self.image_available = vk::Semaphore::null();
            }
            if self.in_flight_fence != vk::Fence::null() {
                device.device.destroy_fence(self.in_flight_fence, None);
                self.in_flight_fence = vk::Fence::null();
            }
        }
    }
}

pub fn create_semaphore(device: &VulkanDevice) -> Result<vk::Semaphore> {
    let semaphore_info = vk::SemaphoreCreateInfo::default();
    unsafe { device.device.create_semaphore(&semaphore_info, None) }
        .context("Failed to create semaphore")
}

/// Device loss becomes a typed error; anything else keeps its driver code.
pub(crate) fn map_device_error(result: vk::Result) -> anyhow::Error {
    match crate::error::RenderError::from_vk(result) {
        Some(render_error) => anyhow::Error::new(render_error),
        None => anyhow::Error::new(result),
    }
}
