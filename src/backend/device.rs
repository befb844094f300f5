// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Logical device + graphics/present queue creation
// - Memory allocator setup (shared by every window on this GPU)
// - One-shot command submission for uploads

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use std::ffi::CStr;
use std::sync::Arc;

use crate::instance::Instance;

/// Queue family indices picked for a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// True when one family serves both graphics and present.
    pub fn shares_queue(&self) -> bool {
        self.graphics == self.present
    }

    /// Pick families from `properties`, preferring one family that does both jobs.
    pub fn find(
        properties: &[vk::QueueFamilyProperties],
        supports_present: impl Fn(u32) -> bool,
    ) -> Option<Self> {
        let graphics: Vec<u32> = properties
            .iter()
            .enumerate()
            .filter(|(_, props)| {
                props.queue_count > 0 && props.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            })
            .map(|(i, _)| i as u32)
            .collect();

        if let Some(&both) = graphics.iter().find(|&&i| supports_present(i)) {
            return Some(Self {
                graphics: both,
                present: both,
            });
        }

        let present = (0..properties.len() as u32)
            .find(|&i| properties[i as usize].queue_count > 0 && supports_present(i))?;
        Some(Self {
            graphics: *graphics.first()?,
            present,
        })
    }
}

/// A queue plus the family it came from.
#[derive(Debug, Clone, Copy)]
pub struct DeviceQueue {
    pub queue: vk::Queue,
    pub family_index: u32,
    /// The same queue also serves the other role.
    pub serves_both: bool,
}

/// Vulkan device wrapper with explicit cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub swapchain_loader: ash::khr::swapchain::Device,

    pub graphics_queue: DeviceQueue,
    pub present_queue: DeviceQueue,

    // Device properties (cached for performance)
    pub properties: vk::PhysicalDeviceProperties,

    // Taken in Drop before the device goes away; gpu-allocator frees its blocks on drop.
    allocator: Mutex<Option<Allocator>>,
    // vkQueueSubmit needs external synchronization across windows sharing this device.
    queue_lock: Mutex<()>,
    upload_pool: Mutex<vk::CommandPool>,

    instance: Arc<Instance>,
}

impl VulkanDevice {
    pub fn new(
        instance: Arc<Instance>,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilies,
    ) -> Result<Self> {
        let properties = unsafe {
            instance
                .instance
                .get_physical_device_properties(physical_device)
        };
        log::info!(
            "Creating logical device on {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );

        let device = Self::create_logical_device(&instance, physical_device, families)?;

        let graphics_queue = DeviceQueue {
            queue: unsafe { device.get_device_queue(families.graphics, 0) },
            family_index: families.graphics,
            serves_both: families.shares_queue(),
        };
        let present_queue = DeviceQueue {
            queue: unsafe { device.get_device_queue(families.present, 0) },
            family_index: families.present,
            serves_both: families.shares_queue(),
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(families.graphics)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let upload_pool = unsafe { device.create_command_pool(&pool_info, None)? };

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance.instance, &device);

        Ok(Self {
            device,
            physical_device,
            swapchain_loader,
            graphics_queue,
            present_queue,
            properties,
            allocator: Mutex::new(Some(allocator)),
            queue_lock: Mutex::new(()),
            upload_pool: Mutex::new(upload_pool),
            instance,
        })
    }

    fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilies,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let mut family_indices = vec![families.graphics];
        if !families.shares_queue() {
            family_indices.push(families.present);
        }
        let queue_create_infos: Vec<_> = family_indices
            .iter()
            .map(|&index| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(index)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let extensions = [ash::khr::swapchain::NAME.as_ptr()];

        // Atlas layers are indexed per vertex in the fragment stage.
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default()
            .shader_sampled_image_array_non_uniform_indexing(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut vulkan12);

        let device = unsafe {
            instance
                .instance
                .create_device(physical_device, &create_info, None)
        }
        .context("Failed to create logical device")?;

        Ok(device)
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn queue_families(&self) -> QueueFamilies {
        QueueFamilies {
            graphics: self.graphics_queue.family_index,
            present: self.present_queue.family_index,
        }
    }

    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.properties.limits.non_coherent_atom_size.max(1)
    }

    /// Lock the shared allocator. Fails once the device is being torn down.
    pub fn allocator(&self) -> Result<parking_lot::MappedMutexGuard<'_, Allocator>> {
        MutexGuard::try_map(self.allocator.lock(), |allocator| allocator.as_mut())
            .map_err(|_| anyhow::anyhow!("GPU allocator already destroyed"))
    }

    /// Submit to a queue while holding the device-wide queue lock.
    pub fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> ash::prelude::VkResult<()> {
        let _guard = self.queue_lock.lock();
        unsafe { self.device.queue_submit(queue, submits, fence) }
    }

    pub fn queue_present(
        &self,
        queue: vk::Queue,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> ash::prelude::VkResult<bool> {
        let _guard = self.queue_lock.lock();
        unsafe { self.swapchain_loader.queue_present(queue, present_info) }
    }

    /// Record commands with `record`, run them on the graphics queue, and wait.
    pub fn submit_once(&self, record: impl FnOnce(vk::CommandBuffer)) -> Result<()> {
        let pool = self.upload_pool.lock();

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info)?[0] };

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let result = (|| -> Result<()> {
            unsafe { self.device.begin_command_buffer(cmd, &begin_info)? };
            record(cmd);
            unsafe { self.device.end_command_buffer(cmd)? };

            let fence = unsafe {
                self.device
                    .create_fence(&vk::FenceCreateInfo::default(), None)?
            };
            let command_buffers = [cmd];
            let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
            let submitted = self
                .queue_submit(self.graphics_queue.queue, &[submit], fence)
                .and_then(|_| unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) });
            unsafe { self.device.destroy_fence(fence, None) };
            submitted
                .map_err(super::sync::map_device_error)
                .context("One-shot submission failed")
        })();

        unsafe { self.device.free_command_buffers(*pool, &[cmd]) };
        result
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        let _guard = self.queue_lock.lock();
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Allocator releases its memory blocks against the still-live device.
        drop(self.allocator.lock().take());

        unsafe {
            self.device
                .destroy_command_pool(*self.upload_pool.get_mut(), None);
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_a_family_that_does_both() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let found = QueueFamilies::find(&families, |i| i != 0).unwrap();
        assert_eq!(found, QueueFamilies { graphics: 2, present: 2 });
        assert!(found.shares_queue());
    }

    #[test]
    fn falls_back_to_separate_families() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let found = QueueFamilies::find(&families, |i| i == 1).unwrap();
        assert_eq!(found, QueueFamilies { graphics: 0, present: 1 });
        assert!(!found.shares_queue());
    }

    #[test]
    fn no_present_support_means_no_families() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        assert!(QueueFamilies::find(&families, |_| false).is_none());
    }
}
