// Device - one GPU shared by every window bound to it
//
// Owns the Vulkan device, the surface negotiation policy, the quad index
// buffer every pipeline draws with, and the per-pipeline shared resources
// (the image atlas and the SDF glyph atlas).

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use crate::backend::buffer;
use crate::backend::swapchain::{choose_present_mode, choose_surface_format};
use crate::backend::{MappedBuffer, QueueFamilies, VulkanDevice};
use crate::config::Config;
use crate::instance::Instance;
use crate::pipeline::image::ImageDeviceShared;
use crate::pipeline::sdf::SdfDeviceShared;
use crate::window::SurfaceLink;

/// Index pattern of one quad: corners 0-1-2-3, two triangles.
pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// GPU caches lent to every window and pipeline on the device.
pub struct DeviceSharedResources {
    pub image: ImageDeviceShared,
    pub sdf: SdfDeviceShared,
}

pub struct Device {
    pub vulkan: VulkanDevice,
    // Fixed for the life of the device
    present_modes: Vec<vk::PresentModeKHR>,
    quad_indices: MappedBuffer<u16>,
    max_vertices: usize,
    shared: DeviceSharedResources,
}

impl Device {
    pub fn new(
        instance: Arc<Instance>,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilies,
    ) -> Result<Arc<Self>> {
        let config = instance.config().clone();
        let vulkan = VulkanDevice::new(instance, physical_device, families)?;
        let max_vertices = config.graphics.max_vertices as usize;

        let mut quad_indices = MappedBuffer::<u16>::new(
            &vulkan,
            quad_index_count(max_vertices),
            vk::BufferUsageFlags::INDEX_BUFFER,
            "quad indices",
        )?;
        let written = fill_quad_indices(quad_indices.as_mut_slice()?);
        quad_indices.flush(&vulkan, 0, written)?;

        let image = match ImageDeviceShared::new(&vulkan, &config.atlas) {
            Ok(image) => image,
            Err(e) => {
                quad_indices.destroy(&vulkan);
                return Err(e);
            }
        };
        let sdf = match SdfDeviceShared::new(&vulkan, &config.atlas) {
            Ok(sdf) => sdf,
            Err(e) => {
                let mut image = image;
                image.destroy(&vulkan);
                quad_indices.destroy(&vulkan);
                return Err(e);
            }
        };

        log::info!(
            "Device ready: {} vertices per pipeline, present families {:?}",
            max_vertices,
            families
        );

        Ok(Arc::new(Self {
            vulkan,
            present_modes: config.present_mode_preference(),
            quad_indices,
            max_vertices,
            shared: DeviceSharedResources { image, sdf },
        }))
    }

    pub fn config(&self) -> &Config {
        self.vulkan.instance().config()
    }

    pub fn shared(&self) -> &DeviceSharedResources {
        &self.shared
    }

    pub fn max_vertices(&self) -> usize {
        self.max_vertices
    }

    pub fn quad_index_buffer(&self) -> vk::Buffer {
        self.quad_indices.buffer
    }

    pub fn present_mode_preference(&self) -> &[vk::PresentModeKHR] {
        &self.present_modes
    }

    // =========================================================================
    // SURFACE NEGOTIATION
    // =========================================================================

    /// Pick format and present mode for a surface this device presents to.
    pub fn surface_link(&self, surface: vk::SurfaceKHR) -> Result<SurfaceLink> {
        let loader = &self.vulkan.instance().surface_loader;
        let physical_device = self.vulkan.physical_device;
        let families = self.vulkan.queue_families();

        let supported = unsafe {
            loader.get_physical_device_surface_support(physical_device, families.present, surface)
        }?;
        if !supported {
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }

        let formats =
            unsafe { loader.get_physical_device_surface_formats(physical_device, surface) }?;
        let surface_format =
            choose_surface_format(&formats).context("Surface reports no formats")?;

        let modes =
            unsafe { loader.get_physical_device_surface_present_modes(physical_device, surface) }?;
        let present_mode = choose_present_mode(&self.present_modes, &modes);

        log::info!(
            "Surface linked: {:?} / {:?}, {:?}",
            surface_format.format,
            surface_format.color_space,
            present_mode
        );

        Ok(SurfaceLink {
            families,
            surface_format,
            present_mode,
        })
    }

    pub fn surface_capabilities(
        &self,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.vulkan
                .instance()
                .surface_loader
                .get_physical_device_surface_capabilities(self.vulkan.physical_device, surface)
        }
        .context("Failed to query surface capabilities")
    }

    // =========================================================================
    // MEMORY
    // =========================================================================

    /// Create a buffer with bound memory. Out of GPU memory is not recoverable here.
    pub fn create_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
        location: MemoryLocation,
        name: &str,
    ) -> Result<(vk::Buffer, Allocation)> {
        buffer::create_buffer(&self.vulkan, create_info, location, name)
    }

    pub fn map_memory<'a, T: bytemuck::Pod>(
        &self,
        allocation: &'a mut Allocation,
    ) -> Result<&'a mut [T]> {
        buffer::map_memory(allocation)
    }

    pub fn flush_allocation(
        &self,
        allocation: &Allocation,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<()> {
        buffer::flush_allocation(&self.vulkan, allocation, offset, size)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::info!("Releasing shared device resources...");
        let _ = self.vulkan.wait_idle();
        self.shared.image.destroy(&self.vulkan);
        self.shared.sdf.destroy(&self.vulkan);
        self.quad_indices.destroy(&self.vulkan);
        // VulkanDevice drops after this, taking the allocator and device with it
    }
}

/// Indices needed to draw `max_vertices` vertices as quads.
pub fn quad_index_count(max_vertices: usize) -> usize {
    (max_vertices / 4) * QUAD_INDICES.len()
}

/// Write the repeating quad pattern; returns how many indices were written.
pub fn fill_quad_indices(indices: &mut [u16]) -> usize {
    let quads = indices.len() / QUAD_INDICES.len();
    for quad in 0..quads {
        let base = (quad * 4) as u16;
        for (slot, offset) in QUAD_INDICES.iter().enumerate() {
            indices[quad * QUAD_INDICES.len() + slot] = base + offset;
        }
    }
    quads * QUAD_INDICES.len()
}
