// Buffer and image utilities
//
// Host-visible buffers stay mapped for their whole life (gpu-allocator maps
// CpuToGpu blocks persistently); writes become GPU-visible after a flush.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::marker::PhantomData;
use std::ops::Range;

use super::VulkanDevice;

/// Create a buffer and bind freshly allocated memory to it.
pub fn create_buffer(
    device: &VulkanDevice,
    create_info: &vk::BufferCreateInfo<'_>,
    location: MemoryLocation,
    name: &str,
) -> Result<(vk::Buffer, Allocation)> {
    let buffer = unsafe {
        device
            .device
            .create_buffer(create_info, None)
            .context("Failed to create buffer")?
    };

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    let allocation = device
        .allocator()?
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .with_context(|| format!("Failed to allocate memory for buffer '{}'", name))?;

    unsafe {
        device
            .device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            .context("Failed to bind buffer memory")?;
    }

    Ok((buffer, allocation))
}

/// View a persistently mapped allocation as a slice of `T`.
pub fn map_memory<T: Pod>(allocation: &mut Allocation) -> Result<&mut [T]> {
    let bytes = allocation
        .mapped_slice_mut()
        .context("Allocation is not host visible")?;
    let usable = bytes.len() - bytes.len() % std::mem::size_of::<T>();
    bytemuck::try_cast_slice_mut(&mut bytes[..usable])
        .map_err(|e| anyhow::anyhow!("Mapped memory cannot hold this type: {:?}", e))
}

/// Device memory range to flush for `size` bytes at `offset` inside an allocation
/// starting at `allocation_offset`, widened to whole non-coherent atoms.
pub fn flush_range(
    allocation_offset: vk::DeviceSize,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    atom: vk::DeviceSize,
) -> Range<vk::DeviceSize> {
    let start = allocation_offset + offset;
    let end = start + size;
    let aligned_start = start - start % atom;
    let aligned_end = end.div_ceil(atom) * atom;
    aligned_start..aligned_end
}

/// Make CPU writes to `size` bytes at `offset` visible to the GPU.
pub fn flush_allocation(
    device: &VulkanDevice,
    allocation: &Allocation,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    let range = flush_range(
        allocation.offset(),
        offset,
        size,
        device.non_coherent_atom_size(),
    );
    let memory_range = vk::MappedMemoryRange::default()
        .memory(unsafe { allocation.memory() })
        .offset(range.start)
        .size(range.end - range.start);
    unsafe {
        device
            .device
            .flush_mapped_memory_ranges(&[memory_range])
            .context("Failed to flush mapped memory")
    }
}

/// A host-visible buffer of `T`, mapped for its whole lifetime.
pub struct MappedBuffer<T> {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> MappedBuffer<T> {
    pub fn new(
        device: &VulkanDevice,
        capacity: usize,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<Self> {
        let create_info = Self::create_info(device, capacity, usage);
        let (buffer, allocation) =
            create_buffer(device, &create_info, MemoryLocation::CpuToGpu, name)?;
        Ok(Self::from_parts(buffer, allocation, capacity))
    }

    /// Buffer description for `capacity` elements of `T`.
    pub fn create_info(
        device: &VulkanDevice,
        capacity: usize,
        usage: vk::BufferUsageFlags,
    ) -> vk::BufferCreateInfo<'static> {
        // Whole atoms, so a widened flush never reaches past the allocation.
        let atom = device.non_coherent_atom_size();
        let size = ((std::mem::size_of::<T>() * capacity) as vk::DeviceSize).div_ceil(atom) * atom;
        vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
    }

    /// Wrap a buffer made from `create_info` with host-visible memory bound to it.
    pub fn from_parts(buffer: vk::Buffer, allocation: Allocation, capacity: usize) -> Self {
        Self {
            buffer,
            allocation: Some(allocation),
            capacity,
            _marker: PhantomData,
        }
    }

    pub fn allocation(&self) -> Result<&Allocation> {
        self.allocation.as_ref().context("Buffer already destroyed")
    }

    pub fn allocation_mut(&mut self) -> Result<&mut Allocation> {
        self.allocation.as_mut().context("Buffer already destroyed")
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_mut_slice(&mut self) -> Result<&mut [T]> {
        let capacity = self.capacity;
        let data = map_memory::<T>(self.allocation_mut()?)?;
        Ok(&mut data[..capacity])
    }

    /// Flush `count` elements starting at element `first`.
    pub fn flush(&self, device: &VulkanDevice, first: usize, count: usize) -> Result<()> {
        let allocation = self.allocation()?;
        let stride = std::mem::size_of::<T>() as vk::DeviceSize;
        flush_allocation(
            device,
            allocation,
            first as vk::DeviceSize * stride,
            count as vk::DeviceSize * stride,
        )
    }

    /// Free the buffer; calling again is a no-op.
    pub fn destroy(&mut self, device: &VulkanDevice) {
        if let Some(allocation) = self.allocation.take() {
            unsafe { device.device.destroy_buffer(self.buffer, None) };
            self.buffer = vk::Buffer::null();
            if let Ok(mut allocator) = device.allocator() {
                if let Err(e) = allocator.free(allocation) {
                    log::warn!("Failed to free buffer memory: {}", e);
                }
            }
        }
    }
}

/// A device-local 2D image with a view.
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    allocation: Option<Allocation>,
}

impl GpuImage {
    pub fn new(
        device: &VulkanDevice,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        name: &str,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe {
            device
                .device
                .create_image(&image_info, None)
                .with_context(|| format!("Failed to create image '{}'", name))?
        };

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = device
            .allocator()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for image '{}'", name))?;

        unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .context("Failed to bind image memory")?;
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(COLOR_SUBRESOURCE);

        let view = unsafe {
            device
                .device
                .create_image_view(&view_info, None)
                .context("Failed to create image view")?
        };

        Ok(Self {
            image,
            view,
            format,
            extent,
            allocation: Some(allocation),
        })
    }

    /// Free the image; calling again is a no-op.
    pub fn destroy(&mut self, device: &VulkanDevice) {
        if let Some(allocation) = self.allocation.take() {
            unsafe {
                device.device.destroy_image_view(self.view, None);
                device.device.destroy_image(self.image, None);
            }
            if let Ok(mut allocator) = device.allocator() {
                if let Err(e) = allocator.free(allocation) {
                    log::warn!("Failed to free image memory: {}", e);
                }
            }
        }
    }
}

pub const COLOR_SUBRESOURCE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Record a whole-image layout transition.
pub fn transition_image(
    device: &VulkanDevice,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let (src_access, src_stage) = match old_layout {
        vk::ImageLayout::UNDEFINED => {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        _ => (vk::AccessFlags::SHADER_READ, vk::PipelineStageFlags::FRAGMENT_SHADER),
    };
    let (dst_access, dst_stage) = match new_layout {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        _ => (vk::AccessFlags::SHADER_READ, vk::PipelineStageFlags::FRAGMENT_SHADER),
    };

    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(COLOR_SUBRESOURCE);

    unsafe {
        device.device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_range_widens_to_atoms() {
        assert_eq!(flush_range(0, 0, 100, 64), 0..128);
        assert_eq!(flush_range(256, 10, 20, 64), 256..320);
        assert_eq!(flush_range(256, 60, 10, 64), 256..384);
    }

    #[test]
    fn aligned_flush_range_is_exact() {
        assert_eq!(flush_range(1024, 64, 128, 64), 1088..1216);
        assert_eq!(flush_range(0, 0, 48, 1), 0..48);
    }
}
