// Swapchain - Window presentation
//
// SwapchainPlan holds the negotiation with the surface (image count, extent,
// sharing mode); Swapchain owns the resulting handles.

use anyhow::{Context, Result};
use ash::vk;

use super::device::QueueFamilies;
use super::VulkanDevice;
use crate::error::RenderError;

/// How swapchain images are shared between queue families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    Exclusive,
    Concurrent([u32; 2]),
}

impl Sharing {
    pub fn for_families(families: QueueFamilies) -> Self {
        if families.shares_queue() {
            Sharing::Exclusive
        } else {
            Sharing::Concurrent([families.graphics, families.present])
        }
    }

    pub fn mode(&self) -> vk::SharingMode {
        match self {
            Sharing::Exclusive => vk::SharingMode::EXCLUSIVE,
            Sharing::Concurrent(_) => vk::SharingMode::CONCURRENT,
        }
    }

    pub fn family_indices(&self) -> &[u32] {
        match self {
            Sharing::Exclusive => &[],
            Sharing::Concurrent(indices) => indices,
        }
    }
}

/// Everything decided before a swapchain is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub image_count: u32,
    pub extent: vk::Extent2D,
    pub sharing: Sharing,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainPlan {
    pub fn new(
        capabilities: &vk::SurfaceCapabilitiesKHR,
        display_size: vk::Extent2D,
        families: QueueFamilies,
        surface_format: vk::SurfaceFormatKHR,
        present_mode: vk::PresentModeKHR,
    ) -> Self {
        Self {
            image_count: Self::image_count(capabilities),
            extent: Self::extent(capabilities, display_size),
            sharing: Sharing::for_families(families),
            surface_format,
            present_mode,
            pre_transform: capabilities.current_transform,
        }
    }

    /// One more than the minimum, capped by the maximum (0 means unbounded).
    pub fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
        let min = capabilities.min_image_count;
        let max = if capabilities.max_image_count == 0 {
            u32::MAX
        } else {
            capabilities.max_image_count
        };
        (min + 1).clamp(min, max.max(min))
    }

    /// The surface's current extent, or the display size when the surface leaves it
    /// up to us, clamped into the supported range.
    pub fn extent(
        capabilities: &vk::SurfaceCapabilitiesKHR,
        display_size: vk::Extent2D,
    ) -> vk::Extent2D {
        let wanted = if capabilities.current_extent.width == u32::MAX {
            display_size
        } else {
            capabilities.current_extent
        };
        let min = capabilities.min_image_extent;
        let max = capabilities.max_image_extent;
        vk::Extent2D {
            width: wanted.width.clamp(min.width, max.width.max(min.width)),
            height: wanted.height.clamp(min.height, max.height.max(min.height)),
        }
    }

    pub fn is_drawable(&self) -> bool {
        self.extent.width > 0 && self.extent.height > 0
    }
}

/// Prefer an 8-bit format in the color space the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    const PREFERRED: [vk::Format; 4] = [
        vk::Format::B8G8R8A8_UNORM,
        vk::Format::R8G8B8A8_UNORM,
        vk::Format::B8G8R8A8_SRGB,
        vk::Format::R8G8B8A8_SRGB,
    ];

    let first = *formats.first()?;
    if formats.len() == 1 && first.format == vk::Format::UNDEFINED {
        return Some(vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: first.color_space,
        });
    }

    PREFERRED
        .iter()
        .find_map(|&wanted| {
            formats
                .iter()
                .find(|f| f.format == wanted && f.color_space == first.color_space)
                .copied()
        })
        .or(Some(first))
}

/// First mode from `preference` the surface supports, FIFO otherwise.
pub fn choose_present_mode(
    preference: &[vk::PresentModeKHR],
    supported: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    preference
        .iter()
        .copied()
        .find(|mode| supported.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO) // FIFO is always supported
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    pub fn new(
        device: &VulkanDevice,
        surface: vk::SurfaceKHR,
        plan: &SwapchainPlan,
    ) -> Result<Self> {
        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}, {:?}",
            plan.extent.width,
            plan.extent.height,
            plan.image_count,
            plan.present_mode,
            plan.sharing
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(plan.image_count)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(plan.sharing.mode())
            .queue_family_indices(plan.sharing.family_indices())
            .pre_transform(plan.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(plan.present_mode)
            .clipped(true);

        let swapchain = unsafe { device.swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let images = unsafe { device.swapchain_loader.get_swapchain_images(swapchain) }?;

        log::info!("Created swapchain with {} images", images.len());

        let image_views: Result<Vec<_>> = images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(plan.surface_format.format)
                    .subresource_range(super::buffer::COLOR_SUBRESOURCE);

                unsafe {
                    device
                        .device
                        .create_image_view(&create_info, None)
                        .context("Failed to create image view")
                }
            })
            .collect();

        Ok(Self {
            swapchain,
            images,
            image_views: image_views?,
            format: plan.surface_format.format,
            extent: plan.extent,
        })
    }

    /// Acquire next image for rendering; out-of-date and lost surfaces surface as
    /// `RenderError`.
    pub fn acquire_next_image(
        &self,
        device: &VulkanDevice,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool)> {
        let result = unsafe {
            device.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        result.map_err(|e| match RenderError::from_vk(e) {
            Some(render_error) => anyhow::Error::new(render_error),
            None => anyhow::Error::new(e).context("Failed to acquire swapchain image"),
        })
    }

    /// Present rendered image to screen. Returns true when the swapchain is suboptimal.
    pub fn present(
        &self,
        device: &VulkanDevice,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        device
            .queue_present(device.present_queue.queue, &present_info)
            .map_err(|e| match RenderError::from_vk(e) {
                Some(render_error) => anyhow::Error::new(render_error),
                None => anyhow::Error::new(e).context("Failed to present"),
            })
    }

    /// Destroy views and the swapchain; calling again is a no-op.
    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            for view in self.image_views.drain(..) {
                device.device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                device.swapchain_loader.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
        }
        self.images.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNDEFINED: vk::Extent2D = vk::Extent2D {
        width: u32::MAX,
        height: u32::MAX,
    };

    fn capabilities(
        min_count: u32,
        max_count: u32,
        current: vk::Extent2D,
        min: (u32, u32),
        max: (u32, u32),
    ) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_count,
            max_image_count: max_count,
            current_extent: current,
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn srgb(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn undefined_extent_uses_display_size() {
        let caps = capabilities(2, 4, UNDEFINED, (64, 64), (4096, 4096));
        let plan = SwapchainPlan::new(
            &caps,
            extent(800, 600),
            QueueFamilies { graphics: 0, present: 0 },
            srgb(vk::Format::B8G8R8A8_UNORM),
            vk::PresentModeKHR::FIFO,
        );
        assert_eq!(plan.extent, extent(800, 600));
        assert_eq!(plan.image_count, 3);
        assert_eq!(plan.sharing, Sharing::Exclusive);
    }

    #[test]
    fn extent_is_always_clamped() {
        let caps = capabilities(2, 4, UNDEFINED, (64, 64), (4096, 4096));
        assert_eq!(SwapchainPlan::extent(&caps, extent(10, 9000)), extent(64, 4096));

        let caps = capabilities(2, 4, extent(5000, 32), (64, 64), (4096, 4096));
        assert_eq!(SwapchainPlan::extent(&caps, extent(800, 600)), extent(4096, 64));

        let caps = capabilities(2, 4, extent(1024, 768), (64, 64), (4096, 4096));
        assert_eq!(SwapchainPlan::extent(&caps, extent(800, 600)), extent(1024, 768));
    }

    #[test]
    fn image_count_respects_bounds() {
        let bounded = capabilities(2, 2, UNDEFINED, (1, 1), (1, 1));
        assert_eq!(SwapchainPlan::image_count(&bounded), 2);

        let unbounded = capabilities(3, 0, UNDEFINED, (1, 1), (1, 1));
        assert_eq!(SwapchainPlan::image_count(&unbounded), 4);
    }

    #[test]
    fn separate_families_share_concurrently() {
        let families = QueueFamilies { graphics: 0, present: 2 };
        let sharing = Sharing::for_families(families);
        assert_eq!(sharing, Sharing::Concurrent([0, 2]));
        assert_eq!(sharing.mode(), vk::SharingMode::CONCURRENT);
        assert_eq!(sharing.family_indices(), &[0, 2]);

        let exclusive = Sharing::for_families(QueueFamilies { graphics: 1, present: 1 });
        assert_eq!(exclusive.mode(), vk::SharingMode::EXCLUSIVE);
        assert!(exclusive.family_indices().is_empty());
    }

    #[test]
    fn zero_sized_surface_is_not_drawable() {
        let caps = capabilities(2, 3, extent(0, 0), (0, 0), (4096, 4096));
        let plan = SwapchainPlan::new(
            &caps,
            extent(0, 0),
            QueueFamilies { graphics: 0, present: 0 },
            srgb(vk::Format::B8G8R8A8_UNORM),
            vk::PresentModeKHR::FIFO,
        );
        assert!(!plan.is_drawable());
    }

    #[test]
    fn surface_format_follows_first_color_space() {
        let hdr = vk::SurfaceFormatKHR {
            format: vk::Format::A2B10G10R10_UNORM_PACK32,
            color_space: vk::ColorSpaceKHR::HDR10_ST2084_EXT,
        };
        let formats = [srgb(vk::Format::B8G8R8A8_SRGB), hdr, srgb(vk::Format::R8G8B8A8_UNORM)];
        assert_eq!(
            choose_surface_format(&formats),
            Some(srgb(vk::Format::R8G8B8A8_UNORM))
        );

        let only_hdr = [hdr];
        assert_eq!(choose_surface_format(&only_hdr), Some(hdr));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn undefined_surface_format_means_free_choice() {
        let formats = [srgb(vk::Format::UNDEFINED)];
        assert_eq!(
            choose_surface_format(&formats),
            Some(srgb(vk::Format::B8G8R8A8_UNORM))
        );
    }

    #[test]
    fn present_mode_follows_preference() {
        let supported = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        let preference = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&preference, &supported),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::MAILBOX], &supported),
            vk::PresentModeKHR::FIFO
        );
    }
}
