// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with explicit destroy calls
// Shared by every window bound to the same GPU

pub mod buffer;
pub mod device;
pub mod render_pass;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use buffer::{GpuImage, MappedBuffer};
pub use device::{DeviceQueue, QueueFamilies, VulkanDevice};
pub use swapchain::{Sharing, Swapchain, SwapchainPlan};
pub use sync::FrameSync;
