//! GPU presentation core: binds windows to Vulkan devices and draws flat,
//! image and distance-field quads into their swapchains.

pub mod atlas;
pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod instance;
pub mod pipeline;
pub mod small_text;
pub mod widget;
pub mod window;

pub use config::Config;
pub use device::Device;
pub use error::{AtlasError, RenderError, WindowStateError};
pub use instance::Instance;
pub use widget::Renderable;
pub use window::{FrameStatus, SkipReason, Window, WindowStateKind};
