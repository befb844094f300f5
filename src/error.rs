// Typed errors for conditions callers need to tell apart.
//
// Everything else travels as anyhow::Error with context, like the rest of the backend.

use crate::pipeline::PipelineKind;
use crate::small_text::SmallText;
use crate::window::WindowStateKind;

/// A window was asked to move along an edge its state machine does not have.
///
/// This is a contract violation by the caller; the window state is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("window '{window}': cannot {operation} while {state:?}")]
pub struct WindowStateError {
    pub window: SmallText,
    pub operation: &'static str,
    pub state: WindowStateKind,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("{pipeline:?} vertex span overflow: capacity is {capacity} vertices")]
    VertexOverflow {
        pipeline: PipelineKind,
        capacity: usize,
    },

    #[error("swapchain is out of date")]
    SwapchainOutOfDate,

    #[error("graphics device lost")]
    DeviceLost,

    /// Something failed between acquire and present. The frame's semaphores and
    /// fence are in an unknown state until the swapchain is rebuilt.
    #[error("frame abandoned after image acquire")]
    FrameAbandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AtlasError {
    #[error(
        "image '{name}' is {width}x{height}, larger than the {max_width}x{max_height} staging area"
    )]
    ImageTooLarge {
        name: SmallText,
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },

    #[error("atlas layer {layer} exceeds the configured maximum of {max_layers}")]
    LayerOutOfRange { layer: u32, max_layers: u32 },
}

impl RenderError {
    /// Classify a driver result from acquire/submit/present.
    pub fn from_vk(result: ash::vk::Result) -> Option<Self> {
        match result {
            ash::vk::Result::ERROR_OUT_OF_DATE_KHR => Some(Self::SwapchainOutOfDate),
            ash::vk::Result::ERROR_DEVICE_LOST | ash::vk::Result::ERROR_SURFACE_LOST_KHR => {
                Some(Self::DeviceLost)
            }
            _ => None,
        }
    }
}
