//! # The Strata compositing library.
//!
//! Strata is the Vulkan half of an XR compositor. Client applications
//! render into shared images, and strata composes their layers into two
//! per-eye images, corrects those for the lens distortion of the
//! head-mounted display, and hands the result to a presentation target.
//!
//! Rendering happens in two stages:
//! * `layer renderer` - draws every quad, cylinder, equirect and
//!   projection layer into one scratch framebuffer per eye.
//! * `distortion` - samples the scratch framebuffers (or the client's
//!   projection images directly, when there is only one projection layer)
//!   through a distortion mesh into the target image.
//!
//! The distortion stage can also run as a compute dispatch which composes
//! the layers itself and optionally applies time-warp.
//!
//! ## Flow
//!
//! * Create an `Instance` and a `Device` (`Device::new`)
//! * Create a presentation `Target` (`HeadlessTarget`, `VkSwapchainTarget`,
//!   or `DirectTarget`)
//! * Create a `VulkanRenderer` with the compiled `ShaderBlobs`
//! * Every frame: `Target::acquire`, `Renderer::draw`, `Target::present`
//!
//! ## Requirements
//!
//! Strata requires a system with vulkan 1.2+ installed. The following
//! extensions are used:
//! * VK_KHR_surface
//! * VK_KHR_swapchain
//! * VK_KHR_display
//! * VK_KHR_external_memory_fd
//! * VK_KHR_external_fence_fd
//! * VK_KHR_external_semaphore_fd
//! * VK_GOOGLE_display_timing (optional)

pub mod deletion_queue;
mod descpool;
pub mod device;
pub mod display;
pub mod hmd;
pub mod image;
pub mod instance;
pub mod layers;
pub mod math;
pub mod pipelines;
mod platform;
pub mod renderer;
pub mod sync;

pub use deletion_queue::DeletionQueue;
pub use device::{Device, SamplerKind};
pub use display::{
    headless::HeadlessTarget, vkd2d::DirectTarget, vkswapchain::VkSwapchainTarget, Target,
    TargetCreateInfo, TargetImage, TargetSync,
};
pub use hmd::{DistortionMesh, HeadDevice, HmdView, Viewport};
pub use image::{ImageCreateInfo, ImageResources, NativeImage, SampledImage};
pub use instance::Instance;
pub use layers::*;
pub use pipelines::ShaderBlobs;
pub use renderer::{
    plan_frame, CompositeLayer, DrawReport, FrameComposition, FramePlan, PlanParams,
    RenderMode, Renderer, RendererCreateInfo, TargetConfig, ViewState, VulkanRenderer,
};
pub use sync::{
    export_queue_sync_file, CompositorFence, CompositorSemaphore, SyncFileFence, VkFence,
    VkTimelineSemaphore,
};

// Re-export some things from utils so clients
// can use them
pub use utils::region::Rect;

pub use ash::vk;

extern crate thiserror;
use thiserror::Error;

/// Strata error codes
/// These signify that action should be taken by the app.
#[derive(Error, Eq, PartialEq, Debug, Copy, Clone)]
#[allow(non_camel_case_types)]
pub enum StrataError {
    #[error("Operation timed out")]
    TIMEOUT,
    #[error("Operation did not complete, not ready")]
    NOT_READY,
    #[error("Target has no image available")]
    NO_IMAGE_AVAILABLE,
    #[error("Target is out of date and must be recreated")]
    OUT_OF_DATE,
    #[error("Target is suboptimal and should be recreated")]
    SUBOPTIMAL,
    #[error("The GPU failed to complete an operation")]
    GPU_ERROR,
    #[error("Invalid operation")]
    INVALID,
    #[error("Out of resources")]
    OUT_OF_RESOURCES,
    #[error("Could not start or stop a thread")]
    THREADING_FAILURE,
    #[error("Invalid format")]
    INVALID_FORMAT,
    #[error("Vulkan surface does not support R8G8B8A8_UNORM")]
    VK_SURF_NOT_SUPPORTED,
    #[error("Vulkan device does not support the required extensions")]
    VK_NOT_ALL_EXTENSIONS_AVAILABLE,
    #[error("Could not create the Vulkan swapchain")]
    COULD_NOT_CREATE_SWAPCHAIN,
    #[error("Could not create Vulkan image")]
    COULD_NOT_CREATE_IMAGE,
    #[error("Failed to present the target image")]
    PRESENT_FAILED,
}

pub type Result<T> = std::result::Result<T, StrataError>;

impl From<vk::Result> for StrataError {
    fn from(res: vk::Result) -> Self {
        match res {
            vk::Result::TIMEOUT => StrataError::TIMEOUT,
            vk::Result::NOT_READY => StrataError::NOT_READY,
            vk::Result::ERROR_OUT_OF_DATE_KHR => StrataError::OUT_OF_DATE,
            vk::Result::SUBOPTIMAL_KHR => StrataError::SUBOPTIMAL,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_TOO_MANY_OBJECTS => StrataError::OUT_OF_RESOURCES,
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => StrataError::INVALID_FORMAT,
            vk::Result::ERROR_EXTENSION_NOT_PRESENT => StrataError::VK_NOT_ALL_EXTENSIONS_AVAILABLE,
            _ => StrataError::GPU_ERROR,
        }
    }
}

/// Parameters for Device creation.
#[derive(Debug, Clone)]
pub struct CreateInfo {
    /// Index into the list of physical devices, None picks the first one
    /// with a graphics queue
    pub selected_gpu_index: Option<usize>,
    /// Enable the Khronos validation layer
    pub validation: bool,
    /// Enable VK_KHR_display for direct mode targets
    pub enable_direct_mode: bool,
    /// The vk::SurfaceKHR extensions the host window system needs
    pub surface_extensions: Vec<&'static std::ffi::CStr>,
}

impl CreateInfo {
    pub fn builder() -> CreateInfoBuilder {
        CreateInfoBuilder {
            ci: CreateInfo {
                selected_gpu_index: None,
                validation: cfg!(debug_assertions),
                enable_direct_mode: false,
                surface_extensions: Vec::new(),
            },
        }
    }
}

/// Implements the builder pattern for easier strata creation
pub struct CreateInfoBuilder {
    ci: CreateInfo,
}

impl CreateInfoBuilder {
    pub fn selected_gpu_index(mut self, index: Option<usize>) -> Self {
        self.ci.selected_gpu_index = index;
        self
    }

    pub fn validation(mut self, enable: bool) -> Self {
        self.ci.validation = enable;
        self
    }

    pub fn enable_direct_mode(mut self) -> Self {
        self.ci.enable_direct_mode = true;
        self
    }

    pub fn surface_extension(mut self, ext: &'static std::ffi::CStr) -> Self {
        self.ci.surface_extensions.push(ext);
        self
    }

    pub fn build(self) -> CreateInfo {
        self.ci
    }
}

#[cfg(test)]
mod tests;
