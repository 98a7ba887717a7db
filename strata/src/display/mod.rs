// Presentation targets
//
// A target is whatever the distortion pass finally writes into: a
// VkSwapchainKHR on a host supplied surface, a direct mode display, or
// plain device images when running headless.
pub mod headless;
pub mod vkd2d;
pub mod vkswapchain;

pub use headless::HeadlessTarget;
pub use vkd2d::{DirectTarget, DisplayModeInfo};
pub use vkswapchain::VkSwapchainTarget;

use ash::vk;

use crate::Result;
use utils::log;
use utils::pacing::{CompositorPacer, FrameRecord, TimingPoint};

/// One image of a target as seen by the renderer
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TargetImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

/// Parameters for (re)creating the images of a target
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TargetCreateInfo {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    /// COLOR_ATTACHMENT for the graphics path, STORAGE for compute
    pub usage: vk::ImageUsageFlags,
    pub present_mode: vk::PresentModeKHR,
}

impl TargetCreateInfo {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width,
            height: height,
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            present_mode: vk::PresentModeKHR::FIFO,
        }
    }
}

/// Binary semaphores a frame's submission has to use
///
/// Targets without a presentation engine hand out null handles, in
/// which case the submission neither waits nor signals.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TargetSync {
    /// Signaled by acquire, waited on by the render submission
    pub present_complete: vk::Semaphore,
    /// Signaled by the render submission, waited on by present
    pub render_complete: vk::Semaphore,
}

/// The display side of the native compositor
pub trait Target: Send {
    fn name(&self) -> &str;

    /// The target has a surface and can allocate images
    fn check_ready(&mut self) -> bool;

    /// Throw away any existing images and create new ones
    fn create_images(&mut self, info: &TargetCreateInfo) -> Result<()>;

    fn has_images(&self) -> bool;

    fn images(&self) -> &[TargetImage];

    fn extent(&self) -> vk::Extent2D;

    fn format(&self) -> vk::Format;

    /// Rotation the display engine expects us to have applied
    fn surface_transform(&self) -> vk::SurfaceTransformFlagsKHR;

    /// Get the index of the next writable image
    ///
    /// Returns `OUT_OF_DATE` or `SUBOPTIMAL` when the images have to be
    /// recreated.
    fn acquire(&mut self) -> Result<u32>;

    /// Post image `index` for scan out
    fn present(&mut self, index: u32, desired_present_time_ns: i64, present_slop_ns: i64)
        -> Result<()>;

    fn sync(&self) -> TargetSync;

    /// Layout the images must be left in after rendering
    fn final_layout(&self) -> vk::ImageLayout {
        vk::ImageLayout::PRESENT_SRC_KHR
    }

    /// The timing model for this target
    fn pacer(&mut self) -> &mut dyn CompositorPacer;

    /// Poll the display engine for completed presentation timings
    fn update_timings(&mut self) {}

    fn calc_frame_pacing(&mut self, now_ns: i64) -> FrameRecord {
        self.pacer().predict(now_ns)
    }

    fn mark_begin(&mut self, frame_id: i64, when_ns: i64) {
        if let Err(e) = self.pacer().mark_point(TimingPoint::Begin, frame_id, when_ns) {
            log::warn!("Could not mark begin for frame {}: {}", frame_id, e);
        }
    }

    fn mark_submit(&mut self, frame_id: i64, when_ns: i64) {
        if let Err(e) = self.pacer().mark_point(TimingPoint::Submit, frame_id, when_ns) {
            log::warn!("Could not mark submit for frame {}: {}", frame_id, e);
        }
    }

    fn info_gpu(&mut self, frame_id: i64, gpu_start_ns: i64, gpu_end_ns: i64, now_ns: i64) {
        self.pacer()
            .info_gpu(frame_id, gpu_start_ns, gpu_end_ns, now_ns)
    }
}

/// Does this transform make us render rotated by 90 degrees
pub fn transform_rotates_90(transform: vk::SurfaceTransformFlagsKHR) -> bool {
    transform.intersects(
        vk::SurfaceTransformFlagsKHR::ROTATE_90 | vk::SurfaceTransformFlagsKHR::ROTATE_270,
    )
}

/// The UNORM alias of an sRGB format
///
/// sRGB formats can't be used for storage images, compute writes go
/// through a UNORM view instead.
pub fn unorm_format(format: vk::Format) -> vk::Format {
    match format {
        vk::Format::B8G8R8A8_SRGB => vk::Format::B8G8R8A8_UNORM,
        vk::Format::R8G8B8A8_SRGB => vk::Format::R8G8B8A8_UNORM,
        vk::Format::A8B8G8R8_SRGB_PACK32 => vk::Format::A8B8G8R8_UNORM_PACK32,
        f => f,
    }
}

/// Create a 2D color view for a target image
pub(crate) fn create_target_view(
    dev: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::R,
            g: vk::ComponentSwizzle::G,
            b: vk::ComponentSwizzle::B,
            a: vk::ComponentSwizzle::A,
        })
        // this view pertains to the entire image
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image(image)
        .build();

    unsafe {
        dev.create_image_view(&create_info, None)
            .or(Err(crate::StrataError::COULD_NOT_CREATE_IMAGE))
    }
}
