/// Headless target
///
/// Renders into plain device images that are never scanned out. Used
/// when no HMD is attached and for bring-up of the render loop.
use ash::vk;

use super::{unorm_format, Target, TargetCreateInfo, TargetImage, TargetSync};
use crate::device::Device;
use crate::image::{ImageCreateInfo, ImageResources};
use crate::{Result, StrataError};
use utils::log;
use utils::pacing::{CompositorPacer, FakeCompositorPacer};
use utils::timing;

use std::sync::Arc;

const IMAGE_COUNT: usize = 3;

pub struct HeadlessTarget {
    h_dev: Arc<Device>,
    h_resources: Vec<ImageResources>,
    h_images: Vec<TargetImage>,
    h_extent: vk::Extent2D,
    h_format: vk::Format,
    /// The image handed out by the last acquire
    h_current: Option<u32>,
    h_pacer: FakeCompositorPacer,
}

impl HeadlessTarget {
    pub fn new(dev: Arc<Device>, frame_interval_ns: i64) -> Self {
        Self {
            h_dev: dev,
            h_resources: Vec::new(),
            h_images: Vec::new(),
            h_extent: vk::Extent2D::default(),
            h_format: vk::Format::UNDEFINED,
            h_current: None,
            h_pacer: FakeCompositorPacer::new(frame_interval_ns, timing::get_current_ns()),
        }
    }

    fn destroy_images(&mut self) {
        self.h_images.clear();
        self.h_resources.clear();
        self.h_current = None;
    }
}

impl Target for HeadlessTarget {
    fn name(&self) -> &str {
        "headless"
    }

    fn check_ready(&mut self) -> bool {
        true
    }

    fn create_images(&mut self, info: &TargetCreateInfo) -> Result<()> {
        // Everything may still be in flight
        self.h_dev.wait_idle_locked()?;
        self.destroy_images();

        let format = match info.usage.contains(vk::ImageUsageFlags::STORAGE) {
            true => unorm_format(info.format),
            false => info.format,
        };
        let image_info = ImageCreateInfo::new(
            info.width,
            info.height,
            format,
            info.usage | vk::ImageUsageFlags::TRANSFER_SRC,
        );

        for _ in 0..IMAGE_COUNT {
            let res = ImageResources::allocate_local(&self.h_dev, &image_info)?;
            let sampled = res.sampled(0).ok_or(StrataError::COULD_NOT_CREATE_IMAGE)?;
            self.h_images.push(TargetImage {
                image: res.image(),
                view: sampled.view_alpha,
            });
            self.h_resources.push(res);
        }

        self.h_extent = vk::Extent2D {
            width: info.width,
            height: info.height,
        };
        self.h_format = format;
        log::debug!(
            "Created {} headless images {}x{} {:?}",
            IMAGE_COUNT,
            info.width,
            info.height,
            format
        );

        Ok(())
    }

    fn has_images(&self) -> bool {
        !self.h_images.is_empty()
    }

    fn images(&self) -> &[TargetImage] {
        &self.h_images
    }

    fn extent(&self) -> vk::Extent2D {
        self.h_extent
    }

    fn format(&self) -> vk::Format {
        self.h_format
    }

    fn surface_transform(&self) -> vk::SurfaceTransformFlagsKHR {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    }

    fn acquire(&mut self) -> Result<u32> {
        if self.h_images.is_empty() {
            return Err(StrataError::NO_IMAGE_AVAILABLE);
        }

        // simply bump the image number
        let next = match self.h_current {
            Some(i) => (i + 1) % self.h_images.len() as u32,
            None => 0,
        };
        self.h_current = Some(next);
        Ok(next)
    }

    fn present(&mut self, index: u32, _desired_present_time_ns: i64, _slop: i64) -> Result<()> {
        // no-op here, nothing to present
        match index < self.h_images.len() as u32 {
            true => Ok(()),
            false => Err(StrataError::PRESENT_FAILED),
        }
    }

    fn sync(&self) -> TargetSync {
        TargetSync::default()
    }

    fn final_layout(&self) -> vk::ImageLayout {
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL
    }

    fn pacer(&mut self) -> &mut dyn CompositorPacer {
        &mut self.h_pacer
    }
}

impl Drop for HeadlessTarget {
    fn drop(&mut self) {
        if let Err(e) = self.h_dev.wait_idle_locked() {
            log::error!("Could not idle device while destroying headless target: {:?}", e);
        }
        self.destroy_images();
    }
}
