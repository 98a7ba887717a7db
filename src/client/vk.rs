// Vulkan guest
//
// Imports the compositor's dmabuf backed images into the application's
// device and syncs through either a shared timeline semaphore or a
// sync file exported from the application's queue.
use super::{ClientShim, GuestApi};
use crate::compositor::*;
use crate::swapchain::image_create_info;

use strata::{export_queue_sync_file, Device, ImageResources, NativeImage, VkTimelineSemaphore};
use utils::log;

use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};

pub struct VkGuest {
    vg_dev: Arc<Device>,
    vg_timeline: Mutex<Option<VkTimelineSemaphore>>,
}

impl VkGuest {
    pub fn new(dev: Arc<Device>) -> Self {
        Self {
            vg_dev: dev,
            vg_timeline: Mutex::new(None),
        }
    }
}

impl GuestApi for VkGuest {
    type Image = ImageResources;

    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn import_images(
        &self,
        info: &SwapchainCreateInfo,
        native_images: &[NativeImage],
    ) -> XrResult<Vec<ImageResources>> {
        let image_info = image_create_info(info);

        let mut images = Vec::with_capacity(native_images.len());
        for native in native_images.iter() {
            images.push(ImageResources::import(&self.vg_dev, &image_info, native)?);
        }
        Ok(images)
    }

    fn import_timeline(&self, fd: OwnedFd) -> XrResult<bool> {
        if !self.vg_dev.supports_semaphore_export() {
            return Ok(false);
        }

        match VkTimelineSemaphore::import(&self.vg_dev, fd) {
            Ok(sem) => {
                *self.vg_timeline.lock().unwrap() = Some(sem);
                Ok(true)
            }
            Err(e) => {
                log::warn!("Could not import the compositor timeline: {:?}", e);
                Ok(false)
            }
        }
    }

    fn signal_timeline(&self, value: u64) -> XrResult<()> {
        let timeline = self.vg_timeline.lock().unwrap();
        let sem = timeline.as_ref().ok_or(XrError::INVALID)?;
        sem.signal_on_queue(value)?;
        Ok(())
    }

    fn export_sync(&self) -> XrResult<GraphicsSyncHandle> {
        let fd = export_queue_sync_file(&self.vg_dev)?;
        Ok(GraphicsSyncHandle::from_fd(fd))
    }
}

pub type VkClient = ClientShim<VkGuest>;

/// Put a Vulkan application on top of `native`
pub fn create_vk_client(native: Arc<dyn Compositor>, dev: Arc<Device>) -> XrResult<VkClient> {
    ClientShim::new(native, Arc::new(VkGuest::new(dev)))
}
