// GPU objects the native compositor hands out to clients
//
// Swapchains, fences and semaphores are created through this trait so
// the render loop can be driven without a Vulkan device in tests.
use crate::compositor::{GraphicsSyncHandle, Swapchain, SwapchainCreateInfo, XrError, XrResult};
use crate::swapchain::{NativeSwapchain, SwapchainGc};
use strata::{
    vk, CompositorFence, CompositorSemaphore, Device, NativeImage, SyncFileFence, VkFence,
    VkTimelineSemaphore,
};
use utils::log;

use std::os::fd::OwnedFd;
use std::sync::Arc;

pub trait GpuResources: Send + Sync {
    /// Swapchain formats this device can composite, most preferred first
    fn supported_formats(&self) -> Vec<i64>;

    fn create_swapchain(
        &self,
        info: &SwapchainCreateInfo,
        gc: &Arc<SwapchainGc>,
    ) -> XrResult<Arc<dyn Swapchain>>;

    fn import_swapchain(
        &self,
        info: &SwapchainCreateInfo,
        native_images: &[NativeImage],
        gc: &Arc<SwapchainGc>,
    ) -> XrResult<Arc<dyn Swapchain>>;

    fn import_fence(&self, handle: GraphicsSyncHandle) -> XrResult<Box<dyn CompositorFence>>;

    fn create_semaphore(&self) -> XrResult<(OwnedFd, Arc<dyn CompositorSemaphore>)>;
}

/// Color formats in order of preference, then depth formats
const COLOR_FORMATS: [vk::Format; 6] = [
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::A2B10G10R10_UNORM_PACK32,
    vk::Format::R16G16B16A16_SFLOAT,
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::B8G8R8A8_UNORM,
];
const DEPTH_FORMATS: [vk::Format; 4] = [
    vk::Format::D16_UNORM,
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
];

/// The Vulkan implementation
pub struct VkResources {
    vr_dev: Arc<Device>,
}

impl VkResources {
    pub fn new(dev: Arc<Device>) -> Self {
        Self { vr_dev: dev }
    }
}

impl GpuResources for VkResources {
    fn supported_formats(&self) -> Vec<i64> {
        let color_usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::COLOR_ATTACHMENT;
        let depth_usage =
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;

        let color = COLOR_FORMATS
            .iter()
            .filter(|f| self.vr_dev.is_format_supported(**f, color_usage));
        let depth = DEPTH_FORMATS
            .iter()
            .filter(|f| self.vr_dev.is_format_supported(**f, depth_usage));

        color.chain(depth).map(|f| f.as_raw() as i64).collect()
    }

    fn create_swapchain(
        &self,
        info: &SwapchainCreateInfo,
        gc: &Arc<SwapchainGc>,
    ) -> XrResult<Arc<dyn Swapchain>> {
        Ok(Arc::new(NativeSwapchain::create(&self.vr_dev, info, gc)?))
    }

    fn import_swapchain(
        &self,
        info: &SwapchainCreateInfo,
        native_images: &[NativeImage],
        gc: &Arc<SwapchainGc>,
    ) -> XrResult<Arc<dyn Swapchain>> {
        Ok(Arc::new(NativeSwapchain::import(
            &self.vr_dev,
            info,
            native_images,
            gc,
        )?))
    }

    fn import_fence(&self, handle: GraphicsSyncHandle) -> XrResult<Box<dyn CompositorFence>> {
        let fd = handle.take().ok_or(XrError::INVALID)?;

        // Without fence import the sync file can still be polled
        if !self.vr_dev.supports_fence_import() {
            return Ok(Box::new(SyncFileFence::new(fd)));
        }

        // the fd is closed by the import on failure
        let fence = VkFence::import(&self.vr_dev, fd).map_err(|e| {
            log::error!("Failed to import client fence: {:?}", e);
            XrError::from(e)
        })?;
        Ok(Box::new(fence))
    }

    fn create_semaphore(&self) -> XrResult<(OwnedFd, Arc<dyn CompositorSemaphore>)> {
        if !self.vr_dev.supports_semaphore_export() {
            return Err(XrError::INVALID);
        }

        let (sem, fd) = VkTimelineSemaphore::new_exported(&self.vr_dev)?;
        Ok((fd, Arc::new(sem)))
    }
}
