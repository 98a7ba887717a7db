// Compositor side swapchains
//
// The images of a swapchain are allocated by the compositor with
// exportable memory so that client APIs can import them. Index
// bookkeeping is kept separate from the GPU objects so that every
// swapchain flavor shares the same acquire/wait/release rules.
use crate::compositor::{
    Swapchain, SwapchainCreateFlags, SwapchainCreateInfo, SwapchainUsageFlags, XrError, XrResult,
};
use strata::{vk, DeletionQueue, ImageCreateInfo, ImageResources, NativeImage, SampledImage};
use utils::log;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Acquire/wait/release state of the images of one swapchain
///
/// Free indices are handed out in FIFO order. An image must be
/// acquired, then waited on, then released.
#[derive(Debug)]
pub struct SwapchainState {
    ss_free: VecDeque<u32>,
    ss_acquired: Vec<bool>,
    ss_waited: Vec<bool>,
}

impl SwapchainState {
    pub fn new(image_count: u32) -> Self {
        Self {
            ss_free: (0..image_count).collect(),
            ss_acquired: vec![false; image_count as usize],
            ss_waited: vec![false; image_count as usize],
        }
    }

    pub fn image_count(&self) -> u32 {
        self.ss_acquired.len() as u32
    }

    pub fn acquire(&mut self) -> XrResult<u32> {
        let index = match self.ss_free.pop_front() {
            Some(i) => i,
            None => {
                log::debug!("No swapchain image available, all are acquired");
                return Err(XrError::INVALID);
            }
        };

        self.ss_acquired[index as usize] = true;
        Ok(index)
    }

    pub fn wait(&mut self, index: u32) -> XrResult<()> {
        let i = index as usize;
        if i >= self.ss_acquired.len() || !self.ss_acquired[i] {
            log::error!("Waited on swapchain image {} which is not acquired", index);
            return Err(XrError::INVALID);
        }

        self.ss_waited[i] = true;
        Ok(())
    }

    pub fn release(&mut self, index: u32) -> XrResult<()> {
        let i = index as usize;
        if i >= self.ss_waited.len() || !self.ss_waited[i] {
            log::error!("Released swapchain image {} which was not waited on", index);
            return Err(XrError::INVALID);
        }

        self.ss_acquired[i] = false;
        self.ss_waited[i] = false;
        self.ss_free.push_back(index);
        Ok(())
    }

    pub fn is_acquired(&self, index: u32) -> bool {
        self.ss_acquired
            .get(index as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn is_waited(&self, index: u32) -> bool {
        self.ss_waited.get(index as usize).copied().unwrap_or(false)
    }
}

/// Destroyed swapchains waiting for the GPU to finish with them
///
/// Swapchains can be released from any thread, but their images may
/// be in use by the frame being rendered. They are parked here and the
/// native compositor drops them after its next frame completes.
pub struct SwapchainGc {
    gc_queue: Mutex<DeletionQueue>,
    /// Last frame the native compositor finished
    gc_last_frame: AtomicI64,
}

impl SwapchainGc {
    pub fn new() -> Self {
        Self {
            gc_queue: Mutex::new(DeletionQueue::new()),
            gc_last_frame: AtomicI64::new(0),
        }
    }

    pub fn schedule(&self, item: Box<dyn Send>) {
        let point = self.gc_last_frame.load(Ordering::Acquire) + 1;
        self.gc_queue
            .lock()
            .unwrap()
            .schedule_drop_at_point(item, point);
    }

    /// Drop everything scheduled before `frame_id` completed
    pub fn collect(&self, frame_id: i64) {
        self.gc_last_frame.fetch_max(frame_id, Ordering::AcqRel);
        self.gc_queue.lock().unwrap().drop_all_at_point(frame_id);
    }

    pub fn pending(&self) -> usize {
        self.gc_queue.lock().unwrap().pending()
    }
}

impl Default for SwapchainGc {
    fn default() -> Self {
        Self::new()
    }
}

/// Describe the images of a swapchain to the GPU library
pub fn image_create_info(info: &SwapchainCreateInfo) -> ImageCreateInfo {
    let mut usage = vk::ImageUsageFlags::SAMPLED;
    if info.usage.contains(SwapchainUsageFlags::COLOR) {
        usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if info.usage.contains(SwapchainUsageFlags::DEPTH_STENCIL) {
        usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if info.usage.contains(SwapchainUsageFlags::UNORDERED_ACCESS) {
        usage |= vk::ImageUsageFlags::STORAGE;
    }
    if info.usage.contains(SwapchainUsageFlags::TRANSFER_SRC) {
        usage |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if info.usage.contains(SwapchainUsageFlags::TRANSFER_DST) {
        usage |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if info.usage.contains(SwapchainUsageFlags::INPUT_ATTACHMENT) {
        usage |= vk::ImageUsageFlags::INPUT_ATTACHMENT;
    }

    let mut ret = ImageCreateInfo::new(
        info.width,
        info.height,
        vk::Format::from_raw(info.format as i32),
        usage,
    );
    ret.face_count = info.face_count;
    ret.array_size = info.array_size;
    ret.mip_count = info.mip_count;
    ret.mutable_format = info.usage.contains(SwapchainUsageFlags::MUTABLE_FORMAT);
    ret
}

/// A swapchain whose images live on the compositor's device
pub struct NativeSwapchain {
    ns_info: SwapchainCreateInfo,
    /// Taken on drop and handed to the garbage collector
    ns_images: Option<Vec<ImageResources>>,
    /// Exported or imported handles, kept so clients can import again
    ns_native: Vec<NativeImage>,
    ns_state: Mutex<SwapchainState>,
    ns_gc: Arc<SwapchainGc>,
}

impl NativeSwapchain {
    /// Allocate the images and export them
    pub fn create(
        dev: &Arc<strata::Device>,
        info: &SwapchainCreateInfo,
        gc: &Arc<SwapchainGc>,
    ) -> XrResult<Self> {
        info.validate()?;
        let image_info = image_create_info(info);
        let count = info.image_count();

        let mut images = Vec::with_capacity(count as usize);
        let mut native = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (image, handle) = ImageResources::allocate_exportable(dev, &image_info)?;
            images.push(image);
            native.push(handle);
        }

        log::debug!(
            "Created swapchain with {} {}x{} images (static: {})",
            count,
            info.width,
            info.height,
            info.create.contains(SwapchainCreateFlags::STATIC_IMAGE)
        );

        Ok(Self::from_parts(info, images, native, gc))
    }

    /// Wrap images allocated by someone else
    ///
    /// Every handle is duplicated, the caller keeps `native_images`.
    pub fn import(
        dev: &Arc<strata::Device>,
        info: &SwapchainCreateInfo,
        native_images: &[NativeImage],
        gc: &Arc<SwapchainGc>,
    ) -> XrResult<Self> {
        info.validate()?;
        if native_images.is_empty() {
            return Err(XrError::INVALID);
        }
        let image_info = image_create_info(info);

        let mut images = Vec::with_capacity(native_images.len());
        let mut native = Vec::with_capacity(native_images.len());
        for handle in native_images.iter() {
            images.push(ImageResources::import(dev, &image_info, handle)?);
            native.push(handle.try_clone()?);
        }

        Ok(Self::from_parts(info, images, native, gc))
    }

    fn from_parts(
        info: &SwapchainCreateInfo,
        images: Vec<ImageResources>,
        native: Vec<NativeImage>,
        gc: &Arc<SwapchainGc>,
    ) -> Self {
        Self {
            ns_info: *info,
            ns_state: Mutex::new(SwapchainState::new(images.len() as u32)),
            ns_images: Some(images),
            ns_native: native,
            ns_gc: gc.clone(),
        }
    }
}

impl Swapchain for NativeSwapchain {
    fn info(&self) -> &SwapchainCreateInfo {
        &self.ns_info
    }

    fn image_count(&self) -> u32 {
        self.ns_native.len() as u32
    }

    fn acquire_image(&self) -> XrResult<u32> {
        self.ns_state.lock().unwrap().acquire()
    }

    fn wait_image(&self, _timeout_ns: i64, index: u32) -> XrResult<()> {
        // The native compositor idles the GPU after every frame, so an
        // acquired image is never being read.
        self.ns_state.lock().unwrap().wait(index)
    }

    fn release_image(&self, index: u32) -> XrResult<()> {
        self.ns_state.lock().unwrap().release(index)
    }

    fn sampled(&self, index: u32, array_index: u32) -> Option<SampledImage> {
        self.ns_images
            .as_ref()?
            .get(index as usize)?
            .sampled(array_index)
    }

    fn native_images(&self) -> XrResult<Vec<NativeImage>> {
        let mut ret = Vec::with_capacity(self.ns_native.len());
        for n in self.ns_native.iter() {
            ret.push(n.try_clone()?);
        }
        Ok(ret)
    }
}

impl Drop for NativeSwapchain {
    fn drop(&mut self) {
        if let Some(images) = self.ns_images.take() {
            self.ns_gc.schedule(Box::new(images));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn images_cycle_in_order() {
        let mut state = SwapchainState::new(3);
        assert_eq!(state.acquire(), Ok(0));
        assert_eq!(state.acquire(), Ok(1));
        state.wait(0).unwrap();
        state.release(0).unwrap();
        assert_eq!(state.acquire(), Ok(2));
        // 0 went to the back of the queue
        assert_eq!(state.acquire(), Ok(0));
        assert_eq!(state.acquire(), Err(XrError::INVALID));
    }

    #[test]
    fn wait_needs_acquire_and_release_needs_wait() {
        let mut state = SwapchainState::new(1);
        assert_eq!(state.wait(0), Err(XrError::INVALID));
        assert_eq!(state.release(0), Err(XrError::INVALID));

        let i = state.acquire().unwrap();
        assert!(state.is_acquired(i));
        assert_eq!(state.release(i), Err(XrError::INVALID));

        state.wait(i).unwrap();
        assert!(state.is_waited(i) && state.is_acquired(i));
        state.release(i).unwrap();
        assert!(!state.is_waited(i) && !state.is_acquired(i));

        assert_eq!(state.wait(7), Err(XrError::INVALID));
    }

    #[test]
    fn gc_drops_after_next_frame() {
        use std::sync::atomic::AtomicUsize;

        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let gc = SwapchainGc::new();
        gc.collect(4);

        gc.schedule(Box::new(Counted(dropped.clone())));
        assert_eq!(gc.pending(), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        gc.collect(5);
        assert_eq!(gc.pending(), 0);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn usage_maps_to_vulkan() {
        let mut info = SwapchainCreateInfo::new(32, 32, vk::Format::R8G8B8A8_SRGB.as_raw() as i64);
        info.usage = SwapchainUsageFlags::COLOR | SwapchainUsageFlags::MUTABLE_FORMAT;
        info.array_size = 2;
        let image = image_create_info(&info);

        assert_eq!(image.format, vk::Format::R8G8B8A8_SRGB);
        assert!(image.usage.contains(vk::ImageUsageFlags::SAMPLED));
        assert!(image.usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
        assert!(!image.usage.contains(vk::ImageUsageFlags::STORAGE));
        assert!(image.mutable_format);
        assert_eq!(image.array_size, 2);
    }
}
