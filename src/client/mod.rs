// Client graphics API shims
//
// A shim puts a guest graphics API (Vulkan, OpenGL, D3D12) on top of a
// compositor. Swapchain images are created by the compositor and
// imported into the guest, and every commit hands the compositor a way
// to wait for the guest's rendering.
pub mod d3d12;
pub mod gl;
pub mod vk;

use crate::compositor::*;

use strata::{BlendMode, CompositorFence, CompositorSemaphore, NativeImage, SampledImage};
use utils::log;

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What a guest graphics API provides to a `ClientShim`
pub trait GuestApi: Send + Sync {
    /// The guest's handle for one swapchain image
    type Image: Send + Sync + 'static;

    fn name(&self) -> &'static str;

    /// Wrap the compositor's images as guest images
    fn import_images(
        &self,
        info: &SwapchainCreateInfo,
        native_images: &[NativeImage],
    ) -> XrResult<Vec<Self::Image>>;

    /// Adopt the compositor's timeline semaphore
    ///
    /// Returns false if the guest can't signal it, commits then fall
    /// back to `export_sync`.
    fn import_timeline(&self, _fd: OwnedFd) -> XrResult<bool> {
        Ok(false)
    }

    /// Signal `value` on the adopted timeline after all submitted work
    fn signal_timeline(&self, _value: u64) -> XrResult<()> {
        Err(XrError::INVALID)
    }

    /// A handle that signals once all submitted work is done
    ///
    /// An invalid handle means the guest already waited for its work.
    fn export_sync(&self) -> XrResult<GraphicsSyncHandle>;
}

/// A compositor swapchain together with its guest images
pub struct ShimSwapchain<I> {
    ss_native: Arc<dyn Swapchain>,
    ss_images: Vec<I>,
}

impl<I> ShimSwapchain<I> {
    pub fn guest_images(&self) -> &[I] {
        &self.ss_images
    }
}

impl<I: Send + Sync> Swapchain for ShimSwapchain<I> {
    fn info(&self) -> &SwapchainCreateInfo {
        self.ss_native.info()
    }

    fn image_count(&self) -> u32 {
        self.ss_native.image_count()
    }

    fn acquire_image(&self) -> XrResult<u32> {
        self.ss_native.acquire_image()
    }

    fn wait_image(&self, timeout_ns: i64, index: u32) -> XrResult<()> {
        self.ss_native.wait_image(timeout_ns, index)
    }

    fn release_image(&self, index: u32) -> XrResult<()> {
        self.ss_native.release_image(index)
    }

    fn sampled(&self, index: u32, array_index: u32) -> Option<SampledImage> {
        self.ss_native.sampled(index, array_index)
    }

    fn native_images(&self) -> XrResult<Vec<NativeImage>> {
        self.ss_native.native_images()
    }

    fn native(&self) -> Option<Arc<dyn Swapchain>> {
        Some(self.ss_native.clone())
    }
}

struct Timeline {
    t_semaphore: Arc<dyn CompositorSemaphore>,
    t_value: AtomicU64,
}

/// Exposes a compositor to one guest graphics API
pub struct ClientShim<G: GuestApi> {
    cs_native: Arc<dyn Compositor>,
    cs_guest: Arc<G>,
    cs_timeline: Option<Timeline>,
}

impl<G: GuestApi> ClientShim<G> {
    pub fn new(native: Arc<dyn Compositor>, guest: Arc<G>) -> XrResult<Self> {
        let timeline = match native.create_semaphore() {
            Ok((fd, sem)) => match guest.import_timeline(fd)? {
                true => Some(Timeline {
                    t_semaphore: sem,
                    t_value: AtomicU64::new(0),
                }),
                false => None,
            },
            Err(e) => {
                log::debug!("No timeline semaphore for {} ({:?})", guest.name(), e);
                None
            }
        };

        log::debug!(
            "{} client shim syncing with {}",
            guest.name(),
            if timeline.is_some() { "a timeline semaphore" } else { "sync handles" }
        );

        Ok(Self {
            cs_native: native,
            cs_guest: guest,
            cs_timeline: timeline,
        })
    }

    pub fn guest(&self) -> &Arc<G> {
        &self.cs_guest
    }

    pub fn uses_timeline(&self) -> bool {
        self.cs_timeline.is_some()
    }

    /// Create a swapchain and keep the guest's view of its images
    pub fn create_guest_swapchain(
        &self,
        info: &SwapchainCreateInfo,
    ) -> XrResult<Arc<ShimSwapchain<G::Image>>> {
        let native = self.cs_native.create_swapchain(info)?;
        let native_images = native.native_images()?;
        let images = self.cs_guest.import_images(info, &native_images)?;

        Ok(Arc::new(ShimSwapchain {
            ss_native: native,
            ss_images: images,
        }))
    }
}

impl<G: GuestApi + 'static> Compositor for ClientShim<G> {
    fn info(&self) -> CompositorInfo {
        self.cs_native.info()
    }

    fn create_swapchain(&self, info: &SwapchainCreateInfo) -> XrResult<Arc<dyn Swapchain>> {
        Ok(self.create_guest_swapchain(info)?)
    }

    fn import_swapchain(
        &self,
        info: &SwapchainCreateInfo,
        native_images: &[NativeImage],
    ) -> XrResult<Arc<dyn Swapchain>> {
        let images = self.cs_guest.import_images(info, native_images)?;
        let native = self.cs_native.import_swapchain(info, native_images)?;

        Ok(Arc::new(ShimSwapchain {
            ss_native: native,
            ss_images: images,
        }))
    }

    fn import_fence(&self, handle: GraphicsSyncHandle) -> XrResult<Box<dyn CompositorFence>> {
        self.cs_native.import_fence(handle)
    }

    fn create_semaphore(&self) -> XrResult<(OwnedFd, Arc<dyn CompositorSemaphore>)> {
        self.cs_native.create_semaphore()
    }

    fn begin_session(&self, view_type: ViewType) -> XrResult<()> {
        self.cs_native.begin_session(view_type)
    }

    fn end_session(&self) -> XrResult<()> {
        self.cs_native.end_session()
    }

    fn predict_frame(&self) -> XrResult<FramePrediction> {
        self.cs_native.predict_frame()
    }

    fn mark_frame(&self, frame_id: i64, point: FramePoint, when_ns: i64) -> XrResult<()> {
        self.cs_native.mark_frame(frame_id, point, when_ns)
    }

    fn wait_frame(&self) -> XrResult<FrameTiming> {
        self.cs_native.wait_frame()
    }

    fn begin_frame(&self, frame_id: i64) -> XrResult<()> {
        self.cs_native.begin_frame(frame_id)
    }

    fn discard_frame(&self, frame_id: i64) -> XrResult<()> {
        self.cs_native.discard_frame(frame_id)
    }

    fn layer_begin(&self, frame_id: i64, display_time_ns: i64, blend: BlendMode) -> XrResult<()> {
        self.cs_native.layer_begin(frame_id, display_time_ns, blend)
    }

    fn add_layer(&self, entry: LayerEntry) -> XrResult<()> {
        self.cs_native.add_layer(entry)
    }

    fn layer_commit(&self, frame_id: i64, sync: GraphicsSyncHandle) -> XrResult<()> {
        // A handle from the application wins over our own sync
        if sync.is_valid() {
            return self.cs_native.layer_commit(frame_id, sync);
        }

        if let Some(timeline) = self.cs_timeline.as_ref() {
            let value = timeline.t_value.fetch_add(1, Ordering::AcqRel) + 1;
            self.cs_guest.signal_timeline(value)?;
            return self.cs_native.layer_commit_with_semaphore(
                frame_id,
                timeline.t_semaphore.clone(),
                value,
            );
        }

        let handle = self.cs_guest.export_sync()?;
        self.cs_native.layer_commit(frame_id, handle)
    }

    fn layer_commit_with_semaphore(
        &self,
        frame_id: i64,
        semaphore: Arc<dyn CompositorSemaphore>,
        value: u64,
    ) -> XrResult<()> {
        self.cs_native
            .layer_commit_with_semaphore(frame_id, semaphore, value)
    }

    fn poll_events(&self) -> XrResult<Event> {
        self.cs_native.poll_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockCompositor};
    use utils::timing::NS_PER_MS;

    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeGuest {
        imported: Mutex<Vec<(u32, usize)>>,
        exports: Mutex<u32>,
    }

    impl GuestApi for FakeGuest {
        type Image = u32;

        fn name(&self) -> &'static str {
            "fake"
        }

        fn import_images(
            &self,
            info: &SwapchainCreateInfo,
            native_images: &[NativeImage],
        ) -> XrResult<Vec<u32>> {
            self.imported
                .lock()
                .unwrap()
                .push((info.image_count(), native_images.len()));
            Ok((0..info.image_count()).collect())
        }

        fn export_sync(&self) -> XrResult<GraphicsSyncHandle> {
            *self.exports.lock().unwrap() += 1;
            Ok(GraphicsSyncHandle::invalid())
        }
    }

    fn shim() -> (Arc<MockCompositor>, ClientShim<FakeGuest>) {
        let native = Arc::new(MockCompositor::new(16 * NS_PER_MS));
        let shim = ClientShim::new(native.clone(), Arc::new(FakeGuest::default())).unwrap();
        (native, shim)
    }

    #[test]
    fn swapchains_unwrap_to_the_native_one() {
        let (native, shim) = shim();
        let info = SwapchainCreateInfo::new(64, 64, strata::vk::Format::R8G8B8A8_SRGB.as_raw() as i64);

        let sc = shim.create_guest_swapchain(&info).unwrap();
        assert_eq!(sc.guest_images(), &[0, 1, 2]);
        assert!(native.calls().contains(&MockCall::CreateSwapchain));

        let sc: Arc<dyn Swapchain> = sc;
        let inner = native_swapchain(&sc);
        assert!(!Arc::ptr_eq(&inner, &sc));
        assert!(inner.native().is_none());
    }

    #[test]
    fn static_swapchain_imports_one_image() {
        let (_native, shim) = shim();
        let mut info = SwapchainCreateInfo::new(64, 64, strata::vk::Format::R8G8B8A8_SRGB.as_raw() as i64);
        info.create = SwapchainCreateFlags::STATIC_IMAGE;

        let sc = shim.create_guest_swapchain(&info).unwrap();
        assert_eq!(sc.image_count(), 1);
        assert_eq!(sc.guest_images().len(), 1);

        let idx = sc.acquire_image().unwrap();
        sc.wait_image(0, idx).unwrap();
        sc.release_image(idx).unwrap();
    }

    #[test]
    fn commit_without_timeline_exports_sync() {
        let (native, shim) = shim();
        // the mock semaphore is not importable by the fake guest
        assert!(!shim.uses_timeline());

        let t = shim.wait_frame().unwrap();
        shim.begin_frame(t.frame_id).unwrap();
        shim.layer_begin(t.frame_id, t.predicted_display_time, BlendMode::Opaque)
            .unwrap();
        shim.layer_commit(t.frame_id, GraphicsSyncHandle::invalid())
            .unwrap();

        assert_eq!(*shim.guest().exports.lock().unwrap(), 1);
        assert_eq!(native.committed().len(), 1);
        assert_eq!(native.committed()[0].frame_id, t.frame_id);
    }
}
