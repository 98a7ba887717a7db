// Stand-ins for the GPU and display
//
// These let the native, multi-client and system compositors run
// without a Vulkan device. Each mock keeps its observable state behind
// an `Arc<Mutex<..>>` handle so a test can inspect it while the
// compositor owns the mock.
use crate::compositor::*;
use crate::native::resources::GpuResources;
use crate::swapchain::{SwapchainGc, SwapchainState};

use strata::vk::{self, Handle};
use strata::{
    BlendMode, CompositorFence, CompositorSemaphore, DrawReport, FrameComposition, FramePlan,
    HeadDevice, LayerType, NativeImage, PlanParams, RenderMode, Renderer, SampledImage,
    StrataError, SyncFileFence, Target, TargetConfig, TargetCreateInfo, TargetImage, TargetSync,
};
use utils::pacing::{CompositorPacer, FakeCompositorPacer};
use utils::timing::{get_current_ns, NS_PER_MS};

use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const MOCK_TARGET_IMAGES: u32 = 3;

/// What a `MockTarget` has been asked to do
#[derive(Debug, Default)]
pub struct MockTargetState {
    /// `check_ready` result
    pub ready: bool,
    /// Errors returned by the next acquires, in order
    pub acquire_errors: VecDeque<StrataError>,
    /// Errors returned by the next presents, in order
    pub present_errors: VecDeque<StrataError>,
    pub create_images_calls: u32,
    pub acquires: u32,
    /// (image index, desired present time) of every present
    pub presents: Vec<(u32, i64)>,
    /// Images acquired and not yet presented
    pub outstanding: Vec<u32>,
    /// Acquires of held images and presents of images not held
    pub violations: u32,
}

pub struct MockTarget {
    mt_state: Arc<Mutex<MockTargetState>>,
    mt_pacer: FakeCompositorPacer,
    mt_images: Vec<TargetImage>,
    mt_extent: vk::Extent2D,
    mt_next: u32,
}

impl MockTarget {
    pub fn new(frame_interval_ns: i64) -> Self {
        let state = MockTargetState {
            ready: true,
            ..Default::default()
        };

        Self {
            mt_state: Arc::new(Mutex::new(state)),
            mt_pacer: FakeCompositorPacer::new(frame_interval_ns, get_current_ns()),
            mt_images: Vec::new(),
            mt_extent: vk::Extent2D::default(),
            mt_next: 0,
        }
    }

    pub fn state(&self) -> Arc<Mutex<MockTargetState>> {
        self.mt_state.clone()
    }
}

impl Target for MockTarget {
    fn name(&self) -> &str {
        "mock"
    }

    fn check_ready(&mut self) -> bool {
        self.mt_state.lock().unwrap().ready
    }

    fn create_images(&mut self, info: &TargetCreateInfo) -> strata::Result<()> {
        let mut st = self.mt_state.lock().unwrap();
        st.create_images_calls += 1;
        // old images are gone, nothing is held anymore
        st.outstanding.clear();

        self.mt_images = (0..MOCK_TARGET_IMAGES)
            .map(|i| TargetImage {
                image: vk::Image::from_raw(0x1000 + i as u64),
                view: vk::ImageView::from_raw(0x2000 + i as u64),
            })
            .collect();
        self.mt_extent = vk::Extent2D {
            width: info.width,
            height: info.height,
        };
        self.mt_next = 0;
        Ok(())
    }

    fn has_images(&self) -> bool {
        !self.mt_images.is_empty()
    }

    fn images(&self) -> &[TargetImage] {
        &self.mt_images
    }

    fn extent(&self) -> vk::Extent2D {
        self.mt_extent
    }

    fn format(&self) -> vk::Format {
        vk::Format::B8G8R8A8_SRGB
    }

    fn surface_transform(&self) -> vk::SurfaceTransformFlagsKHR {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    }

    fn acquire(&mut self) -> strata::Result<u32> {
        let mut st = self.mt_state.lock().unwrap();
        if let Some(err) = st.acquire_errors.pop_front() {
            return Err(err);
        }

        let index = self.mt_next;
        self.mt_next = (self.mt_next + 1) % MOCK_TARGET_IMAGES;
        st.acquires += 1;
        if st.outstanding.contains(&index) {
            st.violations += 1;
        }
        st.outstanding.push(index);
        Ok(index)
    }

    fn present(
        &mut self,
        index: u32,
        desired_present_time_ns: i64,
        _present_slop_ns: i64,
    ) -> strata::Result<()> {
        let mut st = self.mt_state.lock().unwrap();
        match st.outstanding.iter().position(|i| *i == index) {
            Some(pos) => {
                st.outstanding.remove(pos);
            }
            None => st.violations += 1,
        }
        st.presents.push((index, desired_present_time_ns));

        match st.present_errors.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn sync(&self) -> TargetSync {
        TargetSync::default()
    }

    fn pacer(&mut self) -> &mut dyn CompositorPacer {
        &mut self.mt_pacer
    }
}

/// One recorded `Renderer::draw`
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub frame_id: i64,
    pub index: u32,
    pub mode: RenderMode,
    pub blend: BlendMode,
    /// The planned type of every layer
    pub layer_types: Vec<LayerType>,
    /// First sampled view of every layer
    pub views: Vec<vk::ImageView>,
}

#[derive(Debug, Default)]
pub struct MockRendererState {
    pub draws: Vec<DrawRecord>,
    pub renderings_created: u32,
    pub renderings_closed: u32,
}

pub struct MockRenderer {
    mr_state: Arc<Mutex<MockRendererState>>,
    mr_hmd: Arc<dyn HeadDevice>,
    mr_budget: u32,
    mr_has_renderings: bool,
}

impl MockRenderer {
    pub fn new(hmd: Arc<dyn HeadDevice>, sampler_budget: u32) -> Self {
        Self {
            mr_state: Arc::new(Mutex::new(MockRendererState::default())),
            mr_hmd: hmd,
            mr_budget: sampler_budget,
            mr_has_renderings: false,
        }
    }

    pub fn state(&self) -> Arc<Mutex<MockRendererState>> {
        self.mr_state.clone()
    }
}

impl Renderer for MockRenderer {
    fn adjust_target_info(&self, _info: &mut TargetCreateInfo) {}

    fn create_renderings(&mut self, target: &dyn Target) -> strata::Result<TargetConfig> {
        self.mr_state.lock().unwrap().renderings_created += 1;
        self.mr_has_renderings = true;
        Ok(TargetConfig::new(
            &self.mr_hmd.views(),
            self.mr_hmd.screen_size(),
            target.extent(),
            target.surface_transform(),
        ))
    }

    fn close_renderings(&mut self) {
        if self.mr_has_renderings {
            self.mr_state.lock().unwrap().renderings_closed += 1;
        }
        self.mr_has_renderings = false;
    }

    fn has_renderings(&self) -> bool {
        self.mr_has_renderings
    }

    fn plan_params(&self) -> PlanParams {
        PlanParams {
            use_compute: false,
            use_timewarp: false,
            sampler_budget: self.mr_budget,
        }
    }

    fn draw(
        &mut self,
        _target: &dyn Target,
        index: u32,
        frame: &FrameComposition,
        plan: &FramePlan,
    ) -> strata::Result<DrawReport> {
        if !self.mr_has_renderings {
            return Err(StrataError::INVALID);
        }

        self.mr_state.lock().unwrap().draws.push(DrawRecord {
            frame_id: frame.frame_id,
            index: index,
            mode: plan.mode,
            blend: frame.blend,
            layer_types: plan.layer_types.clone(),
            views: frame
                .layers
                .iter()
                .map(|l| l.images.first().map(|i| i.view_alpha).unwrap_or_default())
                .collect(),
        });

        Ok(DrawReport {
            mode: plan.mode,
            layers_drawn: plan.visible_count(),
            submitted: true,
        })
    }

    fn wait_for_fence(&mut self, _index: u32) -> strata::Result<()> {
        Ok(())
    }

    fn wait_idle(&self) -> strata::Result<()> {
        Ok(())
    }

    fn gpu_duration_ns(&mut self) -> Option<i64> {
        Some(2 * NS_PER_MS)
    }
}

/// A swapchain with fake image handles
///
/// View handles are `id * 16 + image index + 1` so tests can tell
/// swapchains apart in draw records.
pub struct MockSwapchain {
    ms_id: u64,
    ms_info: SwapchainCreateInfo,
    ms_state: Mutex<SwapchainState>,
    ms_native: Vec<NativeImage>,
}

impl MockSwapchain {
    pub fn new(id: u64, info: &SwapchainCreateInfo) -> Self {
        Self {
            ms_id: id,
            ms_info: *info,
            ms_state: Mutex::new(SwapchainState::new(info.image_count())),
            ms_native: Vec::new(),
        }
    }

    /// The view handle of image `index`
    pub fn view(id: u64, index: u32) -> vk::ImageView {
        vk::ImageView::from_raw(id * 16 + index as u64 + 1)
    }
}

impl Swapchain for MockSwapchain {
    fn info(&self) -> &SwapchainCreateInfo {
        &self.ms_info
    }

    fn image_count(&self) -> u32 {
        self.ms_state.lock().unwrap().image_count()
    }

    fn acquire_image(&self) -> XrResult<u32> {
        self.ms_state.lock().unwrap().acquire()
    }

    fn wait_image(&self, _timeout_ns: i64, index: u32) -> XrResult<()> {
        self.ms_state.lock().unwrap().wait(index)
    }

    fn release_image(&self, index: u32) -> XrResult<()> {
        self.ms_state.lock().unwrap().release(index)
    }

    fn sampled(&self, index: u32, array_index: u32) -> Option<SampledImage> {
        if index >= self.image_count() || array_index >= self.ms_info.array_size {
            return None;
        }

        let view = Self::view(self.ms_id, index);
        Some(SampledImage {
            view_alpha: view,
            view_no_alpha: view,
            width: self.ms_info.width,
            height: self.ms_info.height,
            is_depth: false,
        })
    }

    fn native_images(&self) -> XrResult<Vec<NativeImage>> {
        let mut ret = Vec::with_capacity(self.ms_native.len());
        for n in self.ms_native.iter() {
            ret.push(n.try_clone()?);
        }
        Ok(ret)
    }
}

/// A timeline that only exists on the CPU
#[derive(Default)]
pub struct MockSemaphore {
    sem_value: Mutex<u64>,
    sem_cond: Condvar,
}

impl MockSemaphore {
    pub fn signal(&self, value: u64) {
        let mut v = self.sem_value.lock().unwrap();
        *v = value.max(*v);
        self.sem_cond.notify_all();
    }
}

impl CompositorSemaphore for MockSemaphore {
    fn wait(&self, value: u64, timeout_ns: u64) -> strata::Result<()> {
        let guard = self.sem_value.lock().unwrap();
        let (_guard, res) = self
            .sem_cond
            .wait_timeout_while(guard, Duration::from_nanos(timeout_ns), |v| *v < value)
            .unwrap();

        match res.timed_out() {
            true => Err(StrataError::TIMEOUT),
            false => Ok(()),
        }
    }
}

/// Hands out mock swapchains and polls fence fds
#[derive(Default)]
pub struct MockResources {
    mr_next_id: AtomicI64,
    mr_semaphores: Mutex<Vec<Arc<MockSemaphore>>>,
}

impl MockResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// The semaphores created so far
    pub fn semaphores(&self) -> Vec<Arc<MockSemaphore>> {
        self.mr_semaphores.lock().unwrap().clone()
    }

    fn next_id(&self) -> u64 {
        self.mr_next_id.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }
}

impl GpuResources for MockResources {
    fn supported_formats(&self) -> Vec<i64> {
        vec![
            vk::Format::R8G8B8A8_SRGB.as_raw() as i64,
            vk::Format::B8G8R8A8_SRGB.as_raw() as i64,
            vk::Format::D32_SFLOAT.as_raw() as i64,
        ]
    }

    fn create_swapchain(
        &self,
        info: &SwapchainCreateInfo,
        _gc: &Arc<SwapchainGc>,
    ) -> XrResult<Arc<dyn Swapchain>> {
        info.validate()?;
        Ok(Arc::new(MockSwapchain::new(self.next_id(), info)))
    }

    fn import_swapchain(
        &self,
        info: &SwapchainCreateInfo,
        native_images: &[NativeImage],
        _gc: &Arc<SwapchainGc>,
    ) -> XrResult<Arc<dyn Swapchain>> {
        info.validate()?;
        if native_images.is_empty() {
            return Err(XrError::INVALID);
        }

        let mut sc = MockSwapchain::new(self.next_id(), info);
        sc.ms_state = Mutex::new(SwapchainState::new(native_images.len() as u32));
        for n in native_images.iter() {
            sc.ms_native.push(n.try_clone()?);
        }
        Ok(Arc::new(sc))
    }

    fn import_fence(&self, handle: GraphicsSyncHandle) -> XrResult<Box<dyn CompositorFence>> {
        let fd = handle.take().ok_or(XrError::INVALID)?;
        Ok(Box::new(SyncFileFence::new(fd)))
    }

    fn create_semaphore(&self) -> XrResult<(OwnedFd, Arc<dyn CompositorSemaphore>)> {
        let (rd, _wr) = nix::unistd::pipe().or(Err(XrError::OUT_OF_RESOURCES))?;
        let sem = Arc::new(MockSemaphore::default());
        self.mr_semaphores.lock().unwrap().push(sem.clone());
        Ok((rd, sem))
    }
}

/// A frame the mock compositor received
#[derive(Clone)]
pub struct CommittedFrame {
    pub frame_id: i64,
    pub display_time: i64,
    pub blend: BlendMode,
    pub layers: Vec<LayerEntry>,
}

impl CommittedFrame {
    pub fn layer_types(&self) -> Vec<LayerType> {
        self.layers.iter().map(|l| l.data.layer_type()).collect()
    }
}

/// Calls a `MockCompositor` received, in order
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    CreateSwapchain,
    ImportSwapchain,
    BeginSession(ViewType),
    EndSession,
    PredictFrame,
    MarkFrame(i64, FramePoint),
    WaitFrame,
    BeginFrame(i64),
    DiscardFrame(i64),
    LayerBegin(i64, i64),
    Layer(LayerType),
    LayerCommit(i64),
    PollEvents,
}

pub type PredictHook = Box<dyn FnMut(i64) -> XrResult<FramePrediction> + Send>;
pub type WaitHook = Box<dyn FnMut() -> XrResult<FrameTiming> + Send>;
pub type CommitHook = Box<dyn FnMut(&CommittedFrame) -> XrResult<()> + Send>;

#[derive(Default)]
struct MockHooks {
    predict_frame: Option<PredictHook>,
    wait_frame: Option<WaitHook>,
    layer_commit: Option<CommitHook>,
}

/// A compositor that records everything and renders nothing
///
/// Without hooks every prediction displays one period from now and
/// wakes half a period before that.
pub struct MockCompositor {
    mc_resources: MockResources,
    mc_gc: Arc<SwapchainGc>,
    mc_period: i64,
    mc_next_id: AtomicI64,
    mc_calls: Mutex<Vec<MockCall>>,
    mc_hooks: Mutex<MockHooks>,
    mc_slot: Mutex<LayerSlot>,
    mc_committed: Mutex<Vec<CommittedFrame>>,
    mc_events: Mutex<VecDeque<Event>>,
}

impl MockCompositor {
    pub fn new(period_ns: i64) -> Self {
        Self {
            mc_resources: MockResources::new(),
            mc_gc: Arc::new(SwapchainGc::new()),
            mc_period: period_ns,
            mc_next_id: AtomicI64::new(1),
            mc_calls: Mutex::new(Vec::new()),
            mc_hooks: Mutex::new(MockHooks::default()),
            mc_slot: Mutex::new(LayerSlot::default()),
            mc_committed: Mutex::new(Vec::new()),
            mc_events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_predict_hook(&self, hook: PredictHook) {
        self.mc_hooks.lock().unwrap().predict_frame = Some(hook);
    }

    pub fn set_wait_hook(&self, hook: WaitHook) {
        self.mc_hooks.lock().unwrap().wait_frame = Some(hook);
    }

    pub fn set_commit_hook(&self, hook: CommitHook) {
        self.mc_hooks.lock().unwrap().layer_commit = Some(hook);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.mc_calls.lock().unwrap().clone()
    }

    pub fn committed(&self) -> Vec<CommittedFrame> {
        self.mc_committed.lock().unwrap().clone()
    }

    pub fn push_event(&self, event: Event) {
        self.mc_events.lock().unwrap().push_back(event);
    }

    pub fn resources(&self) -> &MockResources {
        &self.mc_resources
    }

    fn record(&self, call: MockCall) {
        self.mc_calls.lock().unwrap().push(call);
    }

    fn default_prediction(&self, now: i64) -> FramePrediction {
        let id = self.mc_next_id.fetch_add(1, Ordering::Relaxed);
        FramePrediction {
            frame_id: id,
            wake_time: now + self.mc_period / 2,
            predicted_gpu_time: now + self.mc_period * 3 / 4,
            predicted_display_time: now + self.mc_period,
            predicted_display_period: self.mc_period,
        }
    }

    fn commit(&self, frame_id: i64) -> XrResult<()> {
        self.record(MockCall::LayerCommit(frame_id));

        let slot = std::mem::take(&mut *self.mc_slot.lock().unwrap());
        if !slot.active {
            return Err(XrError::INVALID);
        }

        let frame = CommittedFrame {
            frame_id: frame_id,
            display_time: slot.display_time,
            blend: slot.blend,
            layers: slot.layers,
        };

        let ret = match self.mc_hooks.lock().unwrap().layer_commit.as_mut() {
            Some(hook) => hook(&frame),
            None => Ok(()),
        };
        self.mc_committed.lock().unwrap().push(frame);
        ret
    }
}

impl Compositor for MockCompositor {
    fn info(&self) -> CompositorInfo {
        CompositorInfo {
            formats: self.mc_resources.supported_formats(),
            views: [ViewSizeInfo {
                recommended: (1440, 1600),
                max: (2880, 3200),
            }; 2],
        }
    }

    fn create_swapchain(&self, info: &SwapchainCreateInfo) -> XrResult<Arc<dyn Swapchain>> {
        self.record(MockCall::CreateSwapchain);
        self.mc_resources.create_swapchain(info, &self.mc_gc)
    }

    fn import_swapchain(
        &self,
        info: &SwapchainCreateInfo,
        native_images: &[NativeImage],
    ) -> XrResult<Arc<dyn Swapchain>> {
        self.record(MockCall::ImportSwapchain);
        self.mc_resources
            .import_swapchain(info, native_images, &self.mc_gc)
    }

    fn import_fence(&self, handle: GraphicsSyncHandle) -> XrResult<Box<dyn CompositorFence>> {
        self.mc_resources.import_fence(handle)
    }

    fn create_semaphore(&self) -> XrResult<(OwnedFd, Arc<dyn CompositorSemaphore>)> {
        self.mc_resources.create_semaphore()
    }

    fn begin_session(&self, view_type: ViewType) -> XrResult<()> {
        self.record(MockCall::BeginSession(view_type));
        Ok(())
    }

    fn end_session(&self) -> XrResult<()> {
        self.record(MockCall::EndSession);
        Ok(())
    }

    fn predict_frame(&self) -> XrResult<FramePrediction> {
        self.record(MockCall::PredictFrame);
        let now = get_current_ns();
        match self.mc_hooks.lock().unwrap().predict_frame.as_mut() {
            Some(hook) => hook(now),
            None => Ok(self.default_prediction(now)),
        }
    }

    fn mark_frame(&self, frame_id: i64, point: FramePoint, _when_ns: i64) -> XrResult<()> {
        self.record(MockCall::MarkFrame(frame_id, point));
        Ok(())
    }

    fn wait_frame(&self) -> XrResult<FrameTiming> {
        self.record(MockCall::WaitFrame);
        if let Some(hook) = self.mc_hooks.lock().unwrap().wait_frame.as_mut() {
            return hook();
        }

        let p = self.default_prediction(get_current_ns());
        Ok(FrameTiming {
            frame_id: p.frame_id,
            predicted_display_time: p.predicted_display_time,
            predicted_display_period: p.predicted_display_period,
        })
    }

    fn begin_frame(&self, frame_id: i64) -> XrResult<()> {
        self.record(MockCall::BeginFrame(frame_id));
        Ok(())
    }

    fn discard_frame(&self, frame_id: i64) -> XrResult<()> {
        self.record(MockCall::DiscardFrame(frame_id));
        self.mc_slot.lock().unwrap().clear();
        Ok(())
    }

    fn layer_begin(&self, frame_id: i64, display_time_ns: i64, blend: BlendMode) -> XrResult<()> {
        self.record(MockCall::LayerBegin(frame_id, display_time_ns));
        *self.mc_slot.lock().unwrap() = LayerSlot::begin(display_time_ns, blend);
        Ok(())
    }

    fn add_layer(&self, entry: LayerEntry) -> XrResult<()> {
        self.record(MockCall::Layer(entry.data.layer_type()));
        let mut slot = self.mc_slot.lock().unwrap();
        if !slot.active {
            return Err(XrError::INVALID);
        }
        slot.layers.push(entry);
        Ok(())
    }

    fn layer_commit(&self, frame_id: i64, sync: GraphicsSyncHandle) -> XrResult<()> {
        if sync.is_valid() {
            let mut fence = self.import_fence(sync)?;
            crate::sync::wait_fence(fence.as_mut())?;
        }
        self.commit(frame_id)
    }

    fn layer_commit_with_semaphore(
        &self,
        frame_id: i64,
        semaphore: Arc<dyn CompositorSemaphore>,
        value: u64,
    ) -> XrResult<()> {
        crate::sync::wait_semaphore(semaphore.as_ref(), value)?;
        self.commit(frame_id)
    }

    fn poll_events(&self) -> XrResult<Event> {
        self.record(MockCall::PollEvents);
        Ok(self
            .mc_events
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Event::None))
    }
}

