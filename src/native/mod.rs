// The native compositor
//
// Owns the presentation target and the renderer and turns one frame
// of layers into one presented target image. It is driven by a single
// session, normally the system compositor's render thread. All frame
// work happens on the thread that calls `layer_commit`.
pub mod resources;
pub mod setup;

use crate::compositor::*;
use crate::config::Config;
use crate::swapchain::SwapchainGc;
use crate::sync;
use resources::GpuResources;

use strata::{
    math, plan_frame, BlendMode, CompositeLayer, CompositorFence, CompositorSemaphore,
    FrameComposition, HeadDevice, LayerKind, NativeImage, Renderer, StrataError, Target,
    TargetConfig, TargetCreateInfo, ViewState,
};
use utils::log;
use utils::pacing::{FrameRecord, TimingPoint};
use utils::timing::{get_current_ns, ns_to_ms, PreciseSleeper, NS_PER_MS};

use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};

/// Layers one native frame can hold, every client's layers end up here
pub const NATIVE_MAX_LAYERS: usize = 128;
const STATS_COUNT: usize = 16;

/// Timings of one presented frame
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FrameStats {
    pub frame_id: i64,
    pub predicted_display_time: i64,
    pub desired_present_time: i64,
    /// When present returned
    pub presented_at: i64,
    pub gpu_duration_ns: Option<i64>,
    pub layers_drawn: usize,
}

struct NativeState {
    ns_target: Box<dyn Target>,
    ns_renderer: Box<dyn Renderer>,
    ns_target_info: TargetCreateInfo,
    ns_config: Option<TargetConfig>,
    /// Target image held for rendering, -1 if none
    ns_acquired_buffer: i32,
    /// Target image whose fence has not been waited on, -1 if none
    ns_fenced_buffer: i32,
    /// The prediction of the frame being built
    ns_frame: FrameRecord,
    ns_slot: LayerSlot,
    ns_session_active: bool,
    ns_events: VecDeque<Event>,
    ns_stats: VecDeque<FrameStats>,
    ns_last_display_time: i64,
}

pub struct NativeCompositor {
    nc_resources: Arc<dyn GpuResources>,
    nc_gc: Arc<SwapchainGc>,
    nc_hmd: Arc<dyn HeadDevice>,
    nc_info: CompositorInfo,
    nc_debug_views: bool,
    nc_state: Mutex<NativeState>,
}

/// The images a layer samples, in swapchain order
fn composite_layer(entry: &LayerEntry) -> CompositeLayer {
    let subs = match &entry.data.kind {
        LayerKind::StereoProjection { l, r } => vec![l.sub, r.sub],
        LayerKind::StereoProjectionDepth { l, r, l_d, r_d } => {
            vec![l.sub, r.sub, l_d.sub, r_d.sub]
        }
        _ => vec![entry.data.sub_image(0)],
    };

    let mut images = Vec::with_capacity(subs.len());
    for (sc, sub) in entry.swapchains.iter().zip(subs.iter()) {
        match sc.sampled(sub.image_index, sub.array_index) {
            Some(image) => images.push(image),
            None => {
                log::warn!(
                    "Layer references image {} array layer {} which does not exist",
                    sub.image_index,
                    sub.array_index
                );
                break;
            }
        }
    }

    CompositeLayer::new(entry.data, images)
}

impl NativeCompositor {
    pub fn new(
        target: Box<dyn Target>,
        renderer: Box<dyn Renderer>,
        resources: Arc<dyn GpuResources>,
        hmd: Arc<dyn HeadDevice>,
        config: &Config,
    ) -> Self {
        let (w, h) = match config.fullscreen {
            true => hmd.screen_size(),
            false => (config.preferred.width, config.preferred.height),
        };
        let info = CompositorInfo::new(
            hmd.as_ref(),
            config.viewport_scale,
            resources.supported_formats(),
        );

        log::info!(
            "Native compositor on {} driving {}",
            target.name(),
            hmd.name()
        );

        Self {
            nc_gc: Arc::new(SwapchainGc::new()),
            nc_resources: resources,
            nc_hmd: hmd,
            nc_info: info,
            nc_debug_views: config.debug_views,
            nc_state: Mutex::new(NativeState {
                ns_target: target,
                ns_renderer: renderer,
                ns_target_info: config.target_create_info(w, h),
                ns_config: None,
                ns_acquired_buffer: -1,
                ns_fenced_buffer: -1,
                ns_frame: FrameRecord::default(),
                ns_slot: LayerSlot::default(),
                ns_session_active: false,
                ns_events: VecDeque::new(),
                ns_stats: VecDeque::with_capacity(STATS_COUNT),
                ns_last_display_time: 0,
            }),
        }
    }

    pub fn hmd(&self) -> &Arc<dyn HeadDevice> {
        &self.nc_hmd
    }

    pub fn swapchain_gc(&self) -> &Arc<SwapchainGc> {
        &self.nc_gc
    }

    /// Timings of the last presented frames, oldest first
    pub fn stats(&self) -> Vec<FrameStats> {
        self.nc_state.lock().unwrap().ns_stats.iter().copied().collect()
    }

    /// The mapping of views onto the target, once it has images
    pub fn target_config(&self) -> Option<TargetConfig> {
        self.nc_state.lock().unwrap().ns_config
    }

    pub fn acquired_buffer(&self) -> i32 {
        self.nc_state.lock().unwrap().ns_acquired_buffer
    }

    pub fn fenced_buffer(&self) -> i32 {
        self.nc_state.lock().unwrap().ns_fenced_buffer
    }

    pub fn session_active(&self) -> bool {
        self.nc_state.lock().unwrap().ns_session_active
    }

    /// Make sure the target has images and the renderer can draw to them
    ///
    /// With `force` everything is recreated. Returns false if the target
    /// is not ready yet.
    fn ensure_images_and_renderings(st: &mut NativeState, force: bool) -> bool {
        if !force && st.ns_target.has_images() && st.ns_renderer.has_renderings() {
            return true;
        }

        if !st.ns_target.check_ready() {
            log::trace!("Target {} is not ready", st.ns_target.name());
            return false;
        }

        if st.ns_renderer.has_renderings() {
            if let Err(e) = st.ns_renderer.wait_idle() {
                log::error!("Could not idle the device before resizing: {:?}", e);
            }
            st.ns_renderer.close_renderings();
        }
        // Any held image belongs to the old set
        st.ns_acquired_buffer = -1;
        st.ns_fenced_buffer = -1;
        st.ns_config = None;

        let mut info = st.ns_target_info;
        st.ns_renderer.adjust_target_info(&mut info);
        if let Err(e) = st.ns_target.create_images(&info) {
            log::error!("Could not create target images: {:?}", e);
            return false;
        }

        match st.ns_renderer.create_renderings(st.ns_target.as_ref()) {
            Ok(config) => st.ns_config = Some(config),
            Err(e) => {
                log::error!("Could not create renderings: {:?}", e);
                return false;
            }
        }

        let extent = st.ns_target.extent();
        log::info!(
            "Target {} has {} {}x{} images",
            st.ns_target.name(),
            st.ns_target.images().len(),
            extent.width,
            extent.height
        );
        true
    }

    /// No-op if no fence is outstanding
    fn wait_for_last_fence(st: &mut NativeState) {
        if st.ns_fenced_buffer < 0 {
            return;
        }

        if let Err(e) = st.ns_renderer.wait_for_fence(st.ns_fenced_buffer as u32) {
            log::error!("Waiting on frame fence failed: {:?}", e);
        }
        st.ns_fenced_buffer = -1;
    }

    /// Get a target image to render into
    ///
    /// A stale target is recreated and the acquire retried once.
    fn acquire(st: &mut NativeState) -> Option<u32> {
        if st.ns_acquired_buffer >= 0 {
            return Some(st.ns_acquired_buffer as u32);
        }

        let index = match st.ns_target.acquire() {
            Ok(i) => i,
            Err(StrataError::OUT_OF_DATE) | Err(StrataError::SUBOPTIMAL) => {
                log::debug!("Target out of date on acquire, recreating");
                if !Self::ensure_images_and_renderings(st, true) {
                    return None;
                }
                match st.ns_target.acquire() {
                    Ok(i) => i,
                    Err(e) => {
                        log::error!("Acquire failed again after recreating the target: {:?}", e);
                        return None;
                    }
                }
            }
            Err(e) => {
                log::error!("Could not acquire a target image: {:?}", e);
                return None;
            }
        };

        st.ns_acquired_buffer = index as i32;
        Some(index)
    }

    fn compute_views(&self, display_time: i64) -> [ViewState; 2] {
        let head = self.nc_hmd.head_pose(display_time);
        let eyes = self.nc_hmd.eye_poses();
        let hmd_views = self.nc_hmd.views();

        let view = |i: usize| ViewState {
            fov: hmd_views[i].fov,
            world_pose: math::pose_multiply(&head, &eyes[i]),
            eye_pose: eyes[i],
        };
        let views = [view(0), view(1)];

        if self.nc_debug_views {
            for (i, v) in views.iter().enumerate() {
                log::debug!(
                    "view {}: position {:?} orientation {:?} fov {:?}",
                    i,
                    v.world_pose.position,
                    v.world_pose.orientation,
                    v.fov
                );
            }
        }

        views
    }

    /// Composite `slot` into the next target image and present it
    fn render(&self, st: &mut NativeState, frame_id: i64, slot: &LayerSlot) -> XrResult<()> {
        let frame = st.ns_frame;
        if frame.id != frame_id {
            log::debug!(
                "Committing frame {} but the last prediction was for {}",
                frame_id,
                frame.id
            );
        }

        let mut comp = FrameComposition::new(frame_id, frame.predicted_display_time);
        comp.blend = slot.blend;
        comp.layers = slot.layers.iter().map(composite_layer).collect();

        if !Self::ensure_images_and_renderings(st, false) {
            // keep the pacer ticking while there is nothing to draw to
            st.ns_target.mark_submit(frame_id, get_current_ns());
            return Ok(());
        }

        let index = match Self::acquire(st) {
            Some(i) => i,
            None => {
                st.ns_target.mark_submit(frame_id, get_current_ns());
                return Ok(());
            }
        };
        Self::wait_for_last_fence(st);

        comp.views = self.compute_views(frame.predicted_display_time);

        let plan = plan_frame(&comp.layers, &st.ns_renderer.plan_params());
        let report = st
            .ns_renderer
            .draw(st.ns_target.as_ref(), index, &comp, &plan)
            .map_err(|e| {
                log::error!("Drawing frame {} failed: {:?}", frame_id, e);
                XrError::from(e)
            })?;
        st.ns_target.mark_submit(frame_id, get_current_ns());

        let present = st
            .ns_target
            .present(index, frame.desired_present_time, frame.present_slop);
        st.ns_acquired_buffer = -1;
        if report.submitted {
            st.ns_fenced_buffer = index as i32;
        }
        let presented_at = get_current_ns();
        match present {
            Ok(()) => {}
            Err(StrataError::OUT_OF_DATE) | Err(StrataError::SUBOPTIMAL) => {
                log::debug!("Target out of date on present, recreating");
                Self::ensure_images_and_renderings(st, true);
            }
            Err(e) => log::error!("Could not present frame {}: {:?}", frame_id, e),
        }

        // Serialize with the GPU, latency matters more than throughput
        if let Err(e) = st.ns_renderer.wait_idle() {
            log::error!("Device wait idle failed: {:?}", e);
        }

        let now = get_current_ns();
        let gpu_duration = st.ns_renderer.gpu_duration_ns();
        if let Some(duration) = gpu_duration {
            st.ns_target.info_gpu(frame_id, now - duration, now, now);
        }
        st.ns_target.update_timings();

        // Grab the next image now, a slow acquire means we missed scan out
        if st.ns_target.has_images() && st.ns_acquired_buffer < 0 {
            match st.ns_target.acquire() {
                Ok(i) => st.ns_acquired_buffer = i as i32,
                Err(e) => log::debug!("Early acquire failed, retrying next frame: {:?}", e),
            }
        }
        let after_acquire = get_current_ns();
        if after_acquire > frame.desired_present_time + NS_PER_MS {
            log::warn!(
                "Acquire took until {:.2}ms past the desired present time, probably missed frame",
                ns_to_ms(after_acquire - frame.desired_present_time)
            );
        }

        if frame.predicted_display_time < st.ns_last_display_time {
            log::warn!(
                "Frame {} display time went backwards by {:.2}ms",
                frame_id,
                ns_to_ms(st.ns_last_display_time - frame.predicted_display_time)
            );
        }
        st.ns_last_display_time = frame.predicted_display_time;

        if st.ns_stats.len() == STATS_COUNT {
            st.ns_stats.pop_front();
        }
        st.ns_stats.push_back(FrameStats {
            frame_id: frame_id,
            predicted_display_time: frame.predicted_display_time,
            desired_present_time: frame.desired_present_time,
            presented_at: presented_at,
            gpu_duration_ns: gpu_duration,
            layers_drawn: report.layers_drawn,
        });
        log::profiling!(
            "frame {} {:?} drew {} layers, gpu {:?}ns",
            frame_id,
            report.mode,
            report.layers_drawn,
            gpu_duration
        );

        Ok(())
    }

    /// Render whatever is in the current slot
    fn commit(&self, frame_id: i64) -> XrResult<()> {
        let mut st = self.nc_state.lock().unwrap();
        if !st.ns_slot.active {
            log::error!("layer_commit for frame {} without layer_begin", frame_id);
            return Err(XrError::INVALID);
        }

        // The slot keeps the swapchains alive until the GPU is done
        let slot = std::mem::take(&mut st.ns_slot);
        let ret = self.render(&mut st, frame_id, &slot);
        drop(slot);
        drop(st);

        self.nc_gc.collect(frame_id);
        ret
    }
}

impl Compositor for NativeCompositor {
    fn info(&self) -> CompositorInfo {
        self.nc_info.clone()
    }

    fn create_swapchain(&self, info: &SwapchainCreateInfo) -> XrResult<Arc<dyn Swapchain>> {
        self.nc_resources.create_swapchain(info, &self.nc_gc)
    }

    fn import_swapchain(
        &self,
        info: &SwapchainCreateInfo,
        native_images: &[NativeImage],
    ) -> XrResult<Arc<dyn Swapchain>> {
        self.nc_resources
            .import_swapchain(info, native_images, &self.nc_gc)
    }

    fn import_fence(&self, handle: GraphicsSyncHandle) -> XrResult<Box<dyn CompositorFence>> {
        self.nc_resources.import_fence(handle)
    }

    fn create_semaphore(&self) -> XrResult<(OwnedFd, Arc<dyn CompositorSemaphore>)> {
        self.nc_resources.create_semaphore()
    }

    fn begin_session(&self, view_type: ViewType) -> XrResult<()> {
        let mut st = self.nc_state.lock().unwrap();
        if st.ns_session_active {
            return Err(XrError::INVALID);
        }

        log::debug!("Native session begins ({:?})", view_type);
        st.ns_session_active = true;
        st.ns_events.push_back(Event::StateChange {
            visible: true,
            focused: true,
        });
        Ok(())
    }

    fn end_session(&self) -> XrResult<()> {
        let mut st = self.nc_state.lock().unwrap();
        if !st.ns_session_active {
            return Err(XrError::INVALID);
        }

        log::debug!("Native session ends");
        st.ns_session_active = false;
        st.ns_slot.clear();
        st.ns_events.push_back(Event::StateChange {
            visible: false,
            focused: false,
        });
        Ok(())
    }

    fn predict_frame(&self) -> XrResult<FramePrediction> {
        let mut st = self.nc_state.lock().unwrap();
        let frame = st.ns_target.calc_frame_pacing(get_current_ns());
        st.ns_frame = frame;

        Ok(FramePrediction {
            frame_id: frame.id,
            wake_time: frame.wake_time,
            predicted_gpu_time: frame.predicted_gpu_time,
            predicted_display_time: frame.predicted_display_time,
            predicted_display_period: frame.predicted_display_period,
        })
    }

    fn mark_frame(&self, frame_id: i64, point: FramePoint, when_ns: i64) -> XrResult<()> {
        let mut st = self.nc_state.lock().unwrap();
        match point {
            FramePoint::Woke => {
                st.ns_target
                    .pacer()
                    .mark_point(TimingPoint::WakeUp, frame_id, when_ns)?;
            }
            FramePoint::Begin => st.ns_target.mark_begin(frame_id, when_ns),
        }
        Ok(())
    }

    fn wait_frame(&self) -> XrResult<FrameTiming> {
        let prediction = self.predict_frame()?;
        PreciseSleeper::new().wait_until(prediction.wake_time);
        self.mark_frame(prediction.frame_id, FramePoint::Woke, get_current_ns())?;

        Ok(FrameTiming {
            frame_id: prediction.frame_id,
            predicted_display_time: prediction.predicted_display_time,
            predicted_display_period: prediction.predicted_display_period,
        })
    }

    fn begin_frame(&self, frame_id: i64) -> XrResult<()> {
        self.mark_frame(frame_id, FramePoint::Begin, get_current_ns())
    }

    fn discard_frame(&self, frame_id: i64) -> XrResult<()> {
        let mut st = self.nc_state.lock().unwrap();
        log::debug!("Discarding frame {}", frame_id);
        st.ns_slot.clear();
        st.ns_target.mark_submit(frame_id, get_current_ns());
        Ok(())
    }

    fn layer_begin(&self, frame_id: i64, display_time_ns: i64, blend: BlendMode) -> XrResult<()> {
        let mut st = self.nc_state.lock().unwrap();
        log::trace!("layer_begin for frame {}", frame_id);
        st.ns_slot = LayerSlot::begin(display_time_ns, blend);
        Ok(())
    }

    fn add_layer(&self, entry: LayerEntry) -> XrResult<()> {
        let mut st = self.nc_state.lock().unwrap();
        if !st.ns_slot.active {
            log::error!("Layer submitted outside of layer_begin/layer_commit");
            return Err(XrError::INVALID);
        }
        if st.ns_slot.layers.len() >= NATIVE_MAX_LAYERS {
            return Err(XrError::INVALID);
        }

        // Swapchains wrapped by client shims are sampled directly
        let mut entry = entry;
        entry.swapchains = entry.swapchains.iter().map(native_swapchain).collect();
        st.ns_slot.layers.push(entry);
        Ok(())
    }

    fn layer_commit(&self, frame_id: i64, sync: GraphicsSyncHandle) -> XrResult<()> {
        if sync.is_valid() {
            let mut fence = self.nc_resources.import_fence(sync)?;
            sync::wait_fence(fence.as_mut())?;
        }
        self.commit(frame_id)
    }

    fn layer_commit_with_semaphore(
        &self,
        frame_id: i64,
        semaphore: Arc<dyn CompositorSemaphore>,
        value: u64,
    ) -> XrResult<()> {
        sync::wait_semaphore(semaphore.as_ref(), value)?;
        self.commit(frame_id)
    }

    fn poll_events(&self) -> XrResult<Event> {
        let mut st = self.nc_state.lock().unwrap();
        Ok(st.ns_events.pop_front().unwrap_or(Event::None))
    }
}

impl Drop for NativeCompositor {
    fn drop(&mut self) {
        if let Ok(mut st) = self.nc_state.lock() {
            st.ns_slot.clear();
            if let Err(e) = st.ns_renderer.wait_idle() {
                log::error!("Device wait idle failed during teardown: {:?}", e);
            }
            st.ns_renderer.close_renderings();
        }
        self.nc_gc.collect(i64::MAX);
    }
}
