// One client session of the multi-client compositor
//
// Every frame passes through three slots. The client fills `progress`
// between layer_begin and layer_commit. The wait thread moves it to
// `scheduled` once the client's GPU work is done, and the render thread
// moves `scheduled` to `delivered` when its display time comes up.
// `delivered` is composited every render frame until replaced.
use super::system::SystemShared;
use super::{SessionInfo, MAX_LAYERS};
use crate::compositor::*;
use crate::sync;

use strata::{BlendMode, CompositorFence, CompositorSemaphore, NativeImage};
use utils::log;
use utils::pacing::{AppPacer, AppPrediction, TimingPoint};
use utils::timing::{get_current_ns, ns_to_ms, PreciseSleeper, NS_PER_MS};

use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const HALF_MS: i64 = NS_PER_MS / 2;

fn time_is_within_half_ms(a: i64, b: i64) -> bool {
    (a - b).abs() < HALF_MS
}

#[derive(Default)]
pub(crate) struct Slots {
    pub progress: LayerSlot,
    pub scheduled: LayerSlot,
    pub delivered: LayerSlot,
    /// Display time of the render frame being built right now
    pub next_frame_display: i64,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct ClientState {
    pub visible: bool,
    pub focused: bool,
    pub z_order: i64,
    pub is_overlay: bool,
    pub session_active: bool,
}

/// The parts of a client the render thread and wait thread touch
pub(crate) struct ClientShared {
    pub id: u64,
    pub slots: Mutex<Slots>,
    pub state: Mutex<ClientState>,
    pub events: Mutex<VecDeque<Event>>,
    pub pacer: Mutex<Box<dyn AppPacer>>,
}

impl ClientShared {
    pub fn new(id: u64, info: &SessionInfo, pacer: Box<dyn AppPacer>) -> Self {
        Self {
            id: id,
            slots: Mutex::new(Slots::default()),
            state: Mutex::new(ClientState {
                z_order: info.z_order,
                is_overlay: info.is_overlay,
                ..Default::default()
            }),
            events: Mutex::new(VecDeque::new()),
            pacer: Mutex::new(pacer),
        }
    }

    /// Promote the scheduled frame if it is due at `display_time`
    pub fn deliver_any_frames(&self, display_time: i64) {
        let mut slots = self.slots.lock().unwrap();
        if !slots.scheduled.active {
            return;
        }

        if display_time >= slots.scheduled.display_time - HALF_MS {
            let scheduled = std::mem::take(&mut slots.scheduled);
            slots.delivered = scheduled;
        }
    }

    /// Move `progress` into `scheduled` once it is free
    ///
    /// A scheduled frame that is already in the past, or that is older
    /// than a finished frame for the very next display, is replaced.
    pub fn wait_for_scheduled_free(&self) {
        let mut slots = self.slots.lock().unwrap();

        while slots.scheduled.active {
            if time_is_within_half_ms(slots.progress.display_time, slots.next_frame_display) {
                log::warn!("Dropping old missed frame in favour for completed new frame");
                break;
            }

            if slots.scheduled.display_time < get_current_ns() {
                break;
            }

            drop(slots);
            std::thread::sleep(Duration::from_millis(1));
            slots = self.slots.lock().unwrap();
        }

        let progress = std::mem::take(&mut slots.progress);
        slots.scheduled = progress;
    }

    fn push_event(&self, event: Event) {
        self.events.lock().unwrap().push_back(event);
    }

    pub fn clear_slots(&self) {
        let mut slots = self.slots.lock().unwrap();
        slots.progress.clear();
        slots.scheduled.clear();
        slots.delivered.clear();
    }
}

/// What the wait thread has to wait on before promoting a frame
enum WaitSync {
    Fence(Box<dyn CompositorFence>),
    Semaphore(Arc<dyn CompositorSemaphore>, u64),
}

struct WaitWork {
    frame_id: i64,
    sync: WaitSync,
}

/// Wait thread body, runs until the client drops its sender
fn wait_thread(shared: Arc<ClientShared>, work_rx: Receiver<WaitWork>, done_tx: SyncSender<()>) {
    log::debug!("Wait thread for client {} started", shared.id);

    for work in work_rx.iter() {
        let res = match work.sync {
            WaitSync::Fence(mut fence) => sync::wait_fence(fence.as_mut()),
            WaitSync::Semaphore(sem, value) => sync::wait_semaphore(sem.as_ref(), value),
        };
        if let Err(e) = res {
            // still promote, the client would wait forever otherwise
            log::error!(
                "Client {} frame {} sync failed: {:?}",
                shared.id,
                work.frame_id,
                e
            );
        }

        if let Err(e) = shared
            .pacer
            .lock()
            .unwrap()
            .mark_gpu_done(work.frame_id, get_current_ns())
        {
            log::debug!("Could not mark frame {} gpu done: {}", work.frame_id, e);
        }

        shared.wait_for_scheduled_free();

        if done_tx.send(()).is_err() {
            break;
        }
    }

    log::debug!("Wait thread for client {} exiting", shared.id);
}

/// State only the client's own thread touches
struct ClientFrame {
    cf_work_tx: Option<SyncSender<WaitWork>>,
    cf_done_rx: Receiver<()>,
    /// A commit is with the wait thread
    cf_pending: bool,
    /// Between layer_begin and layer_commit
    cf_in_bracket: bool,
    /// Returned by predict_frame and not yet used by wait_frame
    cf_predicted: Option<AppPrediction>,
}

/// What each slot holds, for inspection
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SlotSummary {
    /// (display time, layer count) of active slots
    pub progress: Option<(i64, usize)>,
    pub scheduled: Option<(i64, usize)>,
    pub delivered: Option<(i64, usize)>,
}

fn summarize(slot: &LayerSlot) -> Option<(i64, usize)> {
    match slot.active {
        true => Some((slot.display_time, slot.layers.len())),
        false => None,
    }
}

/// The compositor handed to one client session
pub struct ClientCompositor {
    cc_shared: Arc<ClientShared>,
    cc_system: Arc<SystemShared>,
    cc_frame: Mutex<ClientFrame>,
    cc_wait_thread: Option<JoinHandle<()>>,
}

impl ClientCompositor {
    pub(crate) fn new(
        shared: Arc<ClientShared>,
        system: Arc<SystemShared>,
    ) -> XrResult<Self> {
        // one frame in flight at most
        let (work_tx, work_rx) = sync_channel(1);
        let (done_tx, done_rx) = sync_channel(1);

        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("squall-wait-{}", shared.id))
            .spawn(move || wait_thread(thread_shared, work_rx, done_tx))
            .map_err(|e| {
                log::error!("Could not start the wait thread: {}", e);
                XrError::THREADING_FAILURE
            })?;

        Ok(Self {
            cc_shared: shared,
            cc_system: system,
            cc_frame: Mutex::new(ClientFrame {
                cf_work_tx: Some(work_tx),
                cf_done_rx: done_rx,
                cf_pending: false,
                cf_in_bracket: false,
                cf_predicted: None,
            }),
            cc_wait_thread: Some(handle),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<ClientShared> {
        &self.cc_shared
    }

    pub fn id(&self) -> u64 {
        self.cc_shared.id
    }

    pub fn slot_summary(&self) -> SlotSummary {
        let slots = self.cc_shared.slots.lock().unwrap();
        SlotSummary {
            progress: summarize(&slots.progress),
            scheduled: summarize(&slots.scheduled),
            delivered: summarize(&slots.delivered),
        }
    }

    pub fn is_visible(&self) -> bool {
        self.cc_shared.state.lock().unwrap().visible
    }

    pub fn z_order(&self) -> i64 {
        self.cc_shared.state.lock().unwrap().z_order
    }

    /// Block until the wait thread handed back the last commit
    fn wait_for_pending(frame: &mut ClientFrame) {
        if !frame.cf_pending {
            return;
        }

        if frame.cf_done_rx.recv().is_err() {
            log::error!("Wait thread went away with a frame in flight");
        }
        frame.cf_pending = false;
    }

    fn push_work(&self, frame: &mut ClientFrame, work: WaitWork) -> XrResult<()> {
        let tx = frame.cf_work_tx.as_ref().ok_or(XrError::THREADING_FAILURE)?;
        tx.send(work).map_err(|_| {
            log::error!("Wait thread of client {} is gone", self.cc_shared.id);
            XrError::THREADING_FAILURE
        })?;
        frame.cf_pending = true;
        Ok(())
    }

    fn end_bracket(&self, frame: &mut ClientFrame, frame_id: i64) -> XrResult<()> {
        if !frame.cf_in_bracket {
            log::error!("layer_commit for frame {} without layer_begin", frame_id);
            return Err(XrError::INVALID);
        }
        frame.cf_in_bracket = false;
        Ok(())
    }
}

impl Compositor for ClientCompositor {
    fn info(&self) -> CompositorInfo {
        self.cc_system.native.info()
    }

    fn create_swapchain(&self, info: &SwapchainCreateInfo) -> XrResult<Arc<dyn Swapchain>> {
        self.cc_system.native.create_swapchain(info)
    }

    fn import_swapchain(
        &self,
        info: &SwapchainCreateInfo,
        native_images: &[NativeImage],
    ) -> XrResult<Arc<dyn Swapchain>> {
        self.cc_system.native.import_swapchain(info, native_images)
    }

    fn import_fence(&self, handle: GraphicsSyncHandle) -> XrResult<Box<dyn CompositorFence>> {
        self.cc_system.native.import_fence(handle)
    }

    fn create_semaphore(&self) -> XrResult<(OwnedFd, Arc<dyn CompositorSemaphore>)> {
        self.cc_system.native.create_semaphore()
    }

    fn begin_session(&self, view_type: ViewType) -> XrResult<()> {
        {
            let mut state = self.cc_shared.state.lock().unwrap();
            if state.session_active {
                return Err(XrError::INVALID);
            }
            state.session_active = true;
        }

        if self.cc_system.lifecycle_verbose {
            log::info!("Client {} begins its {:?} session", self.cc_shared.id, view_type);
        }
        self.cc_system.session_begun();
        Ok(())
    }

    fn end_session(&self) -> XrResult<()> {
        {
            let mut state = self.cc_shared.state.lock().unwrap();
            if !state.session_active {
                return Err(XrError::INVALID);
            }
            state.session_active = false;
        }

        if self.cc_system.lifecycle_verbose {
            log::info!("Client {} ends its session", self.cc_shared.id);
        }
        self.cc_system.session_ended();
        Ok(())
    }

    fn predict_frame(&self) -> XrResult<FramePrediction> {
        let prediction = self
            .cc_shared
            .pacer
            .lock()
            .unwrap()
            .predict(get_current_ns());
        self.cc_frame.lock().unwrap().cf_predicted = Some(prediction);

        Ok(FramePrediction {
            frame_id: prediction.frame_id,
            wake_time: prediction.wake_time,
            predicted_gpu_time: 0,
            predicted_display_time: prediction.predicted_display_time,
            predicted_display_period: prediction.predicted_display_period,
        })
    }

    fn mark_frame(&self, frame_id: i64, point: FramePoint, when_ns: i64) -> XrResult<()> {
        let point = match point {
            FramePoint::Woke => TimingPoint::WakeUp,
            FramePoint::Begin => TimingPoint::Begin,
        };
        self.cc_shared
            .pacer
            .lock()
            .unwrap()
            .mark_point(frame_id, point, when_ns)?;
        Ok(())
    }

    fn wait_frame(&self) -> XrResult<FrameTiming> {
        // A prediction the client already asked for is honored
        let predicted = self.cc_frame.lock().unwrap().cf_predicted.take();
        let prediction = match predicted {
            Some(p) => p,
            None => self
                .cc_shared
                .pacer
                .lock()
                .unwrap()
                .predict(get_current_ns()),
        };

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
        self.cc_shared
            .pacer
            .lock()
            .unwrap()
            .mark_discarded(frame_id, get_current_ns())?;
        Ok(())
    }

    fn layer_begin(&self, frame_id: i64, display_time_ns: i64, blend: BlendMode) -> XrResult<()> {
        let mut frame = self.cc_frame.lock().unwrap();

        if let Err(e) = self.cc_shared.pacer.lock().unwrap().mark_delivered(
            frame_id,
            get_current_ns(),
            display_time_ns,
        ) {
            log::warn!("Client {}: {}", self.cc_shared.id, e);
        }

        // The last commit has to be out of progress before it is reused
        Self::wait_for_pending(&mut frame);

        self.cc_shared.slots.lock().unwrap().progress = LayerSlot::begin(display_time_ns, blend);
        frame.cf_in_bracket = true;
        Ok(())
    }

    fn add_layer(&self, entry: LayerEntry) -> XrResult<()> {
        let frame = self.cc_frame.lock().unwrap();
        if !frame.cf_in_bracket {
            log::error!("Layer submitted outside of layer_begin/layer_commit");
            return Err(XrError::INVALID);
        }

        let mut slots = self.cc_shared.slots.lock().unwrap();
        if slots.progress.layers.len() >= MAX_LAYERS {
            log::error!("Client {} submitted more than {} layers", self.cc_shared.id, MAX_LAYERS);
            return Err(XrError::INVALID);
        }
        slots.progress.layers.push(entry);
        Ok(())
    }

    fn layer_commit(&self, frame_id: i64, sync: GraphicsSyncHandle) -> XrResult<()> {
        let mut frame = self.cc_frame.lock().unwrap();
        self.end_bracket(&mut frame, frame_id)?;

        let fence = match sync.is_valid() {
            // A failed import closes the handle, treat it as waited on
            true => match self.cc_system.native.import_fence(sync) {
                Ok(f) => Some(f),
                Err(e) => {
                    log::error!("Could not import the fence for frame {}: {:?}", frame_id, e);
                    None
                }
            },
            false => None,
        };

        match fence {
            Some(fence) => self.push_work(
                &mut frame,
                WaitWork {
                    frame_id: frame_id,
                    sync: WaitSync::Fence(fence),
                },
            ),
            None => {
                // The client already waited for its GPU work
                if let Err(e) = self
                    .cc_shared
                    .pacer
                    .lock()
                    .unwrap()
                    .mark_gpu_done(frame_id, get_current_ns())
                {
                    log::debug!("Could not mark frame {} gpu done: {}", frame_id, e);
                }
                self.cc_shared.wait_for_scheduled_free();
                Ok(())
            }
        }
    }

    fn layer_commit_with_semaphore(
        &self,
        frame_id: i64,
        semaphore: Arc<dyn CompositorSemaphore>,
        value: u64,
    ) -> XrResult<()> {
        let mut frame = self.cc_frame.lock().unwrap();
        self.end_bracket(&mut frame, frame_id)?;

        self.push_work(
            &mut frame,
            WaitWork {
                frame_id: frame_id,
                sync: WaitSync::Semaphore(semaphore, value),
            },
        )
    }

    fn poll_events(&self) -> XrResult<Event> {
        let event = self.cc_shared.events.lock().unwrap().pop_front();
        Ok(event.unwrap_or(Event::None))
    }
}

impl MultiControl for ClientCompositor {
    fn set_state(&self, visible: bool, focused: bool) -> XrResult<()> {
        let mut state = self.cc_shared.state.lock().unwrap();
        if state.visible == visible && state.focused == focused {
            return Ok(());
        }

        state.visible = visible;
        state.focused = focused;
        drop(state);

        if self.cc_system.lifecycle_verbose {
            log::info!(
                "Client {} visible: {} focused: {}",
                self.cc_shared.id,
                visible,
                focused
            );
        }
        self.cc_shared
            .push_event(Event::StateChange { visible, focused });
        Ok(())
    }

    fn set_z_order(&self, z_order: i64) -> XrResult<()> {
        self.cc_shared.state.lock().unwrap().z_order = z_order;
        Ok(())
    }

    fn set_main_app_visibility(&self, visible: bool) -> XrResult<()> {
        self.cc_shared
            .push_event(Event::OverlayChange { visible });
        Ok(())
    }
}

impl Drop for ClientCompositor {
    fn drop(&mut self) {
        let active = self.cc_shared.state.lock().unwrap().session_active;
        if active {
            if let Err(e) = self.end_session() {
                log::error!("Could not end session of client {}: {:?}", self.cc_shared.id, e);
            }
        }

        self.cc_system.remove_client(&self.cc_shared);
        self.cc_shared.events.lock().unwrap().clear();

        // Closing the channel stops the wait thread
        if let Ok(mut frame) = self.cc_frame.lock() {
            frame.cf_work_tx = None;
        }
        if let Some(handle) = self.cc_wait_thread.take() {
            if handle.join().is_err() {
                log::error!("Wait thread of client {} panicked", self.cc_shared.id);
            }
        }

        self.cc_shared.clear_slots();
        log::debug!(
            "Destroyed client {} at {:.2}ms",
            self.cc_shared.id,
            ns_to_ms(get_current_ns())
        );
    }
}
