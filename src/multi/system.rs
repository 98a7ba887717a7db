// The system compositor
//
// Owns the native compositor and a render thread that composites the
// delivered frames of every client session once per display refresh.
use super::client::{ClientCompositor, ClientShared};
use super::{SessionInfo, MAX_CLIENTS};
use crate::compositor::*;
use crate::config::Config;

use strata::BlendMode;
use utils::log;
use utils::pacing::AppPacerFactory;
use utils::timing::{get_current_ns, ns_to_ms, PreciseSleeper, NS_PER_MS};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const HALF_MS: i64 = NS_PER_MS / 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Render one frame before any client shows up
    InitWarmStart,
    Stopped,
    Running,
    Stopping,
}

/// Last timing broadcast to app pacers, handed to new clients
#[derive(Debug, Copy, Clone)]
struct LastTimings {
    display_time: i64,
    period: i64,
    diff: i64,
}

struct ClientList {
    cl_clients: Vec<Arc<ClientShared>>,
    cl_last: LastTimings,
}

struct Sessions {
    s_state: SessionState,
    s_active_count: u32,
    s_running: bool,
    /// Frames the render thread has committed
    s_frames: u64,
}

/// The parts of the system compositor clients and the render thread share
pub(crate) struct SystemShared {
    pub native: Arc<dyn Compositor>,
    pub lifecycle_verbose: bool,
    ss_list: Mutex<ClientList>,
    ss_sessions: Mutex<Sessions>,
    ss_cond: Condvar,
    ss_pacers: AppPacerFactory,
    ss_next_id: AtomicU64,
}

impl SystemShared {
    pub fn session_begun(&self) {
        let mut s = self.ss_sessions.lock().unwrap();
        s.s_active_count += 1;
        self.ss_cond.notify_all();
    }

    pub fn session_ended(&self) {
        let mut s = self.ss_sessions.lock().unwrap();
        s.s_active_count = s.s_active_count.saturating_sub(1);
        self.ss_cond.notify_all();
    }

    pub fn remove_client(&self, client: &Arc<ClientShared>) {
        self.ss_list
            .lock()
            .unwrap()
            .cl_clients
            .retain(|c| !Arc::ptr_eq(c, client));
    }

    fn log_transition(&self, from: SessionState, to: SessionState) {
        if self.lifecycle_verbose {
            log::info!("System session {:?} -> {:?}", from, to);
        } else {
            log::debug!("System session {:?} -> {:?}", from, to);
        }
    }

    /// Drive the system session from the number of active clients
    fn update_session_state(&self, s: &mut Sessions) {
        let from = s.s_state;
        let active = s.s_active_count > 0;

        s.s_state = match (from, active) {
            (SessionState::InitWarmStart, _) => {
                if let Err(e) = self.native.begin_session(ViewType::Stereo) {
                    log::error!("Warm start begin_session failed: {:?}", e);
                }
                SessionState::Stopping
            }
            (SessionState::Stopped, false) => SessionState::Stopped,
            (SessionState::Stopped, true) => {
                if let Err(e) = self.native.begin_session(ViewType::Stereo) {
                    log::error!("begin_session failed: {:?}", e);
                }
                SessionState::Running
            }
            (SessionState::Running, false) => SessionState::Stopping,
            (SessionState::Running, true) => SessionState::Running,
            (SessionState::Stopping, false) => {
                if let Err(e) = self.native.end_session() {
                    log::error!("end_session failed: {:?}", e);
                }
                SessionState::Stopped
            }
            (SessionState::Stopping, true) => SessionState::Running,
        };

        if from != s.s_state {
            self.log_transition(from, s.s_state);
        }
    }

    fn broadcast_timings_to_clients(&self, display_time: i64) {
        let list = self.ss_list.lock().unwrap();
        for client in list.cl_clients.iter() {
            client.slots.lock().unwrap().next_frame_display = display_time;
        }
    }

    fn broadcast_timings_to_pacers(&self, display_time: i64, period: i64, diff: i64) {
        let mut list = self.ss_list.lock().unwrap();
        list.cl_last = LastTimings {
            display_time: display_time,
            period: period,
            diff: diff,
        };

        for client in list.cl_clients.iter() {
            client.pacer.lock().unwrap().info(display_time, period, diff);
        }
    }

    /// Deliver due client frames and replay them on the native compositor
    fn transfer_layers(&self, frame_id: i64, display_time: i64) -> XrResult<()> {
        let list = self.ss_list.lock().unwrap();

        for client in list.cl_clients.iter() {
            client.deliver_any_frames(display_time);
        }

        // (z_order, is_overlay) keeps overlays above a primary of equal z
        let mut drawn = Vec::new();
        for client in list.cl_clients.iter() {
            let state = *client.state.lock().unwrap();
            let slots = client.slots.lock().unwrap();
            if !slots.delivered.active || !state.visible {
                continue;
            }
            if !state.session_active {
                log::warn!("Client {} has a delivered frame but no active session", client.id);
                continue;
            }
            drawn.push(((state.z_order, state.is_overlay), client.clone()));
        }
        drawn.sort_by_key(|(key, _)| *key);

        let blend = match drawn.first() {
            Some((_, c)) => c.slots.lock().unwrap().delivered.blend,
            None => BlendMode::Opaque,
        };
        self.native.layer_begin(frame_id, display_time, blend)?;

        let mut dropped = 0;
        for (_, client) in drawn.iter() {
            let slots = client.slots.lock().unwrap();
            let diff = slots.delivered.display_time - display_time;
            if diff.abs() > HALF_MS {
                log::warn!(
                    "Client {} frame {} by {:.2}ms",
                    client.id,
                    if diff < 0 { "late" } else { "early" },
                    ns_to_ms(diff.abs())
                );
            }

            // once the native compositor is full the rest of the frame
            // is still committed without the overflow
            for entry in slots.delivered.layers.iter() {
                if dropped > 0 {
                    dropped += 1;
                } else if let Err(e) = self.native.add_layer(entry.clone()) {
                    log::debug!("Native compositor refused a layer: {:?}", e);
                    dropped += 1;
                }
            }
        }

        if dropped > 0 {
            log::warn!(
                "Dropped {} layers the native compositor had no room for",
                dropped
            );
        }
        Ok(())
    }

    fn render_frame(&self, sleeper: &mut PreciseSleeper) -> XrResult<()> {
        let prediction = self.native.predict_frame()?;
        let display_time = prediction.predicted_display_time;

        self.broadcast_timings_to_clients(display_time);
        sleeper.wait_until(prediction.wake_time);

        let now = get_current_ns();
        self.native
            .mark_frame(prediction.frame_id, FramePoint::Woke, now)?;
        self.broadcast_timings_to_pacers(
            display_time,
            prediction.predicted_display_period,
            display_time - now,
        );

        self.native.begin_frame(prediction.frame_id)?;
        self.transfer_layers(prediction.frame_id, display_time)?;
        self.native
            .layer_commit(prediction.frame_id, GraphicsSyncHandle::invalid())
    }

    fn render_thread(&self) {
        log::debug!("System render thread started");
        let mut sleeper = PreciseSleeper::new();

        loop {
            {
                let mut s = self.ss_sessions.lock().unwrap();
                if !s.s_running {
                    break;
                }

                self.update_session_state(&mut s);
                if s.s_state == SessionState::Stopped {
                    // sleep until a session begins or we shut down
                    let _s = self
                        .ss_cond
                        .wait_while(s, |s| s.s_running && s.s_active_count == 0)
                        .unwrap();
                    continue;
                }
            }

            if let Err(e) = self.render_frame(&mut sleeper) {
                log::error!("System frame failed: {:?}", e);
                std::thread::sleep(Duration::from_millis(1));
            }
            self.ss_sessions.lock().unwrap().s_frames += 1;
        }

        let state = self.ss_sessions.lock().unwrap().s_state;
        if matches!(state, SessionState::Running | SessionState::Stopping) {
            if let Err(e) = self.native.end_session() {
                log::error!("end_session on shutdown failed: {:?}", e);
            }
        }
        log::debug!("System render thread exiting");
    }
}

/// Composites any number of client sessions onto one native compositor
pub struct SystemCompositor {
    sc_shared: Arc<SystemShared>,
    sc_thread: Option<JoinHandle<()>>,
}

impl SystemCompositor {
    pub fn new(native: Arc<dyn Compositor>, config: &Config) -> XrResult<Self> {
        let initial = match config.do_warm_start {
            true => SessionState::InitWarmStart,
            false => SessionState::Stopped,
        };

        let shared = Arc::new(SystemShared {
            native: native,
            lifecycle_verbose: config.lifecycle_verbose,
            ss_list: Mutex::new(ClientList {
                cl_clients: Vec::new(),
                cl_last: LastTimings {
                    display_time: get_current_ns(),
                    period: 16 * NS_PER_MS,
                    diff: 5 * NS_PER_MS,
                },
            }),
            ss_sessions: Mutex::new(Sessions {
                s_state: initial,
                s_active_count: 0,
                s_running: true,
                s_frames: 0,
            }),
            ss_cond: Condvar::new(),
            ss_pacers: AppPacerFactory::new(),
            ss_next_id: AtomicU64::new(1),
        });

        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("squall-render".to_string())
            .spawn(move || thread_shared.render_thread())
            .map_err(|e| {
                log::error!("Could not start the render thread: {}", e);
                XrError::THREADING_FAILURE
            })?;

        Ok(Self {
            sc_shared: shared,
            sc_thread: Some(handle),
        })
    }

    /// Create the compositor for a new client session
    pub fn create_client(&self, info: SessionInfo) -> XrResult<ClientCompositor> {
        let mut list = self.sc_shared.ss_list.lock().unwrap();
        if list.cl_clients.len() >= MAX_CLIENTS {
            log::error!("No room for another client, {} connected", MAX_CLIENTS);
            return Err(XrError::OUT_OF_RESOURCES);
        }

        let id = self.sc_shared.ss_next_id.fetch_add(1, Ordering::Relaxed);
        let mut pacer = self.sc_shared.ss_pacers.create(get_current_ns());
        let last = list.cl_last;
        pacer.info(last.display_time, last.period, last.diff);

        let shared = Arc::new(ClientShared::new(id, &info, pacer));
        let client = ClientCompositor::new(shared.clone(), self.sc_shared.clone())?;
        list.cl_clients.push(shared);

        log::debug!(
            "Created client {} (overlay: {}, z_order: {})",
            id,
            info.is_overlay,
            info.z_order
        );
        Ok(client)
    }

    pub fn state(&self) -> SessionState {
        self.sc_shared.ss_sessions.lock().unwrap().s_state
    }

    pub fn active_count(&self) -> u32 {
        self.sc_shared.ss_sessions.lock().unwrap().s_active_count
    }

    pub fn client_count(&self) -> usize {
        self.sc_shared.ss_list.lock().unwrap().cl_clients.len()
    }

    /// Number of frames the render thread has gone through
    pub fn frames_rendered(&self) -> u64 {
        self.sc_shared.ss_sessions.lock().unwrap().s_frames
    }

    pub fn native(&self) -> &Arc<dyn Compositor> {
        &self.sc_shared.native
    }
}

impl Drop for SystemCompositor {
    fn drop(&mut self) {
        {
            let mut s = self.sc_shared.ss_sessions.lock().unwrap();
            s.s_running = false;
            self.sc_shared.ss_cond.notify_all();
        }

        if let Some(handle) = self.sc_thread.take() {
            if handle.join().is_err() {
                log::error!("System render thread panicked");
            }
        }
    }
}
