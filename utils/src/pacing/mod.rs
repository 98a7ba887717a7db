// Frame pacing models
//
// Two kinds of pacers exist. A compositor pacer predicts when the
// compositor itself should wake up and when its frames hit the display.
// An app pacer is owned by each client session and predicts when the
// client should wake up so that its frame is ready for the compositor.
//
// All timestamps are monotonic nanoseconds, see `timing::get_current_ns`.

mod app;
mod compositor;

pub use app::{AppPacerFactory, SimpleAppPacer};
pub use compositor::FakeCompositorPacer;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacingError {
    #[error("frame {0} is not tracked by this pacer")]
    UnknownFrame(i64),
    #[error("frame {id} can not be marked {point:?} from state {state:?}")]
    InvalidTransition {
        id: i64,
        point: TimingPoint,
        state: AppFrameState,
    },
    #[error("timing point {0:?} is not accepted by this pacer")]
    InvalidPoint(TimingPoint),
}

pub type Result<T> = std::result::Result<T, PacingError>;

/// Points during a frame that callers report back to the pacer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimingPoint {
    /// Left the wait for the wake up time
    WakeUp,
    /// Started recording work for this frame
    Begin,
    /// Submitted work to the GPU
    Submit,
}

/// State of one frame tracked by an app pacer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AppFrameState {
    Ready,
    Predicted,
    WaitLeft,
    Begun,
    Delivered,
}

/// A prediction for one compositor frame
///
/// Exactly one of these is being rendered at a time by the native
/// compositor.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FrameRecord {
    pub id: i64,
    /// When the compositor should wake up to start rendering
    pub wake_time: i64,
    /// When the GPU work is predicted to finish
    pub predicted_gpu_time: i64,
    /// When the pixels are predicted to turn into photons
    pub predicted_display_time: i64,
    pub predicted_display_period: i64,
    /// The present time to request from the display engine
    pub desired_present_time: i64,
    /// How far the display engine may miss `desired_present_time`
    pub present_slop: i64,
    /// Shortest period the display can run at
    pub min_display_period: i64,
}

/// Prediction handed to a client session
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AppPrediction {
    pub frame_id: i64,
    pub wake_time: i64,
    pub predicted_display_time: i64,
    pub predicted_display_period: i64,
}

/// The timing model driving the compositor's own frame loop
pub trait CompositorPacer: Send {
    /// Predict the next compositor frame given the current time
    fn predict(&mut self, now_ns: i64) -> FrameRecord;

    /// Record that `point` was reached for `frame_id` at `when_ns`
    fn mark_point(&mut self, point: TimingPoint, frame_id: i64, when_ns: i64) -> Result<()>;

    /// Display timing feedback for a presented frame
    fn info(
        &mut self,
        frame_id: i64,
        desired_present_time_ns: i64,
        actual_present_time_ns: i64,
        earliest_present_time_ns: i64,
        present_margin_ns: i64,
        when_ns: i64,
    );

    /// GPU timestamps read back after a frame completed
    fn info_gpu(&mut self, frame_id: i64, gpu_start_ns: i64, gpu_end_ns: i64, when_ns: i64);

    /// Sync the model to a vblank observed by the display engine
    fn update_vblank(&mut self, last_vblank_ns: i64);

    /// Update how long it takes from present to photons
    fn update_present_offset(&mut self, frame_id: i64, present_to_display_offset_ns: i64);
}

/// The timing model for one client session
pub trait AppPacer: Send {
    fn predict(&mut self, now_ns: i64) -> AppPrediction;

    /// Only `WakeUp` and `Begin` are valid here
    fn mark_point(&mut self, frame_id: i64, point: TimingPoint, when_ns: i64) -> Result<()>;

    fn mark_discarded(&mut self, frame_id: i64, when_ns: i64) -> Result<()>;

    /// The client committed layers for this frame
    fn mark_delivered(&mut self, frame_id: i64, when_ns: i64, display_time_ns: i64) -> Result<()>;

    /// The GPU work the client submitted for this frame completed
    fn mark_gpu_done(&mut self, frame_id: i64, when_ns: i64) -> Result<()>;

    /// Latest compositor timing, `extra_ns` is the time the compositor
    /// needs before the display time
    fn info(&mut self, predicted_display_time_ns: i64, predicted_display_period_ns: i64, extra_ns: i64);
}
