// A compositor pacer for targets without display timing
//
// The display is assumed to run on a fixed grid of `frame_period`
// intervals. Vblank updates from the display engine can move the grid.
use super::{CompositorPacer, FrameRecord, Result, TimingPoint};
use crate::log;
use crate::timing::NS_PER_MS;

pub struct FakeCompositorPacer {
    /// The periodicity of the display
    fp_frame_period: i64,
    /// When the last frame was presented, not displayed
    fp_last_present: i64,
    /// The display engine reports scanout start, not photons
    fp_present_to_display_offset: i64,
    /// Time the compositor needs to render a frame
    fp_comp_time: i64,
    fp_next_id: i64,
}

impl FakeCompositorPacer {
    pub fn new(estimated_frame_period_ns: i64, now_ns: i64) -> Self {
        // 20% of the frame, but at least 2ms
        let comp_time = (estimated_frame_period_ns as f64 * 0.2) as i64;

        log::info!(
            "Created fake compositor pacer with a {:.2}ms period",
            crate::timing::ns_to_ms(estimated_frame_period_ns)
        );

        Self {
            fp_frame_period: estimated_frame_period_ns,
            // start the grid in the future so the first frame has room
            fp_last_present: now_ns + 50 * NS_PER_MS,
            fp_present_to_display_offset: 4 * NS_PER_MS,
            fp_comp_time: comp_time.max(2 * NS_PER_MS),
            // start from a non-zero frame id
            fp_next_id: 5,
        }
    }

    fn predict_next_present(&self, now_ns: i64) -> i64 {
        let mut present = self.fp_last_present + self.fp_frame_period;

        while now_ns + self.fp_comp_time > present {
            present += self.fp_frame_period;
        }

        present
    }
}

impl CompositorPacer for FakeCompositorPacer {
    fn predict(&mut self, now_ns: i64) -> FrameRecord {
        let id = self.fp_next_id;
        self.fp_next_id += 1;

        let desired_present = self.predict_next_present(now_ns);

        FrameRecord {
            id: id,
            wake_time: desired_present - self.fp_comp_time,
            predicted_gpu_time: desired_present,
            predicted_display_time: desired_present + self.fp_present_to_display_offset,
            predicted_display_period: self.fp_frame_period,
            desired_present_time: desired_present,
            present_slop: NS_PER_MS / 2,
            min_display_period: self.fp_frame_period,
        }
    }

    fn mark_point(&mut self, point: TimingPoint, frame_id: i64, when_ns: i64) -> Result<()> {
        log::trace!("frame {} reached {:?} at {}", frame_id, point, when_ns);
        Ok(())
    }

    fn info(
        &mut self,
        _frame_id: i64,
        _desired_present_time_ns: i64,
        _actual_present_time_ns: i64,
        _earliest_present_time_ns: i64,
        _present_margin_ns: i64,
        _when_ns: i64,
    ) {
        // The fake pacer may be selected even if display timing is
        // available, so this is simply ignored.
    }

    fn info_gpu(&mut self, frame_id: i64, gpu_start_ns: i64, gpu_end_ns: i64, _when_ns: i64) {
        crate::profiling!(
            "frame {} gpu took {:.3}ms",
            frame_id,
            crate::timing::ns_to_ms(gpu_end_ns - gpu_start_ns)
        );
    }

    fn update_vblank(&mut self, last_vblank_ns: i64) {
        self.fp_last_present = last_vblank_ns;
    }

    fn update_present_offset(&mut self, _frame_id: i64, present_to_display_offset_ns: i64) {
        self.fp_present_to_display_offset = present_to_display_offset_ns;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: i64 = 16 * NS_PER_MS;

    #[test]
    fn prediction_is_consistent() {
        let now = 1_000 * NS_PER_MS;
        let mut pacer = FakeCompositorPacer::new(PERIOD, now);

        let f = pacer.predict(now);
        assert_eq!(f.id, 5);
        assert!(f.wake_time >= now);
        assert!(f.desired_present_time > now);
        assert!(f.desired_present_time > f.wake_time);
        assert!(f.predicted_display_time > f.desired_present_time);
        assert!((f.predicted_display_period - PERIOD).abs() <= 2 * NS_PER_MS);
        assert_eq!(f.present_slop, NS_PER_MS / 2);
    }

    #[test]
    fn stays_on_grid() {
        let now = 1_000 * NS_PER_MS;
        let mut pacer = FakeCompositorPacer::new(PERIOD, now);

        let a = pacer.predict(now);
        // a whole second later the prediction must still be on the grid
        let b = pacer.predict(now + 1_000 * NS_PER_MS);
        assert_eq!(b.id, a.id + 1);
        assert_eq!((b.desired_present_time - a.desired_present_time) % PERIOD, 0);
        assert!(b.wake_time >= now + 1_000 * NS_PER_MS);
    }

    #[test]
    fn comp_time_floor() {
        let now = 0;
        // 20% of 5ms is below the 2ms floor
        let mut pacer = FakeCompositorPacer::new(5 * NS_PER_MS, now);
        let f = pacer.predict(now);
        assert_eq!(f.desired_present_time - f.wake_time, 2 * NS_PER_MS);
    }

    #[test]
    fn vblank_moves_grid() {
        let mut pacer = FakeCompositorPacer::new(PERIOD, 0);
        pacer.update_vblank(200 * NS_PER_MS + 3);
        let f = pacer.predict(200 * NS_PER_MS);
        assert_eq!(f.desired_present_time, 216 * NS_PER_MS + 3);

        pacer.update_present_offset(f.id, NS_PER_MS);
        let g = pacer.predict(200 * NS_PER_MS);
        assert_eq!(g.predicted_display_time - g.desired_present_time, NS_PER_MS);
    }
}
