// The per-client frame pacer
//
// Tracks a small ring of in-flight frames and keeps running estimates
// of how long the client spends on the CPU, recording and waiting for
// its GPU work. Those estimates decide when the client is woken up.
use super::{AppFrameState, AppPacer, AppPrediction, PacingError, Result, TimingPoint};
use crate::log;
use crate::timing::{ns_to_ms, NS_PER_MS};

const FRAME_COUNT: usize = 8;
const IIR_ALPHA: f64 = 0.8;

#[derive(Debug, Copy, Clone)]
struct AppFrame {
    af_id: i64,
    af_state: AppFrameState,
    af_predicted_gpu_done: i64,
    af_predicted_period: i64,
    /// The display time the client asked for, may differ from the
    /// predicted one
    af_display_time: i64,

    af_predicted_at: i64,
    af_woke_at: i64,
    af_begin_at: i64,
    af_delivered_at: i64,
    af_gpu_done_at: i64,
}

impl AppFrame {
    fn empty() -> Self {
        Self {
            af_id: -1,
            af_state: AppFrameState::Ready,
            af_predicted_gpu_done: 0,
            af_predicted_period: 0,
            af_display_time: 0,
            af_predicted_at: 0,
            af_woke_at: 0,
            af_begin_at: 0,
            af_delivered_at: 0,
            af_gpu_done_at: 0,
        }
    }
}

fn iir_filter(target: &mut i64, sample: i64) {
    *target = (*target as f64 * IIR_ALPHA + sample as f64 * (1.0 - IIR_ALPHA)) as i64;
}

pub struct SimpleAppPacer {
    sp_frames: [AppFrame; FRAME_COUNT],
    sp_frame_counter: i64,

    /// Time between wait returning and begin being called
    sp_cpu_time: i64,
    /// Time between begin and the frame being delivered
    sp_draw_time: i64,
    /// Time between delivery and the GPU completing
    sp_wait_time: i64,
    /// Extra time between the end of draw and the compositor waking
    sp_margin: i64,

    // The last timing the compositor gave us
    sp_last_display_time: i64,
    sp_last_display_period: i64,
    sp_last_extra: i64,

    sp_last_returned: i64,
}

impl SimpleAppPacer {
    pub fn new(now_ns: i64) -> Self {
        Self {
            sp_frames: [AppFrame::empty(); FRAME_COUNT],
            sp_frame_counter: 0,
            sp_cpu_time: 2 * NS_PER_MS,
            sp_draw_time: 2 * NS_PER_MS,
            sp_wait_time: 2 * NS_PER_MS,
            sp_margin: 2 * NS_PER_MS,
            sp_last_display_time: now_ns,
            sp_last_display_period: 0,
            sp_last_extra: 0,
            sp_last_returned: 0,
        }
    }

    fn total_app_time(&self) -> i64 {
        self.sp_cpu_time + self.sp_draw_time + self.sp_wait_time
    }

    fn total_compositor_time(&self) -> i64 {
        self.sp_margin + self.sp_last_extra
    }

    fn total_app_and_compositor_time(&self) -> i64 {
        self.total_app_time() + self.total_compositor_time()
    }

    /// The period this client can keep up with
    ///
    /// This is a multiple of the display period.
    fn calc_period(&self) -> i64 {
        let base = match self.sp_last_display_period {
            0 => 16 * NS_PER_MS,
            p => p,
        };

        let mut period = base;
        for t in [self.sp_cpu_time, self.sp_draw_time, self.sp_wait_time] {
            while t > period {
                period += base;
            }
        }

        period
    }

    fn predict_display_time(&self, now_ns: i64, period: i64) -> i64 {
        let app_and_comp = self.total_app_and_compositor_time();
        let mut val = self.sp_last_display_time;

        // Stay after the last returned time. Half a period of slack
        // absorbs small drift in the samples from the compositor.
        while val <= self.sp_last_returned + period / 2 {
            val += period;
        }

        // Leave enough time for the client to do its work
        while val - app_and_comp <= now_ns {
            val += period;
        }

        val
    }

    fn frame_mut(&mut self, frame_id: i64) -> Result<&mut AppFrame> {
        let f = &mut self.sp_frames[frame_id as usize % FRAME_COUNT];
        if f.af_id != frame_id {
            return Err(PacingError::UnknownFrame(frame_id));
        }
        Ok(f)
    }

    fn transition(
        &mut self,
        frame_id: i64,
        point: TimingPoint,
        from: &[AppFrameState],
    ) -> Result<&mut AppFrame> {
        let f = self.frame_mut(frame_id)?;
        if !from.contains(&f.af_state) {
            return Err(PacingError::InvalidTransition {
                id: frame_id,
                point: point,
                state: f.af_state,
            });
        }
        Ok(f)
    }
}

impl AppPacer for SimpleAppPacer {
    fn predict(&mut self, now_ns: i64) -> AppPrediction {
        self.sp_frame_counter += 1;
        let frame_id = self.sp_frame_counter;

        let period = self.calc_period();
        let display = self.predict_display_time(now_ns, period);
        let wake = display - self.total_app_and_compositor_time();
        let gpu_done = display - self.total_compositor_time();

        self.sp_last_returned = display;

        let f = &mut self.sp_frames[frame_id as usize % FRAME_COUNT];
        if f.af_state != AppFrameState::Ready {
            // The client abandoned this slot without finishing it
            log::warn!(
                "Frame {} was never completed, reusing its slot for {}",
                f.af_id,
                frame_id
            );
        }
        *f = AppFrame::empty();
        f.af_id = frame_id;
        f.af_state = AppFrameState::Predicted;
        f.af_predicted_gpu_done = gpu_done;
        f.af_predicted_period = period;
        f.af_predicted_at = now_ns;

        AppPrediction {
            frame_id: frame_id,
            wake_time: wake,
            predicted_display_time: display,
            predicted_display_period: period,
        }
    }

    fn mark_point(&mut self, frame_id: i64, point: TimingPoint, when_ns: i64) -> Result<()> {
        log::trace!("app frame {} point {:?}", frame_id, point);

        match point {
            TimingPoint::WakeUp => {
                let f = self.transition(frame_id, point, &[AppFrameState::Predicted])?;
                f.af_woke_at = when_ns;
                f.af_state = AppFrameState::WaitLeft;
            }
            TimingPoint::Begin => {
                let f = self.transition(frame_id, point, &[AppFrameState::WaitLeft])?;
                f.af_begin_at = when_ns;
                f.af_state = AppFrameState::Begun;
            }
            TimingPoint::Submit => return Err(PacingError::InvalidPoint(point)),
        }

        Ok(())
    }

    fn mark_discarded(&mut self, frame_id: i64, when_ns: i64) -> Result<()> {
        let f = self.transition(
            frame_id,
            TimingPoint::Submit,
            &[AppFrameState::WaitLeft, AppFrameState::Begun],
        )?;
        *f = AppFrame::empty();
        log::trace!("app frame {} discarded at {}", frame_id, when_ns);
        Ok(())
    }

    fn mark_delivered(&mut self, frame_id: i64, when_ns: i64, display_time_ns: i64) -> Result<()> {
        let f = self.transition(frame_id, TimingPoint::Submit, &[AppFrameState::Begun])?;
        f.af_delivered_at = when_ns;
        f.af_display_time = display_time_ns;
        f.af_state = AppFrameState::Delivered;
        Ok(())
    }

    fn mark_gpu_done(&mut self, frame_id: i64, when_ns: i64) -> Result<()> {
        let f = *self.transition(frame_id, TimingPoint::Submit, &[AppFrameState::Delivered])?;

        let diff = f.af_predicted_gpu_done - when_ns;
        let cpu = f.af_begin_at - f.af_woke_at;
        let draw = f.af_delivered_at - f.af_begin_at;
        let wait = when_ns - f.af_delivered_at;

        log::debug!(
            "Delivered frame {} {:.2}ms {} (period {:.2}, cpu {:.2}/{:.2}, draw {:.2}/{:.2}, wait {:.2}/{:.2})",
            frame_id,
            ns_to_ms(diff.abs()),
            if diff < 0 { "late" } else { "early" },
            ns_to_ms(f.af_predicted_period),
            ns_to_ms(self.sp_cpu_time),
            ns_to_ms(cpu),
            ns_to_ms(self.sp_draw_time),
            ns_to_ms(draw),
            ns_to_ms(self.sp_wait_time),
            ns_to_ms(wait),
        );

        iir_filter(&mut self.sp_cpu_time, cpu);
        iir_filter(&mut self.sp_draw_time, draw);
        iir_filter(&mut self.sp_wait_time, wait);

        self.sp_frames[frame_id as usize % FRAME_COUNT] = AppFrame::empty();
        Ok(())
    }

    fn info(&mut self, predicted_display_time_ns: i64, predicted_display_period_ns: i64, extra_ns: i64) {
        self.sp_last_display_time = predicted_display_time_ns;
        self.sp_last_display_period = predicted_display_period_ns;
        self.sp_last_extra = extra_ns;
    }
}

/// Creates one app pacer per client session
pub struct AppPacerFactory {}

impl AppPacerFactory {
    pub fn new() -> Self {
        Self {}
    }

    pub fn create(&self, now_ns: i64) -> Box<dyn AppPacer> {
        Box::new(SimpleAppPacer::new(now_ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: i64 = 16 * NS_PER_MS;

    fn pacer_at(now: i64) -> SimpleAppPacer {
        let mut pa = SimpleAppPacer::new(now);
        pa.info(now + PERIOD, PERIOD, NS_PER_MS);
        pa
    }

    #[test]
    fn predictions_advance() {
        let now = 500 * NS_PER_MS;
        let mut pa = pacer_at(now);

        let a = pa.predict(now);
        assert_eq!(a.frame_id, 1);
        assert!(a.wake_time >= now);
        assert!(a.predicted_display_time > a.wake_time);
        assert_eq!(a.predicted_display_period, PERIOD);

        let b = pa.predict(now);
        assert_eq!(b.frame_id, 2);
        assert!(b.predicted_display_time >= a.predicted_display_time + PERIOD / 2);
    }

    #[test]
    fn full_frame_cycle() {
        let now = 500 * NS_PER_MS;
        let mut pa = pacer_at(now);

        let p = pa.predict(now);
        pa.mark_point(p.frame_id, TimingPoint::WakeUp, p.wake_time).unwrap();
        pa.mark_point(p.frame_id, TimingPoint::Begin, p.wake_time + NS_PER_MS)
            .unwrap();
        pa.mark_delivered(p.frame_id, p.wake_time + 3 * NS_PER_MS, p.predicted_display_time)
            .unwrap();
        pa.mark_gpu_done(p.frame_id, p.wake_time + 4 * NS_PER_MS).unwrap();

        // the slot was recycled
        assert_eq!(
            pa.mark_gpu_done(p.frame_id, 0),
            Err(PacingError::UnknownFrame(p.frame_id))
        );
    }

    #[test]
    fn invalid_transitions_are_errors() {
        let now = 500 * NS_PER_MS;
        let mut pa = pacer_at(now);
        let p = pa.predict(now);

        // begin before wake up
        assert!(matches!(
            pa.mark_point(p.frame_id, TimingPoint::Begin, now),
            Err(PacingError::InvalidTransition { .. })
        ));
        // discard before wait returned
        assert!(pa.mark_discarded(p.frame_id, now).is_err());
        assert_eq!(
            pa.mark_point(p.frame_id, TimingPoint::Submit, now),
            Err(PacingError::InvalidPoint(TimingPoint::Submit))
        );

        pa.mark_point(p.frame_id, TimingPoint::WakeUp, now).unwrap();
        pa.mark_discarded(p.frame_id, now).unwrap();
    }

    #[test]
    fn slow_app_doubles_period() {
        let now = 500 * NS_PER_MS;
        let mut pa = pacer_at(now);

        // draw takes far longer than the display period every frame
        let mut t = now;
        for _ in 0..20 {
            let p = pa.predict(t);
            pa.mark_point(p.frame_id, TimingPoint::WakeUp, t).unwrap();
            pa.mark_point(p.frame_id, TimingPoint::Begin, t).unwrap();
            t += 25 * NS_PER_MS;
            pa.mark_delivered(p.frame_id, t, p.predicted_display_time)
                .unwrap();
            pa.mark_gpu_done(p.frame_id, t).unwrap();
        }

        let p = pa.predict(t);
        assert_eq!(p.predicted_display_period, 2 * PERIOD);
    }
}
