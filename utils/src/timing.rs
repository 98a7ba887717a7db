// Monotonic time helpers for frame pacing
//
// All compositor timestamps are nanoseconds on the monotonic clock,
// measured from an arbitrary process-local epoch.
use std::time::{Duration, Instant};

lazy_static::lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

pub const NS_PER_MS: i64 = 1_000_000;
pub const NS_PER_US: i64 = 1_000;
pub const NS_PER_S: i64 = 1_000_000_000;

/// Current monotonic time in nanoseconds
///
/// Starts at a small positive value so that zero can be used as the
/// "unset" timestamp everywhere else.
pub fn get_current_ns() -> i64 {
    EPOCH.elapsed().as_nanos() as i64 + NS_PER_MS
}

// Helper to get the current time in milliseconds
#[allow(dead_code)]
pub fn get_current_millis() -> u32 {
    (get_current_ns() / NS_PER_MS) as u32
}

pub fn ms_to_ns(ms: f64) -> i64 {
    (ms * NS_PER_MS as f64) as i64
}

pub fn ns_to_ms(ns: i64) -> f64 {
    ns as f64 / NS_PER_MS as f64
}

/// Sleeps until an absolute monotonic timestamp
///
/// The thread scheduler routinely oversleeps by a few hundred
/// microseconds, so the last stretch before the deadline is spent
/// yielding instead of sleeping.
pub struct PreciseSleeper {
    /// How much of the wait is handled by spinning
    ps_spin_ns: i64,
}

impl PreciseSleeper {
    pub fn new() -> Self {
        Self {
            ps_spin_ns: NS_PER_MS / 2,
        }
    }

    /// Block the calling thread until `until_ns`
    ///
    /// Returns immediately if the timestamp is in the past.
    pub fn wait_until(&mut self, until_ns: i64) {
        loop {
            let now = get_current_ns();
            if now >= until_ns {
                return;
            }

            let remaining = until_ns - now;
            if remaining > self.ps_spin_ns {
                std::thread::sleep(Duration::from_nanos((remaining - self.ps_spin_ns) as u64));
            } else {
                std::thread::yield_now();
            }
        }
    }
}

impl Default for PreciseSleeper {
    fn default() -> Self {
        Self::new()
    }
}

// A stopclock for measuring time intervals
//
// The order of use MUST be `new`, `start`, `end`
pub struct StopWatch {
    sw_start: i64,
    sw_end: i64,
}

impl StopWatch {
    pub fn new() -> StopWatch {
        StopWatch {
            sw_start: 0,
            sw_end: 0,
        }
    }

    pub fn start(&mut self) {
        self.sw_start = get_current_ns();
    }

    pub fn end(&mut self) {
        self.sw_end = get_current_ns();
    }

    pub fn get_duration_ns(&self) -> i64 {
        self.sw_end - self.sw_start
    }

    pub fn get_duration_ms(&self) -> f64 {
        ns_to_ms(self.get_duration_ns())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = get_current_ns();
        let b = get_current_ns();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn sleeper_reaches_deadline() {
        let mut sleeper = PreciseSleeper::new();
        let target = get_current_ns() + 3 * NS_PER_MS;
        sleeper.wait_until(target);
        assert!(get_current_ns() >= target);

        // past deadlines return right away
        let mut sw = StopWatch::new();
        sw.start();
        sleeper.wait_until(get_current_ns() - NS_PER_S);
        sw.end();
        assert!(sw.get_duration_ms() < 100.0);
    }
}
