// Waiting on client GPU work
//
// Client sync objects are waited on in 100ms slices. A slow client only
// produces warnings, the waiter never gives up on it.
use crate::compositor::{XrError, XrResult};
use strata::{CompositorFence, CompositorSemaphore, StrataError};
use utils::log;
use utils::timing::NS_PER_MS;

pub const SYNC_WAIT_SLICE_NS: u64 = 100 * NS_PER_MS as u64;

pub fn wait_fence(fence: &mut dyn CompositorFence) -> XrResult<()> {
    loop {
        match fence.wait(SYNC_WAIT_SLICE_NS) {
            Ok(()) => return Ok(()),
            Err(StrataError::TIMEOUT) => {
                log::warn!("Waiting on client fence timed out > 100ms!");
            }
            Err(e) => {
                log::error!("Waiting on client fence failed: {:?}", e);
                return Err(XrError::from(e));
            }
        }
    }
}

pub fn wait_semaphore(semaphore: &dyn CompositorSemaphore, value: u64) -> XrResult<()> {
    loop {
        match semaphore.wait(value, SYNC_WAIT_SLICE_NS) {
            Ok(()) => return Ok(()),
            Err(StrataError::TIMEOUT) => {
                log::warn!("Waiting on client semaphore value {} timed out > 100ms!", value);
            }
            Err(e) => {
                log::error!("Waiting on client semaphore failed: {:?}", e);
                return Err(XrError::from(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Times out a few times before signaling
    struct SlowFence(u32);

    impl CompositorFence for SlowFence {
        fn wait(&mut self, _timeout_ns: u64) -> strata::Result<()> {
            match self.0 {
                0 => Ok(()),
                _ => {
                    self.0 -= 1;
                    Err(StrataError::TIMEOUT)
                }
            }
        }
    }

    struct LostSemaphore;

    impl CompositorSemaphore for LostSemaphore {
        fn wait(&self, _value: u64, _timeout_ns: u64) -> strata::Result<()> {
            Err(StrataError::GPU_ERROR)
        }
    }

    #[test]
    fn timeouts_are_retried() {
        let mut fence = SlowFence(3);
        assert!(wait_fence(&mut fence).is_ok());
        assert_eq!(fence.0, 0);
    }

    #[test]
    fn failures_are_reported() {
        assert_eq!(wait_semaphore(&LostSemaphore, 1), Err(XrError::GPU_ERROR));
    }
}
