/// Frame based deletion queue
///
/// Resources that the GPU may still be reading are parked here until
/// the frame that last used them has completed.

/// A queue of items to be dropped for a particular frame.
struct DQPointQueue {
    pq_sync_point: i64,
    pq_items: Vec<Box<dyn Send>>,
}

/// A frame id based deletion queue
///
/// This schedules items to be dropped when a certain frame
/// has completed.
pub struct DeletionQueue {
    /// The last frame that we have already seen complete
    /// If new items are not newer than this point then they are dropped
    /// immediately instead of being added to any queue.
    dq_last_signaled: i64,
    /// A queue per frame
    dq_point_queues: Vec<DQPointQueue>,
}

impl DeletionQueue {
    /// Creates an empty deletion queue
    pub fn new() -> Self {
        Self {
            dq_last_signaled: i64::MIN,
            dq_point_queues: Vec::new(),
        }
    }

    /// Schedule the item to be dropped once the specified frame
    /// has completed.
    ///
    /// This does not drop the item immediately, unless the frame
    /// is already known to be complete.
    pub fn schedule_drop_at_point(&mut self, item: Box<dyn Send>, sync_point: i64) {
        if sync_point <= self.dq_last_signaled {
            return;
        }

        // Add this item to an existing queue, if there is one for this sync point
        if let Some(point_queue) = self
            .dq_point_queues
            .iter_mut()
            .find(|pq| pq.pq_sync_point == sync_point)
        {
            point_queue.pq_items.push(item);
            return;
        }

        // Otherwise create a new queue that contains this item
        self.dq_point_queues.push(DQPointQueue {
            pq_sync_point: sync_point,
            pq_items: vec![item],
        });
    }

    /// Release all pending items for a frame
    ///
    /// This clears all deletion queues for this frame, including
    /// frames preceeding this one.
    pub fn drop_all_at_point(&mut self, sync_point: i64) {
        self.dq_last_signaled = sync_point;

        self.dq_point_queues
            .retain(|pq| pq.pq_sync_point > sync_point);
    }

    /// Number of items still waiting
    pub fn pending(&self) -> usize {
        self.dq_point_queues.iter().map(|pq| pq.pq_items.len()).sum()
    }
}

impl Default for DeletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counted(Arc<AtomicUsize>);
    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn drops_in_frame_order() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut dq = DeletionQueue::new();

        dq.schedule_drop_at_point(Box::new(Counted(dropped.clone())), 3);
        dq.schedule_drop_at_point(Box::new(Counted(dropped.clone())), 3);
        dq.schedule_drop_at_point(Box::new(Counted(dropped.clone())), 5);
        assert_eq!(dq.pending(), 3);

        dq.drop_all_at_point(4);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
        assert_eq!(dq.pending(), 1);

        // already completed frames drop right away
        dq.schedule_drop_at_point(Box::new(Counted(dropped.clone())), 2);
        assert_eq!(dropped.load(Ordering::SeqCst), 3);

        dq.drop_all_at_point(5);
        assert_eq!(dropped.load(Ordering::SeqCst), 4);
    }
}
