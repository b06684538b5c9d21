//! `CallbackSequencer` — reorders unordered WAL completion
//! notifications back into per-stream WAL-offset order
//! (`spec.md` §4.2).

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::ids::StreamId;
use crate::request::WalWriteRequest;

/// Default number of stripes in the callback lock array when no
/// configuration is supplied. Bounds per-stream contention while
/// letting unrelated streams proceed concurrently.
pub const STRIPE_COUNT: usize = 128;

/// Per-stream FIFO of in-flight requests, guarded by a fixed-size
/// striped lock keyed by `streamId mod stripe_count` (`stripe_count`
/// from [`crate::config::DeltaConfig`]). Within a stream, `before`/
/// `after` calls are assumed serialized and offset-ascending by the
/// caller (holding the WAL shared-append lock while assigning offsets).
pub struct CallbackSequencer {
    stripes: Vec<Mutex<HashMap<u64, VecDeque<WalWriteRequest>>>>,
}

impl CallbackSequencer {
    /// Creates an empty sequencer with `stripe_count` stripes.
    ///
    /// # Panics
    ///
    /// Panics if `stripe_count` is zero.
    #[must_use]
    pub fn new(stripe_count: usize) -> Self {
        assert!(stripe_count > 0, "stripe_count must be non-zero");
        Self {
            stripes: (0..stripe_count).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn stripe_of(&self, stream_id: StreamId) -> usize {
        (stream_id.value() % self.stripes.len() as u64) as usize
    }

    /// Registers `req` as pending for its stream. Must be called before
    /// its WAL completion can fire.
    pub fn before(&self, req: WalWriteRequest) {
        let stripe = &self.stripes[self.stripe_of(req.stream_id())];
        stripe
            .lock()
            .entry(req.stream_id().value())
            .or_default()
            .push_back(req);
    }

    /// Marks `req` persisted and, if it is at the head of its stream's
    /// queue, pops it and every subsequent contiguous persisted entry.
    /// Returns the popped requests, in WAL-offset order.
    ///
    /// # Panics
    ///
    /// Panics if a popped entry's `baseOffset` does not equal the
    /// previous popped entry's `lastOffset` — this would indicate the
    /// WAL violated its per-stream offset-ascending append guarantee.
    pub fn after(&self, req: &WalWriteRequest) -> Vec<WalWriteRequest> {
        req.mark_persisted();
        let stripe = &self.stripes[self.stripe_of(req.stream_id())];
        let mut guard = stripe.lock();
        let Some(queue) = guard.get_mut(&req.stream_id().value()) else {
            return Vec::new();
        };

        match queue.front() {
            Some(head) if WalWriteRequest::ptr_eq(head, req) => {}
            _ => return Vec::new(),
        }

        let mut drained = Vec::new();
        while let Some(front) = queue.front() {
            if !front.is_persisted() {
                break;
            }
            let popped = queue.pop_front().expect("front checked Some above");
            if let Some(prev) = drained.last() {
                let prev: &WalWriteRequest = prev;
                assert_eq!(
                    popped.base_offset(),
                    prev.last_offset(),
                    "sequencer drained a non-contiguous pair for stream {}",
                    popped.stream_id()
                );
            }
            drained.push(popped);
        }
        drained
    }

    /// Removes the queue for `stream_id` iff it is empty. Safe cleanup
    /// when a stream is retiring via force-upload.
    pub fn try_free(&self, stream_id: StreamId) {
        let stripe = &self.stripes[self.stripe_of(stream_id)];
        let mut guard = stripe.lock();
        if let Some(queue) = guard.get(&stream_id.value()) {
            if queue.is_empty() {
                guard.remove(&stream_id.value());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::StreamId;
    use crate::record::{RefCountedBytes, StreamRecordBatch};

    fn req(stream: u64, base: u64, count: u32) -> WalWriteRequest {
        let record = StreamRecordBatch::new(StreamId::new(stream), 1, base, count, RefCountedBytes::new(vec![0u8; 4]));
        WalWriteRequest::new(record).0
    }

    #[test]
    fn in_order_completion_drains_immediately() {
        let seq = CallbackSequencer::new(128);
        let a = req(7, 0, 5);
        let b = req(7, 5, 5);
        seq.before(a.clone());
        seq.before(b.clone());

        let drained = seq.after(&a);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].base_offset(), 0);

        let drained = seq.after(&b);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].base_offset(), 5);
    }

    #[test]
    fn out_of_order_completion_waits_for_the_head() {
        let seq = CallbackSequencer::new(128);
        let a = req(7, 0, 5);
        let b = req(7, 5, 5);
        seq.before(a.clone());
        seq.before(b.clone());

        let drained = seq.after(&b);
        assert!(drained.is_empty(), "b completed first, but a is still head");

        let drained = seq.after(&a);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].base_offset(), 0);
        assert_eq!(drained[1].base_offset(), 5);
    }

    #[test]
    fn different_streams_do_not_interfere() {
        let seq = CallbackSequencer::new(128);
        let a = req(7, 0, 5);
        let b = req(9, 0, 5);
        seq.before(a.clone());
        seq.before(b.clone());

        assert_eq!(seq.after(&b).len(), 1);
        assert_eq!(seq.after(&a).len(), 1);
    }

    #[test]
    fn try_free_only_removes_empty_queues() {
        let seq = CallbackSequencer::new(128);
        let a = req(7, 0, 5);
        seq.before(a.clone());
        seq.try_free(StreamId::new(7));
        assert_eq!(seq.after(&a).len(), 1);

        seq.try_free(StreamId::new(7));
    }
}
