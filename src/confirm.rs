//! `ConfirmOffsetCalculator` — periodically computes the greatest WAL
//! offset such that every earlier offset is durable (`spec.md` §4.3).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::request::WalWriteRequest;

enum Entry {
    Request(WalWriteRequest),
    Sentinel,
}

/// Tracks in-flight requests and reports the durable prefix. The
/// `append_lock` is the same reader-writer lock Admission holds in
/// shared mode around `wal.append` (`spec.md` §5): appenders taking its
/// read side may call [`ConfirmOffsetCalculator::add`] concurrently,
/// while [`ConfirmOffsetCalculator::update`] takes the write side only
/// long enough to insert a sentinel, guaranteeing no offset assignment
/// is in flight when the scan begins.
pub struct ConfirmOffsetCalculator {
    append_lock: Arc<RwLock<()>>,
    queue: Mutex<VecDeque<Entry>>,
    confirmed: AtomicI64,
}

impl ConfirmOffsetCalculator {
    /// Creates a calculator sharing `append_lock` with the WAL-append
    /// path.
    #[must_use]
    pub fn new(append_lock: Arc<RwLock<()>>) -> Self {
        Self {
            append_lock,
            queue: Mutex::new(VecDeque::new()),
            confirmed: AtomicI64::new(-1),
        }
    }

    /// Registers a request for confirm-offset tracking. Caller is
    /// expected to already hold `append_lock`'s read side (shared with
    /// the WAL append that produced `req`) — `add` does not reacquire it
    /// itself, since parking_lot's write-preferring `RwLock` is not safe
    /// to read-lock recursively on one thread.
    pub fn add(&self, req: WalWriteRequest) {
        self.queue.lock().push_back(Entry::Request(req));
    }

    /// The lock appenders take in shared mode while assigning a WAL
    /// offset and registering the resulting request here.
    #[must_use]
    pub fn append_lock(&self) -> &Arc<RwLock<()>> {
        &self.append_lock
    }

    /// Advances the confirmed offset as far as currently possible.
    /// Returns the (possibly unchanged) confirmed offset.
    pub fn update(&self) -> i64 {
        {
            let _permit = self.append_lock.write();
            self.queue.lock().push_back(Entry::Sentinel);
        }

        let mut min_unconfirmed = i64::MAX;
        {
            let queue = self.queue.lock();
            for entry in queue.iter() {
                match entry {
                    Entry::Sentinel => break,
                    Entry::Request(req) if !req.is_persisted() => {
                        min_unconfirmed = min_unconfirmed.min(req.record_offset());
                    }
                    Entry::Request(_) => {}
                }
            }
        }

        let mut confirmed = self.confirmed.load(Ordering::SeqCst);
        {
            let mut queue = self.queue.lock();
            while let Some(front) = queue.front() {
                match front {
                    Entry::Sentinel => {
                        queue.pop_front();
                        break;
                    }
                    Entry::Request(req) if req.is_persisted() && req.record_offset() < min_unconfirmed => {
                        confirmed = confirmed.max(req.record_offset());
                        queue.pop_front();
                    }
                    Entry::Request(_) => break,
                }
            }
        }

        if confirmed > self.confirmed.load(Ordering::SeqCst) {
            self.confirmed.store(confirmed, Ordering::SeqCst);
            tracing::debug!(confirmed, "confirm offset advanced");
        }
        self.confirmed.load(Ordering::SeqCst)
    }

    /// Last published confirm offset; monotone non-decreasing, may lag
    /// the true durable prefix by up to one `update()` tick.
    #[must_use]
    pub fn confirmed(&self) -> i64 {
        self.confirmed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::StreamId;
    use crate::record::{RefCountedBytes, StreamRecordBatch};

    fn req(offset: i64) -> WalWriteRequest {
        let record = StreamRecordBatch::new(StreamId::new(1), 1, 0, 1, RefCountedBytes::new(vec![0u8; 1]));
        let (req, _rx) = WalWriteRequest::new(record);
        req.set_record_offset(offset);
        req
    }

    #[test]
    fn advances_past_a_fully_persisted_prefix() {
        let calc = ConfirmOffsetCalculator::new(Arc::new(RwLock::new(())));
        let a = req(0);
        let b = req(1);
        a.mark_persisted();
        b.mark_persisted();
        calc.add(a);
        calc.add(b);

        assert_eq!(calc.update(), 1);
    }

    #[test]
    fn stalls_at_the_first_unpersisted_request() {
        let calc = ConfirmOffsetCalculator::new(Arc::new(RwLock::new(())));
        let a = req(0);
        let b = req(1);
        b.mark_persisted();
        calc.add(a);
        calc.add(b);

        assert_eq!(calc.update(), -1);
    }

    #[test]
    fn confirmed_offset_is_monotone_non_decreasing() {
        let calc = ConfirmOffsetCalculator::new(Arc::new(RwLock::new(())));
        let a = req(0);
        a.mark_persisted();
        calc.add(a);
        assert_eq!(calc.update(), 0);

        let b = req(1);
        calc.add(b);
        assert_eq!(calc.update(), 0);
        assert_eq!(calc.confirmed(), 0);
    }
}
