//! `WalWriteRequest` — the per-append handle threaded through the
//! sequencer, the confirm-offset queue, and the producer's completion
//! future (`spec.md` §3).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::ids::StreamId;
use crate::record::StreamRecordBatch;

struct Inner {
    record: StreamRecordBatch,
    record_offset: AtomicI64,
    persisted: AtomicBool,
    completion: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

/// A reference-counted handle to one in-flight append. Cheap to clone
/// (an `Arc` bump) so the same request can live in both the
/// `CallbackSequencer`'s per-stream queue and the confirm-offset FIFO.
#[derive(Clone)]
pub struct WalWriteRequest(Arc<Inner>);

impl WalWriteRequest {
    /// Creates a request for `record`, initially unassigned
    /// (`recordOffset = -1`) and unpersisted, returning it alongside the
    /// receiver half of its completion future.
    #[must_use]
    pub fn new(record: StreamRecordBatch) -> (Self, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self(Arc::new(Inner {
                record,
                record_offset: AtomicI64::new(-1),
                persisted: AtomicBool::new(false),
                completion: Mutex::new(Some(tx)),
            })),
            rx,
        )
    }

    /// Stream this append belongs to.
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.0.record.stream_id
    }

    /// First offset of the underlying record batch.
    #[must_use]
    pub fn base_offset(&self) -> u64 {
        self.0.record.base_offset
    }

    /// Exclusive end offset of the underlying record batch.
    #[must_use]
    pub fn last_offset(&self) -> u64 {
        self.0.record.last_offset()
    }

    /// The record batch this request is appending.
    #[must_use]
    pub fn record(&self) -> &StreamRecordBatch {
        &self.0.record
    }

    /// The WAL-assigned offset, or `-1` if not yet assigned.
    #[must_use]
    pub fn record_offset(&self) -> i64 {
        self.0.record_offset.load(Ordering::SeqCst)
    }

    /// Records the WAL-assigned offset on acceptance.
    pub fn set_record_offset(&self, offset: i64) {
        self.0.record_offset.store(offset, Ordering::SeqCst);
    }

    /// True once the WAL has acknowledged this append as durable.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.0.persisted.load(Ordering::SeqCst)
    }

    /// Marks this request as WAL-durable.
    pub fn mark_persisted(&self) {
        self.0.persisted.store(true, Ordering::SeqCst);
    }

    /// Identity comparison, used by the sequencer to recognize "the
    /// request currently at the head of its stream's queue".
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Signals the producer-facing future exactly once. Later calls
    /// (there should be none) are silently ignored.
    pub fn complete(&self, result: Result<()>) {
        if let Some(tx) = self.0.completion.lock().take() {
            let _ = tx.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::StreamId;
    use crate::record::RefCountedBytes;

    fn record() -> StreamRecordBatch {
        StreamRecordBatch::new(StreamId::new(1), 1, 0, 5, RefCountedBytes::new(vec![0u8; 4]))
    }

    #[tokio::test]
    async fn starts_unassigned_and_unpersisted() {
        let (req, rx) = WalWriteRequest::new(record());
        assert_eq!(req.record_offset(), -1);
        assert!(!req.is_persisted());
        req.set_record_offset(3);
        req.mark_persisted();
        assert_eq!(req.record_offset(), 3);
        assert!(req.is_persisted());
        req.complete(Ok(()));
        rx.await.unwrap().unwrap();
    }

    #[test]
    fn ptr_eq_distinguishes_clones_from_new_instances() {
        let (req, _rx) = WalWriteRequest::new(record());
        let clone = req.clone();
        let (other, _rx2) = WalWriteRequest::new(record());
        assert!(WalWriteRequest::ptr_eq(&req, &clone));
        assert!(!WalWriteRequest::ptr_eq(&req, &other));
    }
}
