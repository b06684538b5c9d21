//! The WAL device collaborator. Out of scope per `spec.md` §1 — this
//! module only pins down the interface (§6) the rest of the engine
//! drives, plus an in-memory reference implementation used by tests
//! (mirrors the teacher's `object_store::mock` pattern: deterministic,
//! inspectable, with an explicit knob to defer completions so tests
//! can exercise out-of-order WAL acknowledgement).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{DeltaError, Result};

/// Result of a successful `Wal::append`: the monotone offset the WAL
/// assigned, and a future that resolves once that offset is durable.
/// WAL implementations may resolve these futures in any order, even
/// within a single stream — reordering them back into stream order is
/// the `CallbackSequencer`'s job, not the WAL's.
pub struct WalAppendResult {
    /// Monotone offset assigned to this append.
    pub record_offset: i64,
    /// Resolves (with an error only on collaborator failure) once this
    /// offset is durable.
    pub completion: oneshot::Receiver<Result<()>>,
}

/// A single `{recordOffset, bytes}` pair produced by [`Wal::recover`].
#[derive(Clone, Debug)]
pub struct WalRecoveredRecord {
    /// WAL offset the bytes were originally appended at.
    pub record_offset: i64,
    /// Opaque encoded `StreamRecordBatch` bytes.
    pub bytes: Vec<u8>,
}

/// The append-only durability log the engine builds on top of.
/// Appends opaque byte blocks and produces a recovery iterator; never
/// interprets the bytes it stores.
#[async_trait]
pub trait Wal: Send + Sync {
    /// Opens the WAL for appends.
    async fn start(&self) -> Result<()>;

    /// Stops accepting new appends and flushes any buffered state.
    async fn shutdown_gracefully(&self) -> Result<()>;

    /// Appends an opaque byte block. Returns [`DeltaError::WalOverCapacity`]
    /// if the device cannot accept more data until it is trimmed.
    async fn append(&self, bytes: Vec<u8>) -> Result<WalAppendResult>;

    /// Returns every record still retained by the device, oldest first,
    /// for crash recovery. Finite — not a live stream.
    async fn recover(&self) -> Result<Vec<WalRecoveredRecord>>;

    /// Drops all retained records after a successful recovery replay.
    async fn reset(&self) -> Result<()>;

    /// Releases every record at or below `offset`; called once the
    /// confirm offset has advanced past them and the owning cache block
    /// has committed.
    async fn trim(&self, offset: i64) -> Result<()>;
}

/// In-memory `Wal` reference implementation. Auto-completes appends in
/// append order unless constructed with [`InMemoryWal::new_manual`], in
/// which case a test drives completion order explicitly via
/// [`InMemoryWal::complete`] to simulate the WAL device's pipeline
/// reordering (`spec.md` §4.2, scenario S2).
pub struct InMemoryWal {
    next_offset: AtomicI64,
    capacity_bytes: u64,
    used_bytes: AtomicU64,
    auto_complete: bool,
    pending: Mutex<HashMap<i64, oneshot::Sender<Result<()>>>>,
    log: Mutex<Vec<WalRecoveredRecord>>,
}

impl InMemoryWal {
    /// Creates a WAL with the given capacity that completes appends
    /// automatically, in the order they were made.
    #[must_use]
    pub fn new(capacity_bytes: u64) -> Arc<Self> {
        Self::with_completion_mode(capacity_bytes, true)
    }

    /// Creates a WAL whose appends only resolve when [`InMemoryWal::complete`]
    /// is called, letting a test choose the acknowledgement order.
    #[must_use]
    pub fn new_manual(capacity_bytes: u64) -> Arc<Self> {
        Self::with_completion_mode(capacity_bytes, false)
    }

    fn with_completion_mode(capacity_bytes: u64, auto_complete: bool) -> Arc<Self> {
        Arc::new(Self {
            next_offset: AtomicI64::new(0),
            capacity_bytes,
            used_bytes: AtomicU64::new(0),
            auto_complete,
            pending: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    /// Resolves a previously deferred append (manual-completion mode).
    pub fn complete(&self, record_offset: i64) {
        if let Some(tx) = self.pending.lock().remove(&record_offset) {
            let _ = tx.send(Ok(()));
        }
    }

    /// Bytes currently retained (not yet trimmed).
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Wal for InMemoryWal {
    async fn start(&self) -> Result<()> {
        tracing::info!("in-memory WAL started");
        Ok(())
    }

    async fn shutdown_gracefully(&self) -> Result<()> {
        tracing::info!("in-memory WAL shutting down");
        Ok(())
    }

    async fn append(&self, bytes: Vec<u8>) -> Result<WalAppendResult> {
        let len = bytes.len() as u64;
        let used = self.used_bytes.load(Ordering::SeqCst);
        if used + len > self.capacity_bytes {
            return Err(DeltaError::WalOverCapacity);
        }
        self.used_bytes.fetch_add(len, Ordering::SeqCst);

        let record_offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(WalRecoveredRecord {
            record_offset,
            bytes,
        });

        let (tx, rx) = oneshot::channel();
        if self.auto_complete {
            let _ = tx.send(Ok(()));
        } else {
            self.pending.lock().insert(record_offset, tx);
        }

        Ok(WalAppendResult {
            record_offset,
            completion: rx,
        })
    }

    async fn recover(&self) -> Result<Vec<WalRecoveredRecord>> {
        Ok(self.log.lock().clone())
    }

    async fn reset(&self) -> Result<()> {
        let mut log = self.log.lock();
        log.clear();
        self.used_bytes.store(0, Ordering::SeqCst);
        tracing::info!("in-memory WAL reset");
        Ok(())
    }

    async fn trim(&self, offset: i64) -> Result<()> {
        let mut log = self.log.lock();
        let trimmed: u64 = log
            .iter()
            .filter(|r| r.record_offset <= offset)
            .map(|r| r.bytes.len() as u64)
            .sum();
        log.retain(|r| r.record_offset > offset);
        self.used_bytes.fetch_sub(trimmed, Ordering::SeqCst);
        tracing::debug!(offset, trimmed, "WAL trimmed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn auto_complete_resolves_immediately_in_order() {
        let wal = InMemoryWal::new(1024);
        let r0 = wal.append(vec![1, 2, 3]).await.unwrap();
        let r1 = wal.append(vec![4, 5]).await.unwrap();
        assert_eq!(r0.record_offset, 0);
        assert_eq!(r1.record_offset, 1);
        r0.completion.await.unwrap().unwrap();
        r1.completion.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn over_capacity_is_reported() {
        let wal = InMemoryWal::new(4);
        assert!(wal.append(vec![0u8; 8]).await.is_err());
    }

    #[tokio::test]
    async fn manual_mode_lets_caller_choose_completion_order() {
        let wal = InMemoryWal::new_manual(1024);
        let r0 = wal.append(vec![1]).await.unwrap();
        let r1 = wal.append(vec![2]).await.unwrap();

        wal.complete(r1.record_offset);
        r1.completion.await.unwrap().unwrap();

        wal.complete(r0.record_offset);
        r0.completion.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn recover_then_reset_clears_the_log() {
        let wal = InMemoryWal::new(1024);
        wal.append(vec![1, 2]).await.unwrap();
        wal.append(vec![3, 4]).await.unwrap();

        let recovered = wal.recover().await.unwrap();
        assert_eq!(recovered.len(), 2);

        wal.reset().await.unwrap();
        assert_eq!(wal.recover().await.unwrap().len(), 0);
        assert_eq!(wal.used_bytes(), 0);
    }

    #[tokio::test]
    async fn trim_drops_records_at_or_below_offset() {
        let wal = InMemoryWal::new(1024);
        wal.append(vec![1, 2]).await.unwrap();
        wal.append(vec![3, 4]).await.unwrap();
        wal.append(vec![5, 6]).await.unwrap();

        wal.trim(1).await.unwrap();
        let remaining = wal.recover().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].record_offset, 2);
    }
}
