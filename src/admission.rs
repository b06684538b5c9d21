//! Admission & Backoff — gates appends when the `LogCache` is full or
//! the WAL is over capacity, and drives WAL-completion handling once
//! an append is accepted (`spec.md` §4.4, §4.5).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::cache::LogCache;
use crate::confirm::ConfirmOffsetCalculator;
use crate::error::{DeltaError, Result};
use crate::ids::StreamScope;
use crate::request::WalWriteRequest;
use crate::sequencer::CallbackSequencer;
use crate::upload::UploadPipeline;
use crate::wal::Wal;

/// Gates new appends on cache/WAL capacity, forwards accepted appends
/// to the WAL, and drives the completion-handling path once the WAL
/// acknowledges them (`spec.md` §4.4/§4.5).
pub struct Admission {
    cache: Arc<LogCache>,
    wal: Arc<dyn Wal>,
    sequencer: Arc<CallbackSequencer>,
    confirm: Arc<ConfirmOffsetCalculator>,
    upload: Arc<UploadPipeline>,
    backoff_queue: Mutex<VecDeque<WalWriteRequest>>,
    shutting_down: AtomicBool,
}

impl Admission {
    /// Creates an admission controller. `confirm` must share its
    /// `append_lock` with nothing else but this controller's WAL
    /// appends.
    #[must_use]
    pub fn new(
        cache: Arc<LogCache>,
        wal: Arc<dyn Wal>,
        sequencer: Arc<CallbackSequencer>,
        confirm: Arc<ConfirmOffsetCalculator>,
        upload: Arc<UploadPipeline>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            wal,
            sequencer,
            confirm,
            upload,
            backoff_queue: Mutex::new(VecDeque::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    fn try_acquire_permit(&self) -> bool {
        self.cache.size() < self.cache.capacity_bytes()
    }

    /// Processes one append request. `is_drain` is set only when this
    /// call originates from the backoff-drain tick, and skips the
    /// "queue already non-empty" head-of-line check so a drained
    /// request doesn't requeue itself behind a copy of itself. Returns
    /// `true` if the request was parked on the backoff queue.
    pub async fn process(self: &Arc<Self>, req: WalWriteRequest, is_drain: bool) -> Result<bool> {
        if self.shutting_down.load(Ordering::SeqCst) && !is_drain {
            req.complete(Err(DeltaError::Shutdown));
            return Err(DeltaError::Shutdown);
        }

        if !is_drain && !self.backoff_queue.lock().is_empty() {
            self.backoff_queue.lock().push_back(req);
            return Ok(true);
        }

        if !self.try_acquire_permit() {
            tracing::warn!("admission backoff: log cache at capacity");
            if !is_drain {
                self.backoff_queue.lock().push_back(req);
            }
            return Ok(true);
        }

        let bytes = match req.record().encode() {
            Ok(b) => b,
            Err(e) => {
                req.complete(Err(DeltaError::Codec(e.to_string())));
                return Ok(false);
            }
        };

        let append_lock = self.confirm.append_lock().clone();
        let _permit = append_lock.read();
        match self.wal.append(bytes).await {
            Ok(appended) => {
                req.set_record_offset(appended.record_offset);
                self.confirm.add(req.clone());
                self.sequencer.before(req.clone());
                drop(_permit);

                let this = self.clone();
                tokio::spawn(async move {
                    match appended.completion.await {
                        Ok(Ok(())) => this.handle_wal_completion(req).await,
                        Ok(Err(e)) => req.complete(Err(e)),
                        Err(_) => req.complete(Err(DeltaError::Internal("WAL completion channel dropped".into()))),
                    }
                });
                Ok(false)
            }
            Err(DeltaError::WalOverCapacity) => {
                drop(_permit);
                self.confirm.update();
                if let Err(e) = self.upload.upload_delta_wal(StreamScope::All, true, self.confirm.confirmed()) {
                    tracing::warn!(error = %e, "forced upload after WAL over-capacity failed to schedule");
                }
                if !is_drain {
                    self.backoff_queue.lock().push_back(req);
                }
                Ok(true)
            }
            Err(e) => {
                drop(_permit);
                req.complete(Err(e));
                Ok(false)
            }
        }
    }

    async fn handle_wal_completion(self: &Arc<Self>, req: WalWriteRequest) {
        let drained = self.sequencer.after(&req);
        for drained_req in drained {
            let full = self.cache.put(drained_req.record().clone());
            if full {
                if let Err(e) = self.upload.upload_delta_wal(StreamScope::All, false, self.confirm.confirmed()) {
                    tracing::warn!(error = %e, "threshold-triggered upload failed to schedule");
                }
            }
            drained_req.complete(Ok(()));
        }
    }

    /// Drains the backoff queue head-to-tail, stopping at the first
    /// request that still backs off. Intended to be driven by a
    /// periodic tick (`spec.md` §6, `backoff_drain_tick`).
    pub async fn drain_backoff_once(self: &Arc<Self>) {
        loop {
            let head = self.backoff_queue.lock().pop_front();
            let Some(req) = head else { break };
            match self.process(req.clone(), true).await {
                Ok(true) => {
                    self.backoff_queue.lock().push_front(req);
                    break;
                }
                _ => continue,
            }
        }
    }

    /// Number of requests currently parked on the backoff queue.
    #[must_use]
    pub fn backoff_len(&self) -> usize {
        self.backoff_queue.lock().len()
    }

    /// Stops accepting new appends and fails every request currently
    /// on the backoff queue with [`DeltaError::Shutdown`].
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut queue = self.backoff_queue.lock();
        while let Some(req) = queue.pop_front() {
            req.complete(Err(DeltaError::Shutdown));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::StreamId;
    use crate::object_store::{InMemoryObjectManager, InMemoryStoreOperator};
    use crate::record::{RefCountedBytes, StreamRecordBatch};
    use crate::wal::InMemoryWal;

    fn make_admission(capacity_bytes: u64) -> Arc<Admission> {
        let cache = Arc::new(LogCache::new(capacity_bytes, 1_000_000, 128));
        let wal = InMemoryWal::new(1_000_000);
        let sequencer = Arc::new(CallbackSequencer::new(128));
        let append_lock = Arc::new(RwLock::new(()));
        let confirm = Arc::new(ConfirmOffsetCalculator::new(append_lock));
        let object_manager = Arc::new(InMemoryObjectManager::new());
        let store = Arc::new(InMemoryStoreOperator::new());
        let upload = UploadPipeline::new(cache.clone(), wal.clone(), object_manager, store, 4, Arc::new(|_: &str| {}));
        upload.start();
        Admission::new(cache, wal, sequencer, confirm, upload)
    }

    fn request(stream: u64, base: u64, count: u32) -> WalWriteRequest {
        let record = StreamRecordBatch::new(StreamId::new(stream), 1, base, count, RefCountedBytes::new(vec![0u8; 8]));
        WalWriteRequest::new(record).0
    }

    #[tokio::test]
    async fn accepted_append_eventually_completes() {
        let admission = make_admission(1_000_000);
        let req = request(7, 0, 5);
        let backoff = admission.process(req.clone(), false).await.unwrap();
        assert!(!backoff);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(admission.cache.contains_stream(StreamId::new(7)));
    }

    #[tokio::test]
    async fn full_cache_parks_the_request_on_the_backoff_queue() {
        let admission = make_admission(1);
        let req = request(7, 0, 5);
        let backoff = admission.process(req, false).await.unwrap();
        assert!(backoff);
        assert_eq!(admission.backoff_len(), 1);
    }

    #[tokio::test]
    async fn shutdown_fails_pending_backoff_requests() {
        let admission = make_admission(1);
        let req = request(7, 0, 5);
        admission.process(req, false).await.unwrap();
        assert_eq!(admission.backoff_len(), 1);
        admission.shutdown();
        assert_eq!(admission.backoff_len(), 0);
    }
}
