//! `UploadPipeline` — the three-stage (prepare → upload → commit)
//! pipeline that coalesces archived `LogCacheBlock`s into stream-set
//! objects, with bounded upload concurrency and strictly
//! archive-ordered commit (`spec.md` §4.6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};

use crate::cache::{LogCache, LogCacheBlock};
use crate::error::{DeltaError, Result};
use crate::ids::StreamScope;
use crate::object_store::{ObjectManager, StoreOperator};
use crate::record::StreamRecordBatch;
use crate::wal::Wal;

/// Encodes every record in a block into one stream-set object payload.
fn encode_block(block: &LogCacheBlock) -> Result<Vec<u8>> {
    let mut encoded: Vec<Vec<u8>> = Vec::new();
    for stream_id in block.stream_ids() {
        if let Some(records) = block.records_for(stream_id) {
            for record in records {
                encoded.push(record.encode()?);
            }
        }
    }
    bincode::serialize(&encoded).map_err(DeltaError::from)
}

/// Decodes a stream-set object payload back into its constituent
/// records, in upload order.
pub fn decode_block(bytes: &[u8]) -> Result<Vec<StreamRecordBatch>> {
    let encoded: Vec<Vec<u8>> = bincode::deserialize(bytes).map_err(DeltaError::from)?;
    encoded.iter().map(|b| StreamRecordBatch::decode(b)).collect()
}

struct ContextState {
    object_id: Option<crate::ids::ObjectId>,
    upload_rx: Option<oneshot::Receiver<Result<()>>>,
}

/// Tracks one archived block's progress through prepare/upload/commit,
/// and lets `forceUpload` wait for it to finish.
pub struct UploadContextHandle {
    /// The archived block this context is uploading.
    pub block: LogCacheBlock,
    /// True if this upload was requested via `forceUpload` rather than
    /// the ordinary threshold-crossing path.
    pub force: bool,
    created_at_millis: i64,
    state: Mutex<ContextState>,
    result: Mutex<Option<std::result::Result<(), String>>>,
    done_tx: watch::Sender<bool>,
}

impl UploadContextHandle {
    fn new(block: LogCacheBlock, force: bool) -> Arc<Self> {
        let (done_tx, _rx) = watch::channel(false);
        Arc::new(Self {
            created_at_millis: chrono::Utc::now().timestamp_millis(),
            block,
            force,
            state: Mutex::new(ContextState {
                object_id: None,
                upload_rx: None,
            }),
            result: Mutex::new(None),
            done_tx,
        })
    }

    /// Blocks until this context's commit (or failure) has resolved,
    /// returning the outcome. Used by `forceUpload`.
    pub async fn await_done(&self) -> Result<()> {
        let mut rx = self.done_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        match self.result.lock().clone() {
            Some(Ok(())) => Ok(()),
            Some(Err(msg)) => Err(DeltaError::PersistFailure(msg)),
            None => Err(DeltaError::Internal("upload context finished with no result".into())),
        }
    }

    fn finish(&self, result: std::result::Result<(), String>) {
        *self.result.lock() = Some(result);
        let _ = self.done_tx.send(true);
    }
}

/// Three-stage upload pipeline. Prepare and commit each run on a single
/// background task (enforcing FIFO order); upload runs on up to
/// `upload_pool_size` concurrent tasks.
pub struct UploadPipeline {
    object_manager: Arc<dyn ObjectManager>,
    store: Arc<dyn StoreOperator>,
    wal: Arc<dyn Wal>,
    cache: Arc<LogCache>,
    upload_semaphore: Arc<Semaphore>,
    prepare_tx: mpsc::UnboundedSender<Arc<UploadContextHandle>>,
    prepare_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<UploadContextHandle>>>>,
    commit_tx: mpsc::UnboundedSender<Arc<UploadContextHandle>>,
    commit_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<UploadContextHandle>>>>,
    inflight: Mutex<Vec<Arc<UploadContextHandle>>>,
    max_observed_rate: AtomicU64,
    abort_fn: Arc<dyn Fn(&str) + Send + Sync>,
}

impl UploadPipeline {
    /// Creates a pipeline. `abort_fn` is invoked (instead of the
    /// default `tracing::error!` + `std::process::exit(1)`) when a
    /// commit fails, letting tests observe the fatal path without
    /// terminating the test process.
    #[must_use]
    pub fn new(
        cache: Arc<LogCache>,
        wal: Arc<dyn Wal>,
        object_manager: Arc<dyn ObjectManager>,
        store: Arc<dyn StoreOperator>,
        upload_pool_size: usize,
        abort_fn: Arc<dyn Fn(&str) + Send + Sync>,
    ) -> Arc<Self> {
        let (prepare_tx, prepare_rx) = mpsc::unbounded_channel();
        let (commit_tx, commit_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            object_manager,
            store,
            wal,
            cache,
            upload_semaphore: Arc::new(Semaphore::new(upload_pool_size.max(1))),
            prepare_tx,
            prepare_rx: Mutex::new(Some(prepare_rx)),
            commit_tx,
            commit_rx: Mutex::new(Some(commit_rx)),
            inflight: Mutex::new(Vec::new()),
            max_observed_rate: AtomicU64::new(0),
            abort_fn,
        })
    }

    /// Starts the prepare and commit worker tasks. Idempotent only on
    /// first call — the receivers are moved out and spawned.
    pub fn start(self: &Arc<Self>) {
        if let Some(mut rx) = self.prepare_rx.lock().take() {
            let pipeline = self.clone();
            tokio::spawn(async move {
                while let Some(ctx) = rx.recv().await {
                    pipeline.prepare_stage(ctx).await;
                }
            });
        }
        if let Some(mut rx) = self.commit_rx.lock().take() {
            let pipeline = self.clone();
            tokio::spawn(async move {
                while let Some(ctx) = rx.recv().await {
                    pipeline.commit_stage(ctx).await;
                }
            });
        }
    }

    /// Archives the active block (if `scope` selects it) and schedules
    /// its upload. Returns immediately once the block is queued — use
    /// `force_upload` to await completion.
    pub fn upload_delta_wal(&self, scope: StreamScope, force: bool, confirm_offset: i64) -> Result<()> {
        self.cache.set_confirm_offset(confirm_offset);
        let Some(block) = self.cache.archive_current_block_if_contains(scope) else {
            return Ok(());
        };
        let ctx = UploadContextHandle::new(block, force);
        self.inflight.lock().push(ctx.clone());
        self.prepare_tx
            .send(ctx)
            .map_err(|_| DeltaError::Internal("upload pipeline prepare stage is not running".into()))
    }

    /// Contexts still in flight whose block contains `stream_id`; used
    /// by `forceUpload` to know what to wait on.
    #[must_use]
    pub fn inflight_containing(&self, stream_id: crate::ids::StreamId) -> Vec<Arc<UploadContextHandle>> {
        self.inflight
            .lock()
            .iter()
            .filter(|ctx| ctx.block.contains_stream(stream_id))
            .cloned()
            .collect()
    }

    /// Every context currently in flight, regardless of stream.
    #[must_use]
    pub fn all_inflight(&self) -> Vec<Arc<UploadContextHandle>> {
        self.inflight.lock().clone()
    }

    fn update_rate_budget(&self, ctx: &UploadContextHandle) {
        let elapsed = (chrono::Utc::now().timestamp_millis() - ctx.created_at_millis).max(1) as u64;
        if ctx.force || elapsed <= 100 {
            return;
        }
        let rate = ctx.block.size_bytes.saturating_mul(1000) / elapsed.min(5000);
        let mut observed = self.max_observed_rate.load(Ordering::SeqCst);
        while rate > observed {
            match self.max_observed_rate.compare_exchange_weak(observed, rate, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => {
                    tracing::debug!(rate, "upload rate budget advanced");
                    break;
                }
                Err(actual) => observed = actual,
            }
        }
    }

    async fn prepare_stage(&self, ctx: Arc<UploadContextHandle>) {
        match self.object_manager.prepare_object().await {
            Ok(object_id) => {
                self.update_rate_budget(&ctx);
                let bytes = match encode_block(&ctx.block) {
                    Ok(b) => b,
                    Err(e) => {
                        self.fail_context(&ctx, e);
                        return;
                    }
                };
                let permit = match self.upload_semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => {
                        self.fail_context(&ctx, DeltaError::Shutdown);
                        return;
                    }
                };
                let store = self.store.clone();
                let (upload_tx, upload_rx) = oneshot::channel();
                let bytes = Bytes::from(bytes);
                tokio::spawn(async move {
                    let result = store.put(object_id, bytes).await;
                    let _ = upload_tx.send(result);
                    drop(permit);
                });
                {
                    let mut state = ctx.state.lock();
                    state.object_id = Some(object_id);
                    state.upload_rx = Some(upload_rx);
                }
                if self.commit_tx.send(ctx).is_err() {
                    tracing::warn!("upload pipeline commit stage is not running; context dropped");
                }
            }
            Err(e) => self.fail_context(&ctx, e),
        }
    }

    async fn commit_stage(&self, ctx: Arc<UploadContextHandle>) {
        let (object_id, upload_rx) = {
            let mut state = ctx.state.lock();
            (state.object_id.take(), state.upload_rx.take())
        };
        let Some(object_id) = object_id else {
            self.fail_context(&ctx, DeltaError::Internal("commit stage reached without an object id".into()));
            return;
        };
        let Some(upload_rx) = upload_rx else {
            self.fail_context(&ctx, DeltaError::Internal("commit stage reached without an upload handle".into()));
            return;
        };

        let upload_result = match upload_rx.await {
            Ok(result) => result,
            Err(_) => Err(DeltaError::Internal("upload task dropped".into())),
        };
        if let Err(e) = upload_result {
            self.fail_context(&ctx, e);
            return;
        }

        match self.object_manager.commit_object(object_id, ctx.block.size_bytes).await {
            Ok(()) => {
                if ctx.block.confirm_offset != -1 {
                    if let Err(e) = self.wal.trim(ctx.block.confirm_offset).await {
                        tracing::warn!(error = %e, "WAL trim failed after commit");
                    }
                }
                self.cache.mark_free(ctx.block.id);
                self.inflight.lock().retain(|c| !Arc::ptr_eq(c, &ctx));
                ctx.finish(Ok(()));
            }
            Err(e) => {
                tracing::error!(error = %e, block_id = ctx.block.id, "commit failed, aborting process");
                (self.abort_fn)(&e.to_string());
                ctx.finish(Err(e.to_string()));
            }
        }
    }

    fn fail_context(&self, ctx: &Arc<UploadContextHandle>, err: DeltaError) {
        tracing::warn!(error = %err, block_id = ctx.block.id, "upload context failed (non-fatal)");
        self.inflight.lock().retain(|c| !Arc::ptr_eq(c, ctx));
        ctx.finish(Err(err.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::StreamId;
    use crate::object_store::{InMemoryObjectManager, InMemoryStoreOperator};
    use crate::record::RefCountedBytes;
    use crate::wal::InMemoryWal;

    fn default_abort() -> Arc<dyn Fn(&str) + Send + Sync> {
        Arc::new(|msg: &str| panic!("fatal commit failure: {msg}"))
    }

    #[tokio::test]
    async fn archived_block_round_trips_through_the_pipeline() {
        let cache = Arc::new(LogCache::new(1_000_000, 1_000_000, 128));
        let wal = InMemoryWal::new(1_000_000);
        let object_manager = Arc::new(InMemoryObjectManager::new());
        let store = Arc::new(InMemoryStoreOperator::new());

        cache.put(StreamRecordBatch::new(
            StreamId::new(1),
            1,
            0,
            5,
            RefCountedBytes::new(vec![1, 2, 3, 4]),
        ));

        let pipeline = UploadPipeline::new(cache.clone(), wal, object_manager.clone(), store, 4, default_abort());
        pipeline.start();
        pipeline.upload_delta_wal(StreamScope::All, true, 4).unwrap();

        let ctx = pipeline.all_inflight().into_iter().next().unwrap();
        ctx.await_done().await.unwrap();

        assert_eq!(object_manager.committed_ids().len(), 1);
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn commit_failure_invokes_the_abort_callback() {
        let cache = Arc::new(LogCache::new(1_000_000, 1_000_000, 128));
        let wal = InMemoryWal::new(1_000_000);
        let object_manager = Arc::new(InMemoryObjectManager::new());
        object_manager.queue_commit_failure("disk full");
        let store = Arc::new(InMemoryStoreOperator::new());

        cache.put(StreamRecordBatch::new(
            StreamId::new(1),
            1,
            0,
            5,
            RefCountedBytes::new(vec![1, 2, 3, 4]),
        ));

        let aborted = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let aborted_clone = aborted.clone();
        let abort_fn: Arc<dyn Fn(&str) + Send + Sync> = Arc::new(move |_msg: &str| {
            aborted_clone.store(true, Ordering::SeqCst);
        });

        let pipeline = UploadPipeline::new(cache.clone(), wal, object_manager, store, 4, abort_fn);
        pipeline.start();
        pipeline.upload_delta_wal(StreamScope::All, true, 4).unwrap();

        let ctx = pipeline.all_inflight().into_iter().next().unwrap();
        assert!(ctx.await_done().await.is_err());
        assert!(aborted.load(Ordering::SeqCst));
    }
}
