//! Storage Facade — the public `append` / `read` / `forceUpload` /
//! `startup` / `shutdown` surface that composes every other component
//! (`spec.md` §4.7, §6).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::admission::Admission;
use crate::block_cache::{AccessType, BlockCache};
use crate::cache::LogCache;
use crate::config::DeltaConfig;
use crate::confirm::ConfirmOffsetCalculator;
use crate::error::{DeltaError, Result};
use crate::ids::{StreamId, StreamScope};
use crate::object_store::{ObjectManager, StoreOperator};
use crate::record::StreamRecordBatch;
use crate::recovery;
use crate::request::WalWriteRequest;
use crate::sequencer::CallbackSequencer;
use crate::stream_manager::StreamManager;
use crate::upload::UploadPipeline;
use crate::wal::Wal;

/// Caller-tunable options for [`DeltaEngine::read`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadOptions {
    /// If set, fail with [`DeltaError::FastReadFailFast`] on a
    /// `LogCache` miss instead of falling through to the block cache.
    pub fast_read: bool,
}

/// Result of a [`DeltaEngine::read`] call.
#[derive(Clone, Debug)]
pub struct ReadResult {
    /// Records returned, in offset order with no gaps.
    pub records: Vec<StreamRecordBatch>,
    /// How the read was satisfied.
    pub access_type: AccessType,
}

/// Composes `LogCache`, `CallbackSequencer`, `ConfirmOffsetCalculator`,
/// `Admission`, and `UploadPipeline` behind the public engine contract.
pub struct DeltaEngine {
    config: DeltaConfig,
    cache: Arc<LogCache>,
    wal: Arc<dyn Wal>,
    confirm: Arc<ConfirmOffsetCalculator>,
    admission: Arc<Admission>,
    upload: Arc<UploadPipeline>,
    block_cache: Arc<dyn BlockCache>,
    stream_manager: Arc<dyn StreamManager>,
    object_manager: Arc<dyn ObjectManager>,
    store: Arc<dyn StoreOperator>,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl DeltaEngine {
    /// Wires up a new engine from its external collaborators and
    /// configuration. Does not start background workers or replay the
    /// WAL — call [`DeltaEngine::startup`] for that.
    #[must_use]
    pub fn new(
        config: DeltaConfig,
        wal: Arc<dyn Wal>,
        block_cache: Arc<dyn BlockCache>,
        stream_manager: Arc<dyn StreamManager>,
        object_manager: Arc<dyn ObjectManager>,
        store: Arc<dyn StoreOperator>,
    ) -> Arc<Self> {
        let cache = Arc::new(LogCache::new(
            config.wal_cache_size_bytes,
            config.wal_upload_threshold_bytes,
            config.max_streams_per_block,
        ));
        let append_lock = Arc::new(RwLock::new(()));
        let confirm = Arc::new(ConfirmOffsetCalculator::new(append_lock));
        let sequencer = Arc::new(CallbackSequencer::new(config.stripe_count));
        let abort_fn: Arc<dyn Fn(&str) + Send + Sync> = Arc::new(|msg: &str| {
            tracing::error!(msg, "fatal commit failure, aborting process");
            std::process::exit(1);
        });
        let upload = UploadPipeline::new(
            cache.clone(),
            wal.clone(),
            object_manager.clone(),
            store.clone(),
            config.upload_pool_size,
            abort_fn,
        );
        let admission = Admission::new(cache.clone(), wal.clone(), sequencer, confirm.clone(), upload.clone());

        Arc::new(Self {
            config,
            cache,
            wal,
            confirm,
            admission,
            upload,
            block_cache,
            stream_manager,
            object_manager,
            store,
            background: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Replays the WAL (`spec.md` §4.8), then starts the upload
    /// pipeline and the background confirm-offset / backoff-drain
    /// ticks.
    ///
    /// # Errors
    ///
    /// Propagates [`DeltaError::RecoveryInvariant`] if recovery detects
    /// a WAL/metadata-service mismatch; startup must not proceed.
    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        recovery::recover(
            &self.wal,
            &self.stream_manager,
            &self.cache,
            &self.upload,
            &self.object_manager,
            &self.store,
        )
        .await?;

        self.upload.start();

        let mut background = self.background.lock().expect("background task list poisoned");

        let confirm = self.confirm.clone();
        let tick = self.config.confirm_offset_tick();
        background.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                confirm.update();
            }
        }));

        let admission = self.admission.clone();
        let tick = self.config.backoff_drain_tick();
        background.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                admission.drain_backoff_once().await;
            }
        }));

        tracing::info!("delta WAL engine started");
        Ok(())
    }

    /// Appends `record`, resolving once it is WAL-durable and placed in
    /// the log cache (or failed).
    pub async fn append(self: &Arc<Self>, record: StreamRecordBatch) -> Result<()> {
        let (req, rx) = WalWriteRequest::new(record);
        self.admission.process(req, false).await?;
        rx.await.map_err(|_| DeltaError::Internal("append request was dropped before completion".into()))?
    }

    /// Reads `[start, end)` for `stream_id`, up to `max_bytes`, merging
    /// the log cache with the block cache on a miss (`spec.md` §4.7).
    pub async fn read(&self, stream_id: StreamId, start: u64, end: u64, max_bytes: u64, options: ReadOptions) -> Result<ReadResult> {
        let log_cache_recs = self.cache.get(stream_id, start, end, max_bytes);
        if let Some(first) = log_cache_recs.first() {
            if first.base_offset <= start {
                return Ok(ReadResult {
                    records: log_cache_recs,
                    access_type: AccessType::CacheHit,
                });
            }
        }

        if options.fast_read {
            drop(log_cache_recs);
            return Err(DeltaError::FastReadFailFast);
        }

        let effective_end = log_cache_recs.first().map_or(end, |r| r.base_offset);

        let (watchdog_tx, watchdog_rx) = tokio::sync::oneshot::channel::<()>();
        let timeout = self.config.read_timeout();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    tracing::warn!("read watchdog fired: block cache fetch exceeded the soft timeout");
                }
                _ = watchdog_rx => {}
            }
        });

        let block_result = self.block_cache.read(stream_id, start, effective_end, max_bytes).await?;
        let _ = watchdog_tx.send(());

        let mut combined = block_result.records;
        let mut remaining = max_bytes.saturating_sub(combined.iter().map(StreamRecordBatch::size).sum());
        for record in log_cache_recs {
            if remaining == 0 {
                break;
            }
            remaining = remaining.saturating_sub(record.size());
            combined.push(record);
        }

        for window in combined.windows(2) {
            if window[1].base_offset != window[0].last_offset() {
                let (actual, expected) = (window[1].base_offset, window[0].last_offset());
                combined.clear();
                return Err(DeltaError::ContinuityViolation { expected, actual });
            }
        }

        Ok(ReadResult {
            records: combined,
            access_type: block_result.access_type,
        })
    }

    /// Forces an upload of the active block (for `scope`), debounced to
    /// coalesce bursts, and waits for every affected in-flight context
    /// to finish committing.
    pub async fn force_upload(&self, scope: StreamScope) -> Result<()> {
        tokio::time::sleep(self.config.force_upload_debounce()).await;
        self.upload.upload_delta_wal(scope, true, self.confirm.confirmed())?;

        let contexts = match scope {
            StreamScope::All => self.upload.all_inflight(),
            StreamScope::One(id) => self.upload.inflight_containing(id),
        };
        for ctx in contexts {
            ctx.await_done().await?;
        }
        Ok(())
    }

    /// Stops accepting new appends, drains the backoff queue with a
    /// shutdown error, stops background ticks, and shuts the WAL down.
    pub async fn shutdown(&self) -> Result<()> {
        self.admission.shutdown();
        let handles: Vec<JoinHandle<()>> = self.background.lock().expect("background task list poisoned").drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        tokio::time::timeout(Duration::from_secs(10), self.wal.shutdown_gracefully())
            .await
            .map_err(|_| DeltaError::Internal("WAL shutdown exceeded 10s grace period".into()))??;
        tracing::info!("delta WAL engine shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_cache::EmptyBlockCache;
    use crate::object_store::{InMemoryObjectManager, InMemoryStoreOperator};
    use crate::record::RefCountedBytes;
    use crate::stream_manager::InMemoryStreamManager;
    use crate::wal::InMemoryWal;

    fn engine() -> Arc<DeltaEngine> {
        let wal: Arc<dyn Wal> = InMemoryWal::new(10 * 1024 * 1024);
        let block_cache: Arc<dyn BlockCache> = Arc::new(EmptyBlockCache);
        let stream_manager: Arc<dyn StreamManager> = Arc::new(InMemoryStreamManager::new(Vec::new()));
        let object_manager: Arc<dyn ObjectManager> = Arc::new(InMemoryObjectManager::new());
        let store: Arc<dyn StoreOperator> = Arc::new(InMemoryStoreOperator::new());
        DeltaEngine::new(DeltaConfig::default(), wal, block_cache, stream_manager, object_manager, store)
    }

    fn batch(stream: u64, base: u64, count: u32) -> StreamRecordBatch {
        StreamRecordBatch::new(StreamId::new(stream), 1, base, count, RefCountedBytes::new(vec![0u8; 16]))
    }

    #[tokio::test]
    async fn single_stream_in_order_round_trips() {
        let engine = engine();
        engine.startup().await.unwrap();

        engine.append(batch(7, 0, 5)).await.unwrap();
        engine.append(batch(7, 5, 5)).await.unwrap();
        engine.append(batch(7, 10, 5)).await.unwrap();

        let result = engine
            .read(StreamId::new(7), 0, 15, 1_000_000, ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(result.records.len(), 3);
        assert_eq!(result.access_type, AccessType::CacheHit);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn fast_read_miss_fails_fast() {
        let engine = engine();
        engine.startup().await.unwrap();

        let result = engine
            .read(StreamId::new(7), 0, 15, 1_000_000, ReadOptions { fast_read: true })
            .await;
        assert!(matches!(result, Err(DeltaError::FastReadFailFast)));

        engine.shutdown().await.unwrap();
    }
}
