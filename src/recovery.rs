//! Crash recovery — replays the WAL into a single cache block, uploads
//! it if non-empty, then resets the WAL (`spec.md` §4.8).

use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::LogCache;
use crate::error::{DeltaError, Result};
use crate::ids::StreamScope;
use crate::record::StreamRecordBatch;
use crate::stream_manager::StreamManager;
use crate::upload::UploadPipeline;
use crate::wal::Wal;

/// Replays the WAL against the metadata service's recorded end offsets
/// and rebuilds in-memory cache state for every stream still open.
///
/// # Errors
///
/// Returns [`DeltaError::RecoveryInvariant`] if the recovered prefix
/// for any opening stream does not begin exactly at its committed end
/// offset — per `spec.md` §4.8 step 5, this is a fatal invariant
/// breach and startup must abort.
pub async fn recover(
    wal: &Arc<dyn Wal>,
    stream_manager: &Arc<dyn StreamManager>,
    cache: &Arc<LogCache>,
    upload: &Arc<UploadPipeline>,
) -> Result<()> {
    wal.start().await?;

    let opening = stream_manager.get_opening_streams().await?;
    let end_offsets: HashMap<u64, u64> = opening.iter().map(|s| (s.stream_id.value(), s.end_offset)).collect();

    let recovered = wal.recover().await?;
    let mut next_expected: HashMap<u64, u64> = HashMap::new();
    let mut first_seen: HashMap<u64, u64> = HashMap::new();
    let mut last_record_offset: Option<i64> = None;
    let mut accepted = 0usize;

    for entry in recovered {
        let batch = match StreamRecordBatch::decode(&entry.bytes) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, record_offset = entry.record_offset, "failed to decode recovered WAL record, dropping");
                continue;
            }
        };
        let stream_key = batch.stream_id.value();

        let Some(&committed_end) = end_offsets.get(&stream_key) else {
            tracing::debug!(stream_id = stream_key, "dropping recovered record for a stream that is not opening");
            continue;
        };
        if batch.base_offset < committed_end {
            tracing::debug!(stream_id = stream_key, base_offset = batch.base_offset, "dropping already-committed record");
            continue;
        }

        let expected = *next_expected.get(&stream_key).unwrap_or(&batch.base_offset);
        if batch.base_offset != expected {
            tracing::error!(
                stream_id = stream_key,
                expected,
                actual = batch.base_offset,
                "gap in recovered WAL records, dropping (WAL corruption downstream of committed range)"
            );
            continue;
        }

        first_seen.entry(stream_key).or_insert(batch.base_offset);
        next_expected.insert(stream_key, batch.last_offset());
        last_record_offset = Some(last_record_offset.map_or(entry.record_offset, |m| m.max(entry.record_offset)));
        cache.put(batch);
        accepted += 1;
    }

    if accepted == 0 {
        tracing::info!("WAL recovery found nothing to replay");
        wal.reset().await?;
        return Ok(());
    }

    cache.set_confirm_offset(last_record_offset.unwrap_or(-1));

    for stream in &opening {
        if let Some(&first) = first_seen.get(&stream.stream_id.value()) {
            if first != stream.end_offset {
                return Err(DeltaError::RecoveryInvariant(format!(
                    "stream {} recovered first base offset {} does not match committed end offset {} — WAL data may be lost",
                    stream.stream_id, first, stream.end_offset
                )));
            }
        }
    }

    tracing::info!(accepted, "replaying recovered WAL block through the upload pipeline");
    upload.upload_delta_wal(StreamScope::All, true, last_record_offset.unwrap_or(-1))?;
    for ctx in upload.all_inflight() {
        ctx.await_done().await?;
    }

    wal.reset().await?;

    for stream in &opening {
        let new_end = next_expected.get(&stream.stream_id.value()).copied().unwrap_or(stream.end_offset);
        stream_manager.close_stream(stream.stream_id, 0, new_end).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::StreamId;
    use crate::object_store::{InMemoryObjectManager, InMemoryStoreOperator};
    use crate::record::RefCountedBytes;
    use crate::stream_manager::{InMemoryStreamManager, OpeningStream};
    use crate::wal::InMemoryWal;

    fn batch(stream: u64, base: u64, count: u32) -> StreamRecordBatch {
        StreamRecordBatch::new(StreamId::new(stream), 1, base, count, RefCountedBytes::new(vec![0u8; 4]))
    }

    #[tokio::test]
    async fn drops_already_committed_prefix_and_uploads_the_rest() {
        let wal = InMemoryWal::new(1_000_000);
        wal.append(batch(7, 5, 5).encode().unwrap()).await.unwrap();
        wal.append(batch(7, 10, 5).encode().unwrap()).await.unwrap();
        wal.append(batch(7, 15, 5).encode().unwrap()).await.unwrap();

        let wal: Arc<dyn Wal> = wal;
        let stream_manager: Arc<dyn StreamManager> =
            Arc::new(InMemoryStreamManager::new(vec![OpeningStream { stream_id: StreamId::new(7), end_offset: 10 }]));
        let cache = Arc::new(LogCache::new(1_000_000, 1_000_000, 128));
        let object_manager: Arc<dyn ObjectManager> = Arc::new(InMemoryObjectManager::new());
        let store: Arc<dyn StoreOperator> = Arc::new(InMemoryStoreOperator::new());
        let upload = UploadPipeline::new(cache.clone(), wal.clone(), object_manager.clone(), store.clone(), 4, Arc::new(|_: &str| {}));
        upload.start();

        recover(&wal, &stream_manager, &cache, &upload).await.unwrap();

        assert_eq!(cache.size(), 0); // uploaded and freed
        assert_eq!(wal.recover().await.unwrap().len(), 0); // reset
    }

    #[tokio::test]
    async fn mismatched_recovered_prefix_is_a_fatal_invariant_violation() {
        let wal = InMemoryWal::new(1_000_000);
        wal.append(batch(7, 20, 5).encode().unwrap()).await.unwrap();

        let wal: Arc<dyn Wal> = wal;
        let stream_manager: Arc<dyn StreamManager> =
            Arc::new(InMemoryStreamManager::new(vec![OpeningStream { stream_id: StreamId::new(7), end_offset: 10 }]));
        let cache = Arc::new(LogCache::new(1_000_000, 1_000_000, 128));
        let object_manager: Arc<dyn ObjectManager> = Arc::new(InMemoryObjectManager::new());
        let store: Arc<dyn StoreOperator> = Arc::new(InMemoryStoreOperator::new());
        let upload = UploadPipeline::new(cache.clone(), wal.clone(), object_manager.clone(), store.clone(), 4, Arc::new(|_: &str| {}));
        upload.start();

        let result = recover(&wal, &stream_manager, &cache, &upload).await;
        assert!(matches!(result, Err(DeltaError::RecoveryInvariant(_))));
    }
}
