//! The committed-object block cache collaborator, consulted on a
//! `LogCache` miss. Out of scope per `spec.md` §1/§6 — only the
//! interface and an in-memory reference implementation live here.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::ids::StreamId;
use crate::record::StreamRecordBatch;

/// How a read was satisfied, reported back to the facade caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessType {
    /// Satisfied entirely from the in-memory log cache.
    CacheHit,
    /// Required a round trip to the block cache.
    BlockCacheRead,
}

/// Result of a `BlockCache::read` call.
#[derive(Clone, Debug)]
pub struct BlockCacheReadResult {
    /// Records found, in offset order.
    pub records: Vec<StreamRecordBatch>,
    /// How the read was satisfied.
    pub access_type: AccessType,
}

/// Reads ranges out of already-committed stream-set objects. The log
/// cache only holds records not yet uploaded; anything older comes
/// from here.
#[async_trait]
pub trait BlockCache: Send + Sync {
    /// Reads `[start, end)` for `stream_id`, up to `max_bytes`.
    async fn read(
        &self,
        stream_id: StreamId,
        start: u64,
        end: u64,
        max_bytes: u64,
    ) -> Result<BlockCacheReadResult>;
}

/// In-memory `BlockCache` seeded with committed records for tests
/// (e.g. scenario S5/S6's pre-existing committed prefix).
pub struct InMemoryBlockCache {
    records: Mutex<HashMap<u64, Vec<StreamRecordBatch>>>,
}

impl InMemoryBlockCache {
    /// Creates an empty block cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Seeds committed records for a stream, in offset order.
    pub fn seed(&self, stream_id: StreamId, records: Vec<StreamRecordBatch>) {
        self.records.lock().insert(stream_id.value(), records);
    }
}

impl Default for InMemoryBlockCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockCache for InMemoryBlockCache {
    async fn read(
        &self,
        stream_id: StreamId,
        start: u64,
        end: u64,
        max_bytes: u64,
    ) -> Result<BlockCacheReadResult> {
        let guard = self.records.lock();
        let mut out = Vec::new();
        let mut cumulative = 0u64;
        if let Some(records) = guard.get(&stream_id.value()) {
            for record in records {
                if record.last_offset() <= start || record.base_offset >= end {
                    continue;
                }
                if cumulative >= max_bytes {
                    break;
                }
                cumulative += record.size();
                out.push(record.clone());
            }
        }
        Ok(BlockCacheReadResult {
            records: out,
            access_type: AccessType::BlockCacheRead,
        })
    }
}

/// A block cache that never has anything committed; used when a test
/// wants every read to fail through to the log-cache-only path.
pub struct EmptyBlockCache;

#[async_trait]
impl BlockCache for EmptyBlockCache {
    async fn read(
        &self,
        _stream_id: StreamId,
        _start: u64,
        _end: u64,
        _max_bytes: u64,
    ) -> Result<BlockCacheReadResult> {
        Ok(BlockCacheReadResult {
            records: Vec::new(),
            access_type: AccessType::BlockCacheRead,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RefCountedBytes;

    fn batch(stream: u64, base: u64, count: u32) -> StreamRecordBatch {
        StreamRecordBatch::new(StreamId::new(stream), 1, base, count, RefCountedBytes::new(vec![0u8; 4]))
    }

    #[tokio::test]
    async fn read_returns_records_intersecting_range() {
        let cache = InMemoryBlockCache::new();
        cache.seed(StreamId::new(7), vec![batch(7, 0, 5), batch(7, 5, 5)]);

        let result = cache.read(StreamId::new(7), 0, 10, 1_000_000).await.unwrap();
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.access_type, AccessType::BlockCacheRead);
    }

    #[tokio::test]
    async fn empty_block_cache_always_returns_nothing() {
        let cache = EmptyBlockCache;
        let result = cache.read(StreamId::new(7), 0, 10, 1_000_000).await.unwrap();
        assert!(result.records.is_empty());
    }
}
