//! `LogCache` — the tiered in-memory buffer organized as an active
//! block plus zero or more archived blocks (`spec.md` §3, §4.1).

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::ids::{StreamId, StreamScope};
use crate::record::StreamRecordBatch;

/// An immutable (once archived) or currently-open (while active) group
/// of records from possibly many streams, produced by one "archive"
/// operation.
#[derive(Clone, Debug)]
pub struct LogCacheBlock {
    /// Monotone block identifier.
    pub id: u64,
    /// Creation timestamp in epoch milliseconds.
    pub created_at_millis: i64,
    /// Sum of encoded record sizes currently held.
    pub size_bytes: u64,
    /// Greatest WAL offset such that every record in this block with a
    /// lower offset is known-durable; `-1` if never set.
    pub confirm_offset: i64,
    records_by_stream: HashMap<u64, Vec<StreamRecordBatch>>,
}

impl LogCacheBlock {
    fn new(id: u64, confirm_offset: i64) -> Self {
        Self {
            id,
            created_at_millis: chrono::Utc::now().timestamp_millis(),
            size_bytes: 0,
            confirm_offset,
            records_by_stream: HashMap::new(),
        }
    }

    /// Records held for `stream_id`, in offset order, if any.
    #[must_use]
    pub fn records_for(&self, stream_id: StreamId) -> Option<&[StreamRecordBatch]> {
        self.records_by_stream.get(&stream_id.value()).map(Vec::as_slice)
    }

    /// Number of distinct streams represented in this block.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.records_by_stream.len()
    }

    /// Every stream id represented in this block.
    #[must_use]
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.records_by_stream.keys().map(|v| StreamId::new(*v)).collect()
    }

    /// True iff this block holds any record for `stream_id`.
    #[must_use]
    pub fn contains_stream(&self, stream_id: StreamId) -> bool {
        self.records_by_stream
            .get(&stream_id.value())
            .is_some_and(|v| !v.is_empty())
    }

    /// True iff this block holds no records for any stream.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records_by_stream.values().all(Vec::is_empty)
    }
}

struct LogCacheState {
    next_block_id: u64,
    active: LogCacheBlock,
    /// Archive order == upload-commit order; readers scan this, then
    /// `active`, in this order (`spec.md` §3, LogCache invariants).
    archived: Vec<LogCacheBlock>,
}

/// Size-bounded tiered in-memory buffer of not-yet-uploaded records.
pub struct LogCache {
    capacity_bytes: u64,
    block_threshold_bytes: u64,
    max_streams_per_block: usize,
    state: Mutex<LogCacheState>,
}

impl LogCache {
    /// Creates an empty cache with the given bounds.
    #[must_use]
    pub fn new(capacity_bytes: u64, block_threshold_bytes: u64, max_streams_per_block: usize) -> Self {
        Self {
            capacity_bytes,
            block_threshold_bytes,
            max_streams_per_block,
            state: Mutex::new(LogCacheState {
                next_block_id: 1,
                active: LogCacheBlock::new(0, -1),
                archived: Vec::new(),
            }),
        }
    }

    /// Total capacity this cache was configured with.
    #[must_use]
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Appends `record` to the active block. Returns `true` if the
    /// active block has now crossed `blockThresholdBytes` or
    /// `maxStreamsPerBlock`, signaling the caller should archive.
    /// Never fails (the only failure mode, allocator OOM, is handled by
    /// the allocator's own `forceFree` callback, not by `put`).
    pub fn put(&self, record: StreamRecordBatch) -> bool {
        let mut state = self.state.lock();
        let size = record.size();
        let stream_key = record.stream_id.value();
        state.active.records_by_stream.entry(stream_key).or_default().push(record);
        state.active.size_bytes += size;
        state.active.size_bytes >= self.block_threshold_bytes
            || state.active.records_by_stream.len() > self.max_streams_per_block
    }

    /// Seals the active block and replaces it with a fresh one
    /// inheriting the running confirm offset, iff the active block is
    /// non-empty and `scope` selects it (a specific stream it contains,
    /// or [`StreamScope::All`]).
    pub fn archive_current_block_if_contains(&self, scope: StreamScope) -> Option<LogCacheBlock> {
        let mut state = self.state.lock();
        if state.active.is_empty() {
            return None;
        }
        let matches = match scope {
            StreamScope::All => true,
            StreamScope::One(id) => state.active.contains_stream(id),
        };
        if !matches {
            return None;
        }
        let next_id = state.next_block_id;
        state.next_block_id += 1;
        let confirm_offset = state.active.confirm_offset;
        let sealed = std::mem::replace(&mut state.active, LogCacheBlock::new(next_id, confirm_offset));
        state.archived.push(sealed.clone());
        Some(sealed)
    }

    /// Sets the active block's confirm offset. Caller is responsible
    /// for monotonicity; this clamps to never regress.
    pub fn set_confirm_offset(&self, offset: i64) {
        let mut state = self.state.lock();
        if offset > state.active.confirm_offset {
            state.active.confirm_offset = offset;
        }
    }

    /// Scans archived blocks in commit order then the active block,
    /// returning the contiguous run of `stream_id`'s records
    /// intersecting `[start, end)`, up to `max_bytes`. The run need not
    /// itself begin at `start` — the caller (see `DeltaEngine::read`)
    /// treats `out[0].base_offset <= start` as the cache-hit condition
    /// and otherwise uses whatever prefix is returned here to bound a
    /// block-cache fetch for the rest.
    #[must_use]
    pub fn get(&self, stream_id: StreamId, start: u64, end: u64, max_bytes: u64) -> Vec<StreamRecordBatch> {
        let state = self.state.lock();
        let mut out = Vec::new();
        let mut cumulative = 0u64;
        let mut next_expected: Option<u64> = None;

        'blocks: for block in state.archived.iter().chain(std::iter::once(&state.active)) {
            let Some(records) = block.records_by_stream.get(&stream_id.value()) else {
                continue;
            };
            for record in records {
                if record.base_offset >= end {
                    break 'blocks;
                }
                if record.last_offset() <= start {
                    continue;
                }
                if let Some(expected) = next_expected {
                    if record.base_offset != expected {
                        break 'blocks;
                    }
                }
                if cumulative >= max_bytes {
                    break 'blocks;
                }
                cumulative += record.size();
                next_expected = Some(record.last_offset());
                out.push(record.clone());
            }
        }
        out
    }

    /// True iff any non-free block holds a record for `stream_id`.
    #[must_use]
    pub fn contains_stream(&self, stream_id: StreamId) -> bool {
        let state = self.state.lock();
        state.active.contains_stream(stream_id)
            || state.archived.iter().any(|b| b.contains_stream(stream_id))
    }

    /// Releases every record in the block with id `block_id` and
    /// removes it from the archived list. A no-op if the block was
    /// already freed or never existed.
    pub fn mark_free(&self, block_id: u64) {
        let mut state = self.state.lock();
        state.archived.retain(|b| b.id != block_id);
    }

    /// Frees archived blocks starting from the oldest, up to the
    /// requested amount, returning bytes actually released. Invoked by
    /// the allocator's OOM handler; only ever touches archived (not
    /// active) blocks, since the active block may still be growing.
    pub fn force_free(&self, bytes_needed: u64) -> u64 {
        let mut state = self.state.lock();
        let mut released = 0u64;
        while released < bytes_needed {
            let Some(oldest) = state.archived.first() else {
                break;
            };
            released += oldest.size_bytes;
            state.archived.remove(0);
        }
        released
    }

    /// Sum of `sizeBytes` over every non-free block.
    #[must_use]
    pub fn size(&self) -> u64 {
        let state = self.state.lock();
        state.active.size_bytes + state.archived.iter().map(|b| b.size_bytes).sum::<u64>()
    }
}
