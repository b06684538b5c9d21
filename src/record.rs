//! `RecordBatch & Codec` — the immutable unit producers append and
//! consumers read, plus its stable on-the-wire encoding.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{DeltaError, Result};
use crate::ids::StreamId;

/// A reference-counted, immutable byte buffer. Every handoff across a
/// consumer path (WAL, cache, reader result) clones this (an `Arc`
/// bump, not a copy) and every drop releases its share; `strong_count`
/// reaching 1 means only the original owner still holds it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefCountedBytes(Arc<Vec<u8>>);

impl RefCountedBytes {
    /// Wraps an owned buffer.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::new(bytes))
    }

    /// Borrows the underlying bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of live references to this buffer. Used by tests to
    /// assert that `markFree` released every record exactly once.
    #[must_use]
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl From<Vec<u8>> for RefCountedBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

/// Immutable record batch addressed by `(streamId, baseOffset,
/// lastOffset)`. The producer owns it on entry; once accepted, each
/// consumer path holds its own retain (a clone of `payload`), released
/// independently on drop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRecordBatch {
    /// Logical stream this batch belongs to.
    pub stream_id: StreamId,
    /// Epoch of the writer that produced this batch.
    pub epoch: u64,
    /// Offset of the first record in this batch.
    pub base_offset: u64,
    /// Number of logical records packed into this batch.
    pub count: u32,
    /// Opaque payload bytes.
    pub payload: RefCountedBytes,
}

/// Wire format for `StreamRecordBatch`; `payload` is a plain `Vec<u8>`
/// here because `bincode` cannot serialize through an `Arc` directly.
#[derive(Serialize, Deserialize)]
struct StreamRecordBatchWire {
    stream_id: u64,
    epoch: u64,
    base_offset: u64,
    count: u32,
    payload: Vec<u8>,
}

impl StreamRecordBatch {
    /// Constructs a batch from its fields.
    #[must_use]
    pub fn new(stream_id: StreamId, epoch: u64, base_offset: u64, count: u32, payload: RefCountedBytes) -> Self {
        Self {
            stream_id,
            epoch,
            base_offset,
            count,
            payload,
        }
    }

    /// Exclusive end of the offset range this batch covers.
    #[must_use]
    pub fn last_offset(&self) -> u64 {
        self.base_offset + u64::from(self.count)
    }

    /// Encoded byte length of this batch.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.encode().map(|b| b.len() as u64).unwrap_or(0)
    }

    /// True iff `other` begins exactly where `self` ends, i.e. the two
    /// batches are offset-contiguous within the same stream.
    #[must_use]
    pub fn is_contiguous_with(&self, other: &StreamRecordBatch) -> bool {
        self.stream_id == other.stream_id && self.last_offset() == other.base_offset
    }

    /// Encodes the batch into its stable on-the-wire representation.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = StreamRecordBatchWire {
            stream_id: self.stream_id.value(),
            epoch: self.epoch,
            base_offset: self.base_offset,
            count: self.count,
            payload: self.payload.as_slice().to_vec(),
        };
        bincode::serialize(&wire).map_err(DeltaError::from)
    }

    /// Decodes a batch previously produced by [`StreamRecordBatch::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let wire: StreamRecordBatchWire = bincode::deserialize(bytes).map_err(DeltaError::from)?;
        Ok(Self {
            stream_id: StreamId::new(wire.stream_id),
            epoch: wire.epoch,
            base_offset: wire.base_offset,
            count: wire.count,
            payload: RefCountedBytes::new(wire.payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(stream: u64, base: u64, count: u32) -> StreamRecordBatch {
        StreamRecordBatch::new(
            StreamId::new(stream),
            1,
            base,
            count,
            RefCountedBytes::new(vec![0u8; count as usize * 4]),
        )
    }

    #[test]
    fn last_offset_is_base_plus_count() {
        let b = batch(7, 10, 5);
        assert_eq!(b.last_offset(), 15);
    }

    #[test]
    fn contiguity_requires_same_stream_and_touching_offsets() {
        let a = batch(7, 0, 5);
        let b = batch(7, 5, 5);
        let c = batch(7, 6, 5);
        let d = batch(8, 5, 5);
        assert!(a.is_contiguous_with(&b));
        assert!(!a.is_contiguous_with(&c));
        assert!(!a.is_contiguous_with(&d));
    }

    #[test]
    fn encode_decode_roundtrips() {
        let original = batch(42, 100, 3);
        let encoded = original.encode().unwrap();
        let decoded = StreamRecordBatch::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn refcounted_bytes_tracks_strong_count() {
        let buf = RefCountedBytes::new(vec![1, 2, 3]);
        assert_eq!(buf.strong_count(), 1);
        let retained = buf.clone();
        assert_eq!(buf.strong_count(), 2);
        drop(retained);
        assert_eq!(buf.strong_count(), 1);
    }
}
