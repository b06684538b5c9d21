//! The stream/object metadata service collaborator. Out of scope per
//! `spec.md` §1/§6 — only the interface Recovery needs and an
//! in-memory reference implementation live here.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::ids::StreamId;

/// A stream open for append at engine startup, with the offset the
/// metadata service has already durably committed for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpeningStream {
    /// Stream identifier.
    pub stream_id: StreamId,
    /// Greatest offset already committed to the object store for this
    /// stream, before WAL replay.
    pub end_offset: u64,
}

/// Allocates and tracks which streams are open for append, and their
/// committed end offsets; consulted only during [`crate::recovery`].
#[async_trait]
pub trait StreamManager: Send + Sync {
    /// Every stream open for append at startup, with its committed end
    /// offset.
    async fn get_opening_streams(&self) -> Result<Vec<OpeningStream>>;

    /// Marks a stream closed at `epoch`, recording its new end offset.
    async fn close_stream(&self, stream_id: StreamId, epoch: u64, end_offset: u64) -> Result<()>;
}

/// In-memory `StreamManager` seeded with a fixed opening-stream set.
pub struct InMemoryStreamManager {
    opening: Mutex<HashMap<u64, OpeningStream>>,
    closed: Mutex<Vec<(StreamId, u64, u64)>>,
}

impl InMemoryStreamManager {
    /// Creates a manager with the given opening streams.
    #[must_use]
    pub fn new(opening: Vec<OpeningStream>) -> Self {
        Self {
            opening: Mutex::new(opening.into_iter().map(|s| (s.stream_id.value(), s)).collect()),
            closed: Mutex::new(Vec::new()),
        }
    }

    /// `(streamId, epoch, endOffset)` triples passed to `close_stream`,
    /// in call order.
    #[must_use]
    pub fn closed_streams(&self) -> Vec<(StreamId, u64, u64)> {
        self.closed.lock().clone()
    }
}

#[async_trait]
impl StreamManager for InMemoryStreamManager {
    async fn get_opening_streams(&self) -> Result<Vec<OpeningStream>> {
        Ok(self.opening.lock().values().copied().collect())
    }

    async fn close_stream(&self, stream_id: StreamId, epoch: u64, end_offset: u64) -> Result<()> {
        self.closed.lock().push((stream_id, epoch, end_offset));
        self.opening.lock().remove(&stream_id.value());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_seeded_opening_streams() {
        let mgr = InMemoryStreamManager::new(vec![OpeningStream {
            stream_id: StreamId::new(7),
            end_offset: 10,
        }]);
        let opening = mgr.get_opening_streams().await.unwrap();
        assert_eq!(opening.len(), 1);
        assert_eq!(opening[0].end_offset, 10);
    }

    #[tokio::test]
    async fn close_stream_removes_it_from_opening_set() {
        let mgr = InMemoryStreamManager::new(vec![OpeningStream {
            stream_id: StreamId::new(7),
            end_offset: 10,
        }]);
        mgr.close_stream(StreamId::new(7), 1, 20).await.unwrap();
        assert!(mgr.get_opening_streams().await.unwrap().is_empty());
        assert_eq!(mgr.closed_streams(), vec![(StreamId::new(7), 1, 20)]);
    }
}
