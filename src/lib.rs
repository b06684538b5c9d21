//! Delta WAL ingestion and upload core for a log-structured streaming
//! storage engine.
//!
//! Producers append record batches addressed by
//! `(streamId, baseOffset, lastOffset)`. Each append is durably written
//! to a WAL, buffered in an in-memory [`cache::LogCache`], and
//! periodically coalesced into stream-set objects by the
//! [`upload::UploadPipeline`], which trims the WAL once an object
//! commits. Readers served from the log cache hit hot data directly;
//! everything older is merged in from a [`block_cache::BlockCache`] of
//! already-committed objects.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │               DeltaEngine                 │
//! └──────────────────────────────────────────┘
//!   ↓            ↓              ↓           ↓
//! ┌────────┐ ┌──────────┐ ┌───────────┐ ┌─────────┐
//! │Admission│ │ LogCache │ │  Upload   │ │ Confirm │
//! │+Backoff │ │(+Sequencer)│ │ Pipeline │ │ Offset  │
//! └────────┘ └──────────┘ └───────────┘ └─────────┘
//! ```
//!
//! The WAL device, object store, stream/object metadata service, and
//! block cache are external collaborators, modeled here as traits with
//! in-memory reference implementations for tests — the crate itself
//! never assumes a concrete backend.
//!
//! # Usage
//!
//! ```rust,no_run
//! use deltawal::block_cache::EmptyBlockCache;
//! use deltawal::config::DeltaConfig;
//! use deltawal::facade::{DeltaEngine, ReadOptions};
//! use deltawal::ids::StreamId;
//! use deltawal::object_store::{InMemoryObjectManager, InMemoryStoreOperator};
//! use deltawal::record::{RefCountedBytes, StreamRecordBatch};
//! use deltawal::stream_manager::InMemoryStreamManager;
//! use deltawal::wal::InMemoryWal;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> deltawal::error::Result<()> {
//!     let engine = DeltaEngine::new(
//!         DeltaConfig::default(),
//!         InMemoryWal::new(256 * 1024 * 1024),
//!         Arc::new(EmptyBlockCache),
//!         Arc::new(InMemoryStreamManager::new(Vec::new())),
//!         Arc::new(InMemoryObjectManager::new()),
//!         Arc::new(InMemoryStoreOperator::new()),
//!     );
//!     engine.startup().await?;
//!
//!     let batch = StreamRecordBatch::new(StreamId::new(7), 1, 0, 5, RefCountedBytes::new(vec![0u8; 32]));
//!     engine.append(batch).await?;
//!
//!     let result = engine.read(StreamId::new(7), 0, 5, 1_000_000, ReadOptions::default()).await?;
//!     assert_eq!(result.records.len(), 1);
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod admission;
pub mod block_cache;
pub mod cache;
pub mod config;
pub mod confirm;
pub mod error;
pub mod facade;
pub mod ids;
pub mod object_store;
pub mod record;
pub mod recovery;
pub mod request;
pub mod sequencer;
pub mod stream_manager;
pub mod upload;
pub mod wal;

pub use config::DeltaConfig;
pub use error::{DeltaError, Result};
pub use facade::{DeltaEngine, ReadOptions, ReadResult};
pub use ids::{ObjectId, StreamId, StreamScope};
pub use record::{RefCountedBytes, StreamRecordBatch};

/// Crate version, as reported by Cargo.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
