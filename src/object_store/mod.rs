//! Object-store-side collaborators: `ObjectManager` (id allocation and
//! commit against the stream/object metadata service) and
//! `StoreOperator` (the object store's put/range-read surface). Both
//! are out of scope per `spec.md` §1/§6 — only the interfaces and an
//! in-memory reference implementation live here.

mod mock;

pub use mock::{InMemoryObjectManager, InMemoryStoreOperator};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::ids::ObjectId;

/// Allocates object ids at the `prepare` stage of an upload and commits
/// them at the `commit` stage, making the object visible to readers.
/// Ids MUST be assignable in the order `prepare_object` is called so
/// that the upload pipeline's archive-ordered commit stage produces a
/// monotone committed sequence (`spec.md` §4.6, invariant 5).
#[async_trait]
pub trait ObjectManager: Send + Sync {
    /// Allocates a fresh object id for an about-to-be-uploaded block.
    async fn prepare_object(&self) -> Result<ObjectId>;

    /// Commits a previously prepared object, recording its final size.
    /// Once this returns ok, the object is visible to readers and the
    /// WAL offsets it covers may be trimmed.
    async fn commit_object(&self, object_id: ObjectId, size_bytes: u64) -> Result<()>;
}

/// The object store's data-plane surface: writing a whole object and
/// reading a byte range back out of one.
#[async_trait]
pub trait StoreOperator: Send + Sync {
    /// Writes the full byte contents of `object_id`. Called once, after
    /// `prepare_object` and before `commit_object`.
    async fn put(&self, object_id: ObjectId, bytes: Bytes) -> Result<()>;

    /// Reads `[start, end)` bytes back out of a committed object.
    async fn range_read(&self, object_id: ObjectId, start: u64, end: u64) -> Result<Bytes>;
}
