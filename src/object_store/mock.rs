//! In-memory `ObjectManager` / `StoreOperator` reference implementations.
//!
//! Grounded in the teacher's `MockS3ObjectStore`: deterministic,
//! pre-programmed failure sequences plus an inspectable call history,
//! so tests can assert both outcomes (did `forceUpload` see a
//! `PersistFailure`?) and behavior (did the pipeline retry, did it
//! stop issuing commits after one failed?).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{ObjectManager, StoreOperator};
use crate::error::{DeltaError, Result};
use crate::ids::ObjectId;

/// A single pre-programmed outcome for the next call to a mock
/// collaborator method.
#[derive(Clone, Debug)]
pub enum MockFailure {
    /// Let the call succeed.
    Ok,
    /// Fail the call with the given message.
    Fail(String),
}

/// In-memory `ObjectManager`. Assigns strictly increasing object ids
/// and records commits for assertions; an optional queue of
/// [`MockFailure`] lets a test inject failures on specific calls.
pub struct InMemoryObjectManager {
    next_id: AtomicU64,
    prepare_failures: Mutex<VecDeque<MockFailure>>,
    commit_failures: Mutex<VecDeque<MockFailure>>,
    committed: Mutex<Vec<(ObjectId, u64)>>,
    call_history: Mutex<Vec<String>>,
}

impl InMemoryObjectManager {
    /// Creates a manager with no injected failures.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            prepare_failures: Mutex::new(VecDeque::new()),
            commit_failures: Mutex::new(VecDeque::new()),
            committed: Mutex::new(Vec::new()),
            call_history: Mutex::new(Vec::new()),
        }
    }

    /// Queues a failure to be returned by the next `commit_object`
    /// call, regardless of which object it targets.
    pub fn queue_commit_failure(&self, message: impl Into<String>) {
        self.commit_failures.lock().push_back(MockFailure::Fail(message.into()));
    }

    /// Queues a failure to be returned by the next `prepare_object` call.
    pub fn queue_prepare_failure(&self, message: impl Into<String>) {
        self.prepare_failures.lock().push_back(MockFailure::Fail(message.into()));
    }

    /// Object ids committed so far, in commit order.
    #[must_use]
    pub fn committed_ids(&self) -> Vec<ObjectId> {
        self.committed.lock().iter().map(|(id, _)| *id).collect()
    }

    /// Full call history, for assertions about call ordering.
    #[must_use]
    pub fn call_history(&self) -> Vec<String> {
        self.call_history.lock().clone()
    }
}

impl Default for InMemoryObjectManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectManager for InMemoryObjectManager {
    async fn prepare_object(&self) -> Result<ObjectId> {
        if let Some(MockFailure::Fail(msg)) = self.prepare_failures.lock().pop_front() {
            self.call_history.lock().push(format!("prepare_object -> err({msg})"));
            return Err(DeltaError::PersistFailure(msg));
        }
        let id = ObjectId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.call_history.lock().push(format!("prepare_object -> {id}"));
        Ok(id)
    }

    async fn commit_object(&self, object_id: ObjectId, size_bytes: u64) -> Result<()> {
        if let Some(MockFailure::Fail(msg)) = self.commit_failures.lock().pop_front() {
            self.call_history.lock().push(format!("commit_object({object_id}) -> err({msg})"));
            return Err(DeltaError::CommitFailure(msg));
        }
        self.committed.lock().push((object_id, size_bytes));
        self.call_history.lock().push(format!("commit_object({object_id})"));
        Ok(())
    }
}

/// In-memory `StoreOperator`. Stores whole objects in a map keyed by
/// `ObjectId`; an optional queue of [`MockFailure`] lets a test inject
/// failures on `put`.
pub struct InMemoryStoreOperator {
    objects: Mutex<HashMap<u64, Bytes>>,
    put_failures: Mutex<VecDeque<MockFailure>>,
    call_history: Mutex<Vec<String>>,
}

impl InMemoryStoreOperator {
    /// Creates a store with no injected failures.
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            put_failures: Mutex::new(VecDeque::new()),
            call_history: Mutex::new(Vec::new()),
        }
    }

    /// Queues a failure to be returned by the next `put` call.
    pub fn queue_put_failure(&self, message: impl Into<String>) {
        self.put_failures.lock().push_back(MockFailure::Fail(message.into()));
    }

    /// Full call history, for assertions about call ordering.
    #[must_use]
    pub fn call_history(&self) -> Vec<String> {
        self.call_history.lock().clone()
    }
}

impl Default for InMemoryStoreOperator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreOperator for InMemoryStoreOperator {
    async fn put(&self, object_id: ObjectId, bytes: Bytes) -> Result<()> {
        if let Some(MockFailure::Fail(msg)) = self.put_failures.lock().pop_front() {
            self.call_history.lock().push(format!("put({object_id}) -> err({msg})"));
            return Err(DeltaError::PersistFailure(msg));
        }
        self.call_history.lock().push(format!("put({object_id}, {} bytes)", bytes.len()));
        self.objects.lock().insert(object_id.value(), bytes);
        Ok(())
    }

    async fn range_read(&self, object_id: ObjectId, start: u64, end: u64) -> Result<Bytes> {
        let objects = self.objects.lock();
        let bytes = objects.get(&object_id.value()).ok_or_else(|| DeltaError::NotFound {
            entity: "object",
            id: object_id.to_string(),
        })?;
        let start = start as usize;
        let end = (end as usize).min(bytes.len());
        if start > end {
            return Ok(Bytes::new());
        }
        Ok(bytes.slice(start..end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prepare_assigns_monotone_ids() {
        let mgr = InMemoryObjectManager::new();
        let a = mgr.prepare_object().await.unwrap();
        let b = mgr.prepare_object().await.unwrap();
        assert!(b.value() > a.value());
    }

    #[tokio::test]
    async fn queued_commit_failure_is_returned_once() {
        let mgr = InMemoryObjectManager::new();
        let id = mgr.prepare_object().await.unwrap();
        mgr.queue_commit_failure("disk full");
        assert!(mgr.commit_object(id, 10).await.is_err());
        assert!(mgr.commit_object(id, 10).await.is_ok());
        assert_eq!(mgr.committed_ids(), vec![id]);
    }

    #[tokio::test]
    async fn put_then_range_read_roundtrips() {
        let store = InMemoryStoreOperator::new();
        let id = ObjectId::new(1);
        store.put(id, Bytes::from_static(&[1, 2, 3, 4, 5])).await.unwrap();
        let slice = store.range_read(id, 1, 4).await.unwrap();
        assert_eq!(&slice[..], &[2, 3, 4]);
    }

    #[tokio::test]
    async fn range_read_on_missing_object_is_not_found() {
        let store = InMemoryStoreOperator::new();
        assert!(store.range_read(ObjectId::new(99), 0, 1).await.is_err());
    }
}
