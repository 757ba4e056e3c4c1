//! Checkpoint storage port.
//!
//! The rollback manager keeps its own in-memory checkpoint list; a storage
//! backend is an optional mirror for checkpoints that must survive a
//! restart. `InMemoryCheckpointStorage` is the reference implementation;
//! `taskflow-infra` provides a file-backed one.
//!
//! Same shape as the agent dispatch port: `CheckpointStorage` for
//! implementors, `CheckpointStorageDyn` as the object-safe twin, and
//! `BoxCheckpointStorage` for storage inside the manager.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use taskflow_types::error::StorageError;
use taskflow_types::rollback::Checkpoint;
use uuid::Uuid;

type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Persistence for checkpoints, keyed by checkpoint ID and grouped by
/// workflow instance.
pub trait CheckpointStorage: Send + Sync + 'static {
    /// Insert or overwrite a checkpoint.
    fn save(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn get(
        &self,
        checkpoint_id: Uuid,
    ) -> impl Future<Output = Result<Option<Checkpoint>, StorageError>> + Send;

    /// Every checkpoint of one instance, oldest first.
    fn get_all_for_workflow(
        &self,
        instance_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Checkpoint>, StorageError>> + Send;

    /// Returns whether a checkpoint was removed.
    fn delete(
        &self,
        checkpoint_id: Uuid,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send;

    /// Returns the number of checkpoints removed.
    fn delete_all_for_workflow(
        &self,
        instance_id: Uuid,
    ) -> impl Future<Output = Result<usize, StorageError>> + Send;

    fn get_latest(
        &self,
        instance_id: Uuid,
    ) -> impl Future<Output = Result<Option<Checkpoint>, StorageError>> + Send;

    fn count(
        &self,
        instance_id: Uuid,
    ) -> impl Future<Output = Result<usize, StorageError>> + Send;
}

/// Object-safe version of [`CheckpointStorage`].
pub trait CheckpointStorageDyn: Send + Sync {
    fn save_boxed<'a>(&'a self, checkpoint: &'a Checkpoint) -> StorageFuture<'a, ()>;
    fn get_boxed(&self, checkpoint_id: Uuid) -> StorageFuture<'_, Option<Checkpoint>>;
    fn get_all_for_workflow_boxed(&self, instance_id: Uuid) -> StorageFuture<'_, Vec<Checkpoint>>;
    fn delete_boxed(&self, checkpoint_id: Uuid) -> StorageFuture<'_, bool>;
    fn delete_all_for_workflow_boxed(&self, instance_id: Uuid) -> StorageFuture<'_, usize>;
    fn get_latest_boxed(&self, instance_id: Uuid) -> StorageFuture<'_, Option<Checkpoint>>;
    fn count_boxed(&self, instance_id: Uuid) -> StorageFuture<'_, usize>;
}

impl<T: CheckpointStorage> CheckpointStorageDyn for T {
    fn save_boxed<'a>(&'a self, checkpoint: &'a Checkpoint) -> StorageFuture<'a, ()> {
        Box::pin(self.save(checkpoint))
    }

    fn get_boxed(&self, checkpoint_id: Uuid) -> StorageFuture<'_, Option<Checkpoint>> {
        Box::pin(self.get(checkpoint_id))
    }

    fn get_all_for_workflow_boxed(&self, instance_id: Uuid) -> StorageFuture<'_, Vec<Checkpoint>> {
        Box::pin(self.get_all_for_workflow(instance_id))
    }

    fn delete_boxed(&self, checkpoint_id: Uuid) -> StorageFuture<'_, bool> {
        Box::pin(self.delete(checkpoint_id))
    }

    fn delete_all_for_workflow_boxed(&self, instance_id: Uuid) -> StorageFuture<'_, usize> {
        Box::pin(self.delete_all_for_workflow(instance_id))
    }

    fn get_latest_boxed(&self, instance_id: Uuid) -> StorageFuture<'_, Option<Checkpoint>> {
        Box::pin(self.get_latest(instance_id))
    }

    fn count_boxed(&self, instance_id: Uuid) -> StorageFuture<'_, usize> {
        Box::pin(self.count(instance_id))
    }
}

/// Type-erased, cheaply cloneable checkpoint storage.
#[derive(Clone)]
pub struct BoxCheckpointStorage {
    inner: Arc<dyn CheckpointStorageDyn>,
}

impl BoxCheckpointStorage {
    pub fn new<T: CheckpointStorage>(storage: T) -> Self {
        Self {
            inner: Arc::new(storage),
        }
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.inner.save_boxed(checkpoint).await
    }

    pub async fn get(&self, checkpoint_id: Uuid) -> Result<Option<Checkpoint>, StorageError> {
        self.inner.get_boxed(checkpoint_id).await
    }

    pub async fn get_all_for_workflow(&self, instance_id: Uuid) -> Result<Vec<Checkpoint>, StorageError> {
        self.inner.get_all_for_workflow_boxed(instance_id).await
    }

    pub async fn delete(&self, checkpoint_id: Uuid) -> Result<bool, StorageError> {
        self.inner.delete_boxed(checkpoint_id).await
    }

    pub async fn delete_all_for_workflow(&self, instance_id: Uuid) -> Result<usize, StorageError> {
        self.inner.delete_all_for_workflow_boxed(instance_id).await
    }

    pub async fn get_latest(&self, instance_id: Uuid) -> Result<Option<Checkpoint>, StorageError> {
        self.inner.get_latest_boxed(instance_id).await
    }

    pub async fn count(&self, instance_id: Uuid) -> Result<usize, StorageError> {
        self.inner.count_boxed(instance_id).await
    }
}

impl std::fmt::Debug for BoxCheckpointStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCheckpointStorage").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// InMemoryCheckpointStorage
// ---------------------------------------------------------------------------

/// Process-local storage. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStorage {
    checkpoints: Arc<RwLock<HashMap<Uuid, Checkpoint>>>,
}

impl InMemoryCheckpointStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn for_instance(&self, instance_id: Uuid) -> Vec<Checkpoint> {
        let map = self.checkpoints.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<Checkpoint> = map
            .values()
            .filter(|c| c.instance_id == instance_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        found
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Checkpoint>> {
        self.checkpoints.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CheckpointStorage for InMemoryCheckpointStorage {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.write().insert(checkpoint.id, checkpoint.clone());
        Ok(())
    }

    async fn get(&self, checkpoint_id: Uuid) -> Result<Option<Checkpoint>, StorageError> {
        let map = self.checkpoints.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(&checkpoint_id).cloned())
    }

    async fn get_all_for_workflow(&self, instance_id: Uuid) -> Result<Vec<Checkpoint>, StorageError> {
        Ok(self.for_instance(instance_id))
    }

    async fn delete(&self, checkpoint_id: Uuid) -> Result<bool, StorageError> {
        Ok(self.write().remove(&checkpoint_id).is_some())
    }

    async fn delete_all_for_workflow(&self, instance_id: Uuid) -> Result<usize, StorageError> {
        let mut map = self.write();
        let before = map.len();
        map.retain(|_, c| c.instance_id != instance_id);
        Ok(before - map.len())
    }

    async fn get_latest(&self, instance_id: Uuid) -> Result<Option<Checkpoint>, StorageError> {
        Ok(self.for_instance(instance_id).pop())
    }

    async fn count(&self, instance_id: Uuid) -> Result<usize, StorageError> {
        Ok(self.for_instance(instance_id).len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use taskflow_types::rollback::{CheckpointType, WorkflowStateSnapshot};

    fn checkpoint(instance_id: Uuid, offset_secs: i64) -> Checkpoint {
        Checkpoint {
            id: Uuid::now_v7(),
            instance_id,
            checkpoint_type: CheckpointType::Auto,
            state: WorkflowStateSnapshot::new("wf", instance_id),
            created_at: Utc::now() + Duration::seconds(offset_secs),
            name: None,
            description: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn in_memory_groups_by_instance() {
        let storage = BoxCheckpointStorage::new(InMemoryCheckpointStorage::new());
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let first = checkpoint(a, 0);
        let second = checkpoint(a, 5);
        let other = checkpoint(b, 1);
        for c in [&second, &first, &other] {
            storage.save(c).await.unwrap();
        }

        assert_eq!(storage.count(a).await.unwrap(), 2);
        let all: Vec<Uuid> = storage
            .get_all_for_workflow(a)
            .await
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(all, vec![first.id, second.id]);
        assert_eq!(storage.get_latest(a).await.unwrap().unwrap().id, second.id);
        assert_eq!(storage.get(other.id).await.unwrap().unwrap().instance_id, b);

        assert!(storage.delete(first.id).await.unwrap());
        assert!(!storage.delete(first.id).await.unwrap());
        assert_eq!(storage.delete_all_for_workflow(a).await.unwrap(), 1);
        assert_eq!(storage.count(a).await.unwrap(), 0);
        assert_eq!(storage.count(b).await.unwrap(), 1);
        assert!(storage.get_latest(a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let storage = InMemoryCheckpointStorage::new();
        let clone = storage.clone();
        let id = Uuid::now_v7();
        storage.save(&checkpoint(id, 0)).await.unwrap();
        assert_eq!(clone.count(id).await.unwrap(), 1);
    }
}
