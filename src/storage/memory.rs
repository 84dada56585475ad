use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::engine::{
    ResourceState, StorageBatch, StorageError, StoredResource, TransactionalStorage,
};

/// In-memory implementation of [`TransactionalStorage`].
///
/// Survives deactivation of the resource that uses it as long as the same
/// instance is handed back, which is how restarts are simulated in tests.
#[derive(Debug)]
pub struct InMemoryStorage<S> {
    stored: RwLock<StoredResource<S>>,
    writes: AtomicU64,
}

impl<S: ResourceState> Default for InMemoryStorage<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ResourceState> InMemoryStorage<S> {
    pub fn new() -> Self {
        Self::with_state(S::default())
    }

    pub fn with_state(state: S) -> Self {
        Self {
            stored: RwLock::new(StoredResource {
                state,
                ..StoredResource::default()
            }),
            writes: AtomicU64::new(0),
        }
    }

    /// Copy of what is currently stored.
    pub async fn snapshot(&self) -> StoredResource<S> {
        self.stored.read().await.clone()
    }

    /// Number of batches stored so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: ResourceState> TransactionalStorage<S> for InMemoryStorage<S> {
    async fn load(&self) -> Result<StoredResource<S>, StorageError> {
        Ok(self.stored.read().await.clone())
    }

    async fn store(&self, batch: StorageBatch<S>) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.stored.write().await.apply(batch);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxnId;

    #[tokio::test]
    async fn load_returns_stored_state_and_sets_the_bit() {
        let storage = InMemoryStorage::<Vec<u8>>::new();
        let txn = TxnId::for_replica(4, 11);
        storage
            .store_committed(txn, 20, b"value".to_vec())
            .await
            .unwrap();

        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded.state, b"value".to_vec());
        assert_eq!(loaded.committed_timestamp, 20);
        assert!(loaded.write_vector.contains(txn));
    }

    #[tokio::test]
    async fn empty_batches_are_not_counted() {
        let storage = InMemoryStorage::<u32>::new();
        storage.store(StorageBatch::new()).await.unwrap();
        assert_eq!(storage.write_count(), 0);
    }
}
