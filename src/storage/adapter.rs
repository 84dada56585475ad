use async_trait::async_trait;

use crate::config::{StorageBackend, StorageConfig};

use super::disk::OnDiskStorage;
use super::engine::{
    ResourceState, StorageBatch, StorageError, StoredResource, TransactionalStorage,
};
use super::memory::InMemoryStorage;

/// Runtime-selectable storage so hosts can switch between memory and disk.
pub enum StorageAdapter<S> {
    Memory(InMemoryStorage<S>),
    Disk(OnDiskStorage<S>),
}

impl<S: ResourceState> StorageAdapter<S> {
    pub fn memory() -> Self {
        Self::Memory(InMemoryStorage::new())
    }

    pub fn disk(
        dir: impl AsRef<std::path::Path>,
        storage_name: &str,
        service_name: &str,
    ) -> Result<Self, StorageError> {
        Ok(Self::Disk(OnDiskStorage::open(dir, storage_name, service_name)?))
    }

    /// Storage factory: one storage per `(storage_name, service_name)` pair.
    pub fn create(
        config: &StorageConfig,
        storage_name: &str,
        service_name: &str,
    ) -> Result<Self, StorageError> {
        match config.backend {
            StorageBackend::Memory => Ok(Self::memory()),
            StorageBackend::Disk => {
                let path = config.path.as_ref().ok_or_else(|| {
                    StorageError::Misconfigured("disk storage requires a path".into())
                })?;
                Self::disk(path, storage_name, service_name)
            }
        }
    }
}

#[async_trait]
impl<S: ResourceState> TransactionalStorage<S> for StorageAdapter<S> {
    async fn load(&self) -> Result<StoredResource<S>, StorageError> {
        match self {
            StorageAdapter::Memory(inner) => inner.load().await,
            StorageAdapter::Disk(inner) => inner.load().await,
        }
    }

    async fn store(&self, batch: StorageBatch<S>) -> Result<(), StorageError> {
        match self {
            StorageAdapter::Memory(inner) => inner.store(batch).await,
            StorageAdapter::Disk(inner) => inner.store(batch).await,
        }
    }
}
