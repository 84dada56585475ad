use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::engine::{
    ResourceState, StorageBatch, StorageError, StoredResource, TransactionalStorage,
};

/// File-backed [`TransactionalStorage`]; one JSON document per resource.
///
/// Each store writes the whole document to a temporary file and renames it
/// over the previous one, so a batch is either fully visible or not at all.
pub struct OnDiskStorage<S> {
    data_file: PathBuf,
    stored: RwLock<StoredResource<S>>,
}

impl<S: ResourceState> OnDiskStorage<S> {
    /// Open `{dir}/{service_name}/{storage_name}.json`, creating it if missing.
    pub fn open(
        dir: impl AsRef<Path>,
        storage_name: &str,
        service_name: &str,
    ) -> Result<Self, StorageError> {
        let dir = dir.as_ref().join(file_component(service_name));
        fs::create_dir_all(&dir).map_err(to_io_error)?;
        let data_file = dir.join(format!("{}.json", file_component(storage_name)));
        let stored = if data_file.exists() {
            let bytes = fs::read(&data_file).map_err(to_io_error)?;
            serde_json::from_slice(&bytes).map_err(to_corrupted)?
        } else {
            StoredResource::default()
        };

        Ok(Self {
            data_file,
            stored: RwLock::new(stored),
        })
    }

    pub fn path(&self) -> &Path {
        &self.data_file
    }

    fn persist(&self, stored: &StoredResource<S>) -> Result<(), StorageError> {
        let serialized = serde_json::to_vec(stored).map_err(to_corrupted)?;
        let tmp = self.data_file.with_extension("tmp");
        fs::write(&tmp, serialized).map_err(to_io_error)?;
        fs::rename(tmp, &self.data_file).map_err(to_io_error)?;
        Ok(())
    }
}

#[async_trait]
impl<S: ResourceState> TransactionalStorage<S> for OnDiskStorage<S> {
    async fn load(&self) -> Result<StoredResource<S>, StorageError> {
        Ok(self.stored.read().await.clone())
    }

    async fn store(&self, batch: StorageBatch<S>) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut stored = self.stored.write().await;
        let mut next = stored.clone();
        next.apply(batch);
        self.persist(&next)?;
        *stored = next;
        Ok(())
    }
}

fn file_component(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn to_io_error(err: impl ToString) -> StorageError {
    StorageError::Io(err.to_string())
}

fn to_corrupted(err: impl ToString) -> StorageError {
    StorageError::CorruptedState(err.to_string())
}
