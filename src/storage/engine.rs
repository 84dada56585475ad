use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transaction::ParticipantId;
use crate::types::{Timestamp, TxnId};

use super::write_vector::WriteVector;

/// Errors surfaced by storage implementations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(String),
    #[error("stored resource is corrupted: {0}")]
    CorruptedState(String),
    #[error("storage misconfigured: {0}")]
    Misconfigured(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// State a transactional resource can hold.
///
/// `Clone` must be a deep copy: a writer's working copy may never share
/// mutable parts with the committed state readers see.
pub trait ResourceState:
    Clone + Default + Send + Sync + Serialize + DeserializeOwned + std::fmt::Debug + 'static
{
}

impl<T> ResourceState for T where
    T: Clone + Default + Send + Sync + Serialize + DeserializeOwned + std::fmt::Debug + 'static
{
}

/// Write persisted by a participant before it reports `Prepared`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "S: ResourceState")]
pub struct PreparedRecord<S> {
    pub txn: TxnId,
    pub timestamp: Timestamp,
    pub state: S,
    pub manager: ParticipantId,
}

/// Manager-side record of a commit whose confirms are still outstanding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub txn: TxnId,
    pub timestamp: Timestamp,
    pub participants: Vec<ParticipantId>,
}

/// Committed write of a resource's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "S: ResourceState")]
pub struct CommittedWrite<S> {
    pub txn: TxnId,
    pub timestamp: Timestamp,
    pub state: S,
}

/// Everything durably known about one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "S: ResourceState")]
pub struct StoredResource<S> {
    pub state: S,
    pub write_vector: WriteVector,
    pub committed_timestamp: Timestamp,
    pub prepared: Vec<PreparedRecord<S>>,
    pub commit_records: Vec<CommitRecord>,
}

impl<S: ResourceState> Default for StoredResource<S> {
    fn default() -> Self {
        Self {
            state: S::default(),
            write_vector: WriteVector::new(),
            committed_timestamp: 0,
            prepared: Vec::new(),
            commit_records: Vec::new(),
        }
    }
}

impl<S: ResourceState> StoredResource<S> {
    /// Apply a batch in place. A commit whose write-vector bit is already set
    /// leaves state untouched; returns whether the commit changed state.
    pub fn apply(&mut self, batch: StorageBatch<S>) -> bool {
        let mut applied = false;

        if let Some(record) = batch.prepare {
            self.prepared.retain(|existing| existing.txn != record.txn);
            self.prepared.push(record);
        }

        if let Some(commit) = batch.commit {
            self.prepared.retain(|existing| existing.txn != commit.txn);
            if self.write_vector.set(commit.txn) {
                self.state = commit.state;
                self.committed_timestamp = self.committed_timestamp.max(commit.timestamp);
                applied = true;
            }
        }

        if !batch.discard_prepared.is_empty() {
            self.prepared
                .retain(|existing| !batch.discard_prepared.contains(&existing.txn));
        }

        if let Some(record) = batch.commit_record {
            self.commit_records.retain(|existing| existing.txn != record.txn);
            self.commit_records.push(record);
        }

        if !batch.forget_commit_records.is_empty() {
            self.commit_records
                .retain(|existing| !batch.forget_commit_records.contains(&existing.txn));
        }

        applied
    }
}

/// Atomic unit of durable change.
#[derive(Debug, Clone)]
pub struct StorageBatch<S> {
    pub prepare: Option<PreparedRecord<S>>,
    pub commit: Option<CommittedWrite<S>>,
    pub discard_prepared: Vec<TxnId>,
    pub commit_record: Option<CommitRecord>,
    pub forget_commit_records: Vec<TxnId>,
}

impl<S> Default for StorageBatch<S> {
    fn default() -> Self {
        Self {
            prepare: None,
            commit: None,
            discard_prepared: Vec::new(),
            commit_record: None,
            forget_commit_records: Vec::new(),
        }
    }
}

impl<S> StorageBatch<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepare(mut self, record: PreparedRecord<S>) -> Self {
        self.prepare = Some(record);
        self
    }

    pub fn commit(mut self, txn: TxnId, timestamp: Timestamp, state: S) -> Self {
        self.commit = Some(CommittedWrite {
            txn,
            timestamp,
            state,
        });
        self
    }

    pub fn discard_prepared(mut self, txn: TxnId) -> Self {
        self.discard_prepared.push(txn);
        self
    }

    pub fn commit_record(mut self, record: CommitRecord) -> Self {
        self.commit_record = Some(record);
        self
    }

    pub fn forget_commit_record(mut self, txn: TxnId) -> Self {
        self.forget_commit_records.push(txn);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.prepare.is_none()
            && self.commit.is_none()
            && self.discard_prepared.is_empty()
            && self.commit_record.is_none()
            && self.forget_commit_records.is_empty()
    }
}

/// Durable storage contract consumed by a transaction queue.
#[async_trait]
pub trait TransactionalStorage<S: ResourceState>: Send + Sync {
    async fn load(&self) -> Result<StoredResource<S>, StorageError>;

    /// Persist every part of `batch` or none of it.
    async fn store(&self, batch: StorageBatch<S>) -> Result<(), StorageError>;

    async fn store_committed(
        &self,
        txn: TxnId,
        timestamp: Timestamp,
        state: S,
    ) -> Result<(), StorageError> {
        self.store(StorageBatch::new().commit(txn, timestamp, state))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{ActorRef, ParticipantRole};

    fn manager() -> ParticipantId {
        ParticipantId::new("m", ActorRef::new("local"), ParticipantRole::Manager)
    }

    #[test]
    fn replayed_commit_is_a_no_op() {
        let txn = TxnId::for_replica(3, 1);
        let mut stored = StoredResource::<u64>::default();
        assert!(stored.apply(StorageBatch::new().commit(txn, 10, 5)));

        // A later commit moves the state on; replaying the first must not undo it.
        stored.apply(StorageBatch::new().commit(TxnId::for_replica(3, 2), 11, 9));
        assert!(!stored.apply(StorageBatch::new().commit(txn, 10, 5)));
        assert_eq!(stored.state, 9);
        assert_eq!(stored.committed_timestamp, 11);
    }

    #[test]
    fn commit_clears_its_prepared_record() {
        let txn = TxnId::for_replica(1, 1);
        let mut stored = StoredResource::<u64>::default();
        stored.apply(StorageBatch::new().prepare(PreparedRecord {
            txn,
            timestamp: 4,
            state: 2,
            manager: manager(),
        }));
        assert_eq!(stored.prepared.len(), 1);
        assert_eq!(stored.state, 0);

        stored.apply(StorageBatch::new().commit(txn, 4, 2));
        assert!(stored.prepared.is_empty());
        assert_eq!(stored.state, 2);
    }
}
