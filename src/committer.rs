//! Resource that runs side-effecting operations exactly when a transaction
//! decides to commit.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::queue::{CommitHook, TransactionalResource};
use crate::transaction::{TransactionContext, TransactionError, TransactionalStatus};
use crate::types::TxnId;

/// Operation executed once, at the decision point of its transaction.
#[async_trait]
pub trait CommitOperation:
    Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
    /// `false` aborts the transaction.
    async fn commit(&self, txn: TxnId) -> bool;
}

/// Durable state of a committer: operations queued by the running
/// transaction and how many operations have committed so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "O: CommitOperation")]
pub struct CommitterState<O> {
    pub pending: Vec<O>,
    pub committed: u64,
}

impl<O> Default for CommitterState<O> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            committed: 0,
        }
    }
}

pub(crate) struct CommitterHook<O> {
    marker: PhantomData<fn() -> O>,
}

impl<O> CommitterHook<O> {
    pub(crate) fn new() -> Self {
        Self {
            marker: PhantomData,
        }
    }
}

#[async_trait]
impl<O: CommitOperation> CommitHook<CommitterState<O>> for CommitterHook<O> {
    async fn on_decide(&self, txn: TxnId, state: &mut CommitterState<O>) -> TransactionalStatus {
        for operation in &state.pending {
            if !operation.commit(txn).await {
                warn!(%txn, ?operation, "commit operation refused");
                return TransactionalStatus::CommitFailure;
            }
        }
        let count = state.pending.len() as u64;
        state.committed += count;
        state.pending.clear();
        info!(%txn, operations = count, "commit operations ran");
        TransactionalStatus::Ok
    }
}

pub(crate) fn committer_hook<O: CommitOperation>() -> Arc<dyn CommitHook<CommitterState<O>>> {
    Arc::new(CommitterHook::<O>::new())
}

/// Handle to a committer resource hosted by a node.
pub struct TransactionCommitter<O> {
    resource: TransactionalResource<CommitterState<O>>,
}

impl<O> Clone for TransactionCommitter<O> {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource.clone(),
        }
    }
}

impl<O: CommitOperation> TransactionCommitter<O> {
    pub(crate) fn new(resource: TransactionalResource<CommitterState<O>>) -> Self {
        Self { resource }
    }

    pub fn resource(&self) -> &TransactionalResource<CommitterState<O>> {
        &self.resource
    }

    /// Queue `operation` to run when `ctx` commits.
    pub async fn on_commit(
        &self,
        ctx: &TransactionContext,
        operation: O,
    ) -> Result<(), TransactionError> {
        self.resource
            .perform_update(ctx, move |state| state.pending.push(operation))
            .await
    }

    /// Number of operations committed so far.
    pub async fn committed(&self) -> Result<u64, TransactionError> {
        Ok(self.resource.committed_state().await?.committed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static RUNS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Flag(bool);

    #[async_trait]
    impl CommitOperation for Flag {
        async fn commit(&self, _txn: TxnId) -> bool {
            RUNS.fetch_add(1, Ordering::SeqCst);
            self.0
        }
    }

    #[tokio::test]
    async fn refused_operation_fails_the_commit() {
        let hook = CommitterHook::<Flag>::new();
        let mut state = CommitterState {
            pending: vec![Flag(true), Flag(false), Flag(true)],
            committed: 0,
        };
        let status = hook.on_decide(TxnId::new(), &mut state).await;
        assert_eq!(status, TransactionalStatus::CommitFailure);
        assert_eq!(state.pending.len(), 3);
        assert_eq!(state.committed, 0);

        let mut ok = CommitterState {
            pending: vec![Flag(true), Flag(true)],
            committed: 5,
        };
        assert!(hook.on_decide(TxnId::new(), &mut ok).await.is_ok());
        assert!(ok.pending.is_empty());
        assert_eq!(ok.committed, 7);
        assert!(RUNS.load(Ordering::SeqCst) >= 4);
    }
}
