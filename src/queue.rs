//! Per-resource transaction queue.
//!
//! Every resource is served by one worker task that owns its lock, its
//! in-flight records and its storage. Callers talk to it through a
//! [`TransactionalResource`] handle; nothing else touches the state.

pub mod commit;
pub mod lock;
pub mod manager;
pub mod record;
pub mod worker;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::clock::LogicalClock;
use crate::config::TransactionConfig;
use crate::protocol::{
    AbortRequest, CancelRequest, CommitOutcome, CommitReadOnlyRequest, ConfirmRequest,
    ParticipantEndpoint, PingRequest, PrepareAndCommitRequest, PrepareRequest, PreparedMessage,
    Transport, TransportError,
};
use crate::storage::{ResourceState, StorageError, TransactionalStorage, WriteVector};
use crate::transaction::{
    AccessCounter, AccessMode, ParticipantId, TransactionContext, TransactionError,
    TransactionOutcome, TransactionalStatus,
};
use crate::types::{Priority, Timestamp, TxnId};

pub use worker::TransactionQueue;

/// Read or write step run by the worker against the transaction's view.
pub enum Operation<S> {
    Read(Box<dyn FnOnce(&S) + Send>),
    Write(Box<dyn FnOnce(&mut S) + Send>),
}

impl<S> Operation<S> {
    pub fn mode(&self) -> AccessMode {
        match self {
            Operation::Read(_) => AccessMode::Read,
            Operation::Write(_) => AccessMode::Write,
        }
    }
}

impl<S> fmt::Debug for Operation<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operation::{:?}", self.mode())
    }
}

/// Request to run one operation under the resource lock.
#[derive(Debug, Clone, Copy)]
pub struct EnterLock {
    pub txn: TxnId,
    pub priority: Priority,
    pub timestamp: Timestamp,
    /// Counter the caller saw for this resource before this operation.
    pub observed: AccessCounter,
}

/// Admission result: the timestamp the resource admitted the transaction at
/// and the counter after this operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockGrant {
    pub timestamp: Timestamp,
    pub access: AccessCounter,
}

/// Committed view of a resource.
#[derive(Debug, Clone)]
pub struct ResourceSnapshot<S> {
    pub state: S,
    pub timestamp: Timestamp,
    pub write_vector: WriteVector,
    pub in_flight: usize,
}

/// Runs when the manager decides to commit a transaction that wrote the
/// resource, before the decision is persisted. A hooked resource that is
/// asked to prepare under another manager votes `CommitFailure` instead.
#[async_trait]
pub trait CommitHook<S>: Send + Sync {
    async fn on_decide(&self, txn: TxnId, state: &mut S) -> TransactionalStatus;
}

pub(crate) type Reply<T> = oneshot::Sender<T>;

pub(crate) enum QueueCommand<S> {
    EnterLock {
        request: EnterLock,
        operation: Operation<S>,
        reply: Reply<Result<LockGrant, TransactionError>>,
    },
    PrepareAndCommit {
        request: PrepareAndCommitRequest,
        reply: Reply<CommitOutcome>,
    },
    Prepared(PreparedMessage),
    Ping {
        request: PingRequest,
        reply: Reply<TransactionOutcome>,
    },
    CommitReadOnly {
        request: CommitReadOnlyRequest,
        reply: Reply<TransactionalStatus>,
    },
    Prepare(PrepareRequest),
    Abort(AbortRequest),
    Cancel(CancelRequest),
    Confirm {
        request: ConfirmRequest,
        reply: Reply<TransactionalStatus>,
    },
    PingResult {
        txn: TxnId,
        outcome: TransactionOutcome,
    },
    ConfirmAcked {
        txn: TxnId,
        participant: ParticipantId,
    },
    Restore {
        reply: Reply<Result<(), StorageError>>,
    },
    Snapshot {
        reply: Reply<ResourceSnapshot<S>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Handle to a running transaction queue.
pub struct TransactionalResource<S> {
    participant: ParticipantId,
    commands: mpsc::Sender<QueueCommand<S>>,
}

impl<S> Clone for TransactionalResource<S> {
    fn clone(&self) -> Self {
        Self {
            participant: self.participant.clone(),
            commands: self.commands.clone(),
        }
    }
}

/// Everything a queue needs besides its storage.
#[derive(Clone)]
pub struct QueueEnvironment {
    pub clock: Arc<LogicalClock>,
    pub transport: Arc<dyn Transport>,
    pub config: TransactionConfig,
}

impl<S: ResourceState> TransactionalResource<S> {
    /// Spawn the worker and restore from storage before serving callers.
    pub async fn start(
        participant: ParticipantId,
        env: QueueEnvironment,
        storage: Arc<dyn TransactionalStorage<S>>,
        hook: Option<Arc<dyn CommitHook<S>>>,
    ) -> Result<Self, StorageError> {
        let (tx, rx) = mpsc::channel(env.config.queue_capacity.max(1));
        let queue = TransactionQueue::new(
            participant.clone(),
            env,
            storage,
            hook,
            rx,
            tx.downgrade(),
        );
        tokio::spawn(queue.run());

        let resource = Self {
            participant,
            commands: tx,
        };
        resource.notify_of_restore().await?;
        Ok(resource)
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn name(&self) -> &str {
        self.participant.name()
    }

    /// Raw admission entry point; most callers want
    /// [`perform_read`](Self::perform_read) or [`perform_update`](Self::perform_update).
    pub async fn enter_lock(
        &self,
        request: EnterLock,
        operation: Operation<S>,
    ) -> Result<LockGrant, TransactionError> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::EnterLock {
            request,
            operation,
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.unavailable())?
    }

    pub async fn perform_read<R, F>(
        &self,
        ctx: &TransactionContext,
        f: F,
    ) -> Result<R, TransactionError>
    where
        F: FnOnce(&S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let operation = Operation::Read(Box::new(move |state: &S| {
            let _ = tx.send(f(state));
        }));
        self.perform(ctx, operation, rx).await
    }

    pub async fn perform_update<R, F>(
        &self,
        ctx: &TransactionContext,
        f: F,
    ) -> Result<R, TransactionError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        if ctx.is_read_only() {
            ctx.record_failure(
                TransactionalStatus::ValidationFailure,
                Some(format!("write to {} in a read-only transaction", self.name())),
            );
            return Err(TransactionError::ReadOnlyViolation(ctx.id()));
        }
        let (tx, rx) = oneshot::channel();
        let operation = Operation::Write(Box::new(move |state: &mut S| {
            let _ = tx.send(f(state));
        }));
        self.perform(ctx, operation, rx).await
    }

    async fn perform<R>(
        &self,
        ctx: &TransactionContext,
        operation: Operation<S>,
        result: oneshot::Receiver<R>,
    ) -> Result<R, TransactionError> {
        let request = EnterLock {
            txn: ctx.id(),
            priority: ctx.priority(),
            timestamp: ctx.timestamp(),
            observed: ctx.access(&self.participant),
        };

        let outcome = match self.enter_lock(request, operation).await {
            Ok(grant) => {
                ctx.with_info(|info| {
                    info.observe_access(self.participant.clone(), grant.access, grant.timestamp)
                });
                result
                    .await
                    .map_err(|_| TransactionError::OperationPanicked(self.name().to_string()))
            }
            Err(err) => Err(err),
        };

        if let Err(err) = &outcome {
            ctx.record_failure(err.status(), Some(err.to_string()));
        }
        outcome
    }

    /// Committed state as of now, outside of any transaction.
    pub async fn snapshot(&self) -> Result<ResourceSnapshot<S>, TransactionError> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| self.unavailable())
    }

    pub async fn committed_state(&self) -> Result<S, TransactionError> {
        Ok(self.snapshot().await?.state)
    }

    /// Reload durable state and resume whatever was mid-protocol.
    pub async fn notify_of_restore(&self) -> Result<(), StorageError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(QueueCommand::Restore { reply })
            .await
            .map_err(|_| StorageError::Unavailable(self.name().to_string()))?;
        rx.await
            .map_err(|_| StorageError::Unavailable(self.name().to_string()))?
    }

    /// Stop the worker. In-flight waiters see the resource as unavailable.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(QueueCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, command: QueueCommand<S>) -> Result<(), TransactionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| self.unavailable())
    }

    fn unavailable(&self) -> TransactionError {
        TransactionError::ResourceUnavailable(self.name().to_string())
    }

    fn not_delivered(&self) -> TransportError {
        TransportError::UnknownResource {
            actor: self.participant.reference().clone(),
            resource: self.name().to_string(),
        }
    }

    fn lost_reply(&self) -> TransportError {
        TransportError::Rpc {
            target: self.participant.reference().clone(),
            message: format!("resource {} stopped before replying", self.name()),
        }
    }

    async fn deliver(&self, command: QueueCommand<S>) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| self.not_delivered())
    }
}

#[async_trait]
impl<S: ResourceState> ParticipantEndpoint for TransactionalResource<S> {
    async fn prepare_and_commit(
        &self,
        request: PrepareAndCommitRequest,
    ) -> Result<CommitOutcome, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.deliver(QueueCommand::PrepareAndCommit { request, reply })
            .await?;
        rx.await.map_err(|_| self.lost_reply())
    }

    async fn prepared(&self, message: PreparedMessage) -> Result<(), TransportError> {
        self.deliver(QueueCommand::Prepared(message)).await
    }

    async fn ping(&self, request: PingRequest) -> Result<TransactionOutcome, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.deliver(QueueCommand::Ping { request, reply }).await?;
        rx.await.map_err(|_| self.lost_reply())
    }

    async fn commit_read_only(
        &self,
        request: CommitReadOnlyRequest,
    ) -> Result<TransactionalStatus, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.deliver(QueueCommand::CommitReadOnly { request, reply })
            .await?;
        rx.await.map_err(|_| self.lost_reply())
    }

    async fn prepare(&self, request: PrepareRequest) -> Result<(), TransportError> {
        self.deliver(QueueCommand::Prepare(request)).await
    }

    async fn abort(&self, request: AbortRequest) -> Result<(), TransportError> {
        self.deliver(QueueCommand::Abort(request)).await
    }

    async fn cancel(&self, request: CancelRequest) -> Result<(), TransportError> {
        self.deliver(QueueCommand::Cancel(request)).await
    }

    async fn confirm(
        &self,
        request: ConfirmRequest,
    ) -> Result<TransactionalStatus, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.deliver(QueueCommand::Confirm { request, reply }).await?;
        rx.await.map_err(|_| self.lost_reply())
    }
}
