use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::transaction::{ActorRef, TransactionOutcome, TransactionalStatus};

use super::messages::{
    AbortRequest, CancelRequest, CommitOutcome, CommitReadOnlyRequest, ConfirmRequest,
    PingRequest, PrepareAndCommitRequest, PrepareRequest, PreparedMessage,
};

/// Failures delivering a protocol message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("actor {actor} is unreachable: {reason}")]
    Unreachable { actor: ActorRef, reason: String },
    #[error("actor {actor} hosts no resource named {resource}")]
    UnknownResource { actor: ActorRef, resource: String },
    #[error("call to {target} failed: {message}")]
    Rpc { target: ActorRef, message: String },
    #[error("failed to encode or decode payload: {0}")]
    Codec(String),
}

impl TransportError {
    /// `false` when the message certainly never reached the target, so the
    /// sender may act as if it was never sent.
    pub fn was_delivered(&self) -> bool {
        !matches!(
            self,
            TransportError::Unreachable { .. } | TransportError::UnknownResource { .. }
        )
    }
}

/// Wire contract every transactional host serves.
///
/// Messages are addressed to a resource by name; the endpoint routes them.
/// One-way messages return once the target has queued them.
#[async_trait]
pub trait ParticipantEndpoint: Send + Sync {
    async fn prepare_and_commit(
        &self,
        request: PrepareAndCommitRequest,
    ) -> Result<CommitOutcome, TransportError>;

    async fn prepared(&self, message: PreparedMessage) -> Result<(), TransportError>;

    async fn ping(&self, request: PingRequest) -> Result<TransactionOutcome, TransportError>;

    async fn commit_read_only(
        &self,
        request: CommitReadOnlyRequest,
    ) -> Result<TransactionalStatus, TransportError>;

    async fn prepare(&self, request: PrepareRequest) -> Result<(), TransportError>;

    async fn abort(&self, request: AbortRequest) -> Result<(), TransportError>;

    async fn cancel(&self, request: CancelRequest) -> Result<(), TransportError>;

    /// Returns `Ok` once the commit is durable at the participant.
    async fn confirm(&self, request: ConfirmRequest) -> Result<TransactionalStatus, TransportError>;
}

/// Resolves actor references to endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn endpoint(&self, actor: &ActorRef)
    -> Result<Arc<dyn ParticipantEndpoint>, TransportError>;
}
