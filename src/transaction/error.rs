use thiserror::Error;

use crate::types::TxnId;

use super::status::TransactionalStatus;

/// Errors surfaced to callers of transactional operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction {txn} aborted: {status}")]
    Aborted {
        txn: TxnId,
        status: TransactionalStatus,
        cause: Option<String>,
    },
    #[error("outcome of transaction {txn} is in doubt: {reason}")]
    InDoubt { txn: TxnId, reason: String },
    #[error("operation requires a transaction but none is active")]
    TransactionRequired,
    #[error("operation is not allowed inside a transaction")]
    TransactionNotAllowed,
    #[error("transaction {0} is read-only and cannot write")]
    ReadOnlyViolation(TxnId),
    #[error("no participant of transaction {0} can act as manager")]
    NoManager(TxnId),
    #[error("resource {0} is not running")]
    ResourceUnavailable(String),
    #[error("operation on resource {0} panicked")]
    OperationPanicked(String),
    #[error("{0}")]
    Application(String),
}

impl TransactionError {
    pub fn aborted(
        txn: TxnId,
        status: TransactionalStatus,
        cause: impl Into<Option<String>>,
    ) -> Self {
        TransactionError::Aborted {
            txn,
            status,
            cause: cause.into(),
        }
    }

    /// Status to record on the transaction when this error escapes a call.
    pub fn status(&self) -> TransactionalStatus {
        match self {
            TransactionError::Aborted { status, .. } => *status,
            TransactionError::InDoubt { .. } => TransactionalStatus::PrepareTimeout,
            TransactionError::ReadOnlyViolation(_) => TransactionalStatus::ValidationFailure,
            TransactionError::ResourceUnavailable(_) => TransactionalStatus::ParticipantUnreachable,
            TransactionError::TransactionRequired
            | TransactionError::TransactionNotAllowed
            | TransactionError::NoManager(_)
            | TransactionError::OperationPanicked(_)
            | TransactionError::Application(_) => TransactionalStatus::CascadingAbort,
        }
    }

    pub fn cause(&self) -> Option<&str> {
        match self {
            TransactionError::Aborted { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }
}
