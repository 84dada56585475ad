//! Transaction metadata, ambient context propagation and the status taxonomy.

pub mod context;
pub mod error;
pub mod info;
pub mod participant;
pub mod status;

pub use context::TransactionContext;
pub use error::TransactionError;
pub use info::{AccessCounter, AccessMode, RecordedFailure, TransactionInfo};
pub use participant::{ActorRef, ParticipantId, ParticipantRole, select_manager};
pub use status::{TransactionOutcome, TransactionalStatus};

use crate::types::Timestamp;

/// Result returned when a transaction successfully commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    pub commit_ts: Timestamp,
}
