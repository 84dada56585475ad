use serde::{Deserialize, Serialize};

use crate::transaction::{AccessCounter, ParticipantId, TransactionalStatus};
use crate::types::{Timestamp, TxnId};

/// Agent to manager: prepare yourself, wait for everyone else, then decide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareAndCommitRequest {
    pub resource: String,
    pub txn: TxnId,
    pub access: AccessCounter,
    pub timestamp: Timestamp,
    /// Every participant of the transaction, manager included.
    pub participants: Vec<ParticipantId>,
    /// Participants that wrote and must receive `Confirm` on commit.
    pub writers: Vec<ParticipantId>,
}

impl PrepareAndCommitRequest {
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }
}

/// Manager's decision for the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub status: TransactionalStatus,
    pub timestamp: Timestamp,
}

/// Participant to manager, one-way: my prepare finished with `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedMessage {
    pub resource: String,
    pub txn: TxnId,
    pub timestamp: Timestamp,
    pub participant: ParticipantId,
    pub status: TransactionalStatus,
}

/// Participant to manager: what happened to this transaction?
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    pub resource: String,
    pub txn: TxnId,
    pub timestamp: Timestamp,
    pub participant: ParticipantId,
}

/// Agent to participant, single round for transactions without writers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitReadOnlyRequest {
    pub resource: String,
    pub txn: TxnId,
    pub access: AccessCounter,
    pub timestamp: Timestamp,
}

/// Agent to participant, one-way: prepare and report to `manager`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub resource: String,
    pub txn: TxnId,
    pub access: AccessCounter,
    pub timestamp: Timestamp,
    pub manager: ParticipantId,
}

/// Agent to participant, one-way: abort before prepare.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortRequest {
    pub resource: String,
    pub txn: TxnId,
    pub status: TransactionalStatus,
}

/// Manager to participant, one-way: the transaction aborted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub resource: String,
    pub txn: TxnId,
    pub timestamp: Timestamp,
    pub status: TransactionalStatus,
}

/// Manager to participant: the transaction committed at `timestamp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub resource: String,
    pub txn: TxnId,
    pub timestamp: Timestamp,
}
