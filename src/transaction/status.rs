use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Outcome taxonomy reported by every participant operation.
///
/// Once a transaction has been assigned an abort reason it never goes back to
/// [`TransactionalStatus::Ok`]; see [`TransactionalStatus::merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionalStatus {
    Ok,
    /// Access counters or read-only commit checks did not validate.
    ValidationFailure,
    /// Prepared acknowledgements did not arrive in time.
    PrepareTimeout,
    /// Aborted because of a failure elsewhere (stale view, lost record, dependency).
    CascadingAbort,
    /// Durable write of a prepared or committed record failed.
    StorageFailure,
    /// A participant could not be reached.
    ParticipantUnreachable,
    /// Waited for or held a resource lock too long, or lost it to an older
    /// transaction.
    LockTimeout,
    /// Two holders of a read lock tried to upgrade at the same time.
    LockUpgradeConflict,
    /// A commit operation refused to commit.
    CommitFailure,
    /// The transaction outlived its timeout before resolving.
    TransactionTimeout,
    /// The caller asked for the abort.
    UserAbort,
}

impl TransactionalStatus {
    pub fn is_ok(self) -> bool {
        self == TransactionalStatus::Ok
    }

    pub fn is_abort(self) -> bool {
        !self.is_ok()
    }

    /// Combine two statuses, keeping the first abort reason.
    #[must_use]
    pub fn merge(self, other: TransactionalStatus) -> TransactionalStatus {
        if self.is_abort() { self } else { other }
    }
}

impl fmt::Display for TransactionalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransactionalStatus::Ok => "ok",
            TransactionalStatus::ValidationFailure => "validation failure",
            TransactionalStatus::PrepareTimeout => "prepare timeout",
            TransactionalStatus::CascadingAbort => "cascading abort",
            TransactionalStatus::StorageFailure => "storage failure",
            TransactionalStatus::ParticipantUnreachable => "participant unreachable",
            TransactionalStatus::LockTimeout => "lock timeout",
            TransactionalStatus::LockUpgradeConflict => "lock upgrade conflict",
            TransactionalStatus::CommitFailure => "commit failure",
            TransactionalStatus::TransactionTimeout => "transaction timeout",
            TransactionalStatus::UserAbort => "user abort",
        };
        f.write_str(label)
    }
}

/// What a manager knows about a transaction when a participant pings it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionOutcome {
    Committed { timestamp: Timestamp },
    Aborted { status: TransactionalStatus },
    Pending,
}

impl TransactionOutcome {
    pub fn status(&self) -> Option<TransactionalStatus> {
        match self {
            TransactionOutcome::Committed { .. } => Some(TransactionalStatus::Ok),
            TransactionOutcome::Aborted { status } => Some(*status),
            TransactionOutcome::Pending => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_never_downgrades_an_abort() {
        let status = TransactionalStatus::Ok
            .merge(TransactionalStatus::StorageFailure)
            .merge(TransactionalStatus::Ok)
            .merge(TransactionalStatus::PrepareTimeout);
        assert_eq!(status, TransactionalStatus::StorageFailure);
    }

    #[test]
    fn pending_outcome_has_no_status() {
        assert_eq!(TransactionOutcome::Pending.status(), None);
        assert_eq!(
            TransactionOutcome::Committed { timestamp: 3 }.status(),
            Some(TransactionalStatus::Ok)
        );
    }
}
