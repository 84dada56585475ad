use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::transaction::{AccessCounter, AccessMode, ParticipantId, TransactionOutcome};
use crate::types::{Priority, Timestamp, TxnId};

/// Where a transaction stands at one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPhase {
    /// Holding the lock and executing operations.
    Pending,
    /// Validating and persisting its prepared write.
    Preparing,
    /// Prepared write is durable; waiting for the decision.
    Prepared,
    /// Abort decided, cleanup in progress.
    Aborting,
    Committed,
    Aborted,
}

impl RecordPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecordPhase::Committed | RecordPhase::Aborted)
    }
}

/// Working copy a queue keeps for one admitted transaction.
#[derive(Debug)]
pub struct TransactionRecord<S> {
    pub txn: TxnId,
    pub sequence: u64,
    pub priority: Priority,
    pub timestamp: Timestamp,
    pub phase: RecordPhase,
    pub access: AccessCounter,
    pub mode: AccessMode,
    /// Private copy made on first write; `None` while the transaction only read.
    pub state: Option<S>,
    pub manager: Option<ParticipantId>,
    pub granted_at: Instant,
    pub last_contact: Instant,
}

impl<S> TransactionRecord<S> {
    pub fn new(
        txn: TxnId,
        sequence: u64,
        priority: Priority,
        timestamp: Timestamp,
        mode: AccessMode,
        now: Instant,
    ) -> Self {
        Self {
            txn,
            sequence,
            priority,
            timestamp,
            phase: RecordPhase::Pending,
            access: AccessCounter::default(),
            mode,
            state: None,
            manager: None,
            granted_at: now,
            last_contact: now,
        }
    }

    pub fn has_written(&self) -> bool {
        self.state.is_some()
    }
}

/// Bounded memory of resolved transactions, for answering late messages.
#[derive(Debug)]
pub struct OutcomeCache {
    capacity: usize,
    outcomes: HashMap<TxnId, TransactionOutcome>,
    order: VecDeque<TxnId>,
}

impl OutcomeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            outcomes: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, txn: TxnId) -> Option<TransactionOutcome> {
        self.outcomes.get(&txn).copied()
    }

    /// Remember `outcome`. A committed outcome is never replaced by an abort.
    pub fn insert(&mut self, txn: TxnId, outcome: TransactionOutcome) {
        if let Some(existing) = self.outcomes.get_mut(&txn) {
            if !matches!(existing, TransactionOutcome::Committed { .. }) {
                *existing = outcome;
            }
            return;
        }
        if self.order.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.outcomes.remove(&oldest);
        }
        self.order.push_back(txn);
        self.outcomes.insert(txn, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionalStatus;

    #[test]
    fn cache_evicts_oldest_and_keeps_commits() {
        let mut cache = OutcomeCache::new(2);
        let (a, b, c) = (TxnId::new(), TxnId::new(), TxnId::new());
        cache.insert(a, TransactionOutcome::Committed { timestamp: 1 });
        cache.insert(
            a,
            TransactionOutcome::Aborted {
                status: TransactionalStatus::PrepareTimeout,
            },
        );
        assert_eq!(cache.get(a), Some(TransactionOutcome::Committed { timestamp: 1 }));

        cache.insert(b, TransactionOutcome::Pending);
        cache.insert(c, TransactionOutcome::Pending);
        assert_eq!(cache.get(a), None);
        assert!(cache.get(c).is_some());
    }
}
