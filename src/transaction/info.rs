use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::types::{Priority, Timestamp, TxnId};

use super::participant::ParticipantId;
use super::status::TransactionalStatus;

/// Kind of access an operation performs on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    Write,
}

/// Number of reads and writes a transaction performed at one participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessCounter {
    pub reads: u32,
    pub writes: u32,
}

impl AccessCounter {
    pub fn new(reads: u32, writes: u32) -> Self {
        Self { reads, writes }
    }

    pub fn record(&mut self, mode: AccessMode) {
        match mode {
            AccessMode::Read => self.reads += 1,
            AccessMode::Write => self.writes += 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.reads == 0 && self.writes == 0
    }

    pub fn has_writes(&self) -> bool {
        self.writes > 0
    }

    fn add(&mut self, other: AccessCounter) {
        self.reads += other.reads;
        self.writes += other.writes;
    }

    fn since(self, baseline: AccessCounter) -> AccessCounter {
        AccessCounter {
            reads: self.reads.saturating_sub(baseline.reads),
            writes: self.writes.saturating_sub(baseline.writes),
        }
    }
}

impl fmt::Display for AccessCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}w{}", self.reads, self.writes)
    }
}

/// First failure observed by any call within the transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFailure {
    pub status: TransactionalStatus,
    pub cause: Option<String>,
}

/// Per-transaction metadata carried through the call graph.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    id: TxnId,
    priority: Priority,
    timestamp: Timestamp,
    read_only: bool,
    expires_at: Instant,
    participants: HashMap<ParticipantId, AccessCounter>,
    pending_calls: u32,
    failure: Option<RecordedFailure>,
    // Counters as they were when this copy was forked; join only adds the delta.
    baseline: HashMap<ParticipantId, AccessCounter>,
}

impl TransactionInfo {
    pub fn new(
        id: TxnId,
        priority: Priority,
        timestamp: Timestamp,
        read_only: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            priority,
            timestamp,
            read_only,
            expires_at: Instant::now() + timeout,
            participants: HashMap::new(),
            pending_calls: 0,
            failure: None,
            baseline: HashMap::new(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn pending_calls(&self) -> u32 {
        self.pending_calls
    }

    pub fn failure(&self) -> Option<&RecordedFailure> {
        self.failure.as_ref()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Counter observed so far at `participant`, zero when untouched.
    pub fn access(&self, participant: &ParticipantId) -> AccessCounter {
        self.participants
            .get(participant)
            .copied()
            .unwrap_or_default()
    }

    pub fn participants(&self) -> impl Iterator<Item = (&ParticipantId, &AccessCounter)> {
        self.participants.iter()
    }

    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.participants.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn writers(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self
            .participants
            .iter()
            .filter(|(_, counter)| counter.has_writes())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Store the counter a resource reported after granting an operation and
    /// move the timestamp forward to what the resource admitted it at.
    pub fn observe_access(
        &mut self,
        participant: ParticipantId,
        counter: AccessCounter,
        timestamp: Timestamp,
    ) {
        self.participants.insert(participant, counter);
        self.timestamp = self.timestamp.max(timestamp);
    }

    pub fn record_failure(&mut self, status: TransactionalStatus, cause: Option<String>) {
        if status.is_ok() || self.failure.is_some() {
            return;
        }
        self.failure = Some(RecordedFailure { status, cause });
    }

    /// Copy handed to a concurrent sub-call; must be joined back.
    pub fn fork(&mut self) -> TransactionInfo {
        self.pending_calls += 1;
        let mut child = self.clone();
        child.pending_calls = 0;
        child.baseline = self.participants.clone();
        child
    }

    /// Fold a forked copy back in.
    pub fn join(&mut self, child: &TransactionInfo) {
        debug_assert_eq!(self.id, child.id);
        self.pending_calls = self.pending_calls.saturating_sub(1);
        for (participant, counter) in &child.participants {
            let base = child.baseline.get(participant).copied().unwrap_or_default();
            self.participants
                .entry(participant.clone())
                .or_default()
                .add(counter.since(base));
        }
        self.timestamp = self.timestamp.max(child.timestamp);
        if self.failure.is_none() {
            self.failure = child.failure.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::participant::{ActorRef, ParticipantRole};

    fn participant(name: &str) -> ParticipantId {
        ParticipantId::new(name, ActorRef::new("local"), ParticipantRole::Manager)
    }

    fn info() -> TransactionInfo {
        TransactionInfo::new(TxnId::new(), 0, 10, false, Duration::from_secs(5))
    }

    #[test]
    fn join_adds_only_what_the_fork_observed() {
        let a = participant("a");
        let b = participant("b");
        let mut parent = info();
        parent.observe_access(a.clone(), AccessCounter::new(1, 0), 11);

        let mut child = parent.fork();
        assert_eq!(parent.pending_calls(), 1);
        child.observe_access(a.clone(), AccessCounter::new(1, 1), 12);
        child.observe_access(b.clone(), AccessCounter::new(0, 1), 15);

        parent.join(&child);
        assert_eq!(parent.pending_calls(), 0);
        assert_eq!(parent.access(&a), AccessCounter::new(1, 1));
        assert_eq!(parent.access(&b), AccessCounter::new(0, 1));
        assert_eq!(parent.timestamp(), 15);
        assert_eq!(parent.writers(), vec![a, b]);
    }

    #[test]
    fn first_recorded_failure_wins() {
        let mut parent = info();
        let mut child = parent.fork();
        child.record_failure(TransactionalStatus::LockTimeout, Some("slow".into()));
        parent.record_failure(TransactionalStatus::UserAbort, None);
        parent.join(&child);

        let failure = parent.failure().unwrap();
        assert_eq!(failure.status, TransactionalStatus::UserAbort);
    }
}
