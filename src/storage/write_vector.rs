use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{ReplicaId, TxnId};

/// Inclusive run of consecutive sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct SequenceRun {
    first: u64,
    last: u64,
}

/// Record of which transactions have already been applied to a resource.
///
/// Keyed by originating replica; each replica keeps a sorted list of
/// disjoint runs so a long history of commits stays compact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteVector {
    replicas: BTreeMap<ReplicaId, Vec<SequenceRun>>,
}

impl WriteVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, txn: TxnId) -> bool {
        let Some(runs) = self.replicas.get(&txn.origin_replica()) else {
            return false;
        };
        let seq = txn.sequence();
        let idx = runs.partition_point(|run| run.last < seq);
        runs.get(idx).is_some_and(|run| run.first <= seq)
    }

    /// Set the bit for `txn`. Returns `false` when it was already set.
    pub fn set(&mut self, txn: TxnId) -> bool {
        let seq = txn.sequence();
        let runs = self.replicas.entry(txn.origin_replica()).or_default();
        let idx = runs.partition_point(|run| run.last < seq);

        if let Some(run) = runs.get(idx)
            && run.first <= seq
        {
            return false;
        }

        let joins_prev = idx > 0 && runs[idx - 1].last.checked_add(1) == Some(seq);
        let joins_next = runs.get(idx).is_some_and(|run| seq.checked_add(1) == Some(run.first));

        match (joins_prev, joins_next) {
            (true, true) => {
                let next = runs.remove(idx);
                runs[idx - 1].last = next.last;
            }
            (true, false) => runs[idx - 1].last = seq,
            (false, true) => runs[idx].first = seq,
            (false, false) => runs.insert(idx, SequenceRun { first: seq, last: seq }),
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Number of runs stored, across all replicas.
    pub fn run_count(&self) -> usize {
        self.replicas.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_idempotent_and_scoped_by_replica() {
        let mut vector = WriteVector::new();
        let txn = TxnId::for_replica(1, 7);
        assert!(!vector.contains(txn));
        assert!(vector.set(txn));
        assert!(!vector.set(txn));
        assert!(vector.contains(txn));
        assert!(!vector.contains(TxnId::for_replica(2, 7)));
    }

    #[test]
    fn adjacent_sequences_collapse_into_one_run() {
        let mut vector = WriteVector::new();
        for seq in [1, 3, 5, 2, 4] {
            vector.set(TxnId::for_replica(9, seq));
        }
        assert_eq!(vector.run_count(), 1);
        assert!((1..=5).all(|seq| vector.contains(TxnId::for_replica(9, seq))));
        assert!(!vector.contains(TxnId::for_replica(9, 6)));
    }

    #[test]
    fn survives_json_round_trip() {
        let mut vector = WriteVector::new();
        vector.set(TxnId::for_replica(u64::MAX, 0));
        let json = serde_json::to_string(&vector).unwrap();
        let back: WriteVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vector);
    }
}
