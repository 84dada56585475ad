use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical clock value in microseconds. Ordering between transactions at a
/// resource is decided by this value, never by arrival order.
pub type Timestamp = u64;
/// Identifier of the host (replica) that originated a transaction.
pub type ReplicaId = u64;
/// Contention priority; lower values are older and win ties.
pub type Priority = u64;

/// Unique identifier assigned to every transaction.
///
/// The 128 bits are split into the originating replica (high half) and a
/// per-replica sequence number (low half), which is what the write-vector keys on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(Uuid);

impl Default for TxnId {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnId {
    /// Creates a new transaction identifier using a random UUID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Identifier for the `sequence`-th transaction started by `replica`.
    pub fn for_replica(replica: ReplicaId, sequence: u64) -> Self {
        Self(Uuid::from_u64_pair(replica, sequence))
    }

    /// Wraps an existing UUID. Useful for tests and deterministic flows.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Exposes the inner UUID for logging or serialization.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn origin_replica(&self) -> ReplicaId {
        self.0.as_u64_pair().0
    }

    pub fn sequence(&self) -> u64 {
        self.0.as_u64_pair().1
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TxnId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_and_sequence_round_trip_through_the_id() {
        let id = TxnId::for_replica(7, 42);
        assert_eq!(id.origin_replica(), 7);
        assert_eq!(id.sequence(), 42);

        let parsed: TxnId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
