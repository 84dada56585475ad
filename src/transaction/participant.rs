use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Opaque address of the host that serves a participant's wire contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorRef(String);

impl ActorRef {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Capability of a participant.
///
/// Every participant hosts a transaction queue, so each role is also a
/// resource; the roles differ in whether they may coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ParticipantRole {
    /// Holds state, never coordinates.
    Resource,
    /// Holds state and may be elected manager.
    #[default]
    Manager,
    /// Holds state and is preferred when electing the manager.
    PriorityManager,
}

impl ParticipantRole {
    pub fn can_manage(self) -> bool {
        matches!(
            self,
            ParticipantRole::Manager | ParticipantRole::PriorityManager
        )
    }

    pub fn is_priority_manager(self) -> bool {
        self == ParticipantRole::PriorityManager
    }
}

/// Identity of a transactional participant.
///
/// Equality, hashing and ordering are structural over `(name, reference)`;
/// the role is a capability, not part of the identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantId {
    name: String,
    reference: ActorRef,
    role: ParticipantRole,
}

impl ParticipantId {
    pub fn new(name: impl Into<String>, reference: ActorRef, role: ParticipantRole) -> Self {
        Self {
            name: name.into(),
            reference,
            role,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reference(&self) -> &ActorRef {
        &self.reference
    }

    pub fn role(&self) -> ParticipantRole {
        self.role
    }
}

impl PartialEq for ParticipantId {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.reference == other.reference
    }
}

impl Eq for ParticipantId {}

impl Hash for ParticipantId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.reference.hash(state);
    }
}

impl PartialOrd for ParticipantId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ParticipantId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.reference.cmp(&other.reference))
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.reference)
    }
}

/// Pick the participant that decides the outcome.
///
/// Lowest `(name, reference)` among priority managers wins; otherwise the
/// lowest manager-capable writer; otherwise the lowest manager-capable
/// participant at all. `writers` must be a subset of `participants`.
pub fn select_manager<'a>(
    participants: &'a [ParticipantId],
    writers: &[ParticipantId],
) -> Option<&'a ParticipantId> {
    let priority = participants
        .iter()
        .filter(|p| p.role().is_priority_manager())
        .min();
    if priority.is_some() {
        return priority;
    }

    let writer = participants
        .iter()
        .filter(|p| p.role().can_manage() && writers.contains(p))
        .min();
    if writer.is_some() {
        return writer;
    }

    participants.iter().filter(|p| p.role().can_manage()).min()
}
