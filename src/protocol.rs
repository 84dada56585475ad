//! Two-phase commit messages exchanged between agents, managers and resources.

pub mod endpoint;
pub mod messages;

pub use endpoint::{ParticipantEndpoint, Transport, TransportError};
pub use messages::{
    AbortRequest, CancelRequest, CommitOutcome, CommitReadOnlyRequest, ConfirmRequest,
    PingRequest, PrepareAndCommitRequest, PrepareRequest, PreparedMessage,
};
