//! Core crate exports for Tessera.
//!
//! Tessera coordinates ACID transactions across independently hosted,
//! single-threaded resources: per-resource transaction queues ordered by a
//! logical clock, ambient transaction context, and two-phase commit with
//! durable prepare and commit records.

pub mod agent;
pub mod clock;
pub mod committer;
pub mod config;
pub mod interceptor;
pub mod network;
pub mod node;
pub mod protocol;
pub mod queue;
pub mod rpc;
pub mod storage;
pub mod transaction;
pub mod types;

pub use agent::TransactionAgent;
pub use clock::{LogicalClock, ManualTimeSource};
pub use committer::{CommitOperation, CommitterState, TransactionCommitter};
pub use config::{ConfigError, PeerConfig, StorageConfig, TesseraConfig, TransactionConfig};
pub use interceptor::{TransactionInterceptor, TransactionOption, TransactionOptions};
pub use network::Router;
pub use node::{NodeError, TesseraNode};
pub use queue::TransactionalResource;
pub use transaction::{
    CommitReceipt, ParticipantId, ParticipantRole, TransactionContext, TransactionError,
    TransactionInfo, TransactionOutcome, TransactionalStatus,
};
pub use types::{Timestamp, TxnId};
