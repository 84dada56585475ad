use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Host configuration loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TesseraConfig {
    /// Replica id stamped into the high half of every transaction id this
    /// host starts. Must be unique across the cluster; `0` means unset and is
    /// only accepted for a host without peers.
    pub node_id: u64,
    /// Actor reference other hosts use to address this host.
    pub actor: String,
    /// Address the gRPC extension server binds to (e.g. `127.0.0.1:50061`).
    pub listen_addr: String,
    /// Remote hosts reachable over gRPC.
    pub peers: Vec<PeerConfig>,
    pub storage: StorageConfig,
    pub transactions: TransactionConfig,
}

/// Definition of a remote host supplied through configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    pub actor: String,
    pub listen_addr: String,
}

impl PeerConfig {
    pub fn new(actor: impl Into<String>, listen_addr: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            listen_addr: listen_addr.into(),
        }
    }
}

impl TesseraConfig {
    pub fn new(node_id: u64, actor: impl Into<String>, listen_addr: impl Into<String>) -> Self {
        Self {
            node_id,
            actor: actor.into(),
            listen_addr: listen_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_peers(mut self, peers: Vec<PeerConfig>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_transactions(mut self, transactions: TransactionConfig) -> Self {
        self.transactions = transactions;
        self
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would let two hosts mint the same transaction ids.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id == 0 && !self.peers.is_empty() {
            return Err(ConfigError::Invalid(
                "node_id must be a unique non-zero id when peers are configured".into(),
            ));
        }
        if self.peers.iter().any(|peer| peer.actor == self.actor) {
            return Err(ConfigError::Invalid(format!(
                "actor {} is listed as its own peer",
                self.actor
            )));
        }
        Ok(())
    }
}

impl Default for TesseraConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            actor: "host-0".into(),
            listen_addr: "127.0.0.1:50061".into(),
            peers: Vec::new(),
            storage: StorageConfig::memory(),
            transactions: TransactionConfig::default(),
        }
    }
}

/// Supported storage backends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Disk,
}

/// Storage configuration specifying the backend and optional path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::memory()
    }
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: None,
        }
    }

    pub fn disk(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: StorageBackend::Disk,
            path: Some(path.into()),
        }
    }
}

/// Timings and limits of the transaction protocol, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransactionConfig {
    pub default_timeout_ms: u64,
    /// How long a manager waits for every `Prepared` before aborting.
    pub prepare_timeout_ms: u64,
    /// How long a prepared participant waits before pinging its manager.
    pub ping_interval_ms: u64,
    pub lock_wait_timeout_ms: u64,
    pub lock_hold_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub queue_capacity: usize,
    /// Number of resolved outcomes a resource remembers for late messages.
    pub outcome_cache_size: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            prepare_timeout_ms: 5_000,
            ping_interval_ms: 1_000,
            lock_wait_timeout_ms: 5_000,
            lock_hold_timeout_ms: 10_000,
            tick_interval_ms: 50,
            queue_capacity: 1_024,
            outcome_cache_size: 4_096,
        }
    }
}

impl TransactionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn lock_hold_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_hold_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}
