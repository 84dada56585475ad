use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tessera::protocol::{
    AbortRequest, CancelRequest, CommitOutcome, CommitReadOnlyRequest, ConfirmRequest,
    ParticipantEndpoint, PingRequest, PrepareAndCommitRequest, PrepareRequest, PreparedMessage,
    TransportError,
};
use tessera::storage::{
    InMemoryStorage, ResourceState, StorageAdapter, StorageBatch, StorageError, StoredResource,
    TransactionalStorage,
};
use tessera::{
    LogicalClock, Router, StorageConfig, TesseraConfig, TesseraNode, TransactionConfig,
    TransactionOutcome, TransactionalResource, TransactionalStatus,
};
use tokio::time::sleep;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: i64,
}

/// Timings short enough that recovery paths run within a test.
#[allow(dead_code)]
pub fn fast_config() -> TransactionConfig {
    TransactionConfig {
        default_timeout_ms: 5_000,
        prepare_timeout_ms: 1_000,
        ping_interval_ms: 50,
        lock_wait_timeout_ms: 1_000,
        lock_hold_timeout_ms: 2_000,
        tick_interval_ms: 10,
        ..TransactionConfig::default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(dead_code)]
pub enum BackendKind {
    Memory,
    Disk,
}

#[allow(dead_code)]
pub fn all_backends() -> [BackendKind; 2] {
    [BackendKind::Memory, BackendKind::Disk]
}

/// Storage config plus the tempdir that keeps disk-backed runs alive.
#[allow(dead_code)]
pub struct TestStorage {
    backend: BackendKind,
    _guard: Option<TempDir>,
    config: StorageConfig,
}

#[allow(dead_code)]
impl TestStorage {
    pub fn new(backend: BackendKind) -> Self {
        match backend {
            BackendKind::Memory => Self {
                backend,
                _guard: None,
                config: StorageConfig::memory(),
            },
            BackendKind::Disk => {
                let dir = TempDir::new().expect("create temp dir for disk storage");
                let config = StorageConfig::disk(dir.path().join("storage"));
                Self {
                    backend,
                    _guard: Some(dir),
                    config,
                }
            }
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn config(&self) -> StorageConfig {
        self.config.clone()
    }

    pub fn adapter<S: ResourceState>(&self, name: &str) -> StorageAdapter<S> {
        StorageAdapter::create(&self.config, name, "test-service").expect("open storage")
    }
}

/// Several hosts in one process sharing a router and a clock.
#[allow(dead_code)]
pub struct Cluster {
    pub router: Arc<Router>,
    pub clock: Arc<LogicalClock>,
    pub nodes: Vec<Arc<TesseraNode>>,
}

#[allow(dead_code)]
impl Cluster {
    pub async fn start(hosts: usize) -> Self {
        Self::start_with(hosts, StorageConfig::memory()).await
    }

    pub async fn start_with(hosts: usize, storage: StorageConfig) -> Self {
        Self::start_configured(hosts, storage, fast_config()).await
    }

    pub async fn start_configured(
        hosts: usize,
        storage: StorageConfig,
        transactions: TransactionConfig,
    ) -> Self {
        let router = Arc::new(Router::new());
        let clock = Arc::new(LogicalClock::system());
        let mut nodes = Vec::with_capacity(hosts);
        for id in 0..hosts {
            let config = TesseraConfig::new(id as u64 + 1, format!("host-{id}"), "127.0.0.1:0")
                .with_storage(storage.clone())
                .with_transactions(transactions.clone());
            nodes.push(TesseraNode::with_router(config, router.clone(), clock.clone()).await);
        }
        Self {
            router,
            clock,
            nodes,
        }
    }

    pub fn node(&self, index: usize) -> &Arc<TesseraNode> {
        &self.nodes[index]
    }

    /// Route messages for `node` through a fault-injecting wrapper.
    pub async fn make_lossy(&self, node: usize) -> Arc<LossyEndpoint> {
        let node = self.nodes[node].clone();
        let lossy = Arc::new(LossyEndpoint::new(node.clone()));
        let weak: Weak<LossyEndpoint> = Arc::downgrade(&lossy);
        self.router.register_local(node.actor().clone(), weak).await;
        lossy
    }

    /// Undo [`make_lossy`](Self::make_lossy).
    pub async fn restore_route(&self, node: usize) {
        let node = &self.nodes[node];
        let weak: Weak<TesseraNode> = Arc::downgrade(node);
        self.router.register_local(node.actor().clone(), weak).await;
    }
}

/// Wraps a node and silently drops selected messages.
#[allow(dead_code)]
pub struct LossyEndpoint {
    inner: Arc<TesseraNode>,
    pub drop_prepared: AtomicBool,
    pub drop_confirm: AtomicBool,
    pub lose_commit_reply: AtomicBool,
}

#[allow(dead_code)]
impl LossyEndpoint {
    fn new(inner: Arc<TesseraNode>) -> Self {
        Self {
            inner,
            drop_prepared: AtomicBool::new(false),
            drop_confirm: AtomicBool::new(false),
            lose_commit_reply: AtomicBool::new(false),
        }
    }

    pub fn drop_prepared(&self, drop: bool) {
        self.drop_prepared.store(drop, Ordering::SeqCst);
    }

    pub fn drop_confirm(&self, drop: bool) {
        self.drop_confirm.store(drop, Ordering::SeqCst);
    }

    /// Deliver `PrepareAndCommit` but fail the call instead of replying.
    pub fn lose_commit_reply(&self, lose: bool) {
        self.lose_commit_reply.store(lose, Ordering::SeqCst);
    }
}

#[async_trait]
impl ParticipantEndpoint for LossyEndpoint {
    async fn prepare_and_commit(
        &self,
        request: PrepareAndCommitRequest,
    ) -> Result<CommitOutcome, TransportError> {
        let outcome = self.inner.prepare_and_commit(request).await;
        if self.lose_commit_reply.load(Ordering::SeqCst) {
            return Err(TransportError::Rpc {
                target: self.inner.actor().clone(),
                message: "commit reply lost".into(),
            });
        }
        outcome
    }

    async fn prepared(&self, message: PreparedMessage) -> Result<(), TransportError> {
        if self.drop_prepared.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.prepared(message).await
    }

    async fn ping(&self, request: PingRequest) -> Result<TransactionOutcome, TransportError> {
        self.inner.ping(request).await
    }

    async fn commit_read_only(
        &self,
        request: CommitReadOnlyRequest,
    ) -> Result<TransactionalStatus, TransportError> {
        self.inner.commit_read_only(request).await
    }

    async fn prepare(&self, request: PrepareRequest) -> Result<(), TransportError> {
        self.inner.prepare(request).await
    }

    async fn abort(&self, request: AbortRequest) -> Result<(), TransportError> {
        self.inner.abort(request).await
    }

    async fn cancel(&self, request: CancelRequest) -> Result<(), TransportError> {
        self.inner.cancel(request).await
    }

    async fn confirm(
        &self,
        request: ConfirmRequest,
    ) -> Result<TransactionalStatus, TransportError> {
        if self.drop_confirm.load(Ordering::SeqCst) {
            return Err(TransportError::Rpc {
                target: self.inner.actor().clone(),
                message: "confirm dropped".into(),
            });
        }
        self.inner.confirm(request).await
    }
}

/// In-memory storage that can be told to fail prepares or commits.
#[allow(dead_code)]
pub struct FailingStorage<S> {
    inner: InMemoryStorage<S>,
    fail_prepare: AtomicBool,
    fail_commit: AtomicBool,
}

#[allow(dead_code)]
impl<S: ResourceState> FailingStorage<S> {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStorage::new(),
            fail_prepare: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
        }
    }

    pub fn fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> StoredResource<S> {
        self.inner.snapshot().await
    }
}

#[async_trait]
impl<S: ResourceState> TransactionalStorage<S> for FailingStorage<S> {
    async fn load(&self) -> Result<StoredResource<S>, StorageError> {
        self.inner.load().await
    }

    async fn store(&self, batch: StorageBatch<S>) -> Result<(), StorageError> {
        if batch.prepare.is_some() && self.fail_prepare.load(Ordering::SeqCst) {
            return Err(StorageError::Io("injected prepare failure".into()));
        }
        if batch.commit.is_some() && self.fail_commit.load(Ordering::SeqCst) {
            return Err(StorageError::Io("injected commit failure".into()));
        }
        self.inner.store(batch).await
    }
}

const WAIT: Duration = Duration::from_secs(5);

/// Poll until the committed state of `resource` equals `expected`.
#[allow(dead_code)]
pub async fn wait_for_state<S: ResourceState + PartialEq>(
    resource: &TransactionalResource<S>,
    expected: &S,
) {
    let deadline = Instant::now() + WAIT;
    loop {
        let state = resource.committed_state().await.expect("resource running");
        if &state == expected {
            return;
        }
        if Instant::now() > deadline {
            panic!(
                "{} never reached {:?}, still {:?}",
                resource.name(),
                expected,
                state
            );
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `resource` has no transaction in flight.
#[allow(dead_code)]
pub async fn wait_idle<S: ResourceState>(resource: &TransactionalResource<S>) {
    let deadline = Instant::now() + WAIT;
    loop {
        let snapshot = resource.snapshot().await.expect("resource running");
        if snapshot.in_flight == 0 {
            return;
        }
        if Instant::now() > deadline {
            panic!(
                "{} still has {} transactions in flight",
                resource.name(),
                snapshot.in_flight
            );
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `resource` has exactly `count` transactions holding or
/// waiting for its lock.
#[allow(dead_code)]
pub async fn wait_in_flight<S: ResourceState>(resource: &TransactionalResource<S>, count: usize) {
    let deadline = Instant::now() + WAIT;
    loop {
        let snapshot = resource.snapshot().await.expect("resource running");
        if snapshot.in_flight == count {
            return;
        }
        if Instant::now() > deadline {
            panic!(
                "{} has {} transactions in flight, expected {}",
                resource.name(),
                snapshot.in_flight,
                count
            );
        }
        sleep(Duration::from_millis(10)).await;
    }
}
