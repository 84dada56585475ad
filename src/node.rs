use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::agent::TransactionAgent;
use crate::clock::LogicalClock;
use crate::committer::{CommitOperation, CommitterState, TransactionCommitter, committer_hook};
use crate::config::{ConfigError, TesseraConfig};
use crate::interceptor::TransactionInterceptor;
use crate::network::Router;
use crate::protocol::{
    AbortRequest, CancelRequest, CommitOutcome, CommitReadOnlyRequest, ConfirmRequest,
    ParticipantEndpoint, PingRequest, PrepareAndCommitRequest, PrepareRequest, PreparedMessage,
    TransportError,
};
use crate::queue::{CommitHook, QueueEnvironment, TransactionalResource};
use crate::rpc::server::TransactionExtensionService;
use crate::rpc::service::transaction_extension_server::TransactionExtensionServer;
use crate::storage::{ResourceState, StorageAdapter, StorageError, TransactionalStorage};
use crate::transaction::{
    ActorRef, ParticipantId, ParticipantRole, TransactionOutcome, TransactionalStatus,
};

/// Errors raised while wiring a node together.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("resource {0} is already hosted here")]
    DuplicateResource(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("invalid listen address {0}")]
    InvalidAddress(String),
    #[error("server error: {0}")]
    Serve(#[from] tonic::transport::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Resource queue as seen by the node, independent of its state type.
#[async_trait]
trait HostedResource: ParticipantEndpoint {
    async fn stop(&self);
}

#[async_trait]
impl<S: ResourceState> HostedResource for TransactionalResource<S> {
    async fn stop(&self) {
        self.shutdown().await;
    }
}

/// One host: a set of transactional resources, the agent that starts
/// transactions here, and the endpoint peers send protocol messages to.
pub struct TesseraNode {
    config: TesseraConfig,
    actor: ActorRef,
    clock: Arc<LogicalClock>,
    router: Arc<Router>,
    agent: Arc<TransactionAgent>,
    resources: RwLock<HashMap<String, Arc<dyn HostedResource>>>,
}

impl TesseraNode {
    /// Node with its own router built from the configured peers.
    pub async fn new(config: TesseraConfig) -> Result<Arc<Self>, NodeError> {
        config.validate()?;
        let router = Arc::new(Router::with_peers(&config.peers));
        Ok(Self::with_router(config, router, Arc::new(LogicalClock::system())).await)
    }

    /// Node sharing `router` and `clock`, e.g. several hosts in one process.
    pub async fn with_router(
        config: TesseraConfig,
        router: Arc<Router>,
        clock: Arc<LogicalClock>,
    ) -> Arc<Self> {
        let actor = ActorRef::new(&config.actor);
        let agent = Arc::new(TransactionAgent::new(
            config.node_id,
            clock.clone(),
            router.clone(),
            config.transactions.clone(),
        ));
        let node = Arc::new(Self {
            config,
            actor: actor.clone(),
            clock,
            router: router.clone(),
            agent,
            resources: RwLock::new(HashMap::new()),
        });

        let weak: Weak<TesseraNode> = Arc::downgrade(&node);
        let endpoint: Weak<dyn ParticipantEndpoint> = weak;
        router.register_local(actor.clone(), endpoint).await;
        info!(node_id = node.config.node_id, %actor, "node started");
        node
    }

    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    pub fn actor(&self) -> &ActorRef {
        &self.actor
    }

    pub fn clock(&self) -> &Arc<LogicalClock> {
        &self.clock
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn agent(&self) -> &Arc<TransactionAgent> {
        &self.agent
    }

    pub fn interceptor(&self) -> TransactionInterceptor {
        TransactionInterceptor::new(self.agent.clone())
    }

    pub fn participant(&self, name: &str, role: ParticipantRole) -> ParticipantId {
        ParticipantId::new(name, self.actor.clone(), role)
    }

    /// Host a resource backed by the configured storage.
    pub async fn create_resource<S: ResourceState>(
        &self,
        name: &str,
        role: ParticipantRole,
    ) -> Result<TransactionalResource<S>, NodeError> {
        let storage = StorageAdapter::<S>::create(&self.config.storage, name, self.actor.as_str())?;
        self.host(name, role, Arc::new(storage), None).await
    }

    pub async fn create_resource_with_storage<S: ResourceState>(
        &self,
        name: &str,
        role: ParticipantRole,
        storage: Arc<dyn TransactionalStorage<S>>,
    ) -> Result<TransactionalResource<S>, NodeError> {
        self.host(name, role, storage, None).await
    }

    pub async fn create_committer<O: CommitOperation>(
        &self,
        name: &str,
    ) -> Result<TransactionCommitter<O>, NodeError> {
        let storage = StorageAdapter::<CommitterState<O>>::create(
            &self.config.storage,
            name,
            self.actor.as_str(),
        )?;
        let resource = self
            .host(
                name,
                ParticipantRole::PriorityManager,
                Arc::new(storage),
                Some(committer_hook::<O>()),
            )
            .await?;
        Ok(TransactionCommitter::new(resource))
    }

    async fn host<S: ResourceState>(
        &self,
        name: &str,
        role: ParticipantRole,
        storage: Arc<dyn TransactionalStorage<S>>,
        hook: Option<Arc<dyn CommitHook<S>>>,
    ) -> Result<TransactionalResource<S>, NodeError> {
        let mut resources = self.resources.write().await;
        if resources.contains_key(name) {
            return Err(NodeError::DuplicateResource(name.to_string()));
        }

        let env = QueueEnvironment {
            clock: self.clock.clone(),
            transport: self.router.clone(),
            config: self.config.transactions.clone(),
        };
        let resource =
            TransactionalResource::start(self.participant(name, role), env, storage, hook).await?;
        resources.insert(name.to_string(), Arc::new(resource.clone()));
        info!(actor = %self.actor, resource = name, ?role, "resource activated");
        Ok(resource)
    }

    /// Stop hosting `name`. Its durable state stays behind for a later
    /// activation to restore from.
    pub async fn deactivate(&self, name: &str) -> bool {
        let removed = self.resources.write().await.remove(name);
        match removed {
            Some(resource) => {
                resource.stop().await;
                info!(actor = %self.actor, resource = name, "resource deactivated");
                true
            }
            None => false,
        }
    }

    /// Stop every resource and leave the router.
    pub async fn shutdown(&self) {
        let resources: Vec<_> = self.resources.write().await.drain().collect();
        for (_, resource) in resources {
            resource.stop().await;
        }
        self.router.unregister_local(&self.actor).await;
        info!(actor = %self.actor, "node stopped");
    }

    /// gRPC service exposing this node to remote hosts.
    pub fn service(self: &Arc<Self>) -> TransactionExtensionServer<TransactionExtensionService> {
        let endpoint: Arc<dyn ParticipantEndpoint> = self.clone();
        TransactionExtensionService::new(endpoint).into_server()
    }

    /// Serve on the configured listen address until `shutdown` resolves.
    pub async fn serve(
        self: &Arc<Self>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), NodeError> {
        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .map_err(|_| NodeError::InvalidAddress(self.config.listen_addr.clone()))?;
        info!(actor = %self.actor, %addr, "serving transaction extension");
        let endpoint: Arc<dyn ParticipantEndpoint> = self.clone();
        crate::rpc::server::serve(endpoint, addr, shutdown).await?;
        Ok(())
    }

    async fn resource(&self, name: &str) -> Result<Arc<dyn HostedResource>, TransportError> {
        self.resources
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::UnknownResource {
                actor: self.actor.clone(),
                resource: name.to_string(),
            })
    }
}

#[async_trait]
impl ParticipantEndpoint for TesseraNode {
    async fn prepare_and_commit(
        &self,
        request: PrepareAndCommitRequest,
    ) -> Result<CommitOutcome, TransportError> {
        self.resource(&request.resource)
            .await?
            .prepare_and_commit(request)
            .await
    }

    async fn prepared(&self, message: PreparedMessage) -> Result<(), TransportError> {
        self.resource(&message.resource).await?.prepared(message).await
    }

    async fn ping(
        &self,
        request: PingRequest,
    ) -> Result<TransactionOutcome, TransportError> {
        self.resource(&request.resource).await?.ping(request).await
    }

    async fn commit_read_only(
        &self,
        request: CommitReadOnlyRequest,
    ) -> Result<TransactionalStatus, TransportError> {
        self.resource(&request.resource)
            .await?
            .commit_read_only(request)
            .await
    }

    async fn prepare(&self, request: PrepareRequest) -> Result<(), TransportError> {
        self.resource(&request.resource).await?.prepare(request).await
    }

    async fn abort(&self, request: AbortRequest) -> Result<(), TransportError> {
        self.resource(&request.resource).await?.abort(request).await
    }

    async fn cancel(&self, request: CancelRequest) -> Result<(), TransportError> {
        self.resource(&request.resource).await?.cancel(request).await
    }

    async fn confirm(
        &self,
        request: ConfirmRequest,
    ) -> Result<TransactionalStatus, TransportError> {
        self.resource(&request.resource).await?.confirm(request).await
    }
}
