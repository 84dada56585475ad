use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::PeerConfig;
use crate::protocol::{ParticipantEndpoint, Transport, TransportError};
use crate::rpc::client::RemoteParticipant;
use crate::transaction::ActorRef;

/// Routing table from actor references to endpoints.
///
/// In-process hosts are served directly; everything else is forwarded over
/// gRPC to the address configured for the actor.
#[derive(Default)]
pub struct Router {
    local: RwLock<HashMap<ActorRef, Weak<dyn ParticipantEndpoint>>>,
    remote: HashMap<ActorRef, String>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peers(peers: &[PeerConfig]) -> Self {
        let remote = peers
            .iter()
            .map(|peer| (ActorRef::new(&peer.actor), normalize_endpoint(&peer.listen_addr)))
            .collect();
        Self {
            local: RwLock::new(HashMap::new()),
            remote,
        }
    }

    /// Serve `actor` from this process. The router does not keep it alive.
    pub async fn register_local(&self, actor: ActorRef, endpoint: Weak<dyn ParticipantEndpoint>) {
        self.local.write().await.insert(actor, endpoint);
    }

    pub async fn unregister_local(&self, actor: &ActorRef) {
        self.local.write().await.remove(actor);
    }
}

#[async_trait]
impl Transport for Router {
    async fn endpoint(
        &self,
        actor: &ActorRef,
    ) -> Result<Arc<dyn ParticipantEndpoint>, TransportError> {
        if let Some(weak) = self.local.read().await.get(actor)
            && let Some(endpoint) = weak.upgrade()
        {
            return Ok(endpoint);
        }

        if let Some(address) = self.remote.get(actor) {
            return Ok(Arc::new(RemoteParticipant::new(actor.clone(), address.clone())));
        }

        Err(TransportError::Unreachable {
            actor: actor.clone(),
            reason: "no route to actor".into(),
        })
    }
}

pub(crate) fn normalize_endpoint(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_addresses_get_a_scheme() {
        assert_eq!(normalize_endpoint("127.0.0.1:1"), "http://127.0.0.1:1");
        assert_eq!(normalize_endpoint("https://host:2"), "https://host:2");
    }

    #[tokio::test]
    async fn unknown_actor_is_not_delivered() {
        let router = Router::new();
        let err = match router.endpoint(&ActorRef::new("nowhere")).await {
            Ok(_) => panic!("expected no route"),
            Err(err) => err,
        };
        assert!(!err.was_delivered());
    }

    #[tokio::test]
    async fn configured_peers_are_routed_over_grpc() {
        let router = Router::with_peers(&[PeerConfig::new("west", "127.0.0.1:50062")]);
        assert!(router.endpoint(&ActorRef::new("west")).await.is_ok());
        assert!(router.endpoint(&ActorRef::new("east")).await.is_err());
    }
}
