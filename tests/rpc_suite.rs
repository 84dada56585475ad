use std::net::SocketAddr;
use std::sync::Arc;

use tessera::protocol::{AbortRequest, ParticipantEndpoint, TransportError};
use tessera::rpc::client::RemoteParticipant;
use tessera::transaction::ActorRef;
use tessera::{
    ConfigError, NodeError, ParticipantRole, PeerConfig, TesseraConfig, TesseraNode,
    TransactionError, TransactionOptions, TransactionalStatus, TxnId,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::transport::Server;
use tonic::transport::server::TcpIncoming;

#[path = "common.rs"]
mod common;

use common::{Account, fast_config, wait_for_state, wait_idle};

/// A node serving its extension endpoint on a real socket.
struct ServedNode {
    addr: SocketAddr,
    node: Arc<TesseraNode>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ServedNode {
    async fn spawn(config: TesseraConfig, listener: TcpListener) -> Self {
        let addr = listener.local_addr().expect("read listener addr");
        let incoming = TcpIncoming::from_listener(listener, true, None).expect("build TcpIncoming");
        let node = TesseraNode::new(config).await.expect("start node");

        let service = node.service();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Self {
            addr,
            node,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.node.shutdown().await;
    }
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    (listener, addr)
}

/// Two nodes that only know each other through their configured peers.
async fn pair() -> (ServedNode, ServedNode) {
    let (first_listener, first_addr) = bind().await;
    let (second_listener, second_addr) = bind().await;

    let first = TesseraConfig::new(1, "bank-east", first_addr.clone())
        .with_peers(vec![PeerConfig::new("bank-west", second_addr.clone())])
        .with_transactions(fast_config());
    let second = TesseraConfig::new(2, "bank-west", second_addr)
        .with_peers(vec![PeerConfig::new("bank-east", first_addr)])
        .with_transactions(fast_config());

    (
        ServedNode::spawn(first, first_listener).await,
        ServedNode::spawn(second, second_listener).await,
    )
}

#[tokio::test]
async fn transfer_between_processes_commits_over_grpc() {
    let (mut east, mut west) = pair().await;
    let checking = east
        .node
        .create_resource::<Account>("checking", ParticipantRole::Manager)
        .await
        .unwrap();
    let savings = west
        .node
        .create_resource::<Account>("savings", ParticipantRole::Manager)
        .await
        .unwrap();

    // The agent runs on east, so every message to savings crosses the wire.
    let interceptor = east.node.interceptor();
    let (from, to) = (checking.clone(), savings.clone());
    interceptor
        .invoke(TransactionOptions::default(), |ctx| async move {
            let ctx = ctx.expect("transaction created");
            from.perform_update(&ctx, |a| a.balance -= 40).await?;
            to.perform_update(&ctx, |a| a.balance += 40).await?;
            Ok::<_, TransactionError>(())
        })
        .await
        .expect("transfer commits");

    wait_for_state(&checking, &Account { balance: -40 }).await;
    wait_for_state(&savings, &Account { balance: 40 }).await;
    wait_idle(&checking).await;
    wait_idle(&savings).await;

    east.stop().await;
    west.stop().await;
}

#[tokio::test]
async fn unknown_resource_is_reported_as_not_delivered() {
    let (mut east, mut west) = pair().await;

    let remote = RemoteParticipant::new(ActorRef::new("bank-west"), west.endpoint());
    let err = remote
        .abort(AbortRequest {
            resource: "missing".into(),
            txn: TxnId::for_replica(1, 1),
            status: TransactionalStatus::UserAbort,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::UnknownResource { .. }));
    assert!(!err.was_delivered());

    east.stop().await;
    west.stop().await;
}

#[tokio::test]
async fn stopped_peer_is_unreachable() {
    let (mut east, mut west) = pair().await;
    let endpoint = east.endpoint();
    east.stop().await;

    let remote = RemoteParticipant::new(ActorRef::new("bank-east"), endpoint);
    let err = remote
        .abort(AbortRequest {
            resource: "checking".into(),
            txn: TxnId::for_replica(2, 1),
            status: TransactionalStatus::UserAbort,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Unreachable { .. }));

    west.stop().await;
}

#[tokio::test]
async fn host_with_peers_needs_its_own_node_id() {
    let peers = vec![PeerConfig::new("bank-west", "127.0.0.1:50062")];
    let unset = TesseraConfig::new(0, "bank-east", "127.0.0.1:0").with_peers(peers.clone());
    match TesseraNode::new(unset).await {
        Err(NodeError::Config(ConfigError::Invalid(_))) => {}
        Err(other) => panic!("expected a config error, got {other}"),
        Ok(_) => panic!("node started with an unset node_id"),
    }

    let node = TesseraNode::new(TesseraConfig::new(3, "bank-east", "127.0.0.1:0").with_peers(peers))
        .await
        .expect("distinct node_id starts");
    assert_eq!(node.agent().replica(), 3);
    node.shutdown().await;
}
