use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tessera::protocol::{ParticipantEndpoint, PrepareRequest};
use tessera::storage::{InMemoryStorage, TransactionalStorage};
use tessera::{ParticipantRole, StorageConfig};
use tokio::time::sleep;

#[path = "common.rs"]
mod common;

use common::{Account, Cluster, wait_for_state, wait_idle};

#[tokio::test]
async fn prepared_participant_learns_abort_through_ping() {
    let cluster = Cluster::start(2).await;
    let manager = cluster
        .node(0)
        .create_resource::<Account>("ledger", ParticipantRole::Manager)
        .await
        .unwrap();
    let storage = Arc::new(InMemoryStorage::<Account>::new());
    let vault = cluster
        .node(1)
        .create_resource_with_storage::<Account>("vault", ParticipantRole::Manager, storage.clone())
        .await
        .unwrap();

    // Whatever the vault reports is lost on the way to the manager.
    let lossy = cluster.make_lossy(0).await;
    lossy.drop_prepared(true);

    let ctx = cluster.node(1).agent().begin(false, None);
    vault
        .perform_update(&ctx, |a| a.balance = 500)
        .await
        .unwrap();

    // Prepare the vault against a manager that never heard of the transaction.
    cluster
        .node(1)
        .prepare(PrepareRequest {
            resource: "vault".into(),
            txn: ctx.id(),
            access: ctx.access(vault.participant()),
            timestamp: ctx.timestamp(),
            manager: manager.participant().clone(),
        })
        .await
        .unwrap();

    // The vault pings, the manager answers with an abort, the prepared write
    // is discarded.
    wait_idle(&vault).await;
    let stored = storage.snapshot().await;
    assert!(stored.prepared.is_empty());
    // One batch to prepare, one to discard.
    assert_eq!(storage.write_count(), 2);
    assert_eq!(vault.committed_state().await.unwrap(), Account::default());
    drop(lossy);
}

#[tokio::test]
async fn restarted_participant_finishes_a_committed_transaction() {
    let cluster = Cluster::start(2).await;
    let ledger_storage = Arc::new(InMemoryStorage::<Account>::new());
    let ledger = cluster
        .node(0)
        .create_resource_with_storage::<Account>(
            "ledger",
            ParticipantRole::Manager,
            ledger_storage.clone(),
        )
        .await
        .unwrap();
    let vault_storage = Arc::new(InMemoryStorage::<Account>::new());
    let vault = cluster
        .node(1)
        .create_resource_with_storage::<Account>(
            "vault",
            ParticipantRole::Manager,
            vault_storage.clone(),
        )
        .await
        .unwrap();

    let lossy = cluster.make_lossy(1).await;
    lossy.drop_confirm(true);

    let agent = cluster.node(0).agent().clone();
    let ctx = agent.begin(false, None);
    ledger
        .perform_update(&ctx, |a| a.balance = -75)
        .await
        .unwrap();
    vault
        .perform_update(&ctx, |a| a.balance = 75)
        .await
        .unwrap();
    let receipt = agent.resolve(&ctx.snapshot()).await.expect("commit");
    assert_eq!(ledger.committed_state().await.unwrap().balance, -75);

    // The decision is durable at the manager until the vault acknowledges.
    let stored = ledger_storage.snapshot().await;
    assert_eq!(stored.commit_records.len(), 1);
    assert_eq!(stored.commit_records[0].timestamp, receipt.commit_ts);
    assert_eq!(vault_storage.snapshot().await.prepared.len(), 1);

    // Crash the vault while it only has a prepared record.
    assert!(cluster.node(1).deactivate("vault").await);
    cluster.restore_route(1).await;
    drop(lossy);

    let vault = cluster
        .node(1)
        .create_resource_with_storage::<Account>(
            "vault",
            ParticipantRole::Manager,
            vault_storage.clone(),
        )
        .await
        .unwrap();
    wait_for_state(&vault, &Account { balance: 75 }).await;
    wait_idle(&vault).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while !ledger_storage.snapshot().await.commit_records.is_empty() {
        assert!(Instant::now() < deadline, "commit record never forgotten");
        sleep(Duration::from_millis(10)).await;
    }
    let restored = vault_storage.load().await.unwrap();
    assert!(restored.prepared.is_empty());
    assert!(restored.write_vector.contains(ctx.id()));
}

#[tokio::test]
async fn disk_storage_survives_deactivation() {
    let dir = TempDir::new().unwrap();
    let cluster = Cluster::start_with(1, StorageConfig::disk(dir.path())).await;
    let node = cluster.node(0);
    let account = node
        .create_resource::<Account>("account", ParticipantRole::Manager)
        .await
        .unwrap();

    let ctx = node.agent().begin(false, None);
    account
        .perform_update(&ctx, |a| a.balance = 12)
        .await
        .unwrap();
    let receipt = node.agent().resolve(&ctx.snapshot()).await.unwrap();

    assert!(node.deactivate("account").await);
    assert!(account.committed_state().await.is_err());

    let account = node
        .create_resource::<Account>("account", ParticipantRole::Manager)
        .await
        .unwrap();
    let snapshot = account.snapshot().await.unwrap();
    assert_eq!(snapshot.state.balance, 12);
    assert_eq!(snapshot.timestamp, receipt.commit_ts);
    assert!(snapshot.write_vector.contains(ctx.id()));
}
