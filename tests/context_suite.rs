use tessera::{
    ParticipantRole, TransactionContext, TransactionError, TransactionOption, TransactionOptions,
    TransactionalStatus,
};

#[path = "common.rs"]
mod common;

use common::{Account, Cluster, wait_for_state, wait_idle};

fn options(option: TransactionOption) -> TransactionOptions {
    TransactionOptions::new(option)
}

#[tokio::test]
async fn join_requires_an_ambient_transaction() {
    let cluster = Cluster::start(1).await;
    let interceptor = cluster.node(0).interceptor();

    let err = interceptor
        .invoke(options(TransactionOption::Join), |_| async {
            Ok::<_, TransactionError>(())
        })
        .await
        .unwrap_err();
    assert_eq!(err, TransactionError::TransactionRequired);

    // Supported runs without one.
    let seen = interceptor
        .invoke(options(TransactionOption::Supported), |ctx| async move {
            Ok::<_, TransactionError>(ctx.is_none() && TransactionContext::current().is_none())
        })
        .await
        .unwrap();
    assert!(seen);
}

#[tokio::test]
async fn nested_options_see_the_right_ambient_context() {
    let cluster = Cluster::start(1).await;
    let interceptor = cluster.node(0).interceptor();

    let inner = interceptor.clone();
    interceptor
        .invoke(options(TransactionOption::Create), |outer| async move {
            let outer = outer.expect("created");
            let outer_id = outer.id();
            assert_eq!(TransactionContext::current().map(|c| c.id()), Some(outer_id));

            let joined = inner
                .invoke(options(TransactionOption::CreateOrJoin), |ctx| async move {
                    Ok::<_, TransactionError>(ctx.map(|c| c.id()))
                })
                .await?;
            assert_eq!(joined, Some(outer_id));

            let fresh = inner
                .invoke(options(TransactionOption::Create), |ctx| async move {
                    Ok::<_, TransactionError>(ctx.map(|c| c.id()))
                })
                .await?;
            assert!(fresh.is_some());
            assert_ne!(fresh, Some(outer_id));

            let suppressed = inner
                .invoke(options(TransactionOption::Suppress), |ctx| async move {
                    let detached = ctx.is_none() && TransactionContext::current().is_none();
                    Ok::<_, TransactionError>(detached)
                })
                .await?;
            assert!(suppressed);

            let refused = inner
                .invoke(options(TransactionOption::NotAllowed), |_| async {
                    Ok::<_, TransactionError>(())
                })
                .await;
            assert_eq!(refused, Err(TransactionError::TransactionNotAllowed));

            // Still attached after every nested call returned.
            assert_eq!(TransactionContext::current().map(|c| c.id()), Some(outer_id));
            Ok::<_, TransactionError>(())
        })
        .await
        .expect("outer transaction commits");

    assert!(TransactionContext::current().is_none());
}

#[tokio::test]
async fn joined_calls_fold_their_access_into_the_caller() {
    let cluster = Cluster::start(2).await;
    let left = cluster
        .node(0)
        .create_resource::<Account>("left", ParticipantRole::Manager)
        .await
        .unwrap();
    let right = cluster
        .node(1)
        .create_resource::<Account>("right", ParticipantRole::Manager)
        .await
        .unwrap();

    let interceptor = cluster.node(0).interceptor();
    let inner = interceptor.clone();
    let (l, r) = (left.clone(), right.clone());
    interceptor
        .invoke(TransactionOptions::default(), |ctx| async move {
            let ctx = ctx.expect("created");
            l.perform_update(&ctx, |s| s.balance += 1).await?;

            // A nested call on another host joins and writes there.
            inner
                .invoke(TransactionOptions::default(), |child| async move {
                    let child = child.expect("joined");
                    r.perform_update(&child, |s| s.balance += 1).await?;
                    Ok::<_, TransactionError>(())
                })
                .await?;

            let info = ctx.snapshot();
            assert_eq!(info.pending_calls(), 0);
            assert_eq!(info.writers().len(), 2);
            Ok::<_, TransactionError>(())
        })
        .await
        .expect("commit");

    wait_for_state(&left, &Account { balance: 1 }).await;
    wait_for_state(&right, &Account { balance: 1 }).await;
}

#[tokio::test]
async fn failed_call_aborts_the_created_transaction() {
    let cluster = Cluster::start(1).await;
    let account = cluster
        .node(0)
        .create_resource::<Account>("account", ParticipantRole::Manager)
        .await
        .unwrap();
    let interceptor = cluster.node(0).interceptor();

    let handle = account.clone();
    let err = interceptor
        .invoke(TransactionOptions::default(), |ctx| async move {
            let ctx = ctx.expect("created");
            handle.perform_update(&ctx, |s| s.balance = 99).await?;
            Err::<(), _>(TransactionError::Application("insufficient funds".into()))
        })
        .await
        .unwrap_err();

    match err {
        TransactionError::Aborted { status, cause, .. } => {
            assert_eq!(status, TransactionalStatus::CascadingAbort);
            assert!(cause.unwrap_or_default().contains("insufficient funds"));
        }
        other => panic!("expected an abort, got {other:?}"),
    }

    wait_idle(&account).await;
    assert_eq!(account.committed_state().await.unwrap().balance, 0);
}

#[tokio::test]
async fn failure_inside_a_joined_call_dooms_the_transaction() {
    let cluster = Cluster::start(1).await;
    let account = cluster
        .node(0)
        .create_resource::<Account>("account", ParticipantRole::Manager)
        .await
        .unwrap();
    let interceptor = cluster.node(0).interceptor();
    let inner = interceptor.clone();

    let handle = account.clone();
    let err = interceptor
        .invoke(TransactionOptions::default(), |ctx| async move {
            let ctx = ctx.expect("created");
            handle.perform_update(&ctx, |s| s.balance = 1).await?;
            // The caller swallows the nested failure, but it was recorded.
            let _ = inner
                .invoke(TransactionOptions::default(), |_| async {
                    Err::<(), _>(TransactionError::aborted(
                        ctx.id(),
                        TransactionalStatus::UserAbort,
                        None::<String>,
                    ))
                })
                .await;
            Ok::<_, TransactionError>(())
        })
        .await
        .unwrap_err();

    match err {
        TransactionError::Aborted { status, .. } => {
            assert_eq!(status, TransactionalStatus::UserAbort)
        }
        other => panic!("expected an abort, got {other:?}"),
    }
    wait_idle(&account).await;
    assert_eq!(account.committed_state().await.unwrap().balance, 0);
}
