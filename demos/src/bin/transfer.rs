use std::sync::Arc;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tessera::{
    LogicalClock, ParticipantRole, Router, TesseraConfig, TesseraNode, TransactionError,
    TransactionOption, TransactionOptions,
};
use tracing_subscriber::EnvFilter;

/// Moves money between two accounts hosted on different in-process hosts.
#[derive(Parser, Debug)]
#[command(name = "transfer", about = "Two-host bank transfer walkthrough")]
struct Args {
    /// Starting balance of both accounts.
    #[arg(long, default_value_t = 100)]
    initial: i64,

    /// Amount to move from alice to bob.
    #[arg(long, default_value_t = 30)]
    amount: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Account {
    balance: i64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let router = Arc::new(Router::new());
    let clock = Arc::new(LogicalClock::system());
    let east = TesseraNode::with_router(
        TesseraConfig::new(1, "east", "127.0.0.1:0"),
        router.clone(),
        clock.clone(),
    )
    .await;
    let west = TesseraNode::with_router(TesseraConfig::new(2, "west", "127.0.0.1:0"), router, clock)
        .await;

    let alice = east
        .create_resource::<Account>("alice", ParticipantRole::Manager)
        .await?;
    let bob = west
        .create_resource::<Account>("bob", ParticipantRole::Manager)
        .await?;
    println!("alice lives on {}, bob on {}", east.actor(), west.actor());

    let interceptor = east.interceptor();
    let initial = args.initial;
    let (a, b) = (alice.clone(), bob.clone());
    interceptor
        .invoke(TransactionOptions::default(), |ctx| async move {
            let ctx = ctx.ok_or(TransactionError::TransactionRequired)?;
            a.perform_update(&ctx, move |s| s.balance = initial).await?;
            b.perform_update(&ctx, move |s| s.balance = initial).await?;
            Ok::<_, TransactionError>(())
        })
        .await?;
    println!("opened both accounts with {initial}");

    let amount = args.amount;
    let (a, b) = (alice.clone(), bob.clone());
    let moved = interceptor
        .invoke(TransactionOptions::default(), |ctx| async move {
            let ctx = ctx.ok_or(TransactionError::TransactionRequired)?;
            let available = a
                .perform_update(&ctx, move |s| {
                    s.balance -= amount;
                    s.balance
                })
                .await?;
            if available < 0 {
                return Err(TransactionError::Application(format!(
                    "alice cannot cover {amount}"
                )));
            }
            b.perform_update(&ctx, move |s| s.balance += amount).await?;
            Ok(amount)
        })
        .await;
    match moved {
        Ok(amount) => println!("moved {amount} from alice to bob"),
        Err(err) => println!("transfer rolled back: {err}"),
    }

    let (a, b) = (alice.clone(), bob.clone());
    let (left, right) = interceptor
        .invoke(
            TransactionOptions::new(TransactionOption::Create).read_only(),
            |ctx| async move {
                let ctx = ctx.ok_or(TransactionError::TransactionRequired)?;
                let left = a.perform_read(&ctx, |s| s.balance).await?;
                let right = b.perform_read(&ctx, |s| s.balance).await?;
                Ok::<_, TransactionError>((left, right))
            },
        )
        .await?;
    println!("alice has {left}, bob has {right}, together {}", left + right);

    east.shutdown().await;
    west.shutdown().await;
    Ok(())
}
