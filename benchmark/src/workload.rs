use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tessera::{
    LogicalClock, ParticipantRole, Router, StorageConfig, TesseraConfig, TesseraNode,
    TransactionError, TransactionOption, TransactionOptions, TransactionalResource,
};
use tokio::time::sleep;
use tracing::{info, warn};

const MAX_ATTEMPTS: usize = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    pub balance: i64,
}

#[derive(Clone, Debug)]
pub struct WorkloadConfig {
    pub hosts: usize,
    pub accounts: usize,
    pub transfers: usize,
    pub threads: usize,
    pub initial_balance: i64,
    pub max_amount: i64,
}

#[derive(Clone, Debug)]
pub struct RunMeasurement {
    pub duration: Duration,
    pub transfers: usize,
    pub commits: usize,
    pub aborts: usize,
    pub in_doubt: usize,
    pub gave_up: usize,
    pub total_balance: i64,
}

/// Hosts sharing one router and clock, each owning a slice of the accounts.
struct Bank {
    nodes: Vec<Arc<TesseraNode>>,
    accounts: Vec<(usize, TransactionalResource<Account>)>,
}

impl Bank {
    async fn open(
        plan: &WorkloadConfig,
        storage_root: Option<&Path>,
        experiment: &str,
        run_idx: usize,
    ) -> Result<Self> {
        let storage = match storage_root {
            Some(root) => {
                StorageConfig::disk(root.join(format!("{experiment}-run-{run_idx}")))
            }
            None => StorageConfig::memory(),
        };

        let router = Arc::new(Router::new());
        let clock = Arc::new(LogicalClock::system());
        let mut nodes = Vec::with_capacity(plan.hosts);
        for id in 0..plan.hosts {
            let config = TesseraConfig::new(id as u64 + 1, format!("bench-{id}"), "127.0.0.1:0")
                .with_storage(storage.clone());
            nodes.push(TesseraNode::with_router(config, router.clone(), clock.clone()).await);
        }

        let mut accounts = Vec::with_capacity(plan.accounts);
        for index in 0..plan.accounts {
            let host = index % plan.hosts;
            let account = nodes[host]
                .create_resource::<Account>(
                    &format!("account-{index:04}"),
                    ParticipantRole::Manager,
                )
                .await
                .with_context(|| format!("create account {index}"))?;
            accounts.push((host, account));
        }

        Ok(Self { nodes, accounts })
    }

    async fn seed(&self, balance: i64) -> Result<()> {
        for (host, account) in &self.accounts {
            let account = account.clone();
            self.nodes[*host]
                .interceptor()
                .invoke(TransactionOptions::default(), |ctx| async move {
                    let ctx = ctx.ok_or(TransactionError::TransactionRequired)?;
                    account.perform_update(&ctx, move |a| a.balance = balance).await
                })
                .await
                .context("seed account")?;
        }
        Ok(())
    }

    /// Sum of every balance, read in one read-only transaction.
    async fn audit(&self) -> Result<i64> {
        let accounts: Vec<_> = self.accounts.iter().map(|(_, a)| a.clone()).collect();
        let options = TransactionOptions::new(TransactionOption::Create).read_only();
        let total = self.nodes[0]
            .interceptor()
            .invoke(options, |ctx| async move {
                let ctx = ctx.ok_or(TransactionError::TransactionRequired)?;
                let mut total = 0;
                for account in &accounts {
                    total += account.perform_read(&ctx, |a| a.balance).await?;
                }
                Ok::<_, TransactionError>(total)
            })
            .await
            .context("audit balances")?;
        Ok(total)
    }

    async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

#[derive(Default)]
struct Counters {
    claimed: AtomicUsize,
    commits: AtomicUsize,
    aborts: AtomicUsize,
    in_doubt: AtomicUsize,
    gave_up: AtomicUsize,
}

pub async fn run_workload(
    plan: &WorkloadConfig,
    run_idx: usize,
    storage_root: Option<&Path>,
    experiment: &str,
) -> Result<RunMeasurement> {
    if plan.hosts == 0 {
        return Err(anyhow!("hosts must be greater than zero"));
    }
    if plan.accounts < 2 {
        return Err(anyhow!("a transfer needs at least two accounts"));
    }

    let bank = Arc::new(Bank::open(plan, storage_root, experiment, run_idx).await?);
    let result = run_workload_inner(plan, run_idx, bank.clone()).await;
    bank.shutdown().await;
    result
}

async fn run_workload_inner(
    plan: &WorkloadConfig,
    run_idx: usize,
    bank: Arc<Bank>,
) -> Result<RunMeasurement> {
    bank.seed(plan.initial_balance).await?;
    let counters = Arc::new(Counters::default());
    let start = Instant::now();

    let threads = plan.threads.max(1);
    let mut handles = Vec::with_capacity(threads);
    for worker in 0..threads {
        let bank = bank.clone();
        let counters = counters.clone();
        let plan = plan.clone();
        let handle = tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed_from(run_idx as u64, worker as u64));
            loop {
                let index = counters.claimed.fetch_add(1, Ordering::SeqCst);
                if index >= plan.transfers {
                    break;
                }
                let from = rng.gen_range(0..plan.accounts);
                let mut to = rng.gen_range(0..plan.accounts - 1);
                if to >= from {
                    to += 1;
                }
                let amount = rng.gen_range(1..=plan.max_amount.max(1));
                execute_transfer(&bank, &counters, from, to, amount).await;
            }
        });
        handles.push(handle);
    }

    for handle in handles {
        handle
            .await
            .map_err(|join_err| anyhow!("worker panicked: {join_err}"))?;
    }
    let duration = start.elapsed();

    let total_balance = bank.audit().await?;
    let expected = plan.initial_balance * plan.accounts as i64;
    if total_balance != expected {
        warn!(total_balance, expected, "balances do not add up");
    }

    Ok(RunMeasurement {
        duration,
        transfers: plan.transfers,
        commits: counters.commits.load(Ordering::SeqCst),
        aborts: counters.aborts.load(Ordering::SeqCst),
        in_doubt: counters.in_doubt.load(Ordering::SeqCst),
        gave_up: counters.gave_up.load(Ordering::SeqCst),
        total_balance,
    })
}

/// Retry one transfer until it commits, its outcome is unknown, or it has
/// been aborted too often.
async fn execute_transfer(bank: &Bank, counters: &Counters, from: usize, to: usize, amount: i64) {
    let (host, source) = &bank.accounts[from];
    let (_, target) = &bank.accounts[to];
    let interceptor = bank.nodes[*host].interceptor();

    for attempt in 1..=MAX_ATTEMPTS {
        let (source, target) = (source.clone(), target.clone());
        let result = interceptor
            .invoke(TransactionOptions::default(), |ctx| async move {
                let ctx = ctx.ok_or(TransactionError::TransactionRequired)?;
                source.perform_update(&ctx, move |a| a.balance -= amount).await?;
                target.perform_update(&ctx, move |a| a.balance += amount).await?;
                Ok::<_, TransactionError>(())
            })
            .await;

        match result {
            Ok(()) => {
                counters.commits.fetch_add(1, Ordering::SeqCst);
                return;
            }
            Err(TransactionError::InDoubt { txn, reason }) => {
                warn!(%txn, %reason, "transfer outcome in doubt");
                counters.in_doubt.fetch_add(1, Ordering::SeqCst);
                return;
            }
            Err(err) => {
                counters.aborts.fetch_add(1, Ordering::SeqCst);
                if attempt % 10 == 0 {
                    info!(attempt, error = %err, "transfer still retrying");
                }
                sleep(Duration::from_millis(attempt as u64)).await;
            }
        }
    }
    counters.gave_up.fetch_add(1, Ordering::SeqCst);
}

fn seed_from(run_idx: u64, worker: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    run_idx.hash(&mut hasher);
    worker.hash(&mut hasher);
    hasher.finish()
}
