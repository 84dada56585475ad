mod output;
mod workload;

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use output::{ExperimentReport, RunSnapshot, TrimmedStats, trim_runs};
use workload::WorkloadConfig;

#[derive(Parser, Debug)]
#[command(name = "tessera-benchmark")]
struct Args {
    /// Label for this run (used in output).
    #[arg(long, default_value = "run")]
    label: String,

    /// Number of hosts sharing the accounts.
    #[arg(long, default_value_t = 3)]
    hosts: usize,

    /// Number of accounts; fewer accounts means more contention.
    #[arg(long, default_value_t = 16)]
    accounts: usize,

    /// Number of transfers to commit per run.
    #[arg(long, default_value_t = 1000)]
    transfers: usize,

    /// Number of concurrent workers issuing transfers.
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Starting balance of every account.
    #[arg(long, default_value_t = 1_000)]
    initial_balance: i64,

    /// Largest amount moved by one transfer.
    #[arg(long, default_value_t = 10)]
    max_amount: i64,

    /// Directory to write per-experiment JSON reports.
    #[arg(long, default_value = "benchmark/reports")]
    report_dir: PathBuf,

    /// Optional root directory for disk storage; memory when omitted.
    #[arg(long)]
    storage_root: Option<PathBuf>,

    /// Number of times to run the experiment.
    #[arg(long, default_value_t = 5)]
    runs: usize,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let workload = WorkloadConfig {
        hosts: args.hosts,
        accounts: args.accounts,
        transfers: args.transfers,
        threads: args.threads,
        initial_balance: args.initial_balance,
        max_amount: args.max_amount,
    };

    println!("=== {} ===", args.label);
    let mut runs = Vec::with_capacity(args.runs);
    for run_idx in 0..args.runs {
        let measurement = workload::run_workload(
            &workload,
            run_idx,
            args.storage_root.as_deref(),
            &args.label,
        )
        .await?;
        let snapshot = RunSnapshot::new(run_idx + 1, &measurement);
        println!(
            "  run {:>2}: {:>8.2?} ({:.1} commits/s, aborts={}, in doubt={}, gave up={}, total={})",
            snapshot.run,
            measurement.duration,
            snapshot.commits_per_sec,
            snapshot.aborts,
            snapshot.in_doubt,
            snapshot.gave_up,
            snapshot.total_balance
        );
        runs.push(snapshot);
    }

    let trimmed = trim_runs(&runs);
    print_trimmed(&trimmed);
    let report = ExperimentReport {
        name: args.label.clone(),
        hosts: args.hosts,
        accounts: args.accounts,
        threads: args.threads,
        runs,
        trimmed,
    };
    write_report(&args.report_dir, &report)?;

    Ok(())
}

fn print_trimmed(stats: &TrimmedStats) {
    println!(
        "  trimmed (middle {}): mean {:.2} ms, {:.1} commits/s, abort rate {:.3}",
        stats.runs_used, stats.mean_ms, stats.commits_per_sec, stats.abort_rate
    );
    println!("  middle durations (ms): {:?}", stats.durations_ms);
    println!();
}

fn write_report(dir: &Path, report: &ExperimentReport) -> Result<()> {
    create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(format!("{}.json", report.name));
    let file = File::create(&path).with_context(|| format!("create {}", path.display()))?;
    serde_json::to_writer_pretty(file, report).context("write report")?;
    println!("    wrote {}", path.display());
    Ok(())
}
