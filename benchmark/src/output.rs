use serde::Serialize;

use crate::workload::RunMeasurement;

#[derive(Serialize)]
pub struct RunSnapshot {
    pub run: usize,
    pub duration_ms: u128,
    pub transfers: usize,
    pub commits: usize,
    pub aborts: usize,
    pub in_doubt: usize,
    pub gave_up: usize,
    pub total_balance: i64,
    pub commits_per_sec: f64,
}

impl RunSnapshot {
    pub fn new(run: usize, measurement: &RunMeasurement) -> Self {
        Self {
            run,
            duration_ms: measurement.duration.as_millis(),
            transfers: measurement.transfers,
            commits: measurement.commits,
            aborts: measurement.aborts,
            in_doubt: measurement.in_doubt,
            gave_up: measurement.gave_up,
            total_balance: measurement.total_balance,
            commits_per_sec: measurement.commits as f64 / measurement.duration.as_secs_f64(),
        }
    }
}

#[derive(Serialize)]
pub struct TrimmedStats {
    pub runs_used: usize,
    pub mean_ms: f64,
    pub commits_per_sec: f64,
    pub abort_rate: f64,
    pub durations_ms: Vec<u128>,
}

#[derive(Serialize)]
pub struct ExperimentReport {
    pub name: String,
    pub hosts: usize,
    pub accounts: usize,
    pub threads: usize,
    pub runs: Vec<RunSnapshot>,
    pub trimmed: TrimmedStats,
}

/// Drop the fastest and slowest run when there are more than two.
pub fn trim_runs(runs: &[RunSnapshot]) -> TrimmedStats {
    if runs.is_empty() {
        return TrimmedStats {
            runs_used: 0,
            mean_ms: 0.0,
            commits_per_sec: 0.0,
            abort_rate: 0.0,
            durations_ms: Vec::new(),
        };
    }

    let mut ordered: Vec<&RunSnapshot> = runs.iter().collect();
    ordered.sort_by_key(|run| run.duration_ms);
    let slice = if ordered.len() > 2 {
        &ordered[1..ordered.len() - 1]
    } else {
        &ordered[..]
    };

    let used = slice.len() as f64;
    let durations_ms = slice.iter().map(|run| run.duration_ms).collect::<Vec<_>>();
    let mean_ms = durations_ms.iter().copied().sum::<u128>() as f64 / used;
    let commits_per_sec = slice.iter().map(|run| run.commits_per_sec).sum::<f64>() / used;
    let attempts: usize = slice.iter().map(|run| run.commits + run.aborts).sum();
    let aborts: usize = slice.iter().map(|run| run.aborts).sum();
    let abort_rate = if attempts == 0 {
        0.0
    } else {
        aborts as f64 / attempts as f64
    };

    TrimmedStats {
        runs_used: slice.len(),
        mean_ms,
        commits_per_sec,
        abort_rate,
        durations_ms,
    }
}
