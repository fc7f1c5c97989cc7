// Master-side stats aggregation
//
// Driver nodes post one StatsSummary per (workload, spec, interval, target).
// Summaries are merged until every host has reported for every target, then
// the interval is rolled up, printed and kept for verdict queries. Only the
// most recent completed rollups are kept.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use super::rollup::StatsRollup;
use super::summary::StatsSummary;
use crate::error::{DriverError, Result};
use crate::messages::InitializeRunStatsMessage;

/// Progress of one interval on the master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct RollupStatus {
    pub num_samples_expected: u32,
    pub num_samples_received: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollup: Option<StatsRollup>,
}

impl RollupStatus {
    pub fn is_complete(&self) -> bool {
        self.rollup.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IntervalKey {
    workload: String,
    spec: String,
    interval: String,
}

#[derive(Debug, Default)]
struct IntervalAggregate {
    /// Merged so far; dropped once the rollup is built
    summary: Option<StatsSummary>,
    received: u32,
    rollup: Option<StatsRollup>,
}

#[derive(Debug)]
struct RunStats {
    hosts: Vec<String>,
    output_dir: String,
    targets_per_workload: HashMap<String, u32>,
    started_at: Option<i64>,
    intervals: HashMap<IntervalKey, IntervalAggregate>,
    /// Completed intervals, oldest first
    completed: VecDeque<IntervalKey>,
    /// (workload, spec) in first-completion order
    spec_order: Vec<(String, String)>,
    /// Whole-run totals per (workload, spec)
    totals: HashMap<(String, String), StatsSummary>,
}

impl RunStats {
    fn expected_for(&self, workload: &str) -> u32 {
        let targets = self.targets_per_workload.get(workload).copied().unwrap_or(1).max(1);
        self.hosts.len() as u32 * targets
    }
}

/// CSV line waiting to be written outside the lock
struct CsvWrite {
    path: PathBuf,
    row: String,
}

/// Completed interval rollups kept per run
pub const DEFAULT_RETAINED_ROLLUPS: usize = 4096;

/// Per-run aggregation of summaries posted by driver nodes
pub struct StatsAggregator {
    runs: Mutex<HashMap<String, RunStats>>,
    retained_rollups: usize,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            retained_rollups: DEFAULT_RETAINED_ROLLUPS,
        }
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retained_rollups(mut self, retained: usize) -> Self {
        self.retained_rollups = retained.max(1);
        self
    }

    pub fn initialize_run(&self, run_name: &str, msg: InitializeRunStatsMessage) {
        info!(
            run = %run_name,
            hosts = msg.hosts.len(),
            workloads = msg.workload_name_to_num_targets_map.len(),
            "initializing run stats"
        );
        self.runs.lock().insert(
            run_name.to_string(),
            RunStats {
                hosts: msg.hosts,
                output_dir: msg.stats_output_dir_name,
                targets_per_workload: msg.workload_name_to_num_targets_map,
                started_at: None,
                intervals: HashMap::new(),
                completed: VecDeque::new(),
                spec_order: Vec::new(),
                totals: HashMap::new(),
            },
        );
    }

    pub fn run_started(&self, run_name: &str, timestamp: i64) -> Result<()> {
        let mut runs = self.runs.lock();
        let run = runs
            .get_mut(run_name)
            .ok_or_else(|| DriverError::RunNotFound(run_name.to_string()))?;
        run.started_at = Some(timestamp);
        info!(run = %run_name, timestamp, "run started");
        Ok(())
    }

    /// Whole-run rollups per (workload, spec), in the order specs first completed
    pub fn run_complete(&self, run_name: &str, timestamp: i64) -> Result<Vec<StatsRollup>> {
        let runs = self.runs.lock();
        let run = runs
            .get(run_name)
            .ok_or_else(|| DriverError::RunNotFound(run_name.to_string()))?;

        let mut rollups = Vec::with_capacity(run.spec_order.len());
        for key in &run.spec_order {
            let Some(total) = run.totals.get(key) else {
                continue;
            };
            let mut total = total.clone();
            total.interval_name = "run".to_string();
            if let Some(started) = run.started_at {
                total.interval_start_time = started;
            }
            total.interval_end_time = timestamp.max(total.interval_end_time);
            let rollup = StatsRollup::from_summary(&total);
            if total.print.print_summary {
                info!(
                    run = %run_name,
                    workload = %rollup.workload_name,
                    spec = %rollup.stats_interval_spec_name,
                    total_ops = rollup.total_num_ops,
                    failed = rollup.total_num_failed,
                    throughput = rollup.throughput,
                    avg_rt = rollup.avg_rt,
                    passed = rollup.interval_passed,
                    "run summary"
                );
            }
            rollups.push(rollup);
        }

        info!(run = %run_name, specs = rollups.len(), "run complete");
        Ok(rollups)
    }

    /// Merge one posted summary. Returns the rollup when this completed the interval.
    pub async fn post_stats_summary(
        &self,
        run_name: &str,
        summary: StatsSummary,
    ) -> Result<Option<StatsRollup>> {
        let (rollup, csv) = self.merge_summary(run_name, summary)?;

        if let Some(csv) = csv {
            if let Err(e) = append_csv(&csv).await {
                warn!(path = %csv.path.display(), error = %e, "failed to write stats csv");
            }
        }
        Ok(rollup)
    }

    fn merge_summary(
        &self,
        run_name: &str,
        summary: StatsSummary,
    ) -> Result<(Option<StatsRollup>, Option<CsvWrite>)> {
        let mut runs = self.runs.lock();
        let run = runs
            .get_mut(run_name)
            .ok_or_else(|| DriverError::RunNotFound(run_name.to_string()))?;

        let key = IntervalKey {
            workload: summary.workload_name.clone(),
            spec: summary.stats_interval_spec_name.clone(),
            interval: summary.interval_name.clone(),
        };
        let expected = run.expected_for(&key.workload);
        let aggregate = run.intervals.entry(key.clone()).or_default();

        if aggregate.rollup.is_some() {
            warn!(
                run = %run_name,
                workload = %key.workload,
                spec = %key.spec,
                interval = %key.interval,
                host = %summary.host_name,
                "summary arrived after interval completed, ignoring"
            );
            return Ok((None, None));
        }

        match aggregate.summary.as_mut() {
            Some(merged) => merged.merge(&summary),
            None => aggregate.summary = Some(summary),
        }
        aggregate.received += 1;

        if aggregate.received < expected {
            return Ok((None, None));
        }

        let Some(merged) = aggregate.summary.take() else {
            return Ok((None, None));
        };
        let rollup = StatsRollup::from_summary(&merged);
        aggregate.rollup = Some(rollup.clone());
        let print = merged.print;

        let spec_key = (key.workload.clone(), key.spec.clone());
        if !run.totals.contains_key(&spec_key) {
            run.spec_order.push(spec_key.clone());
        }
        run.totals
            .entry(spec_key)
            .and_modify(|total| total.merge(&merged))
            .or_insert(merged);

        run.completed.push_back(key);
        while run.completed.len() > self.retained_rollups {
            if let Some(oldest) = run.completed.pop_front() {
                run.intervals.remove(&oldest);
            }
        }

        if print.print_intervals {
            info!(
                run = %run_name,
                workload = %rollup.workload_name,
                spec = %rollup.stats_interval_spec_name,
                interval = %rollup.interval_name,
                start_users = rollup.start_active_users,
                end_users = rollup.end_active_users,
                throughput = rollup.throughput,
                effective_throughput = rollup.effective_throughput,
                avg_rt = rollup.avg_rt,
                passed = rollup.interval_passed,
                "interval complete"
            );
        }

        let csv = (print.print_csv && !run.output_dir.is_empty()).then(|| CsvWrite {
            path: PathBuf::from(&run.output_dir).join(format!(
                "{}-{}-{}.csv",
                run_name, rollup.workload_name, rollup.stats_interval_spec_name
            )),
            row: rollup.csv_row(),
        });

        Ok((Some(rollup), csv))
    }

    pub fn rollup_status(
        &self,
        run_name: &str,
        workload: &str,
        spec: &str,
        interval: &str,
    ) -> Result<RollupStatus> {
        let runs = self.runs.lock();
        let run = runs
            .get(run_name)
            .ok_or_else(|| DriverError::RunNotFound(run_name.to_string()))?;
        let key = IntervalKey {
            workload: workload.to_string(),
            spec: spec.to_string(),
            interval: interval.to_string(),
        };
        let aggregate = run.intervals.get(&key);
        Ok(RollupStatus {
            num_samples_expected: run.expected_for(workload),
            num_samples_received: aggregate.map_or(0, |a| a.received),
            rollup: aggregate.and_then(|a| a.rollup.clone()),
        })
    }
}

async fn append_csv(csv: &CsvWrite) -> std::io::Result<()> {
    if let Some(parent) = csv.path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let is_new = tokio::fs::metadata(&csv.path).await.is_err();
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&csv.path)
        .await?;
    if is_new {
        file.write_all(StatsRollup::csv_header().as_bytes()).await?;
        file.write_all(b"\n").await?;
    }
    file.write_all(csv.row.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}
