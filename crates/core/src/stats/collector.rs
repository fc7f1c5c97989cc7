// Node-side stats collection
//
// Simulated users submit samples into one shared buffer. When a stats interval
// completes the buffer is swapped out under the same lock, folded into every
// spec's running summary, and the completed spec's summaries are shipped to
// the master.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::operation::OperationStats;
use super::summary::{OperationQuality, PrintFlags, StatsSummary, ALL_TARGETS};
use crate::messages::StatsIntervalCompleteMessage;
use crate::transport::{PeerClient, TransportError};

/// Destination for completed summaries
#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn send(&self, summary: &StatsSummary) -> Result<(), TransportError>;
}

/// Posts summaries to `/stats/run/{run}` on the stats host
pub struct HttpStatsSink {
    client: PeerClient,
    url: String,
}

impl HttpStatsSink {
    pub fn new(client: PeerClient, stats_host: &str, stats_port: u16, run_name: &str) -> Self {
        let url = crate::transport::peer_url(
            stats_host,
            stats_port,
            &format!("/stats/run/{}", run_name),
        );
        Self { client, url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl StatsSink for HttpStatsSink {
    async fn send(&self, summary: &StatsSummary) -> Result<(), TransportError> {
        self.client.post(&self.url, summary).await?;
        Ok(())
    }
}

/// Whether summaries are kept per workload or per target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    PerWorkload,
    PerTarget,
}

/// Per-spec settings a collector needs to build its summaries
#[derive(Debug, Clone)]
pub struct TrackedSpec {
    pub name: String,
    pub print: PrintFlags,
}

/// Receives samples and interval-complete notifications on a driver node
#[async_trait]
pub trait StatsCollector: Send + Sync {
    fn submit_operation_stats(&self, stats: OperationStats);

    async fn stats_interval_complete(&self, msg: &StatsIntervalCompleteMessage);
}

/// Buffered collector for one workload on one node
pub struct BufferedStatsCollector {
    workload_name: String,
    host_name: String,
    granularity: Granularity,
    specs: Vec<TrackedSpec>,
    operations: Vec<OperationQuality>,
    buffer: Mutex<Vec<OperationStats>>,
    /// spec name -> target key -> running summary
    summaries: Mutex<HashMap<String, HashMap<String, StatsSummary>>>,
    sink: Arc<dyn StatsSink>,
}

impl BufferedStatsCollector {
    pub fn new(
        workload_name: impl Into<String>,
        host_name: impl Into<String>,
        granularity: Granularity,
        specs: Vec<TrackedSpec>,
        operations: Vec<OperationQuality>,
        targets: &[String],
        sink: Arc<dyn StatsSink>,
    ) -> Self {
        let workload_name = workload_name.into();
        let host_name = host_name.into();

        let target_keys: Vec<&str> = match granularity {
            Granularity::PerWorkload => vec![ALL_TARGETS],
            Granularity::PerTarget => targets.iter().map(String::as_str).collect(),
        };

        let summaries = specs
            .iter()
            .map(|spec| {
                let per_target = target_keys
                    .iter()
                    .map(|target| {
                        let summary =
                            StatsSummary::new(&workload_name, *target, &spec.name, &operations)
                                .with_print_flags(spec.print)
                                .with_host(&host_name);
                        (target.to_string(), summary)
                    })
                    .collect();
                (spec.name.clone(), per_target)
            })
            .collect();

        Self {
            workload_name,
            host_name,
            granularity,
            specs,
            operations,
            buffer: Mutex::new(Vec::new()),
            summaries: Mutex::new(summaries),
            sink,
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    fn target_key<'a>(&self, stats: &'a OperationStats) -> &'a str {
        match self.granularity {
            Granularity::PerWorkload => ALL_TARGETS,
            Granularity::PerTarget => &stats.target_name,
        }
    }

    /// Fold samples into every spec, then take the completed spec's summaries
    fn roll_over(&self, msg: &StatsIntervalCompleteMessage) -> Vec<StatsSummary> {
        let samples = std::mem::take(&mut *self.buffer.lock());

        let mut summaries = self.summaries.lock();
        for spec in &self.specs {
            let per_target = summaries.entry(spec.name.clone()).or_default();
            for sample in &samples {
                let key = self.target_key(sample);
                per_target
                    .entry(key.to_string())
                    .or_insert_with(|| {
                        StatsSummary::new(&self.workload_name, key, &spec.name, &self.operations)
                            .with_print_flags(spec.print)
                            .with_host(&self.host_name)
                    })
                    .add_stats(sample);
            }
        }

        let Some(completed) = summaries.get_mut(&msg.completed_spec_name) else {
            warn!(
                workload = %self.workload_name,
                spec = %msg.completed_spec_name,
                "interval complete for untracked stats spec"
            );
            return Vec::new();
        };

        completed
            .values_mut()
            .map(|summary| {
                summary.stamp(msg, &self.host_name);
                let out = summary.clone();
                summary.reset();
                out
            })
            .collect()
    }
}

#[async_trait]
impl StatsCollector for BufferedStatsCollector {
    fn submit_operation_stats(&self, stats: OperationStats) {
        self.buffer.lock().push(stats);
    }

    async fn stats_interval_complete(&self, msg: &StatsIntervalCompleteMessage) {
        let outgoing = self.roll_over(msg);

        debug!(
            workload = %self.workload_name,
            spec = %msg.completed_spec_name,
            interval = %msg.cur_interval_name,
            summaries = outgoing.len(),
            "stats interval complete"
        );

        let sends = outgoing.iter().map(|summary| self.sink.send(summary));
        for (summary, result) in outgoing.iter().zip(join_all(sends).await) {
            if let Err(e) = result {
                warn!(
                    workload = %self.workload_name,
                    target = %summary.target_name,
                    spec = %summary.stats_interval_spec_name,
                    interval = %summary.interval_name,
                    error = %e,
                    "failed to deliver stats summary"
                );
            }
        }
    }
}
