//! Runs
//!
//! A run groups workloads that share driver nodes, a stats host and one load
//! path controller. It is driven forward by explicit control calls and
//! completes once every workload's load path has reported its outcome, or
//! earlier when a failing workload aborts it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use crate::behavior::{BehaviorSpec, BehaviorSpecRegistry};
use crate::error::{DriverError, Result};
use crate::lifecycle::LifecycleState;
use crate::load_path::{
    ControllerPolicy, HttpRollupSource, LoadPathController, LoadPathOutcome, LocalRollupSource,
    RollupSource,
};
use crate::messages::{ActiveUsersResponse, InitializeRunStatsMessage, RunTimestampMessage};
use crate::stats::interval_spec::now_millis;
use crate::stats::StatsAggregator;
use crate::transport::{PeerClient, DEFAULT_PEER_PORT};
use crate::workload::{Workload, WorkloadConfig, WorkloadNodes};

fn default_port() -> u16 {
    DEFAULT_PEER_PORT
}

/// Run definition as submitted to the run host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub name: String,
    /// Driver nodes ("name" or "name:port")
    pub hosts: Vec<String>,
    /// Defaults to the run host itself
    #[serde(default)]
    pub stats_host: Option<String>,
    #[serde(default = "default_port")]
    pub port_number: u16,
    #[serde(default)]
    pub stats_output_dir_name: String,
    pub workloads: Vec<WorkloadConfig>,
    #[serde(default)]
    pub behavior_specs: Vec<BehaviorSpec>,
    /// Stop the whole run as soon as one workload fails
    #[serde(default)]
    pub abort_on_fail: bool,
    #[serde(default)]
    pub load_path_controller: ControllerPolicy,
    /// Host owning the load path controller when it is not this run host
    #[serde(default)]
    pub load_path_controller_host: Option<String>,
    #[serde(default)]
    pub per_target_stats: bool,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(DriverError::config("run name must be set"));
        }
        if self.hosts.is_empty() {
            return Err(DriverError::config(format!("run {} has no hosts", self.name)));
        }
        if self.workloads.is_empty() {
            return Err(DriverError::config(format!("run {} has no workloads", self.name)));
        }
        let mut names = HashSet::new();
        for workload in &self.workloads {
            workload.validate()?;
            if !names.insert(workload.name.as_str()) {
                return Err(DriverError::config(format!(
                    "workload {} is defined twice in run {}",
                    workload.name, self.name
                )));
            }
        }

        let registry = BehaviorSpecRegistry::from_specs(self.behavior_specs.iter().cloned())?;
        for workload in &self.workloads {
            registry.get(&workload.behavior_spec_name)?;
        }
        Ok(())
    }
}

/// Final word on one workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    pub name: String,
    pub passed: bool,
    pub max_pass_users: u64,
    #[serde(default)]
    pub max_pass_interval_name: Option<String>,
    pub load_path_name: String,
    #[serde(default)]
    pub interval_stats_summaries: Vec<crate::stats::StatsRollup>,
}

impl WorkloadStatus {
    pub fn from_outcome(workload: &str, outcome: LoadPathOutcome) -> Self {
        Self {
            name: workload.to_string(),
            passed: outcome.passed,
            max_pass_users: outcome.max_pass_users,
            max_pass_interval_name: outcome.max_pass_interval_name,
            load_path_name: outcome.load_path_name,
            interval_stats_summaries: outcome.interval_stats_summaries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub name: String,
    pub state: LifecycleState,
    pub running_workloads: Vec<String>,
    pub workload_statuses: Vec<WorkloadStatus>,
}

/// Where run-level stats messages go
pub enum StatsHost {
    /// Aggregator in this process
    Local(Arc<StatsAggregator>),
    Remote { client: PeerClient, host: String },
}

impl StatsHost {
    async fn initialize_run(&self, run: &str, msg: InitializeRunStatsMessage) -> Result<()> {
        match self {
            StatsHost::Local(aggregator) => aggregator.initialize_run(run, msg),
            StatsHost::Remote { client, host } => {
                let url = client.url(host, &format!("/stats/initialize/run/{}", run));
                client.post(&url, &msg).await?;
            }
        }
        Ok(())
    }

    async fn run_started(&self, run: &str, timestamp: i64) -> Result<()> {
        match self {
            StatsHost::Local(aggregator) => aggregator.run_started(run, timestamp),
            StatsHost::Remote { client, host } => {
                let url = client.url(host, &format!("/stats/started/{}", run));
                client.post(&url, &RunTimestampMessage { timestamp }).await?;
                Ok(())
            }
        }
    }

    async fn run_complete(&self, run: &str, timestamp: i64) -> Result<()> {
        match self {
            StatsHost::Local(aggregator) => aggregator.run_complete(run, timestamp).map(|_| ()),
            StatsHost::Remote { client, host } => {
                let url = client.url(host, &format!("/stats/complete/{}", run));
                client.post(&url, &RunTimestampMessage { timestamp }).await?;
                Ok(())
            }
        }
    }

    fn rollup_source(&self, run: &str, workload: &str) -> Arc<dyn RollupSource> {
        match self {
            StatsHost::Local(aggregator) => {
                Arc::new(LocalRollupSource::new(aggregator.clone(), run, workload))
            }
            StatsHost::Remote { client, host } => {
                Arc::new(HttpRollupSource::new(client.clone(), host.clone(), run, workload))
            }
        }
    }
}

#[derive(Debug, Default)]
struct RunProgress {
    state: LifecycleState,
    running: HashSet<String>,
    statuses: Vec<WorkloadStatus>,
}

pub struct Run {
    config: RunConfig,
    client: PeerClient,
    stats_host_name: String,
    stats: StatsHost,
    controller: Arc<dyn LoadPathController>,
    workloads: Vec<Arc<Workload>>,
    progress: Mutex<RunProgress>,
}

impl Run {
    /// `stats_host_name` is what driver nodes post summaries to
    pub fn new(
        config: RunConfig,
        client: PeerClient,
        stats_host_name: impl Into<String>,
        stats: StatsHost,
        controller: Arc<dyn LoadPathController>,
    ) -> Result<Self> {
        config.validate()?;
        let workloads = config
            .workloads
            .iter()
            .map(|workload| {
                let nodes = Arc::new(WorkloadNodes::new(
                    client.clone(),
                    &config.name,
                    &workload.name,
                    config.hosts.clone(),
                ));
                Arc::new(Workload::new(&config.name, workload.clone(), nodes))
            })
            .collect();

        Ok(Self {
            config,
            client,
            stats_host_name: stats_host_name.into(),
            stats,
            controller,
            workloads,
            progress: Mutex::new(RunProgress::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.progress.lock().state
    }

    fn advance(&self, next: LifecycleState) -> Result<()> {
        self.progress.lock().state.advance(next, "Run", &self.config.name)
    }

    fn workload(&self, name: &str) -> Result<&Arc<Workload>> {
        self.workloads
            .iter()
            .find(|w| w.name() == name)
            .ok_or_else(|| DriverError::workload_not_found(&self.config.name, name))
    }

    /// Prepare the stats host, then every workload on every node
    #[instrument(skip(self), fields(run = %self.config.name))]
    pub async fn initialize(&self) -> Result<()> {
        self.advance(LifecycleState::Initialized)?;

        let workload_name_to_num_targets_map: HashMap<String, u32> = self
            .config
            .workloads
            .iter()
            .map(|w| (w.name.clone(), w.summaries_per_node(self.config.per_target_stats)))
            .collect();
        self.stats
            .initialize_run(
                &self.config.name,
                InitializeRunStatsMessage {
                    hosts: self.config.hosts.clone(),
                    stats_output_dir_name: self.config.stats_output_dir_name.clone(),
                    workload_name_to_num_targets_map,
                },
            )
            .await?;

        for workload in &self.workloads {
            workload
                .initialize(
                    &self.config.behavior_specs,
                    &self.stats_host_name,
                    self.config.port_number,
                    self.config.per_target_stats,
                )
                .await?;
        }
        info!(run = %self.config.name, workloads = self.workloads.len(), "run initialized");
        Ok(())
    }

    /// Start every workload and watch for their outcomes
    #[instrument(skip(self), fields(run = %self.config.name))]
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut progress = self.progress.lock();
            if progress.state != LifecycleState::Initialized {
                return Err(DriverError::InvalidState {
                    entity: "Run",
                    name: self.config.name.clone(),
                    from: progress.state,
                    to: LifecycleState::Running,
                });
            }
            progress.state = LifecycleState::Running;
        }
        self.stats.run_started(&self.config.name, now_millis()).await?;

        for workload in &self.workloads {
            let rollups = self.stats.rollup_source(&self.config.name, workload.name());
            let outcome = workload.start(self.controller.clone(), rollups).await?;
            self.progress.lock().running.insert(workload.name().to_string());

            let run = Arc::clone(self);
            let name = workload.name().to_string();
            tokio::spawn(async move {
                if let Ok(outcome) = outcome.await {
                    run.workload_complete(&name, outcome).await;
                }
            });
        }
        info!(run = %self.config.name, "run started");
        Ok(())
    }

    /// Record a workload's outcome; the last one, or a failure with abortOnFail, stops the run
    pub async fn workload_complete(&self, workload: &str, outcome: LoadPathOutcome) {
        let status = WorkloadStatus::from_outcome(workload, outcome);
        let passed = status.passed;
        let all_done = {
            let mut progress = self.progress.lock();
            progress.running.remove(workload);
            progress.statuses.push(status);
            progress.running.is_empty()
        };
        info!(run = %self.config.name, workload = %workload, passed, "workload complete");

        if all_done || (!passed && self.config.abort_on_fail) {
            if !all_done {
                warn!(run = %self.config.name, workload = %workload, "workload failed, aborting run");
            }
            if let Err(e) = self.stop().await {
                error!(run = %self.config.name, error = %e, "failed to stop run");
            }
        }
    }

    /// Stop every workload and close the run on the stats host
    ///
    /// Stopping a run that is already stopping or complete is a no-op.
    #[instrument(skip(self), fields(run = %self.config.name))]
    pub async fn stop(&self) -> Result<()> {
        {
            let mut progress = self.progress.lock();
            if progress.state >= LifecycleState::Stopping {
                return Ok(());
            }
            progress
                .state
                .advance(LifecycleState::Stopping, "Run", &self.config.name)?;
        }

        for workload in &self.workloads {
            if let Err(e) = workload.stop().await {
                warn!(run = %self.config.name, workload = %workload.name(), error = %e, "workload did not stop cleanly");
            }
        }
        if let Err(e) = self.stats.run_complete(&self.config.name, now_millis()).await {
            warn!(run = %self.config.name, error = %e, "failed to complete run stats");
        }

        self.advance(LifecycleState::Completed)?;
        info!(run = %self.config.name, "run complete");
        Ok(())
    }

    /// Ask every driver node to exit
    pub async fn shutdown(&self) {
        for host in &self.config.hosts {
            let url = self.client.url(host, &format!("/driver/exit/{}", self.config.name));
            if let Err(e) = self.client.post_empty(&url).await {
                warn!(run = %self.config.name, host = %host, error = %e, "driver did not acknowledge exit");
            }
        }
    }

    pub async fn change_active_users(&self, workload: &str, users: u64) -> Result<()> {
        self.workload(workload)?.change_active_users(users).await
    }

    pub fn active_users(&self) -> ActiveUsersResponse {
        ActiveUsersResponse {
            workload_active_users: self
                .workloads
                .iter()
                .map(|w| (w.name().to_string(), w.active_users()))
                .collect(),
        }
    }

    pub fn status(&self) -> RunStatus {
        let progress = self.progress.lock();
        let mut running_workloads: Vec<String> = progress.running.iter().cloned().collect();
        running_workloads.sort();
        RunStatus {
            name: self.config.name.clone(),
            state: progress.state,
            running_workloads,
            workload_statuses: progress.statuses.clone(),
        }
    }
}
