//! Workloads as seen from the run host
//!
//! A [`Workload`] owns the load path and the self-scheduling stats interval
//! specs for one workload of a run. It reaches the driver nodes that run the
//! simulated users through [`WorkloadNodes`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::behavior::{BehaviorSpec, BidStrategyKind};
use crate::error::{DriverError, Result};
use crate::lifecycle::LifecycleState;
use crate::load_path::{
    ChannelWatcher, LoadPathConfig, LoadPathController, LoadPathOutcome, LoadPathRunner,
    LoadTarget, RollupSource,
};
use crate::messages::{
    AddWorkloadMessage, ChangeUsersMessage, InitializeWorkloadMessage,
    StatsIntervalCompleteMessage,
};
use crate::stats::interval_spec::now_millis;
use crate::stats::{
    spawn_interval_spec, IntervalClock, IntervalListener, StatsIntervalSpecConfig, TrackedSpec,
};
use crate::transport::PeerClient;

fn default_targets() -> Vec<String> {
    vec!["default".to_string()]
}

/// Workload definition as submitted with a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct WorkloadConfig {
    pub name: String,
    pub behavior_spec_name: String,
    pub max_users: u64,
    #[serde(default = "default_targets")]
    pub targets: Vec<String>,
    pub load_path: LoadPathConfig,
    #[serde(default)]
    pub stats_interval_specs: Vec<StatsIntervalSpecConfig>,
    #[serde(default)]
    pub per_target_stats: bool,
    #[serde(default)]
    pub bid_strategy: BidStrategyKind,
}

impl WorkloadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(DriverError::config("workload name must be set"));
        }
        if self.targets.is_empty() {
            return Err(DriverError::config(format!(
                "workload {} has no targets",
                self.name
            )));
        }
        let path_users = self.load_path.max_users();
        if path_users > self.max_users {
            return Err(DriverError::config(format!(
                "load path {} asks for {} users but workload {} allows {}",
                self.load_path.name(),
                path_users,
                self.name,
                self.max_users
            )));
        }

        let mut names = HashSet::from([self.load_path.name()]);
        for spec in &self.stats_interval_specs {
            if !names.insert(spec.name.as_str()) {
                return Err(DriverError::config(format!(
                    "stats interval spec {} is defined twice in workload {}",
                    spec.name, self.name
                )));
            }
        }
        self.load_path.schedule(self.max_users)?;
        Ok(())
    }

    /// The load path's own spec followed by every configured spec
    pub fn tracked_specs(&self) -> Vec<TrackedSpec> {
        std::iter::once(TrackedSpec {
            name: self.load_path.name().to_string(),
            print: self.load_path.print_flags(),
        })
        .chain(self.stats_interval_specs.iter().map(|spec| TrackedSpec {
            name: spec.name.clone(),
            print: spec.print,
        }))
        .collect()
    }

    /// Configured `loadpath` specs, closed whenever the load path closes its own
    pub fn linked_load_path_specs(&self) -> Vec<String> {
        self.stats_interval_specs
            .iter()
            .filter(|spec| spec.is_load_path())
            .map(|spec| spec.name.clone())
            .collect()
    }

    /// Summaries each node sends per closed interval
    pub fn summaries_per_node(&self, per_target_stats: bool) -> u32 {
        if per_target_stats || self.per_target_stats {
            self.targets.len() as u32
        } else {
            1
        }
    }
}

/// Split `total` over `parts`: everyone gets the floor, the first `total % parts` one more
pub fn distribute_users(total: u64, parts: usize) -> Vec<u64> {
    if parts == 0 {
        return Vec::new();
    }
    let parts_u64 = parts as u64;
    let base = total / parts_u64;
    let remainder = total % parts_u64;
    (0..parts_u64)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

pub fn workload_path(run: &str, workload: &str) -> String {
    format!("/driver/run/{}/workload/{}", run, workload)
}

/// Driver nodes running one workload, addressed over HTTP
pub struct WorkloadNodes {
    client: PeerClient,
    run_name: String,
    workload_name: String,
    hosts: Vec<String>,
}

impl WorkloadNodes {
    pub fn new(
        client: PeerClient,
        run_name: impl Into<String>,
        workload_name: impl Into<String>,
        hosts: Vec<String>,
    ) -> Self {
        Self {
            client,
            run_name: run_name.into(),
            workload_name: workload_name.into(),
            hosts,
        }
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    fn url(&self, host: &str, suffix: &str) -> String {
        self.client.url(
            host,
            &format!("{}{}", workload_path(&self.run_name, &self.workload_name), suffix),
        )
    }

    /// POST the same body to every node; report the hosts that failed
    async fn broadcast<B: Serialize + Sync>(&self, suffix: &str, body: &B) -> Vec<String> {
        let posts = self.hosts.iter().map(|host| {
            let url = self.url(host, suffix);
            async move { (host, self.client.post(&url, body).await) }
        });
        let mut failed = Vec::new();
        for (host, result) in join_all(posts).await {
            if let Err(e) = result {
                warn!(
                    workload = %self.workload_name,
                    host = %host,
                    path = %suffix,
                    error = %e,
                    "node rejected workload message"
                );
                failed.push(host.clone());
            }
        }
        failed
    }

    /// Register the workload definition and its behavior specs on every node
    pub async fn add(&self, config: &WorkloadConfig, behavior_specs: &[BehaviorSpec]) -> Result<()> {
        let msg = AddWorkloadMessage {
            workload: config.clone(),
            behavior_specs: behavior_specs.to_vec(),
        };
        let failed = self.broadcast("", &msg).await;
        self.check("add", failed)
    }

    /// Initialize every node, waiting for all acknowledgements
    ///
    /// A node that fails does not roll back the others.
    pub async fn initialize(
        &self,
        stats_host: &str,
        stats_port: u16,
        per_target_stats: bool,
    ) -> Result<()> {
        let num_nodes = self.hosts.len() as u32;
        let posts = self.hosts.iter().enumerate().map(|(node_number, host)| {
            let msg = InitializeWorkloadMessage {
                hostname: host.clone(),
                node_number: node_number as u32,
                num_nodes,
                stats_host_name: stats_host.to_string(),
                stats_port_number: stats_port,
                run_name: self.run_name.clone(),
                per_target_stats,
            };
            let url = self.url(host, "/initialize");
            async move { (host, self.client.post(&url, &msg).await) }
        });

        let mut failed = Vec::new();
        for (host, result) in join_all(posts).await {
            if let Err(e) = result {
                warn!(workload = %self.workload_name, host = %host, error = %e, "node failed to initialize");
                failed.push(host.clone());
            }
        }
        self.check("initialize", failed)
    }

    pub async fn stop(&self) -> Result<()> {
        let failed = self.broadcast("/stop", &serde_json::json!({})).await;
        self.check("stop", failed)
    }

    fn check(&self, action: &str, failed: Vec<String>) -> Result<()> {
        if failed.is_empty() {
            Ok(())
        } else {
            Err(DriverError::config(format!(
                "workload {} failed to {} on {}",
                self.workload_name,
                action,
                failed.join(", ")
            )))
        }
    }
}

#[async_trait]
impl IntervalListener for WorkloadNodes {
    async fn interval_complete(&self, msg: StatsIntervalCompleteMessage) {
        self.broadcast("/statsIntervalComplete", &msg).await;
    }
}

#[async_trait]
impl LoadTarget for WorkloadNodes {
    async fn set_active_users(&self, users: u64) {
        let shares = distribute_users(users, self.hosts.len());
        let posts = self.hosts.iter().zip(shares).map(|(host, share)| {
            let url = self.url(host, "/users");
            let msg = ChangeUsersMessage {
                active_users: share,
            };
            async move { (host, self.client.post(&url, &msg).await) }
        });
        for (host, result) in join_all(posts).await {
            if let Err(e) = result {
                warn!(workload = %self.workload_name, host = %host, error = %e, "failed to change active users");
            }
        }
    }
}

/// Workload lifecycle on the run host
pub struct Workload {
    run_name: String,
    config: WorkloadConfig,
    nodes: Arc<WorkloadNodes>,
    clock: Arc<IntervalClock>,
    state: Mutex<LifecycleState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Workload {
    /// `config` has already passed [`WorkloadConfig::validate`]
    pub fn new(run_name: impl Into<String>, config: WorkloadConfig, nodes: Arc<WorkloadNodes>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            run_name: run_name.into(),
            config,
            nodes,
            clock: Arc::new(IntervalClock::new()),
            state: Mutex::new(LifecycleState::Pending),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &WorkloadConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn active_users(&self) -> u64 {
        self.clock.active_users()
    }

    pub async fn initialize(
        &self,
        behavior_specs: &[BehaviorSpec],
        stats_host: &str,
        stats_port: u16,
        per_target_stats: bool,
    ) -> Result<()> {
        self.state
            .lock()
            .advance(LifecycleState::Initialized, "Workload", &self.config.name)?;
        self.nodes.add(&self.config, behavior_specs).await?;
        self.nodes
            .initialize(stats_host, stats_port, per_target_stats)
            .await?;
        info!(run = %self.run_name, workload = %self.config.name, nodes = self.nodes.hosts().len(), "workload initialized");
        Ok(())
    }

    /// Start the load path and interval specs; the receiver yields the path's outcome
    pub async fn start(
        &self,
        controller: Arc<dyn LoadPathController>,
        rollups: Arc<dyn RollupSource>,
    ) -> Result<oneshot::Receiver<LoadPathOutcome>> {
        self.state
            .lock()
            .advance(LifecycleState::Running, "Workload", &self.config.name)?;

        let schedule = self.config.load_path.schedule(self.config.max_users)?;
        let load_path_name = self.config.load_path.name().to_string();

        let tracked = self.config.tracked_specs();
        self.clock
            .start(tracked.iter().map(|spec| spec.name.as_str()), now_millis());

        let mut tasks = Vec::new();
        for spec in &self.config.stats_interval_specs {
            let listener: Arc<dyn IntervalListener> = self.nodes.clone();
            if let Some(task) = spawn_interval_spec(
                spec.clone(),
                self.clock.clone(),
                listener,
                self.shutdown.subscribe(),
            ) {
                tasks.push(task);
            }
        }

        let (watcher, verdicts) = ChannelWatcher::new();
        let verdict_driven = self.config.load_path.is_verdict_driven();
        if verdict_driven {
            controller
                .register_interval_result_callback(&load_path_name, Arc::new(watcher))
                .await?;
        }

        let target: Arc<dyn LoadTarget> = self.nodes.clone();
        let mut runner = LoadPathRunner::new(
            &self.config.name,
            schedule,
            target,
            self.clock.clone(),
            rollups,
            controller,
            verdicts,
        )
        .with_linked_specs(self.config.linked_load_path_specs());
        if verdict_driven {
            runner = runner.with_registered_watcher();
        }
        let (task, outcome) = runner.spawn(self.shutdown.subscribe());
        tasks.push(task);

        self.tasks.lock().extend(tasks);
        info!(run = %self.run_name, workload = %self.config.name, load_path = %load_path_name, "workload started");
        Ok(outcome)
    }

    /// Set the total active users across all nodes
    pub async fn change_active_users(&self, users: u64) -> Result<()> {
        if users > self.config.max_users {
            return Err(DriverError::TooManyUsers {
                requested: users,
                max: self.config.max_users,
            });
        }
        let state = self.state();
        if !state.is_active() {
            return Err(DriverError::InvalidState {
                entity: "Workload",
                name: self.config.name.clone(),
                from: state,
                to: LifecycleState::Running,
            });
        }
        self.clock.set_active_users(users);
        self.nodes.set_active_users(users).await;
        Ok(())
    }

    /// Halt the load path and interval specs, then stop every node
    ///
    /// Stopping an already stopped workload is a no-op.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state >= LifecycleState::Stopping {
                return Ok(());
            }
            state.advance(LifecycleState::Stopping, "Workload", &self.config.name)?;
        }

        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(workload = %self.config.name, error = %e, "workload task failed");
            }
        }

        let result = self.nodes.stop().await;
        self.state
            .lock()
            .advance(LifecycleState::Completed, "Workload", &self.config.name)?;
        debug!(run = %self.run_name, workload = %self.config.name, "workload stopped");
        result
    }
}
