// Runs hosted by this process

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rampart_core::{
    ActiveUsersResponse, DriverError, LifecycleState, PeerClient, Result, Run, RunConfig,
    RunStatus, StatsAggregator, StatsHost,
};
use tracing::{info, instrument};

use super::ControllerService;

pub struct RunService {
    client: PeerClient,
    self_host: String,
    aggregator: Arc<StatsAggregator>,
    controllers: Arc<ControllerService>,
    runs: DashMap<String, Arc<Run>>,
}

impl RunService {
    pub fn new(
        client: PeerClient,
        self_host: impl Into<String>,
        aggregator: Arc<StatsAggregator>,
        controllers: Arc<ControllerService>,
    ) -> Self {
        Self {
            client,
            self_host: self_host.into(),
            aggregator,
            controllers,
            runs: DashMap::new(),
        }
    }

    /// Register a run; nothing is sent to other hosts until it is initialized
    #[instrument(skip(self, config))]
    pub fn add_run(&self, name: &str, config: RunConfig) -> Result<RunStatus> {
        if config.name != name {
            return Err(DriverError::config(format!(
                "run body is named {} but was posted as {}",
                config.name, name
            )));
        }
        if self.runs.contains_key(name) {
            return Err(DriverError::RunExists(name.to_string()));
        }

        let (stats_host_name, stats) = match config.stats_host.as_deref() {
            Some(host) if !self.controllers.is_self(host) => (
                host.to_string(),
                StatsHost::Remote {
                    client: self.client.clone(),
                    host: host.to_string(),
                },
            ),
            _ => (self.self_host.clone(), StatsHost::Local(self.aggregator.clone())),
        };
        let controller = self.controllers.controller_for_run(&config)?;
        let run = Run::new(config, self.client.clone(), stats_host_name, stats, controller)?;

        match self.runs.entry(name.to_string()) {
            Entry::Occupied(_) => Err(DriverError::RunExists(name.to_string())),
            Entry::Vacant(slot) => {
                let status = run.status();
                slot.insert(Arc::new(run));
                info!(run = %name, "run added");
                Ok(status)
            }
        }
    }

    pub fn run(&self, name: &str) -> Result<Arc<Run>> {
        self.runs
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| DriverError::RunNotFound(name.to_string()))
    }

    pub fn status(&self, name: &str) -> Result<RunStatus> {
        Ok(self.run(name)?.status())
    }

    pub fn state(&self, name: &str) -> Result<LifecycleState> {
        Ok(self.run(name)?.state())
    }

    pub async fn initialize(&self, name: &str) -> Result<()> {
        self.run(name)?.initialize().await
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.run(name)?.start().await
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        self.run(name)?.stop().await
    }

    /// Stop the run, tell every driver to exit, and forget it here
    pub async fn shutdown(&self, name: &str) -> Result<()> {
        let run = self.run(name)?;
        run.stop().await?;
        run.shutdown().await;
        self.runs.remove(name);
        self.controllers.drop_run(name);
        info!(run = %name, "run shut down");
        Ok(())
    }

    pub fn active_users(&self, name: &str) -> Result<ActiveUsersResponse> {
        Ok(self.run(name)?.active_users())
    }

    pub async fn change_active_users(&self, name: &str, workload: &str, users: u64) -> Result<()> {
        self.run(name)?.change_active_users(workload, users).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn service() -> RunService {
        let client = PeerClient::new(Duration::from_secs(1), 7500).unwrap();
        RunService::new(
            client.clone(),
            "master:7500",
            Arc::new(StatsAggregator::new()),
            Arc::new(ControllerService::new(client, "master:7500")),
        )
    }

    fn config(name: &str) -> RunConfig {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "hosts": ["driver1"],
            "workloads": [{
                "name": "w",
                "behaviorSpecName": "user",
                "maxUsers": 10,
                "loadPath": {"type": "interval", "name": "lp", "loadIntervals": [
                    {"type": "uniform", "name": "i1", "duration": 30, "users": 10}
                ]}
            }],
            "behaviorSpecs": [{
                "name": "user",
                "operations": ["a", "b"],
                "transitionMatrices": [[[0, 1]], [[1, 0]]]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_add_run_once() {
        let service = service();
        let status = service.add_run("r1", config("r1")).unwrap();
        assert_eq!(status.state, LifecycleState::Pending);

        let err = service.add_run("r1", config("r1")).unwrap_err();
        assert!(matches!(err, DriverError::RunExists(_)));
        assert!(service.add_run("r2", config("r1")).is_err());
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let service = service();
        assert!(matches!(service.state("ghost"), Err(DriverError::RunNotFound(_))));
        assert!(service.start("ghost").await.is_err());
        assert!(service.change_active_users("ghost", "w", 1).await.is_err());
    }

    #[test]
    fn test_run_policy_must_match_registered_controller() {
        let service = service();
        service
            .controllers
            .owned_controller("r1", rampart_core::ControllerPolicy::SyncUntilHalfFail)
            .unwrap();

        let err = service.add_run("r1", config("r1")).unwrap_err();
        assert!(err.is_configuration());

        let mut matching = config("r1");
        matching.load_path_controller = rampart_core::ControllerPolicy::SyncUntilHalfFail;
        service.add_run("r1", matching).unwrap();
    }

    #[tokio::test]
    async fn test_start_before_initialize_is_conflict() {
        let service = service();
        service.add_run("r1", config("r1")).unwrap();
        let err = service.start("r1").await.unwrap_err();
        assert!(matches!(err, DriverError::InvalidState { .. }));
        assert_eq!(service.state("r1").unwrap(), LifecycleState::Pending);
    }
}
