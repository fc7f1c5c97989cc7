// Load path controllers per run
//
// A run's controller lives in exactly one process. That process keeps a
// `LocalLoadPathController`; every other process taking part talks to it
// through a `RemoteLoadPathController` and receives verdicts on its notify route.

use std::sync::Arc;

use dashmap::DashMap;
use rampart_core::load_path::{HttpWatcher, IntervalResultWatcher};
use rampart_core::{
    ControllerPolicy, DriverError, IntervalResultMessage, LoadPathController,
    LocalLoadPathController, PeerClient, RegisterWatcherMessage, RemoteLoadPathController, Result,
    RunConfig,
};
use tracing::{debug, warn};

pub struct ControllerService {
    client: PeerClient,
    self_host: String,
    owned: DashMap<String, Arc<LocalLoadPathController>>,
    proxies: DashMap<String, Arc<RemoteLoadPathController>>,
}

impl ControllerService {
    pub fn new(client: PeerClient, self_host: impl Into<String>) -> Self {
        Self {
            client,
            self_host: self_host.into(),
            owned: DashMap::new(),
            proxies: DashMap::new(),
        }
    }

    /// Whether a host entry names this process
    pub fn is_self(&self, host: &str) -> bool {
        self.client.url(host, "") == self.client.url(&self.self_host, "")
    }

    /// Controller a run on this host should use
    pub fn controller_for_run(&self, config: &RunConfig) -> Result<Arc<dyn LoadPathController>> {
        match config.load_path_controller_host.as_deref() {
            Some(owner) if !self.is_self(owner) => {
                debug!(run = %config.name, owner = %owner, "using remote load path controller");
                let proxy = Arc::new(RemoteLoadPathController::new(
                    self.client.clone(),
                    &config.name,
                    owner,
                    &self.self_host,
                    config.load_path_controller,
                ));
                self.proxies.insert(config.name.clone(), proxy.clone());
                Ok(proxy)
            }
            _ => Ok(self.owned_controller(&config.name, config.load_path_controller)?),
        }
    }

    /// Get or create the controller this process owns for a run
    ///
    /// An existing controller configured with another policy is a conflict.
    pub fn owned_controller(
        &self,
        run: &str,
        policy: ControllerPolicy,
    ) -> Result<Arc<LocalLoadPathController>> {
        let controller = self
            .owned
            .entry(run.to_string())
            .or_insert_with(|| {
                debug!(run = %run, policy = ?policy, "creating load path controller");
                Arc::new(LocalLoadPathController::new(policy))
            })
            .value()
            .clone();
        if controller.policy() != policy {
            return Err(DriverError::config(format!(
                "load path controller of run {run} uses {:?}, not {:?}",
                controller.policy(),
                policy
            )));
        }
        Ok(controller)
    }

    /// A remote participant registers its watcher with the owner
    ///
    /// Registration may arrive before the run itself is added here, so the
    /// controller is created with the participant's policy when missing.
    pub async fn register(&self, run: &str, msg: RegisterWatcherMessage) -> Result<()> {
        let controller = self.owned_controller(run, msg.policy)?;
        let watcher: Arc<dyn IntervalResultWatcher> = Arc::new(HttpWatcher::new(
            self.client.clone(),
            &msg.load_path_name,
            &msg.callback_url,
        ));
        controller
            .register_interval_result_callback(&msg.load_path_name, watcher)
            .await
    }

    pub async fn remove(&self, run: &str, msg: RegisterWatcherMessage) -> Result<()> {
        let controller = self.owned(run)?;
        controller
            .remove_interval_result_callback(&msg.load_path_name)
            .await
    }

    pub async fn post_result(&self, run: &str, msg: IntervalResultMessage) -> Result<()> {
        let controller = self.owned(run)?;
        controller
            .post_interval_result(&msg.load_path_name, &msg.interval_name, msg.passed)
            .await
    }

    /// The owner delivers a combined verdict to this process
    pub async fn notify(&self, run: &str, load_path: &str, msg: IntervalResultMessage) -> Result<()> {
        let proxy = self
            .proxies
            .get(run)
            .map(|p| p.value().clone())
            .ok_or_else(|| DriverError::RunNotFound(run.to_string()))?;
        if msg.load_path_name != load_path {
            warn!(run = %run, path = %load_path, body = %msg.load_path_name, "verdict names a different load path");
        }
        proxy.notify(load_path, &msg.interval_name, msg.passed).await;
        Ok(())
    }

    pub fn drop_run(&self, run: &str) {
        self.owned.remove(run);
        self.proxies.remove(run);
    }

    fn owned(&self, run: &str) -> Result<Arc<LocalLoadPathController>> {
        self.owned
            .get(run)
            .map(|c| c.value().clone())
            .ok_or_else(|| DriverError::RunNotFound(run.to_string()))
    }
}
