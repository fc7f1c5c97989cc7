// Driver-node side of workloads: added definitions and initialized workloads

use std::sync::Arc;

use dashmap::DashMap;
use rampart_core::messages::{AddWorkloadMessage, InitializeWorkloadMessage};
use rampart_core::{
    DriverError, NodeWorkload, OperationExecutor, PeerClient, Result, StatsIntervalCompleteMessage,
};
use tokio::sync::watch;
use tracing::{info, instrument};

type WorkloadKey = (String, String);

fn key(run: &str, workload: &str) -> WorkloadKey {
    (run.to_string(), workload.to_string())
}

pub struct NodeService {
    client: PeerClient,
    executor: Arc<dyn OperationExecutor>,
    added: DashMap<WorkloadKey, AddWorkloadMessage>,
    workloads: DashMap<WorkloadKey, Arc<NodeWorkload>>,
    exit_on_shutdown: bool,
    exit: watch::Sender<bool>,
}

impl NodeService {
    pub fn new(
        client: PeerClient,
        executor: Arc<dyn OperationExecutor>,
        exit_on_shutdown: bool,
    ) -> Self {
        let (exit, _) = watch::channel(false);
        Self {
            client,
            executor,
            added: DashMap::new(),
            workloads: DashMap::new(),
            exit_on_shutdown,
            exit,
        }
    }

    /// Flips to true once a run asked this process to exit
    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exit.subscribe()
    }

    /// Store a workload definition until the run host initializes it
    pub fn add_workload(&self, run: &str, workload: &str, msg: AddWorkloadMessage) -> Result<()> {
        if msg.workload.name != workload {
            return Err(DriverError::config(format!(
                "workload body is named {} but was posted as {}",
                msg.workload.name, workload
            )));
        }
        self.ensure_not_initialized(run, workload)?;
        self.added.insert(key(run, workload), msg);
        Ok(())
    }

    /// Build this node's share of a workload; `inline` replaces a prior add
    #[instrument(skip(self, msg, inline))]
    pub fn initialize_workload(
        &self,
        run: &str,
        workload: &str,
        msg: InitializeWorkloadMessage,
        inline: Option<AddWorkloadMessage>,
    ) -> Result<()> {
        self.ensure_not_initialized(run, workload)?;
        let added = match inline {
            Some(added) => added,
            None => self
                .added
                .remove(&key(run, workload))
                .map(|(_, added)| added)
                .ok_or_else(|| {
                    DriverError::config(format!("workload {workload} of run {run} was never added"))
                })?,
        };

        let node = NodeWorkload::initialize(added, &msg, self.client.clone(), self.executor.clone())?;
        self.workloads.insert(key(run, workload), Arc::new(node));
        Ok(())
    }

    fn ensure_not_initialized(&self, run: &str, workload: &str) -> Result<()> {
        match self.workloads.get(&key(run, workload)) {
            Some(existing) => Err(DriverError::InvalidState {
                entity: "Workload",
                name: workload.to_string(),
                from: existing.state(),
                to: rampart_core::LifecycleState::Initialized,
            }),
            None => Ok(()),
        }
    }

    pub fn workload(&self, run: &str, workload: &str) -> Result<Arc<NodeWorkload>> {
        self.workloads
            .get(&key(run, workload))
            .map(|w| w.value().clone())
            .ok_or_else(|| DriverError::workload_not_found(run, workload))
    }

    pub fn change_active_users(&self, run: &str, workload: &str, users: u64) -> Result<()> {
        self.workload(run, workload)?.change_active_users(users)
    }

    pub async fn stats_interval_complete(
        &self,
        run: &str,
        workload: &str,
        msg: &StatsIntervalCompleteMessage,
    ) -> Result<()> {
        self.workload(run, workload)?
            .stats_interval_complete(msg)
            .await;
        Ok(())
    }

    pub async fn stop_workload(&self, run: &str, workload: &str) -> Result<()> {
        self.workload(run, workload)?.stop().await;
        Ok(())
    }

    /// Stop and forget every workload of a run, then signal exit when configured to
    pub async fn exit(&self, run: &str) {
        let keys: Vec<WorkloadKey> = self
            .workloads
            .iter()
            .filter(|entry| entry.key().0 == run)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, workload)) = self.workloads.remove(&key) {
                workload.stop().await;
            }
        }
        self.added.retain(|key, _| key.0 != run);

        info!(run = %run, exit = self.exit_on_shutdown, "run shut down on this node");
        if self.exit_on_shutdown {
            let _ = self.exit.send(true);
        }
    }
}
