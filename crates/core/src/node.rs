//! Workloads as seen from a driver node
//!
//! The run host registers each workload with an [`AddWorkloadMessage`] and then
//! initializes it. From then on the node runs its share of the simulated users
//! and ships stats summaries whenever the run host closes an interval.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, instrument};

use crate::behavior::{BehaviorSpecRegistry, BidStrategy};
use crate::error::{DriverError, Result};
use crate::lifecycle::LifecycleState;
use crate::messages::{AddWorkloadMessage, InitializeWorkloadMessage, StatsIntervalCompleteMessage};
use crate::stats::{BufferedStatsCollector, Granularity, HttpStatsSink, StatsCollector, StatsSink};
use crate::transport::PeerClient;
use crate::user::{OperationExecutor, UserPool, UserPoolConfig};
use crate::workload::{distribute_users, WorkloadConfig};

pub struct NodeWorkload {
    run_name: String,
    config: WorkloadConfig,
    node_number: u32,
    /// This node's share of the workload's maximum
    max_users: u64,
    collector: Arc<BufferedStatsCollector>,
    users: UserPool,
    state: Mutex<LifecycleState>,
}

impl NodeWorkload {
    /// Build the node side of a workload from its registration and init message
    pub fn initialize(
        added: AddWorkloadMessage,
        msg: &InitializeWorkloadMessage,
        client: PeerClient,
        executor: Arc<dyn OperationExecutor>,
    ) -> Result<Self> {
        let sink: Arc<dyn StatsSink> = Arc::new(HttpStatsSink::new(
            client,
            &msg.stats_host_name,
            msg.stats_port_number,
            &msg.run_name,
        ));
        Self::with_sink(added, msg, executor, sink)
    }

    pub fn with_sink(
        added: AddWorkloadMessage,
        msg: &InitializeWorkloadMessage,
        executor: Arc<dyn OperationExecutor>,
        sink: Arc<dyn StatsSink>,
    ) -> Result<Self> {
        let config = added.workload;
        config.validate()?;
        if msg.num_nodes == 0 || msg.node_number >= msg.num_nodes {
            return Err(DriverError::config(format!(
                "node {} of {} is out of range",
                msg.node_number, msg.num_nodes
            )));
        }

        let registry = Arc::new(BehaviorSpecRegistry::from_specs(added.behavior_specs)?);
        let root_spec = registry.get(&config.behavior_spec_name)?;
        let operations = registry.operation_qualities(&config.behavior_spec_name)?;

        let granularity = if msg.per_target_stats || config.per_target_stats {
            Granularity::PerTarget
        } else {
            Granularity::PerWorkload
        };
        let collector = Arc::new(BufferedStatsCollector::new(
            &config.name,
            &msg.hostname,
            granularity,
            config.tracked_specs(),
            operations,
            &config.targets,
            sink,
        ));

        let max_users = distribute_users(config.max_users, msg.num_nodes as usize)
            .get(msg.node_number as usize)
            .copied()
            .unwrap_or(0);
        let strategy: Arc<dyn BidStrategy> = Arc::new(config.bid_strategy.build());
        let stats: Arc<dyn StatsCollector> = collector.clone();
        let users = UserPool::new(
            UserPoolConfig {
                workload_name: config.name.clone(),
                host_name: msg.hostname.clone(),
                targets: config.targets.clone(),
                root_spec,
                registry,
                strategy,
            },
            executor,
            stats,
        );

        info!(
            run = %msg.run_name,
            workload = %config.name,
            node = msg.node_number,
            nodes = msg.num_nodes,
            max_users,
            "workload initialized on node"
        );
        Ok(Self {
            run_name: msg.run_name.clone(),
            config,
            node_number: msg.node_number,
            max_users,
            collector,
            users,
            state: Mutex::new(LifecycleState::Initialized),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn node_number(&self) -> u32 {
        self.node_number
    }

    pub fn max_users(&self) -> u64 {
        self.max_users
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn active_users(&self) -> u64 {
        self.users.active_users()
    }

    /// Set this node's active users; the first change starts the workload
    #[instrument(skip(self), fields(workload = %self.config.name))]
    pub fn change_active_users(&self, users: u64) -> Result<()> {
        if users > self.max_users {
            return Err(DriverError::TooManyUsers {
                requested: users,
                max: self.max_users,
            });
        }
        {
            let mut state = self.state.lock();
            match *state {
                LifecycleState::Initialized => {
                    state.advance(LifecycleState::Running, "Workload", &self.config.name)?
                }
                LifecycleState::Running => {}
                other => {
                    return Err(DriverError::InvalidState {
                        entity: "Workload",
                        name: self.config.name.clone(),
                        from: other,
                        to: LifecycleState::Running,
                    })
                }
            }
        }
        self.users.set_active_users(users);
        Ok(())
    }

    pub async fn stats_interval_complete(&self, msg: &StatsIntervalCompleteMessage) {
        self.collector.stats_interval_complete(msg).await;
    }

    /// Stop every user; in-flight operations finish first
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state >= LifecycleState::Stopping {
                return;
            }
            *state = LifecycleState::Stopping;
        }
        self.users.stop().await;
        *self.state.lock() = LifecycleState::Completed;
        info!(run = %self.run_name, workload = %self.config.name, "workload stopped on node");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::spec::fixtures::two_state;
    use crate::stats::StatsSummary;
    use crate::transport::TransportError;
    use crate::user::DryRunExecutor;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<StatsSummary>>,
    }

    #[async_trait]
    impl StatsSink for RecordingSink {
        async fn send(&self, summary: &StatsSummary) -> std::result::Result<(), TransportError> {
            self.sent.lock().push(summary.clone());
            Ok(())
        }
    }

    fn added() -> AddWorkloadMessage {
        let workload: WorkloadConfig = serde_json::from_value(serde_json::json!({
            "name": "auction",
            "behaviorSpecName": "user",
            "maxUsers": 101,
            "targets": ["t1", "t2"],
            "loadPath": {
                "type": "interval",
                "name": "steady",
                "loadIntervals": [{"type": "uniform", "name": "only", "duration": 60, "users": 100}]
            }
        }))
        .unwrap();
        AddWorkloadMessage {
            workload,
            behavior_specs: vec![two_state("user", None)],
        }
    }

    fn init(node_number: u32, per_target_stats: bool) -> InitializeWorkloadMessage {
        InitializeWorkloadMessage {
            hostname: format!("driver{node_number}"),
            node_number,
            num_nodes: 2,
            stats_host_name: "master".into(),
            stats_port_number: 7500,
            run_name: "r1".into(),
            per_target_stats,
        }
    }

    fn node(node_number: u32, sink: Arc<RecordingSink>) -> NodeWorkload {
        NodeWorkload::with_sink(
            added(),
            &init(node_number, true),
            Arc::new(DryRunExecutor::new(Duration::from_millis(20))),
            sink,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_share_of_max_users() {
        let first = node(0, Arc::default());
        let second = node(1, Arc::default());
        assert_eq!(first.max_users(), 51);
        assert_eq!(second.max_users(), 50);

        let err = second.change_active_users(51).unwrap_err();
        assert!(matches!(err, DriverError::TooManyUsers { requested: 51, max: 50 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_and_stats() {
        let sink = Arc::new(RecordingSink::default());
        let node = node(0, sink.clone());
        assert_eq!(node.state(), LifecycleState::Initialized);

        node.change_active_users(4).unwrap();
        assert_eq!(node.state(), LifecycleState::Running);
        assert_eq!(node.active_users(), 4);
        tokio::time::sleep(Duration::from_secs(20)).await;

        node.stats_interval_complete(&StatsIntervalCompleteMessage {
            completed_spec_name: "steady".into(),
            cur_interval_name: "only".into(),
            cur_interval_start_time: 0,
            last_interval_end_time: 20_000,
            interval_start_users: 4,
            interval_end_users: 4,
        })
        .await;
        {
            let sent = sink.sent.lock();
            // per-target stats: one summary per target
            assert_eq!(sent.len(), 2);
            assert!(sent.iter().all(|s| s.host_name == "driver0"));
            assert!(sent.iter().map(|s| s.total_num_ops()).sum::<u64>() > 0);
        }

        node.stop().await;
        assert_eq!(node.state(), LifecycleState::Completed);
        assert_eq!(node.active_users(), 0);
        assert!(node.change_active_users(1).is_err());
    }

    #[test]
    fn test_unknown_behavior_spec_is_configuration_error() {
        let mut added = added();
        added.workload.behavior_spec_name = "missing".into();
        let err = match NodeWorkload::with_sink(
            added,
            &init(0, false),
            Arc::new(DryRunExecutor::default()),
            Arc::new(RecordingSink::default()),
        ) {
            Ok(_) => panic!("expected failure"),
            Err(e) => e,
        };
        assert!(err.is_configuration());
    }
}
