//! Simulated users
//!
//! Each active user is one tokio task walking its own [`BehaviorTree`]. The
//! task keeps every scheduled operation in flight at once, so sub-behaviors run
//! concurrently with the behavior that started them. Completed operations are
//! reported to the [`StatsCollector`] unless their behavior was stopped while
//! the operation was running.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::behavior::{
    BehaviorId, BehaviorSpec, BehaviorSpecRegistry, BehaviorTree, BidSnapshot, BidStrategy,
    ItemSnapshot, ProviderState, ProviderUpdate, ScheduledOperation, Transition, UserProfile,
};
use crate::stats::interval_spec::now_millis;
use crate::stats::{OperationStats, StatsCollector};
use crate::workload::distribute_users;

/// Everything an executor needs to issue one operation
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub user_id: u64,
    pub target_name: String,
    pub behavior_id: BehaviorId,
    pub operation_index: usize,
    pub operation_name: String,
    pub user_profile: Option<UserProfile>,
    pub current_bid: Option<BidSnapshot>,
    pub current_item: Option<ItemSnapshot>,
    pub active_auctions: Vec<i64>,
    pub auction_id_to_leave: Option<i64>,
}

/// What the system under test told us
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationResult {
    pub failure: Option<String>,
    pub updates: Vec<ProviderUpdate>,
    pub total_steps: u64,
}

impl OperationResult {
    pub fn ok(updates: Vec<ProviderUpdate>) -> Self {
        Self {
            failure: None,
            updates,
            total_steps: 1,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            updates: Vec::new(),
            total_steps: 1,
        }
    }
}

/// Runs benchmark operations against the system under test
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, request: OperationRequest) -> OperationResult;
}

/// Executor that answers every operation after a fixed service time
///
/// Exercises the control plane without a system under test.
#[derive(Debug, Clone, Default)]
pub struct DryRunExecutor {
    service_time: Duration,
}

impl DryRunExecutor {
    pub fn new(service_time: Duration) -> Self {
        Self { service_time }
    }
}

#[async_trait]
impl OperationExecutor for DryRunExecutor {
    async fn execute(&self, _request: OperationRequest) -> OperationResult {
        tokio::time::sleep(self.service_time).await;
        OperationResult::ok(Vec::new())
    }
}

/// Settings shared by every user of one workload on one node
pub struct UserPoolConfig {
    pub workload_name: String,
    pub host_name: String,
    pub targets: Vec<String>,
    pub root_spec: Arc<BehaviorSpec>,
    pub registry: Arc<BehaviorSpecRegistry>,
    pub strategy: Arc<dyn BidStrategy>,
}

struct UserShared {
    config: UserPoolConfig,
    executor: Arc<dyn OperationExecutor>,
    collector: Arc<dyn StatsCollector>,
}

struct UserHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Active users of one workload on one node, spread over its targets
pub struct UserPool {
    shared: Arc<UserShared>,
    /// Per target, in start order
    users: Mutex<Vec<Vec<UserHandle>>>,
    next_user_id: Mutex<u64>,
}

impl UserPool {
    pub fn new(
        config: UserPoolConfig,
        executor: Arc<dyn OperationExecutor>,
        collector: Arc<dyn StatsCollector>,
    ) -> Self {
        let num_targets = config.targets.len();
        Self {
            shared: Arc::new(UserShared {
                config,
                executor,
                collector,
            }),
            users: Mutex::new((0..num_targets).map(|_| Vec::new()).collect()),
            next_user_id: Mutex::new(0),
        }
    }

    pub fn active_users(&self) -> u64 {
        self.users.lock().iter().map(|t| t.len() as u64).sum()
    }

    pub fn active_users_per_target(&self) -> Vec<u64> {
        self.users.lock().iter().map(|t| t.len() as u64).collect()
    }

    /// Grow or shrink each target to its share of `total`
    ///
    /// Removed users finish their in-flight operations before their task exits.
    pub fn set_active_users(&self, total: u64) {
        let shares = distribute_users(total, self.shared.config.targets.len());
        let mut users = self.users.lock();
        for (target_index, (target_users, share)) in users.iter_mut().zip(shares).enumerate() {
            let share = share as usize;
            while target_users.len() > share {
                if let Some(user) = target_users.pop() {
                    let _ = user.stop.send(true);
                }
            }
            while target_users.len() < share {
                let user_id = {
                    let mut next = self.next_user_id.lock();
                    *next += 1;
                    *next
                };
                target_users.push(self.spawn_user(user_id, target_index));
            }
        }
        debug!(
            workload = %self.shared.config.workload_name,
            active_users = total,
            "active users changed"
        );
    }

    fn spawn_user(&self, user_id: u64, target_index: usize) -> UserHandle {
        let (stop, stop_rx) = watch::channel(false);
        let user = SimulatedUser::new(self.shared.clone(), user_id, target_index);
        let task = tokio::spawn(user.run(stop_rx));
        UserHandle { stop, task }
    }

    /// Stop every user and wait for their in-flight operations
    pub async fn stop(&self) {
        let handles: Vec<UserHandle> = self.users.lock().iter_mut().flat_map(std::mem::take).collect();
        for handle in &handles {
            let _ = handle.stop.send(true);
        }
        for handle in handles {
            if let Err(e) = handle.task.await {
                warn!(workload = %self.shared.config.workload_name, error = %e, "user task failed");
            }
        }
        info!(workload = %self.shared.config.workload_name, "all users stopped");
    }
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

struct CompletedOperation {
    op: ScheduledOperation,
    result: OperationResult,
    start_time: i64,
    end_time: i64,
}

struct SimulatedUser {
    shared: Arc<UserShared>,
    user_id: u64,
    target_name: String,
    tree: BehaviorTree,
    providers: ProviderState,
    rng: StdRng,
}

impl SimulatedUser {
    fn new(shared: Arc<UserShared>, user_id: u64, target_index: usize) -> Self {
        let config = &shared.config;
        let tree = BehaviorTree::new(
            config.root_spec.clone(),
            config.registry.clone(),
            config.strategy.clone(),
        );
        Self {
            target_name: config.targets.get(target_index).cloned().unwrap_or_default(),
            tree,
            user_id,
            providers: ProviderState::new(),
            rng: StdRng::from_entropy(),
            shared,
        }
    }

    fn request(&self, op: &ScheduledOperation) -> OperationRequest {
        OperationRequest {
            user_id: self.user_id,
            target_name: self.target_name.clone(),
            behavior_id: op.behavior_id,
            operation_index: op.operation_index,
            operation_name: op.operation_name.clone(),
            user_profile: self.providers.user_profile().cloned(),
            current_bid: self.providers.current_bid(op.data_source).cloned(),
            current_item: self.providers.current_item(op.data_source).cloned(),
            active_auctions: self.providers.active_auctions().to_vec(),
            auction_id_to_leave: self.providers.auction_id_to_leave(),
        }
    }

    /// Resolves to `None` when the user stops before the operation starts
    fn execute(
        &self,
        op: ScheduledOperation,
        stop: watch::Receiver<bool>,
    ) -> impl Future<Output = Option<CompletedOperation>> + Send + 'static {
        let executor = self.shared.executor.clone();
        let request = self.request(&op);
        async move {
            tokio::select! {
                _ = tokio::time::sleep_until(op.start_at) => {}
                _ = stopped(stop) => return None,
            }
            let start_time = now_millis();
            let result = executor.execute(request).await;
            Some(CompletedOperation {
                op,
                result,
                start_time,
                end_time: now_millis(),
            })
        }
    }

    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut in_flight = FuturesUnordered::new();
        if let Some(first) = self.tree.start(Instant::now(), &mut self.rng) {
            in_flight.push(self.execute(first, stop.clone()));
        }

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                Some(done) = in_flight.next() => {
                    let Some(done) = done else { continue };
                    for op in self.complete(done) {
                        in_flight.push(self.execute(op, stop.clone()));
                    }
                }
            }
        }

        // running operations land, nothing new is scheduled
        while let Some(done) = in_flight.next().await {
            if let Some(done) = done {
                self.record(&done);
            }
        }
        debug!(user = self.user_id, target = %self.target_name, "user stopped");
    }

    fn record(&self, done: &CompletedOperation) {
        if !self.tree.contains(done.op.behavior_id) {
            return;
        }
        let config = &self.shared.config;
        let mut stats = OperationStats::new(
            &done.op.operation_name,
            &self.target_name,
            done.start_time,
            done.end_time,
        )
        .with_host(&config.host_name)
        .with_cycle_time(done.op.cycle_time.as_millis() as i64)
        .with_steps(done.result.total_steps);
        if let Some(reason) = &done.result.failure {
            stats = stats.with_failure(reason);
        }
        self.shared.collector.submit_operation_stats(stats);
    }

    fn complete(&mut self, done: CompletedOperation) -> Vec<ScheduledOperation> {
        let id = done.op.behavior_id;
        if !self.tree.contains(id) {
            return Vec::new();
        }
        self.record(&done);

        if let Some(reason) = done.result.failure {
            debug!(user = self.user_id, operation = %done.op.operation_name, reason = %reason, "operation failed, resetting user");
            return vec![self.tree.reset(&mut self.providers, Instant::now(), &mut self.rng)];
        }

        for update in done.result.updates {
            self.providers.apply(done.op.data_sink, update);
        }

        match self
            .tree
            .operation_complete(id, &mut self.providers, Instant::now(), &mut self.rng)
        {
            Ok(Transition::Next(ops)) => ops,
            Ok(Transition::Reset) => {
                vec![self.tree.reset(&mut self.providers, Instant::now(), &mut self.rng)]
            }
            Err(e) => {
                warn!(user = self.user_id, error = %e, "behavior transition failed, resetting user");
                vec![self.tree.reset(&mut self.providers, Instant::now(), &mut self.rng)]
            }
        }
    }
}
