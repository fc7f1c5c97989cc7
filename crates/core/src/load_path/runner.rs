// Load path runner
//
// One task per workload on the run host. Each step sets the workload's active
// users on every node, sleeps for the step, and when the step ends a stats
// interval closes it, fetches the rollup and (for verdict-driven intervals)
// waits for the controller's combined verdict.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::controller::{IntervalVerdict, LoadPathController};
use super::schedule::{IntervalOutcome, LoadPathOutcome, LoadSchedule, StatsIntervalEnd};
use crate::error::Result;
use crate::stats::interval_spec::now_millis;
use crate::stats::{IntervalClock, IntervalListener, RollupStatus, StatsAggregator, StatsRollup};
use crate::transport::PeerClient;

/// The set of driver nodes running a workload
#[async_trait]
pub trait LoadTarget: IntervalListener {
    async fn set_active_users(&self, users: u64);
}

/// Where completed-interval rollups are read from
#[async_trait]
pub trait RollupSource: Send + Sync {
    async fn rollup_status(&self, spec: &str, interval: &str) -> Result<RollupStatus>;
}

/// Reads rollups from a stats host over HTTP
pub struct HttpRollupSource {
    client: PeerClient,
    stats_host: String,
    run_name: String,
    workload_name: String,
}

impl HttpRollupSource {
    pub fn new(
        client: PeerClient,
        stats_host: impl Into<String>,
        run_name: impl Into<String>,
        workload_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            stats_host: stats_host.into(),
            run_name: run_name.into(),
            workload_name: workload_name.into(),
        }
    }
}

#[async_trait]
impl RollupSource for HttpRollupSource {
    async fn rollup_status(&self, spec: &str, interval: &str) -> Result<RollupStatus> {
        let path = format!(
            "/stats/run/{}/workload/{}/specName/{}/intervalName/{}/rollup",
            self.run_name, self.workload_name, spec, interval
        );
        let url = self.client.url(&self.stats_host, &path);
        Ok(self.client.get(&url).await?)
    }
}

/// Reads rollups from an aggregator in this process
pub struct LocalRollupSource {
    aggregator: Arc<StatsAggregator>,
    run_name: String,
    workload_name: String,
}

impl LocalRollupSource {
    pub fn new(
        aggregator: Arc<StatsAggregator>,
        run_name: impl Into<String>,
        workload_name: impl Into<String>,
    ) -> Self {
        Self {
            aggregator,
            run_name: run_name.into(),
            workload_name: workload_name.into(),
        }
    }
}

#[async_trait]
impl RollupSource for LocalRollupSource {
    async fn rollup_status(&self, spec: &str, interval: &str) -> Result<RollupStatus> {
        self.aggregator
            .rollup_status(&self.run_name, &self.workload_name, spec, interval)
    }
}

/// How long to wait for every node's summary to reach the stats host
#[derive(Debug, Clone, Copy)]
pub struct RollupPoll {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RollupPoll {
    fn default() -> Self {
        Self {
            attempts: 24,
            interval: Duration::from_millis(500),
        }
    }
}

/// Poll until the interval's rollup is complete
pub async fn fetch_rollup(
    source: &dyn RollupSource,
    spec: &str,
    interval: &str,
    poll: RollupPoll,
) -> Option<StatsRollup> {
    for attempt in 1..=poll.attempts {
        match source.rollup_status(spec, interval).await {
            Ok(RollupStatus {
                rollup: Some(rollup),
                ..
            }) => return Some(rollup),
            Ok(status) => {
                debug!(
                    spec = %spec,
                    interval = %interval,
                    attempt,
                    expected = status.num_samples_expected,
                    received = status.num_samples_received,
                    "rollup not ready"
                );
                tokio::time::sleep(poll.interval).await;
            }
            Err(e) => {
                warn!(spec = %spec, interval = %interval, error = %e, "failed to fetch rollup");
                return None;
            }
        }
    }
    warn!(spec = %spec, interval = %interval, "rollup never completed");
    None
}

pub struct LoadPathRunner {
    workload_name: String,
    schedule: Box<dyn LoadSchedule>,
    target: Arc<dyn LoadTarget>,
    clock: Arc<IntervalClock>,
    /// Other `loadpath` stats specs closed together with the path's own
    linked_specs: Vec<String>,
    rollups: Arc<dyn RollupSource>,
    controller: Arc<dyn LoadPathController>,
    verdicts: mpsc::UnboundedReceiver<IntervalVerdict>,
    /// The path's watcher is registered with `controller` and must be removed
    registered: bool,
    poll: RollupPoll,
}

impl LoadPathRunner {
    pub fn new(
        workload_name: impl Into<String>,
        schedule: Box<dyn LoadSchedule>,
        target: Arc<dyn LoadTarget>,
        clock: Arc<IntervalClock>,
        rollups: Arc<dyn RollupSource>,
        controller: Arc<dyn LoadPathController>,
        verdicts: mpsc::UnboundedReceiver<IntervalVerdict>,
    ) -> Self {
        Self {
            workload_name: workload_name.into(),
            schedule,
            target,
            clock,
            linked_specs: Vec::new(),
            rollups,
            controller,
            verdicts,
            registered: false,
            poll: RollupPoll::default(),
        }
    }

    /// Remove the path's watcher from the controller once the path completes
    pub fn with_registered_watcher(mut self) -> Self {
        self.registered = true;
        self
    }

    pub fn with_linked_specs(mut self, specs: Vec<String>) -> Self {
        self.linked_specs = specs;
        self
    }

    pub fn with_rollup_poll(mut self, poll: RollupPoll) -> Self {
        self.poll = poll;
        self
    }

    pub fn spawn(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> (JoinHandle<()>, oneshot::Receiver<LoadPathOutcome>) {
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(self.run(shutdown, tx));
        (handle, rx)
    }

    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        outcome_tx: oneshot::Sender<LoadPathOutcome>,
    ) {
        let name = self.schedule.name().to_string();
        info!(workload = %self.workload_name, load_path = %name, "load path started");

        let mut outcome_tx = Some(outcome_tx);
        let mut last: Option<IntervalOutcome> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let step = self.schedule.next_step(last.take());
            if let Some(outcome) = self.schedule.take_outcome() {
                info!(
                    workload = %self.workload_name,
                    load_path = %name,
                    passed = outcome.passed,
                    max_pass_users = outcome.max_pass_users,
                    "load path complete"
                );
                self.release_watcher(&name).await;
                if let Some(tx) = outcome_tx.take() {
                    let _ = tx.send(outcome);
                }
            }
            let Some(step) = step else {
                break;
            };

            self.clock.set_active_users(step.users);
            self.target.set_active_users(step.users).await;

            if step.duration.is_zero() {
                debug!(load_path = %name, "zero-length step, load path ends");
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(step.duration) => {}
                _ = shutdown.changed() => break,
            }

            if let Some(end) = step.ends_interval {
                match self.close_interval(&name, end, &mut shutdown).await {
                    Some(outcome) => last = Some(outcome),
                    None => break,
                }
            }
        }

        self.release_watcher(&name).await;
        info!(workload = %self.workload_name, load_path = %name, "load path stopped");
    }

    /// Other participants stop waiting on this path's verdicts
    async fn release_watcher(&mut self, name: &str) {
        if !std::mem::take(&mut self.registered) {
            return;
        }
        match self.controller.remove_interval_result_callback(name).await {
            Ok(()) => debug!(load_path = %name, "load path watcher removed"),
            Err(e) => warn!(load_path = %name, error = %e, "failed to remove load path watcher"),
        }
    }

    /// `None` when shut down while waiting for a verdict
    async fn close_interval(
        &mut self,
        name: &str,
        end: StatsIntervalEnd,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<IntervalOutcome> {
        let now = now_millis();
        for spec in std::iter::once(name).chain(self.linked_specs.iter().map(String::as_str)) {
            let msg = self.clock.close(spec, &end.name, now);
            self.target.interval_complete(msg).await;
        }

        let rollup = fetch_rollup(self.rollups.as_ref(), name, &end.name, self.poll).await;
        let own = self.schedule.judge(&end, rollup.as_ref());

        let passed = if end.needs_verdict {
            if let Err(e) = self.controller.post_interval_result(name, &end.name, own).await {
                warn!(load_path = %name, interval = %end.name, error = %e, "failed to post interval result");
            }
            self.await_verdict(&end.name, shutdown).await?
        } else {
            own
        };

        debug!(load_path = %name, interval = %end.name, own, passed, "stats interval closed");
        Some(IntervalOutcome {
            interval_name: end.name,
            passed,
            rollup,
        })
    }

    async fn await_verdict(
        &mut self,
        interval: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<bool> {
        loop {
            tokio::select! {
                verdict = self.verdicts.recv() => match verdict {
                    Some(v) if v.interval_name == interval => return Some(v.passed),
                    Some(v) => debug!(interval = %v.interval_name, "ignoring verdict for another interval"),
                    None => return None,
                },
                _ = shutdown.changed() => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_path::controller::{ChannelWatcher, ControllerPolicy, LocalLoadPathController};
    use crate::load_path::schedule::{FixedLoadPath, FixedLoadPathConfig};
    use crate::messages::StatsIntervalCompleteMessage;
    use crate::stats::{StatsSummary, ALL_TARGETS};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Nodes {
        users: Mutex<Vec<u64>>,
        closed: Mutex<Vec<StatsIntervalCompleteMessage>>,
    }

    #[async_trait]
    impl IntervalListener for Nodes {
        async fn interval_complete(&self, msg: StatsIntervalCompleteMessage) {
            self.closed.lock().push(msg);
        }
    }

    #[async_trait]
    impl LoadTarget for Nodes {
        async fn set_active_users(&self, users: u64) {
            self.users.lock().push(users);
        }
    }

    /// Every QoS period fails except those listed
    struct ScriptedRollups {
        passing: Vec<&'static str>,
    }

    #[async_trait]
    impl RollupSource for ScriptedRollups {
        async fn rollup_status(&self, spec: &str, interval: &str) -> Result<RollupStatus> {
            let mut summary = StatsSummary::new("w1", ALL_TARGETS, spec, &[]);
            summary.interval_name = interval.to_string();
            let mut rollup = StatsRollup::from_summary(&summary);
            rollup.interval_passed = self.passing.iter().any(|p| *p == interval);
            Ok(RollupStatus {
                num_samples_expected: 1,
                num_samples_received: 1,
                rollup: Some(rollup),
            })
        }
    }

    struct NeverReady;

    #[async_trait]
    impl RollupSource for NeverReady {
        async fn rollup_status(&self, _spec: &str, _interval: &str) -> Result<RollupStatus> {
            Ok(RollupStatus {
                num_samples_expected: 2,
                num_samples_received: 1,
                rollup: None,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_rollup_gives_up() {
        let poll = RollupPoll {
            attempts: 3,
            interval: Duration::from_millis(500),
        };
        assert!(fetch_rollup(&NeverReady, "lp", "1", poll).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_path_runs_through_controller() {
        let controller = Arc::new(LocalLoadPathController::new(ControllerPolicy::AllPass));
        let (watcher, verdicts) = ChannelWatcher::new();
        controller
            .register_interval_result_callback("fixed", Arc::new(watcher))
            .await
            .unwrap();

        let config = FixedLoadPathConfig {
            name: "fixed".into(),
            users: 20,
            ramp_up: 20,
            warm_up: 10,
            num_qos_periods: 2,
            qos_period_sec: 30,
            ramp_down: 10,
            time_step: 10,
            ..Default::default()
        };
        let nodes = Arc::new(Nodes::default());
        let runner = LoadPathRunner::new(
            "w1",
            Box::new(FixedLoadPath::new(&config).unwrap()),
            nodes.clone(),
            Arc::new(IntervalClock::new()),
            Arc::new(ScriptedRollups {
                passing: vec!["QOS-1"],
            }),
            controller,
            verdicts,
        )
        .with_linked_specs(vec!["lpStats".into()]);

        let (tx, rx) = watch::channel(false);
        let (handle, outcome) = runner.spawn(rx);

        let outcome = outcome.await.unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.max_pass_interval_name.as_deref(), Some("QOS-2"));
        assert_eq!(outcome.max_pass_users, 20);

        tx.send(true).unwrap();
        handle.await.unwrap();

        let closed: Vec<(String, String)> = nodes
            .closed
            .lock()
            .iter()
            .map(|m| (m.completed_spec_name.clone(), m.cur_interval_name.clone()))
            .collect();
        assert_eq!(closed[0], ("fixed".to_string(), "RampUp".to_string()));
        assert_eq!(closed[1], ("lpStats".to_string(), "RampUp".to_string()));
        assert!(closed.contains(&("fixed".to_string(), "QOS-2".to_string())));
        assert!(closed.contains(&("fixed".to_string(), "RampDown".to_string())));
        assert!(nodes.users.lock().iter().all(|u| *u == 20));
    }

    fn short_fixed(name: &str, num_qos_periods: u64) -> FixedLoadPath {
        FixedLoadPath::new(&FixedLoadPathConfig {
            name: name.into(),
            users: 10,
            ramp_up: 10,
            warm_up: 0,
            num_qos_periods,
            qos_period_sec: 30,
            ramp_down: 0,
            time_step: 10,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_path_stops_holding_back_others() {
        let controller = Arc::new(LocalLoadPathController::new(ControllerPolicy::AllPass));
        let passing = vec!["QOS-1", "QOS-2", "QOS-3"];

        let mut outcomes = Vec::new();
        let mut handles = Vec::new();
        let (tx, rx) = watch::channel(false);
        for (name, periods) in [("short", 1), ("long", 3)] {
            let (watcher, verdicts) = ChannelWatcher::new();
            controller
                .register_interval_result_callback(name, Arc::new(watcher))
                .await
                .unwrap();
            let runner = LoadPathRunner::new(
                name,
                Box::new(short_fixed(name, periods)),
                Arc::new(Nodes::default()),
                Arc::new(IntervalClock::new()),
                Arc::new(ScriptedRollups {
                    passing: passing.clone(),
                }),
                controller.clone(),
                verdicts,
            )
            .with_registered_watcher();
            let (handle, outcome) = runner.spawn(rx.clone());
            handles.push(handle);
            outcomes.push(outcome);
        }

        let long = outcomes.pop().unwrap();
        let short = outcomes.pop().unwrap();
        let short = short.await.unwrap();
        assert!(short.passed);

        let long = tokio::time::timeout(Duration::from_secs(3600), long)
            .await
            .expect("long path received every verdict")
            .unwrap();
        assert!(long.passed);
        assert_eq!(controller.watcher_count(), 0);

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_waiting_for_verdict() {
        let controller = Arc::new(LocalLoadPathController::new(ControllerPolicy::AllPass));
        let (watcher, verdicts) = ChannelWatcher::new();
        controller
            .register_interval_result_callback("fixed", Arc::new(watcher))
            .await
            .unwrap();
        // Second participant never reports, so the verdict never arrives
        let (other, _other_rx) = ChannelWatcher::new();
        controller
            .register_interval_result_callback("other", Arc::new(other))
            .await
            .unwrap();

        let config = FixedLoadPathConfig {
            name: "fixed".into(),
            users: 5,
            ramp_up: 10,
            warm_up: 0,
            num_qos_periods: 1,
            qos_period_sec: 10,
            ramp_down: 0,
            time_step: 10,
            ..Default::default()
        };
        let runner = LoadPathRunner::new(
            "w1",
            Box::new(FixedLoadPath::new(&config).unwrap()),
            Arc::new(Nodes::default()),
            Arc::new(IntervalClock::new()),
            Arc::new(ScriptedRollups { passing: vec![] }),
            controller,
            verdicts,
        );

        let (tx, rx) = watch::channel(false);
        let (handle, mut outcome) = runner.spawn(rx);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(outcome.try_recv().is_err());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
