//! Load path controllers
//!
//! Every participating load path registers one watcher and posts one verdict
//! per interval. Once all registered participants have reported, the combined
//! verdict is delivered to every watcher exactly once. How verdicts combine is
//! decided by [`ControllerPolicy`]; some policies switch mode permanently after
//! an interval where load was no longer sustainable.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use crate::error::Result;

/// Receives combined interval verdicts
#[async_trait]
pub trait IntervalResultWatcher: Send + Sync {
    async fn interval_result(&self, interval_name: &str, passed: bool);
}

#[async_trait]
pub trait LoadPathController: Send + Sync {
    /// Register the watcher for participant `name`. Re-registering replaces it.
    async fn register_interval_result_callback(
        &self,
        name: &str,
        watcher: Arc<dyn IntervalResultWatcher>,
    ) -> Result<()>;

    async fn remove_interval_result_callback(&self, name: &str) -> Result<()>;

    /// Report participant `name`'s verdict for `interval_name`
    async fn post_interval_result(&self, name: &str, interval_name: &str, passed: bool)
        -> Result<()>;
}

/// How per-participant verdicts are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControllerPolicy {
    /// AND of all reports
    #[default]
    AllPass,
    /// OR until an interval where every participant fails, then AND
    AnyPassUntilFail,
    /// OR until failures reach passes in an interval, then AND
    AnyPassUntilHalfFail,
    /// OR until failures reach passes in an interval, then each participant on its own
    SyncUntilHalfFail,
    /// OR until an interval where every participant fails, then each participant on its own
    SyncUntilAllFail,
}

/// Current combining mode of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    And,
    Or,
    /// Each report goes straight back to the reporter's own watcher
    PassThrough,
}

/// Verdicts received so far for one interval
#[derive(Debug, Default)]
pub struct IntervalTally {
    combined: Option<bool>,
    passes: u32,
    fails: u32,
    reporters: HashSet<String>,
}

impl IntervalTally {
    pub fn reporters(&self) -> usize {
        self.reporters.len()
    }
}

/// Policy plus the mode it has switched into
#[derive(Debug, Clone)]
pub struct PolicyState {
    policy: ControllerPolicy,
    mode: Mode,
}

impl PolicyState {
    pub fn new(policy: ControllerPolicy) -> Self {
        let mode = match policy {
            ControllerPolicy::AllPass => Mode::And,
            _ => Mode::Or,
        };
        Self { policy, mode }
    }

    pub fn policy(&self) -> ControllerPolicy {
        self.policy
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Fold `latest` into `previous` under the current mode
    pub fn combine(&self, previous: Option<bool>, latest: bool) -> bool {
        match (self.mode, previous) {
            (_, None) | (Mode::PassThrough, _) => latest,
            (Mode::And, Some(p)) => p && latest,
            (Mode::Or, Some(p)) => p || latest,
        }
    }

    /// Record one report. On the last report returns the interval's final verdict,
    /// switching mode when the policy calls for it.
    pub fn fold(&mut self, tally: &mut IntervalTally, passed: bool, is_last: bool) -> Option<bool> {
        if passed {
            tally.passes += 1;
        } else {
            tally.fails += 1;
        }
        tally.combined = Some(self.combine(tally.combined, passed));

        if !is_last {
            return None;
        }
        Some(self.finish(tally))
    }

    /// Final verdict of an interval every participant has reported for
    pub fn finish(&mut self, tally: &IntervalTally) -> bool {
        let mut result = tally.combined.unwrap_or(tally.fails == 0);
        if self.mode == Mode::Or {
            let all_failed = tally.passes == 0;
            let half_failed = tally.fails >= tally.passes;
            let next = match self.policy {
                ControllerPolicy::AnyPassUntilFail if all_failed => Some(Mode::And),
                ControllerPolicy::AnyPassUntilHalfFail if half_failed => Some(Mode::And),
                ControllerPolicy::SyncUntilHalfFail if half_failed => Some(Mode::PassThrough),
                ControllerPolicy::SyncUntilAllFail if all_failed => Some(Mode::PassThrough),
                _ => None,
            };
            if let Some(next) = next {
                info!(
                    policy = ?self.policy,
                    passes = tally.passes,
                    fails = tally.fails,
                    mode = ?next,
                    "load path controller switching mode"
                );
                self.mode = next;
                result = false;
            }
        }
        result
    }
}

struct ControllerState {
    watchers: HashMap<String, Arc<dyn IntervalResultWatcher>>,
    tallies: HashMap<String, IntervalTally>,
    policy: PolicyState,
}

impl ControllerState {
    /// Every registered participant has reported for this interval
    fn complete(&self, tally: &IntervalTally) -> bool {
        self.watchers.keys().all(|w| tally.reporters.contains(w))
    }

    fn broadcast(&self, interval_name: &str, result: bool) -> Vec<Delivery> {
        self.watchers
            .values()
            .map(|w| (interval_name.to_string(), Arc::clone(w), result))
            .collect()
    }
}

type Delivery = (String, Arc<dyn IntervalResultWatcher>, bool);

async fn deliver(deliveries: Vec<Delivery>) {
    join_all(
        deliveries
            .iter()
            .map(|(interval, watcher, result)| watcher.interval_result(interval, *result)),
    )
    .await;
}

/// Authoritative controller living in the owning process
pub struct LocalLoadPathController {
    state: Mutex<ControllerState>,
}

impl LocalLoadPathController {
    pub fn new(policy: ControllerPolicy) -> Self {
        Self {
            state: Mutex::new(ControllerState {
                watchers: HashMap::new(),
                tallies: HashMap::new(),
                policy: PolicyState::new(policy),
            }),
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.state.lock().watchers.len()
    }

    pub fn mode(&self) -> Mode {
        self.state.lock().policy.mode()
    }

    pub fn policy(&self) -> ControllerPolicy {
        self.state.lock().policy.policy()
    }

    /// Work out who to notify; runs entirely under the lock
    fn record(&self, name: &str, interval_name: &str, passed: bool) -> Vec<Delivery> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(own_watcher) = state.watchers.get(name).cloned() else {
            warn!(participant = %name, interval = %interval_name, "result from unregistered participant ignored");
            return Vec::new();
        };

        if state.policy.mode() == Mode::PassThrough {
            return vec![(interval_name.to_string(), own_watcher, passed)];
        }

        let total = state.watchers.len();
        let mut tally = state.tallies.remove(interval_name).unwrap_or_default();
        if !tally.reporters.insert(name.to_string()) {
            warn!(participant = %name, interval = %interval_name, "duplicate interval result ignored");
            state.tallies.insert(interval_name.to_string(), tally);
            return Vec::new();
        }

        let is_last = state.complete(&tally);
        debug!(
            participant = %name,
            interval = %interval_name,
            passed,
            reported = tally.reporters.len(),
            expected = total,
            "interval result posted"
        );

        let Some(result) = state.policy.fold(&mut tally, passed, is_last) else {
            state.tallies.insert(interval_name.to_string(), tally);
            return Vec::new();
        };

        info!(interval = %interval_name, passed = result, participants = total, "interval verdict combined");
        state.broadcast(interval_name, result)
    }

    /// Drop a participant and close every interval the rest have all reported for
    ///
    /// Reports the removed participant already posted still count.
    fn release(&self, name: &str) -> Vec<Delivery> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.watchers.remove(name).is_none() {
            debug!(participant = %name, "removing unknown participant");
            return Vec::new();
        }
        debug!(participant = %name, watchers = state.watchers.len(), "watcher removed");
        if state.watchers.is_empty() {
            state.tallies.clear();
            return Vec::new();
        }

        let mut ready: Vec<String> = state
            .tallies
            .iter()
            .filter(|(_, tally)| state.complete(tally))
            .map(|(interval, _)| interval.clone())
            .collect();
        ready.sort();

        let mut deliveries = Vec::new();
        for interval in ready {
            let Some(tally) = state.tallies.remove(&interval) else {
                continue;
            };
            let result = state.policy.finish(&tally);
            info!(
                interval = %interval,
                passed = result,
                participants = state.watchers.len(),
                "interval verdict combined after participant left"
            );
            deliveries.extend(state.broadcast(&interval, result));
        }
        deliveries
    }
}

#[async_trait]
impl LoadPathController for LocalLoadPathController {
    async fn register_interval_result_callback(
        &self,
        name: &str,
        watcher: Arc<dyn IntervalResultWatcher>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.watchers.insert(name.to_string(), watcher).is_some() {
            warn!(participant = %name, "replacing interval result watcher");
        }
        debug!(participant = %name, watchers = state.watchers.len(), "watcher registered");
        Ok(())
    }

    async fn remove_interval_result_callback(&self, name: &str) -> Result<()> {
        let deliveries = self.release(name);
        deliver(deliveries).await;
        Ok(())
    }

    async fn post_interval_result(
        &self,
        name: &str,
        interval_name: &str,
        passed: bool,
    ) -> Result<()> {
        let deliveries = self.record(name, interval_name, passed);
        deliver(deliveries).await;
        Ok(())
    }
}

/// A combined verdict delivered to a watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalVerdict {
    pub interval_name: String,
    pub passed: bool,
}

/// Watcher that forwards verdicts into a channel
pub struct ChannelWatcher {
    tx: mpsc::UnboundedSender<IntervalVerdict>,
}

impl ChannelWatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<IntervalVerdict>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl IntervalResultWatcher for ChannelWatcher {
    async fn interval_result(&self, interval_name: &str, passed: bool) {
        let verdict = IntervalVerdict {
            interval_name: interval_name.to_string(),
            passed,
        };
        if self.tx.send(verdict).is_err() {
            debug!(interval = %interval_name, "verdict receiver gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl IntervalResultWatcher for Recorder {
        async fn interval_result(&self, interval_name: &str, passed: bool) {
            self.seen.lock().push((interval_name.to_string(), passed));
        }
    }

    async fn controller(
        policy: ControllerPolicy,
        names: &[&str],
    ) -> (LocalLoadPathController, Vec<Arc<Recorder>>) {
        let controller = LocalLoadPathController::new(policy);
        let mut recorders = Vec::new();
        for name in names {
            let r = Arc::new(Recorder::default());
            controller
                .register_interval_result_callback(name, r.clone())
                .await
                .unwrap();
            recorders.push(r);
        }
        (controller, recorders)
    }

    async fn post_all(c: &LocalLoadPathController, interval: &str, results: &[(&str, bool)]) {
        for (name, passed) in results {
            c.post_interval_result(name, interval, *passed).await.unwrap();
        }
    }

    #[test]
    fn test_policy_json_names() {
        let p: ControllerPolicy =
            serde_json::from_value(serde_json::json!({"type": "syncuntilhalffail"})).unwrap();
        assert_eq!(p, ControllerPolicy::SyncUntilHalfFail);
        let json = serde_json::to_value(ControllerPolicy::AnyPassUntilFail).unwrap();
        assert_eq!(json["type"], "anypassuntilfail");
    }

    #[tokio::test]
    async fn test_fires_once_after_last_post_in_any_order() {
        let (c, recorders) = controller(ControllerPolicy::AllPass, &["a", "b", "c"]).await;

        c.post_interval_result("c", "1", true).await.unwrap();
        c.post_interval_result("a", "1", true).await.unwrap();
        assert!(recorders[0].seen.lock().is_empty());

        c.post_interval_result("a", "1", false).await.unwrap();
        assert!(recorders[0].seen.lock().is_empty());

        c.post_interval_result("b", "1", true).await.unwrap();
        for r in &recorders {
            assert_eq!(*r.seen.lock(), vec![("1".to_string(), true)]);
        }
    }

    #[tokio::test]
    async fn test_all_must_pass_three_nodes() {
        let (c, recorders) = controller(ControllerPolicy::AllPass, &["a", "b", "c"]).await;
        let a = [true, true, false];
        for (i, a_passed) in a.iter().enumerate() {
            let interval = (i + 1).to_string();
            post_all(&c, &interval, &[("b", true), ("a", *a_passed), ("c", true)]).await;
        }
        let results: Vec<bool> = recorders[2].seen.lock().iter().map(|(_, p)| *p).collect();
        assert_eq!(results, vec![true, true, false]);
    }

    #[tokio::test]
    async fn test_any_pass_until_fail_is_sticky() {
        let (c, recorders) = controller(ControllerPolicy::AnyPassUntilFail, &["a", "b"]).await;
        post_all(&c, "1", &[("a", true), ("b", false)]).await;
        post_all(&c, "2", &[("a", false), ("b", false)]).await;
        assert_eq!(c.mode(), Mode::And);
        post_all(&c, "3", &[("a", true), ("b", false)]).await;
        post_all(&c, "4", &[("a", true), ("b", true)]).await;

        let results: Vec<bool> = recorders[0].seen.lock().iter().map(|(_, p)| *p).collect();
        assert_eq!(results, vec![true, false, false, true]);
        assert_eq!(c.mode(), Mode::And);
    }

    #[tokio::test]
    async fn test_any_pass_until_half_fail() {
        let (c, recorders) =
            controller(ControllerPolicy::AnyPassUntilHalfFail, &["a", "b", "c", "d"]).await;
        post_all(&c, "1", &[("a", true), ("b", true), ("c", true), ("d", false)]).await;
        assert_eq!(c.mode(), Mode::Or);
        post_all(&c, "2", &[("a", true), ("b", true), ("c", false), ("d", false)]).await;
        assert_eq!(c.mode(), Mode::And);
        post_all(&c, "3", &[("a", true), ("b", true), ("c", true), ("d", false)]).await;

        let results: Vec<bool> = recorders[1].seen.lock().iter().map(|(_, p)| *p).collect();
        assert_eq!(results, vec![true, false, false]);
    }

    #[tokio::test]
    async fn test_sync_until_half_fail_then_pass_through() {
        let (c, recorders) = controller(ControllerPolicy::SyncUntilHalfFail, &["a", "b"]).await;
        post_all(&c, "1", &[("a", true), ("b", false)]).await;
        assert_eq!(c.mode(), Mode::PassThrough);
        for r in &recorders {
            assert_eq!(*r.seen.lock(), vec![("1".to_string(), false)]);
        }

        c.post_interval_result("b", "2", true).await.unwrap();
        assert_eq!(recorders[1].seen.lock().last(), Some(&("2".to_string(), true)));
        assert_eq!(recorders[0].seen.lock().len(), 1);

        c.post_interval_result("a", "2", false).await.unwrap();
        assert_eq!(recorders[0].seen.lock().last(), Some(&("2".to_string(), false)));
        assert_eq!(recorders[1].seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_until_all_fail() {
        let (c, recorders) = controller(ControllerPolicy::SyncUntilAllFail, &["a", "b"]).await;
        post_all(&c, "1", &[("a", true), ("b", false)]).await;
        assert_eq!(c.mode(), Mode::Or);
        post_all(&c, "2", &[("a", false), ("b", false)]).await;
        assert_eq!(c.mode(), Mode::PassThrough);
        let results: Vec<bool> = recorders[0].seen.lock().iter().map(|(_, p)| *p).collect();
        assert_eq!(results, vec![true, false]);
    }

    #[tokio::test]
    async fn test_order_does_not_change_verdict() {
        for policy in [ControllerPolicy::AllPass, ControllerPolicy::AnyPassUntilFail] {
            let reports = [("a", true), ("b", false), ("c", true)];
            let mut outcomes = Vec::new();
            for rotation in 0..3 {
                let (c, recorders) = controller(policy, &["a", "b", "c"]).await;
                let mut order = reports.to_vec();
                order.rotate_left(rotation);
                post_all(&c, "1", &order).await;
                outcomes.push(recorders[0].seen.lock()[0].1);
            }
            assert!(outcomes.windows(2).all(|w| w[0] == w[1]), "{:?}", policy);
        }
    }

    #[tokio::test]
    async fn test_removed_participant_no_longer_counted() {
        let (c, recorders) = controller(ControllerPolicy::AllPass, &["a", "b"]).await;
        c.remove_interval_result_callback("b").await.unwrap();
        assert_eq!(c.watcher_count(), 1);
        c.post_interval_result("a", "1", true).await.unwrap();
        assert_eq!(recorders[0].seen.lock().len(), 1);
        assert!(recorders[1].seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_removal_completes_interval_the_rest_reported() {
        let (c, recorders) = controller(ControllerPolicy::AllPass, &["a", "b"]).await;
        c.post_interval_result("a", "QOS-2", true).await.unwrap();
        assert!(recorders[0].seen.lock().is_empty());

        c.remove_interval_result_callback("b").await.unwrap();
        assert_eq!(*recorders[0].seen.lock(), vec![("QOS-2".to_string(), true)]);
        assert!(recorders[1].seen.lock().is_empty());

        c.post_interval_result("a", "QOS-3", false).await.unwrap();
        assert_eq!(recorders[0].seen.lock().last(), Some(&("QOS-3".to_string(), false)));
    }

    #[tokio::test]
    async fn test_removed_participant_report_still_counts() {
        let (c, recorders) = controller(ControllerPolicy::AllPass, &["a", "b", "c"]).await;
        c.post_interval_result("b", "1", false).await.unwrap();
        c.remove_interval_result_callback("b").await.unwrap();
        assert!(recorders[0].seen.lock().is_empty());

        post_all(&c, "1", &[("a", true), ("c", true)]).await;
        assert_eq!(*recorders[0].seen.lock(), vec![("1".to_string(), false)]);
        assert_eq!(*recorders[2].seen.lock(), vec![("1".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_removal_applies_policy_switch() {
        let (c, recorders) =
            controller(ControllerPolicy::AnyPassUntilHalfFail, &["a", "b", "c"]).await;
        post_all(&c, "1", &[("a", true), ("b", false)]).await;
        c.remove_interval_result_callback("c").await.unwrap();
        assert_eq!(c.mode(), Mode::And);
        assert_eq!(*recorders[0].seen.lock(), vec![("1".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_channel_watcher() {
        let (watcher, mut rx) = ChannelWatcher::new();
        watcher.interval_result("QOS-1", true).await;
        assert_eq!(
            rx.recv().await,
            Some(IntervalVerdict {
                interval_name: "QOS-1".into(),
                passed: true
            })
        );
    }
}
