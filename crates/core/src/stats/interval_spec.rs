//! Stats interval specs
//!
//! A spec names a sequence of intervals. `fixed` and `periodic` specs run their
//! own timer task on the run host; `loadpath` specs are closed by the load path
//! runner whenever its schedule ends a stats interval. Either way a closed
//! interval becomes one [`StatsIntervalCompleteMessage`] delivered to every
//! driver node through an [`IntervalListener`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use super::summary::PrintFlags;
use crate::messages::StatsIntervalCompleteMessage;

/// One named, durationed interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub name: String,
    pub duration: Duration,
}

impl Interval {
    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct FixedInterval {
    pub name: String,
    /// Seconds
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IntervalSpecKind {
    Fixed { intervals: Vec<FixedInterval> },
    /// `period` is in seconds
    Periodic { period: u64 },
    LoadPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StatsIntervalSpecConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: IntervalSpecKind,
    #[serde(flatten)]
    pub print: PrintFlags,
}

impl StatsIntervalSpecConfig {
    pub fn is_load_path(&self) -> bool {
        matches!(self.kind, IntervalSpecKind::LoadPath)
    }

    pub fn sequence(&self) -> IntervalSequence {
        IntervalSequence {
            kind: self.kind.clone(),
            produced: 0,
        }
    }
}

/// Lazily produces a spec's intervals, one per call
#[derive(Debug, Clone)]
pub struct IntervalSequence {
    kind: IntervalSpecKind,
    produced: usize,
}

impl IntervalSequence {
    /// Next interval, or `None` when the spec is exhausted or externally driven
    pub fn next_interval(&mut self) -> Option<Interval> {
        let interval = match &self.kind {
            IntervalSpecKind::Fixed { intervals } => intervals
                .get(self.produced)
                .map(|i| Interval::new(i.name.clone(), Duration::from_secs(i.duration))),
            IntervalSpecKind::Periodic { period } => Some(Interval::new(
                (self.produced + 1).to_string(),
                Duration::from_secs(*period),
            )),
            IntervalSpecKind::LoadPath => None,
        };
        if interval.is_some() {
            self.produced += 1;
        }
        interval
    }
}

/// Receives closed intervals
#[async_trait]
pub trait IntervalListener: Send + Sync {
    async fn interval_complete(&self, msg: StatsIntervalCompleteMessage);
}

#[derive(Debug, Clone, Copy)]
struct WindowStart {
    start_time: i64,
    start_users: i64,
}

/// Tracks when each spec's current interval opened and how many users were active
#[derive(Debug, Default)]
pub struct IntervalClock {
    active_users: AtomicU64,
    windows: Mutex<HashMap<String, WindowStart>>,
}

impl IntervalClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active_users(&self, users: u64) {
        self.active_users.store(users, Ordering::Relaxed);
    }

    pub fn active_users(&self) -> u64 {
        self.active_users.load(Ordering::Relaxed)
    }

    /// Open the first interval of every spec at `now_ms`
    pub fn start<'a>(&self, specs: impl IntoIterator<Item = &'a str>, now_ms: i64) {
        let users = self.active_users() as i64;
        let mut windows = self.windows.lock();
        for spec in specs {
            windows.insert(
                spec.to_string(),
                WindowStart {
                    start_time: now_ms,
                    start_users: users,
                },
            );
        }
    }

    /// Close the current interval of `spec` at `now_ms` and open the next one
    pub fn close(&self, spec: &str, interval_name: &str, now_ms: i64) -> StatsIntervalCompleteMessage {
        let users = self.active_users() as i64;
        let mut windows = self.windows.lock();
        let window = windows.entry(spec.to_string()).or_insert(WindowStart {
            start_time: now_ms,
            start_users: users,
        });

        let msg = StatsIntervalCompleteMessage {
            completed_spec_name: spec.to_string(),
            cur_interval_name: interval_name.to_string(),
            cur_interval_start_time: window.start_time,
            last_interval_end_time: now_ms,
            interval_start_users: window.start_users,
            interval_end_users: users,
        };
        *window = WindowStart {
            start_time: now_ms,
            start_users: users,
        };
        msg
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Spawn the timer task for a self-scheduling spec. `loadpath` specs get none.
pub fn spawn_interval_spec(
    config: StatsIntervalSpecConfig,
    clock: Arc<IntervalClock>,
    listener: Arc<dyn IntervalListener>,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if config.is_load_path() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut sequence = config.sequence();
        let mut current = sequence.next_interval();

        while let Some(interval) = current.take() {
            if interval.duration.is_zero() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval.duration) => {}
                _ = shutdown.changed() => {
                    debug!(spec = %config.name, "stats interval spec stopped");
                    return;
                }
            }
            if *shutdown.borrow() {
                return;
            }

            let msg = clock.close(&config.name, &interval.name, now_millis());
            listener.interval_complete(msg).await;
            current = sequence.next_interval();
        }

        info!(spec = %config.name, "stats interval spec exhausted");
    }))
}
