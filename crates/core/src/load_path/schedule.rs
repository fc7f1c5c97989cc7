//! Load path schedules
//!
//! A schedule turns a load path configuration into a sequence of uniform
//! [`LoadStep`]s. Steps that end a stats interval name it; for verdict-driven
//! intervals the runner feeds the combined verdict back before asking for the
//! next step.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use crate::error::{DriverError, Result};
use crate::stats::{PrintFlags, StatsRollup};

fn default_ramp_time_step() -> u64 {
    15
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct UniformLoadInterval {
    pub name: String,
    /// Seconds
    pub duration: u64,
    pub users: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct RampLoadInterval {
    pub name: String,
    /// Seconds
    pub duration: u64,
    #[serde(default)]
    pub start_users: Option<u64>,
    pub end_users: u64,
    /// Seconds between user changes
    #[serde(default = "default_ramp_time_step")]
    pub time_step: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LoadInterval {
    Uniform(UniformLoadInterval),
    Ramp(RampLoadInterval),
}

impl LoadInterval {
    pub fn name(&self) -> &str {
        match self {
            LoadInterval::Uniform(u) => &u.name,
            LoadInterval::Ramp(r) => &r.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct IntervalLoadPathConfig {
    pub name: String,
    #[serde(default)]
    pub load_intervals: Vec<LoadInterval>,
    #[serde(flatten)]
    pub print: PrintFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase", default)]
pub struct FixedLoadPathConfig {
    pub name: String,
    pub users: u64,
    pub ramp_up: u64,
    pub warm_up: u64,
    pub num_qos_periods: u64,
    pub qos_period_sec: u64,
    pub ramp_down: u64,
    pub time_step: u64,
    pub run_forever: bool,
    pub exit_on_first_failure: bool,
    #[serde(flatten)]
    pub print: PrintFlags,
}

impl Default for FixedLoadPathConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            users: 0,
            ramp_up: 240,
            warm_up: 300,
            num_qos_periods: 3,
            qos_period_sec: 300,
            ramp_down: 120,
            time_step: 10,
            run_forever: false,
            exit_on_first_failure: false,
            print: PrintFlags::default(),
        }
    }
}

/// Search for the highest passing load; `syncedfindmax` decides every step
/// together with the run's other workloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase", default)]
pub struct FindMaxLoadPathConfig {
    pub name: String,
    /// Upper bound of the search, the workload's maxUsers when unset
    pub max_users: Option<u64>,
    pub min_users: u64,
    /// Ramp straight to this many users instead of probing upward
    pub max_pass_hint: u64,
    pub num_qos_periods: u64,
    pub qos_period_sec: u64,
    /// Search ends once the pass/fail bounds are this close, as a fraction of the failing bound
    pub find_max_stop_pct: f64,
    pub initial_ramp_rate_step: u64,
    #[serde(flatten)]
    pub print: PrintFlags,
}

impl Default for FindMaxLoadPathConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_users: None,
            min_users: 0,
            max_pass_hint: 0,
            num_qos_periods: 3,
            qos_period_sec: 300,
            find_max_stop_pct: 0.01,
            initial_ramp_rate_step: 1000,
            print: PrintFlags::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LoadPathConfig {
    Interval(IntervalLoadPathConfig),
    Fixed(FixedLoadPathConfig),
    FindMax(FindMaxLoadPathConfig),
    SyncedFindMax(FindMaxLoadPathConfig),
}

impl LoadPathConfig {
    pub fn name(&self) -> &str {
        match self {
            LoadPathConfig::Interval(c) => &c.name,
            LoadPathConfig::Fixed(c) => &c.name,
            LoadPathConfig::FindMax(c) | LoadPathConfig::SyncedFindMax(c) => &c.name,
        }
    }

    pub fn print_flags(&self) -> PrintFlags {
        match self {
            LoadPathConfig::Interval(c) => c.print,
            LoadPathConfig::Fixed(c) => c.print,
            LoadPathConfig::FindMax(c) | LoadPathConfig::SyncedFindMax(c) => c.print,
        }
    }

    /// Whether intervals wait for the controller's combined verdict
    pub fn is_verdict_driven(&self) -> bool {
        matches!(self, LoadPathConfig::Fixed(_) | LoadPathConfig::SyncedFindMax(_))
    }

    /// Users requested at any point of the path; a search without its own bound reports zero
    pub fn max_users(&self) -> u64 {
        match self {
            LoadPathConfig::Interval(c) => c
                .load_intervals
                .iter()
                .map(|i| match i {
                    LoadInterval::Uniform(u) => u.users,
                    LoadInterval::Ramp(r) => r.end_users.max(r.start_users.unwrap_or(0)),
                })
                .max()
                .unwrap_or(0),
            LoadPathConfig::Fixed(c) => c.users,
            LoadPathConfig::FindMax(c) | LoadPathConfig::SyncedFindMax(c) => {
                c.max_users.unwrap_or(0)
            }
        }
    }

    /// Validate and build the runtime schedule for a workload allowing `workload_max_users`
    pub fn schedule(&self, workload_max_users: u64) -> Result<Box<dyn LoadSchedule>> {
        if self.name().is_empty() {
            return Err(DriverError::config("load path name must be set"));
        }
        match self {
            LoadPathConfig::Interval(c) => Ok(Box::new(IntervalLoadPath::new(c)?)),
            LoadPathConfig::Fixed(c) => Ok(Box::new(FixedLoadPath::new(c)?)),
            LoadPathConfig::FindMax(c) => {
                Ok(Box::new(FindMaxLoadPath::new(c, workload_max_users, false)?))
            }
            LoadPathConfig::SyncedFindMax(c) => {
                Ok(Box::new(FindMaxLoadPath::new(c, workload_max_users, true)?))
            }
        }
    }
}

/// Stats interval closed at the end of a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsIntervalEnd {
    pub name: String,
    /// The schedule needs the combined verdict before its next step
    pub needs_verdict: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadStep {
    pub users: u64,
    pub duration: Duration,
    pub ends_interval: Option<StatsIntervalEnd>,
}

impl LoadStep {
    fn new(users: u64, secs: u64) -> Self {
        Self {
            users,
            duration: Duration::from_secs(secs),
            ends_interval: None,
        }
    }

    fn ending(mut self, name: impl Into<String>, needs_verdict: bool) -> Self {
        self.ends_interval = Some(StatsIntervalEnd {
            name: name.into(),
            needs_verdict,
        });
        self
    }
}

/// Outcome of a closed stats interval, fed back to the schedule
#[derive(Debug, Clone)]
pub struct IntervalOutcome {
    pub interval_name: String,
    /// Combined verdict when one was awaited, else this workload's own
    pub passed: bool,
    pub rollup: Option<StatsRollup>,
}

/// Result of a load path, reported once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct LoadPathOutcome {
    pub load_path_name: String,
    pub passed: bool,
    pub max_pass_users: u64,
    #[serde(default)]
    pub max_pass_interval_name: Option<String>,
    #[serde(default)]
    pub interval_stats_summaries: Vec<StatsRollup>,
}

/// Runtime state of a load path
pub trait LoadSchedule: Send {
    fn name(&self) -> &str;

    /// Next step, given the outcome of the stats interval the previous step closed
    fn next_step(&mut self, last: Option<IntervalOutcome>) -> Option<LoadStep>;

    /// Set once the path has reached its end; taken at most once
    fn take_outcome(&mut self) -> Option<LoadPathOutcome>;

    /// This workload's own result for an interval it just closed
    fn judge(&self, _interval: &StatsIntervalEnd, rollup: Option<&StatsRollup>) -> bool {
        rollup.is_some_and(|r| r.interval_passed)
    }
}

/// Expand a ramp into uniform `(users, seconds)` steps
pub fn ramp_steps(duration: u64, time_step: u64, start_users: u64, end_users: u64) -> Vec<(u64, u64)> {
    let num_steps = duration.div_ceil(time_step.max(1));
    let delta = start_users.abs_diff(end_users);
    let per_step = if num_steps > 1 {
        delta.div_ceil(num_steps - 1)
    } else {
        delta
    };

    let mut steps = Vec::with_capacity(num_steps as usize);
    let mut elapsed = 0;
    for i in 0..num_steps {
        let users = if end_users >= start_users {
            start_users.saturating_add(i * per_step).min(end_users)
        } else {
            start_users.saturating_sub(i * per_step).max(end_users)
        };
        let mut step = time_step;
        if elapsed + step > duration {
            step = duration - elapsed;
            if step == 0 {
                break;
            }
        }
        steps.push((users, step));
        elapsed += step;
    }
    steps
}

/// First ramp users when none are given: one increment up from zero
fn first_ramp_start(duration: u64, time_step: u64, end_users: u64) -> u64 {
    let num_steps = duration.div_ceil(time_step.max(1));
    if num_steps > 1 {
        end_users.div_ceil(num_steps - 1)
    } else {
        end_users
    }
}

/// Named list of uniform and ramp intervals, played once
pub struct IntervalLoadPath {
    name: String,
    steps: VecDeque<LoadStep>,
    max_pass_users: u64,
    max_pass_interval_name: Option<String>,
    rollups: Vec<StatsRollup>,
    outcome: Option<LoadPathOutcome>,
    finished: bool,
}

impl IntervalLoadPath {
    pub fn new(config: &IntervalLoadPathConfig) -> Result<Self> {
        let mut steps = VecDeque::new();
        let mut previous_end = 0;

        for (index, interval) in config.load_intervals.iter().enumerate() {
            match interval {
                LoadInterval::Uniform(u) => {
                    steps.push_back(LoadStep::new(u.users, u.duration).ending(&u.name, false));
                    previous_end = u.users;
                }
                LoadInterval::Ramp(r) => {
                    if r.time_step == 0 {
                        return Err(DriverError::config(format!(
                            "ramp interval {} in load path {} has a zero timeStep",
                            r.name, config.name
                        )));
                    }
                    let start = match r.start_users {
                        Some(s) => s,
                        None if index == 0 => first_ramp_start(r.duration, r.time_step, r.end_users),
                        None => previous_end,
                    };
                    let sub_steps = ramp_steps(r.duration, r.time_step, start, r.end_users);
                    let last = sub_steps.len().saturating_sub(1);
                    for (i, (users, secs)) in sub_steps.into_iter().enumerate() {
                        let step = LoadStep::new(users, secs);
                        steps.push_back(if i == last {
                            step.ending(&r.name, false)
                        } else {
                            step
                        });
                    }
                    previous_end = r.end_users;
                }
            }
        }

        debug!(load_path = %config.name, steps = steps.len(), "interval load path expanded");
        Ok(Self {
            name: config.name.clone(),
            steps,
            max_pass_users: 0,
            max_pass_interval_name: None,
            rollups: Vec::new(),
            outcome: None,
            finished: false,
        })
    }

    fn record(&mut self, last: IntervalOutcome) {
        let Some(rollup) = last.rollup else {
            return;
        };
        let steady = rollup.start_active_users == rollup.end_active_users;
        let users = rollup.end_active_users.max(0) as u64;
        if steady && last.passed && users > self.max_pass_users {
            self.max_pass_users = users;
            self.max_pass_interval_name = Some(last.interval_name);
        }
        self.rollups.push(rollup);
    }
}

impl LoadSchedule for IntervalLoadPath {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_step(&mut self, last: Option<IntervalOutcome>) -> Option<LoadStep> {
        if let Some(last) = last {
            self.record(last);
        }
        let next = self.steps.pop_front();
        if next.is_none() && !self.finished {
            self.finished = true;
            self.outcome = Some(LoadPathOutcome {
                load_path_name: self.name.clone(),
                passed: self.max_pass_users > 0,
                max_pass_users: self.max_pass_users,
                max_pass_interval_name: self.max_pass_interval_name.clone(),
                interval_stats_summaries: std::mem::take(&mut self.rollups),
            });
        }
        next
    }

    fn take_outcome(&mut self) -> Option<LoadPathOutcome> {
        self.outcome.take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    RampUp,
    WarmUp,
    Qos,
    RampDown,
    PostRun,
}

/// Ramp to a fixed load, warm up, then judge a number of QoS periods
pub struct FixedLoadPath {
    config: FixedLoadPathConfig,
    phase: Phase,
    ramp_up: VecDeque<LoadStep>,
    phase_interval: u64,
    passed_qos: bool,
    first_fail_interval: Option<String>,
    rollups: Vec<StatsRollup>,
    outcome: Option<LoadPathOutcome>,
}

impl FixedLoadPath {
    pub fn new(config: &FixedLoadPathConfig) -> Result<Self> {
        if config.time_step == 0 {
            return Err(DriverError::config(format!(
                "fixed load path {} has a zero timeStep",
                config.name
            )));
        }
        let start = first_ramp_start(config.ramp_up, config.time_step, config.users);
        let mut ramp_up: VecDeque<LoadStep> =
            ramp_steps(config.ramp_up, config.time_step, start, config.users)
                .into_iter()
                .map(|(users, secs)| LoadStep::new(users, secs))
                .collect();
        if let Some(last) = ramp_up.pop_back() {
            ramp_up.push_back(last.ending("RampUp", false));
        }

        Ok(Self {
            config: config.clone(),
            phase: Phase::RampUp,
            ramp_up,
            phase_interval: 0,
            passed_qos: true,
            first_fail_interval: None,
            rollups: Vec::new(),
            outcome: None,
        })
    }

    fn enter(&mut self, phase: Phase) {
        debug!(load_path = %self.config.name, phase = ?phase, "fixed load path phase");
        self.phase = phase;
        self.phase_interval = 0;
    }

    fn judge_qos(&mut self, last: IntervalOutcome) {
        if let Some(rollup) = last.rollup {
            self.rollups.push(rollup);
        }
        if !last.passed {
            self.passed_qos = false;
            if self.first_fail_interval.is_none() {
                self.first_fail_interval = Some(last.interval_name);
            }
            if self.config.exit_on_first_failure {
                self.enter(Phase::RampDown);
            }
        }
    }
}

impl LoadSchedule for FixedLoadPath {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn next_step(&mut self, last: Option<IntervalOutcome>) -> Option<LoadStep> {
        let users = self.config.users;

        if let Some(last) = last {
            if self.phase == Phase::Qos {
                self.judge_qos(last);
            }
        }

        loop {
            match self.phase {
                Phase::RampUp => match self.ramp_up.pop_front() {
                    Some(step) => return Some(step),
                    None => self.enter(Phase::WarmUp),
                },
                Phase::WarmUp => {
                    if self.phase_interval == 0 && self.config.warm_up > 0 {
                        self.phase_interval += 1;
                        return Some(LoadStep::new(users, self.config.warm_up).ending("WarmUp", false));
                    }
                    self.enter(Phase::Qos);
                }
                Phase::Qos => {
                    let done = self.phase_interval >= self.config.num_qos_periods;
                    if (done && !self.config.run_forever) || self.config.qos_period_sec == 0 {
                        self.enter(Phase::RampDown);
                        continue;
                    }
                    self.phase_interval += 1;
                    let name = format!("QOS-{}", self.phase_interval);
                    return Some(LoadStep::new(users, self.config.qos_period_sec).ending(name, true));
                }
                Phase::RampDown => {
                    self.enter(Phase::PostRun);
                    if self.config.ramp_down > 0 {
                        return Some(
                            LoadStep::new(users, self.config.ramp_down).ending("RampDown", false),
                        );
                    }
                }
                Phase::PostRun => {
                    if self.phase_interval == 0 {
                        self.outcome = Some(LoadPathOutcome {
                            load_path_name: self.config.name.clone(),
                            passed: self.passed_qos,
                            max_pass_users: users,
                            max_pass_interval_name: if self.passed_qos {
                                Some("QOS-1".to_string())
                            } else {
                                self.first_fail_interval.clone()
                            },
                            interval_stats_summaries: std::mem::take(&mut self.rollups),
                        });
                    }
                    if self.config.qos_period_sec == 0 {
                        return None;
                    }
                    self.phase_interval += 1;
                    return Some(LoadStep::new(users, self.config.qos_period_sec));
                }
            }
        }
    }

    fn take_outcome(&mut self) -> Option<LoadPathOutcome> {
        self.outcome.take()
    }
}

const INITIAL_RAMP_INTERVAL_SEC: u64 = 60;
const SEARCH_RAMP_SEC: u64 = 120;
const SEARCH_RAMP_TIME_STEP: u64 = 15;
const SEARCH_WARMUP_SEC: u64 = 180;
/// Initial ramp intervals judge response times only
const INITIAL_RAMP_PCT_PASSING: f64 = 0.999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchPhase {
    /// Short intervals, raising users until response times fail
    InitialRamp,
    /// Medium intervals bracketing the maximum
    FindFirstMax,
    /// Repeated long intervals confirming the final level
    VerifyMax,
}

impl SearchPhase {
    fn label(self) -> &'static str {
        match self {
            SearchPhase::InitialRamp => "INITIALRAMP",
            SearchPhase::FindFirstMax => "FINDFIRSTMAX",
            SearchPhase::VerifyMax => "VERIFYMAX",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubInterval {
    Ramp,
    WarmUp,
    Steady,
    Decision,
}

/// Round to a number with few significant digits, strictly between the
/// limits. A zero limit is ignored; the number comes back unchanged when no
/// rounding fits.
pub fn nice_round(number: u64, lower: u64, upper: u64) -> u64 {
    let within = |n: u64| (lower == 0 || n > lower) && (upper == 0 || n < upper);

    let mut scaled = number;
    let mut tens = 1;
    while scaled > 1000 && tens < 100 {
        scaled /= 10;
        tens *= 10;
    }
    let rounder = if scaled >= 250 {
        10
    } else if tens > 1 && scaled >= 200 {
        5
    } else if tens == 1 && scaled >= 100 {
        4
    } else if scaled >= 50 {
        2
    } else {
        1
    };
    let down = scaled / rounder * rounder * tens;
    let up = down + rounder * tens;

    if number - down < up - number {
        if within(down) {
            return down;
        }
    } else {
        if within(up) {
            return up;
        }
        if within(down) {
            return down;
        }
    }

    let start = if lower == 0 { down } else { lower };
    let end = if upper == 0 { up } else { upper };
    let delta = end.saturating_sub(start);
    let mut adder = rounder * tens / 2;
    if adder == delta && adder > 1 {
        adder /= 2;
    }
    while delta < adder && adder > 1 {
        adder /= 2;
    }
    let middle = start + adder;
    if within(middle) {
        middle
    } else {
        number
    }
}

/// Narrows in on the highest user count whose intervals pass
pub struct FindMaxLoadPath {
    config: FindMaxLoadPathConfig,
    synced: bool,
    max_users: u64,
    phase: SearchPhase,
    next: SubInterval,
    cur_users: u64,
    ramp: VecDeque<LoadStep>,
    initial_intervals: u64,
    rate_step: u64,
    min_fail_users: u64,
    max_pass_users: u64,
    max_pass_interval_name: Option<String>,
    phase_repeats: u64,
    repeats_passed: u64,
    successive_passed: u32,
    successive_failed: u32,
    rollups: Vec<StatsRollup>,
    complete: bool,
    outcome: Option<LoadPathOutcome>,
}

impl FindMaxLoadPath {
    pub fn new(config: &FindMaxLoadPathConfig, workload_max_users: u64, synced: bool) -> Result<Self> {
        let max_users = config.max_users.unwrap_or(workload_max_users);
        let invalid = |what: &str| {
            DriverError::config(format!("findmax load path {} {}", config.name, what))
        };
        if max_users == 0 {
            return Err(invalid("has no maxUsers"));
        }
        if config.min_users >= max_users {
            return Err(invalid("has minUsers at or above maxUsers"));
        }
        if config.qos_period_sec == 0 {
            return Err(invalid("has a zero qosPeriodSec"));
        }
        if config.initial_ramp_rate_step == 0 {
            return Err(invalid("has a zero initialRampRateStep"));
        }
        if !(config.find_max_stop_pct > 0.0 && config.find_max_stop_pct < 1.0) {
            return Err(invalid("needs findMaxStopPct between 0 and 1"));
        }

        Ok(Self {
            config: config.clone(),
            synced,
            max_users,
            phase: SearchPhase::InitialRamp,
            next: SubInterval::Decision,
            cur_users: 0,
            ramp: VecDeque::new(),
            initial_intervals: 0,
            rate_step: 0,
            min_fail_users: u64::MAX,
            max_pass_users: 0,
            max_pass_interval_name: None,
            phase_repeats: 1,
            repeats_passed: 0,
            successive_passed: 0,
            successive_failed: 0,
            rollups: Vec::new(),
            complete: false,
            outcome: None,
        })
    }

    fn ramp_rate_step(&self) -> u64 {
        self.config.initial_ramp_rate_step.min(self.max_users)
    }

    /// The initial ramp cannot go any higher
    fn ramp_exhausted(&self) -> bool {
        let hint = self.config.max_pass_hint;
        (hint > 0 && self.cur_users == hint) || self.cur_users + self.ramp_rate_step() > self.max_users
    }

    fn bounds_converged(&self) -> bool {
        let gap = self.min_fail_users.saturating_sub(self.max_pass_users);
        (gap as f64) < self.min_fail_users as f64 * self.config.find_max_stop_pct
    }

    fn initial_ramp_step(&mut self, last: Option<IntervalOutcome>) -> Option<LoadStep> {
        let mut passed = true;
        if let Some(last) = last {
            passed = last.passed;
            if let Some(rollup) = last.rollup {
                self.rollups.push(rollup);
            }
        }
        if !passed || self.ramp_exhausted() {
            self.next_phase();
            return self.search_step(None);
        }

        self.cur_users += self.ramp_rate_step();
        let hint = self.config.max_pass_hint;
        if hint > 0 && self.cur_users > hint {
            self.cur_users = hint;
        }
        self.initial_intervals += 1;
        let mut secs = INITIAL_RAMP_INTERVAL_SEC;
        if self.cur_users < 1000 {
            secs *= 2;
        }
        Some(
            LoadStep::new(self.cur_users, secs)
                .ending(format!("InitialRamp-{}", self.cur_users), self.synced),
        )
    }

    fn search_step(&mut self, mut last: Option<IntervalOutcome>) -> Option<LoadStep> {
        loop {
            if self.complete {
                return Some(LoadStep::new(self.max_pass_users, self.config.qos_period_sec));
            }
            if let Some(step) = self.ramp.pop_front() {
                return Some(step);
            }
            let users = self.cur_users;
            match self.next {
                SubInterval::Ramp => self.next = SubInterval::WarmUp,
                SubInterval::WarmUp => {
                    self.next = SubInterval::Steady;
                    let name = format!("{}-Warmup-{}", self.phase.label(), users);
                    return Some(LoadStep::new(users, SEARCH_WARMUP_SEC).ending(name, false));
                }
                SubInterval::Steady => {
                    self.next = SubInterval::Decision;
                    let name = match self.phase {
                        SearchPhase::VerifyMax => format!(
                            "{}-{}-ITERATION-{}",
                            self.phase.label(),
                            users,
                            self.repeats_passed
                        ),
                        _ => format!("{}-{}", self.phase.label(), users),
                    };
                    return Some(
                        LoadStep::new(users, self.config.qos_period_sec).ending(name, self.synced),
                    );
                }
                SubInterval::Decision => match last.take() {
                    Some(outcome) => self.decide(outcome),
                    None => {
                        // No result to decide on, count it as failed
                        self.decide(IntervalOutcome {
                            interval_name: String::new(),
                            passed: false,
                            rollup: None,
                        })
                    }
                },
            }
        }
    }

    fn decide(&mut self, last: IntervalOutcome) {
        if let Some(rollup) = last.rollup {
            self.rollups.push(rollup);
        }
        debug!(
            load_path = %self.config.name,
            phase = self.phase.label(),
            users = self.cur_users,
            passed = last.passed,
            "findmax decision"
        );
        if last.passed {
            self.passed(last.interval_name);
        } else {
            self.failed();
        }
    }

    fn passed(&mut self, interval_name: String) {
        self.repeats_passed += 1;
        if self.repeats_passed < self.phase_repeats {
            self.next = SubInterval::Steady;
            return;
        }
        self.repeats_passed = 0;
        if self.cur_users > self.max_pass_users {
            self.max_pass_users = self.cur_users;
            self.max_pass_interval_name = Some(interval_name);
        }
        if self.cur_users >= self.max_users {
            self.finish(true);
            return;
        }
        if self.bounds_converged() {
            self.next_phase();
            return;
        }

        let mut step = self.rate_step;
        self.successive_failed = 0;
        self.successive_passed += 1;
        if self.successive_passed >= 3 {
            self.successive_passed = 0;
            step = (step as f64 * 1.25) as u64;
        }
        if self.cur_users + step >= self.min_fail_users {
            step = (self.min_fail_users.saturating_sub(self.max_pass_users) as f64 * 0.5).ceil() as u64;
        }
        let prev = self.cur_users;
        self.rate_step = step;
        self.cur_users = nice_round(prev + step, self.max_pass_users, self.min_fail_users);
        self.ramp_from(prev);
    }

    fn failed(&mut self) {
        self.repeats_passed = 0;
        let min_users = self.config.min_users;
        if self.cur_users < self.min_fail_users {
            self.min_fail_users = self.cur_users;
            if self.min_fail_users <= min_users {
                self.give_up();
                return;
            }
            if self.bounds_converged() {
                if self.max_pass_users < min_users {
                    self.give_up();
                } else {
                    self.next_phase();
                }
                return;
            }
        }

        let mut step = self.rate_step;
        self.successive_passed = 0;
        self.successive_failed += 1;
        if self.successive_failed >= 2 {
            self.successive_failed = 0;
            step = (step as f64 * 1.5) as u64;
        }
        if self.cur_users.saturating_sub(step) <= self.max_pass_users {
            step = (self.min_fail_users.saturating_sub(self.max_pass_users) as f64 * 0.75).ceil() as u64;
        }
        let prev = self.cur_users;
        self.rate_step = step;
        self.cur_users = if prev.saturating_sub(step) <= min_users {
            min_users
        } else {
            nice_round(prev - step, self.max_pass_users, self.min_fail_users)
        };
        self.ramp_from(prev);
    }

    /// Never passed above the floor
    fn give_up(&mut self) {
        self.max_pass_users = self.config.min_users;
        self.max_pass_interval_name = None;
        self.finish(false);
    }

    fn ramp_from(&mut self, prev: u64) {
        self.next = SubInterval::Ramp;
        if prev != self.cur_users {
            self.ramp.extend(
                ramp_steps(SEARCH_RAMP_SEC, SEARCH_RAMP_TIME_STEP, prev, self.cur_users)
                    .into_iter()
                    .map(|(users, secs)| LoadStep::new(users, secs)),
            );
        }
    }

    fn next_phase(&mut self) {
        match self.phase {
            SearchPhase::InitialRamp => self.enter_find_first_max(),
            SearchPhase::FindFirstMax => self.enter_verify_max(),
            SearchPhase::VerifyMax => {
                let passed = self.max_pass_users > self.config.min_users;
                self.finish(passed);
            }
        }
    }

    fn enter_find_first_max(&mut self) {
        let prev = self.cur_users;
        if self.config.max_pass_hint == 0 {
            self.rate_step = prev / 10;
            self.cur_users = prev - self.rate_step;
        } else {
            self.rate_step = prev / 100;
        }
        self.cur_users = nice_round(self.cur_users.max(1), 0, prev);

        self.enter(SearchPhase::FindFirstMax, 1);
        self.min_fail_users = self.max_users;
        self.max_pass_users = 0;
        self.ramp_from(prev);
    }

    fn enter_verify_max(&mut self) {
        let prev = self.cur_users;
        self.rate_step = (self.max_pass_users as f64 * self.config.find_max_stop_pct).ceil() as u64;
        self.cur_users = self.max_pass_users;
        self.min_fail_users = self.max_pass_users + 1;

        self.enter(SearchPhase::VerifyMax, self.config.num_qos_periods.saturating_sub(1));
        if self.phase_repeats == 0 {
            self.finish(true);
            return;
        }
        self.max_pass_users = 0;
        self.max_pass_interval_name = None;
        if prev != self.cur_users {
            self.ramp_from(prev);
        } else {
            self.next = SubInterval::Steady;
        }
    }

    fn enter(&mut self, phase: SearchPhase, repeats: u64) {
        debug!(load_path = %self.config.name, phase = phase.label(), users = self.cur_users, "findmax phase");
        self.phase = phase;
        self.phase_repeats = repeats;
        self.repeats_passed = 0;
        self.successive_passed = 0;
        self.successive_failed = 0;
    }

    fn finish(&mut self, passed: bool) {
        self.complete = true;
        self.ramp.clear();
        self.outcome = Some(LoadPathOutcome {
            load_path_name: self.config.name.clone(),
            passed,
            max_pass_users: self.max_pass_users,
            max_pass_interval_name: self.max_pass_interval_name.clone(),
            interval_stats_summaries: std::mem::take(&mut self.rollups),
        });
    }
}

impl LoadSchedule for FindMaxLoadPath {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn next_step(&mut self, last: Option<IntervalOutcome>) -> Option<LoadStep> {
        if self.phase == SearchPhase::InitialRamp && !self.complete {
            self.initial_ramp_step(last)
        } else {
            self.search_step(last)
        }
    }

    fn take_outcome(&mut self) -> Option<LoadPathOutcome> {
        self.outcome.take()
    }

    fn judge(&self, _interval: &StatsIntervalEnd, rollup: Option<&StatsRollup>) -> bool {
        if self.phase != SearchPhase::InitialRamp {
            return rollup.is_some_and(|r| r.interval_passed);
        }
        if self.ramp_exhausted() {
            return false;
        }
        // The first interval passes regardless, users are still logging in
        if self.config.max_pass_hint > 0 || self.initial_intervals <= 1 {
            return true;
        }
        rollup.map_or(true, |r| r.pct_passing >= INITIAL_RAMP_PCT_PASSING)
    }
}
