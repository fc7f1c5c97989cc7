//! Operation samples and per-operation counters
//!
//! [`OperationStats`] is the immutable record of one completed simulated
//! operation. [`OperationStatsSummary`] folds many of them into counters that
//! can be merged across windows, hosts and targets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// One completed simulated operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    pub operation_name: String,
    pub target_name: String,
    pub host_name: String,
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_string: Option<String>,
    /// Epoch millis
    pub start_time: i64,
    /// Epoch millis
    pub end_time: i64,
    /// Think time chosen for the operation, in millis
    #[serde(default)]
    pub cycle_time: i64,
    #[serde(default)]
    pub total_steps: u64,
}

impl OperationStats {
    pub fn new(
        operation_name: impl Into<String>,
        target_name: impl Into<String>,
        start_time: i64,
        end_time: i64,
    ) -> Self {
        Self {
            operation_name: operation_name.into(),
            target_name: target_name.into(),
            host_name: String::new(),
            failed: false,
            failure_string: None,
            start_time,
            end_time,
            cycle_time: 0,
            total_steps: 1,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host_name = host.into();
        self
    }

    pub fn with_failure(mut self, reason: impl Into<String>) -> Self {
        self.failed = true;
        self.failure_string = Some(reason.into());
        self
    }

    pub fn with_cycle_time(mut self, cycle_time_ms: i64) -> Self {
        self.cycle_time = cycle_time_ms;
        self
    }

    pub fn with_steps(mut self, steps: u64) -> Self {
        self.total_steps = steps;
        self
    }

    pub fn passed(&self) -> bool {
        !self.failed
    }

    /// Latency in millis
    pub fn response_time(&self) -> i64 {
        self.end_time - self.start_time
    }

    /// Whether both timestamps were recorded
    pub fn has_valid_times(&self) -> bool {
        self.start_time > 0 && self.end_time > 0
    }
}

/// Quality bar an operation must meet for an interval to pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct QualityBar {
    /// Seconds
    #[serde(default)]
    pub response_time_limit: f64,
    /// Percent of operations that must meet the limit
    #[serde(default)]
    pub response_time_limit_percentile: f64,
    #[serde(default)]
    pub use_response_time: bool,
    /// Percent of all operations this one should account for
    #[serde(default)]
    pub required_mix_pct: f64,
    /// Relative tolerance around `required_mix_pct`
    #[serde(default)]
    pub mix_pct_tolerance: f64,
}

/// Counters for one operation within one window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct OperationStatsSummary {
    pub operation_name: String,
    pub total_num_ops: u64,
    pub total_num_rt_ops: u64,
    #[serde(rename = "totalNumFailedRT")]
    pub total_num_failed_rt: u64,
    pub total_num_failed: u64,
    #[serde(default)]
    pub failure_string_counts: BTreeMap<String, u64>,
    pub total_response_time: i64,
    pub total_failed_response_time: i64,
    pub total_passed_response_time: i64,
    #[serde(default)]
    pub min_response_time: Option<i64>,
    #[serde(default)]
    pub max_response_time: Option<i64>,
    pub total_cycle_time: i64,
    pub total_steps: u64,
    #[serde(flatten)]
    pub quality: QualityBar,
}

impl OperationStatsSummary {
    pub fn new(operation_name: impl Into<String>, quality: QualityBar) -> Self {
        Self {
            operation_name: operation_name.into(),
            quality,
            ..Default::default()
        }
    }

    /// Fold one sample in. Samples without valid timestamps are ignored.
    pub fn add_stats(&mut self, stats: &OperationStats) {
        if !stats.has_valid_times() {
            tracing::debug!(
                operation = %stats.operation_name,
                start = stats.start_time,
                end = stats.end_time,
                "ignoring sample with unset timestamps"
            );
            return;
        }

        self.total_num_ops += 1;
        let response_time = stats.response_time();

        if self.quality.use_response_time {
            self.total_response_time += response_time;
            self.total_num_rt_ops += 1;
            if (response_time as f64 / 1000.0) > self.quality.response_time_limit {
                self.total_num_failed_rt += 1;
                self.total_failed_response_time += response_time;
            } else {
                self.total_passed_response_time += response_time;
            }
        }

        self.total_cycle_time += stats.cycle_time;

        if stats.failed {
            self.total_num_failed += 1;
            let reason = stats.failure_string.clone().unwrap_or_default();
            *self.failure_string_counts.entry(reason).or_insert(0) += 1;
        }

        self.min_response_time = Some(
            self.min_response_time
                .map_or(response_time, |m| m.min(response_time)),
        );
        self.max_response_time = Some(
            self.max_response_time
                .map_or(response_time, |m| m.max(response_time)),
        );
        self.total_steps += stats.total_steps;
    }

    /// Add another summary's counters into this one
    pub fn merge(&mut self, other: &OperationStatsSummary) {
        if self.operation_name.is_empty() {
            self.operation_name = other.operation_name.clone();
        }
        if self.quality == QualityBar::default() {
            self.quality = other.quality.clone();
        }

        self.total_num_ops += other.total_num_ops;
        self.total_num_rt_ops += other.total_num_rt_ops;
        self.total_num_failed_rt += other.total_num_failed_rt;
        self.total_num_failed += other.total_num_failed;
        for (reason, count) in &other.failure_string_counts {
            *self.failure_string_counts.entry(reason.clone()).or_insert(0) += count;
        }
        self.total_response_time += other.total_response_time;
        self.total_failed_response_time += other.total_failed_response_time;
        self.total_passed_response_time += other.total_passed_response_time;
        self.min_response_time = merge_extreme(self.min_response_time, other.min_response_time, i64::min);
        self.max_response_time = merge_extreme(self.max_response_time, other.max_response_time, i64::max);
        self.total_cycle_time += other.total_cycle_time;
        self.total_steps += other.total_steps;
    }

    /// Zero all counters, keeping the name and quality bar
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.operation_name), self.quality.clone());
    }

    /// Whether enough operations met the response-time limit
    pub fn passed_rt(&self) -> bool {
        if !self.quality.use_response_time || self.total_num_ops == 0 {
            return true;
        }
        let passing = (self.total_num_ops - self.total_num_failed_rt) as f64 / self.total_num_ops as f64;
        passing * 100.0 >= self.quality.response_time_limit_percentile
    }

    /// Whether this operation's share of `overall_num_ops` is within tolerance
    pub fn passed_mix_pct(&self, overall_num_ops: u64) -> bool {
        if overall_num_ops == 0 {
            return true;
        }
        let pct = self.total_num_ops as f64 / overall_num_ops as f64;
        let required = self.quality.required_mix_pct / 100.0;
        let min_limit = required - required * self.quality.mix_pct_tolerance;
        let max_limit = required + required * self.quality.mix_pct_tolerance;
        let passed = pct >= min_limit && pct <= max_limit;
        if !passed {
            tracing::info!(
                operation = %self.operation_name,
                required_mix_pct = self.quality.required_mix_pct,
                tolerance = self.quality.mix_pct_tolerance,
                pct,
                "operation failed mix percentage"
            );
        }
        passed
    }
}

fn merge_extreme(a: Option<i64>, b: Option<i64>, pick: fn(i64, i64) -> i64) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(pick(x, y)),
        (x, None) => x,
        (None, y) => y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt_quality() -> QualityBar {
        QualityBar {
            response_time_limit: 1.0,
            response_time_limit_percentile: 90.0,
            use_response_time: true,
            required_mix_pct: 50.0,
            mix_pct_tolerance: 0.1,
        }
    }

    #[test]
    fn test_add_stats_counts_rt_failures() {
        let mut summary = OperationStatsSummary::new("Login", rt_quality());
        summary.add_stats(&OperationStats::new("Login", "t1", 1_000, 1_500));
        summary.add_stats(&OperationStats::new("Login", "t1", 2_000, 3_500));

        assert_eq!(summary.total_num_ops, 2);
        assert_eq!(summary.total_num_rt_ops, 2);
        assert_eq!(summary.total_num_failed_rt, 1);
        assert_eq!(summary.total_failed_response_time, 1_500);
        assert_eq!(summary.total_passed_response_time, 500);
        assert_eq!(summary.min_response_time, Some(500));
        assert_eq!(summary.max_response_time, Some(1_500));
    }

    #[test]
    fn test_add_stats_ignores_unset_times() {
        let mut summary = OperationStatsSummary::new("Login", rt_quality());
        summary.add_stats(&OperationStats::new("Login", "t1", 0, 1_500));
        assert_eq!(summary.total_num_ops, 0);
        assert_eq!(summary.min_response_time, None);
    }

    #[test]
    fn test_failure_strings_counted() {
        let mut summary = OperationStatsSummary::new("Bid", QualityBar::default());
        for _ in 0..3 {
            summary.add_stats(&OperationStats::new("Bid", "t1", 10, 20).with_failure("timeout"));
        }
        assert_eq!(summary.total_num_failed, 3);
        assert_eq!(summary.failure_string_counts.get("timeout"), Some(&3));
    }

    #[test]
    fn test_merge_and_reset() {
        let mut a = OperationStatsSummary::new("Login", rt_quality());
        a.add_stats(&OperationStats::new("Login", "t1", 1_000, 1_200));
        let mut b = OperationStatsSummary::new("Login", rt_quality());
        b.add_stats(&OperationStats::new("Login", "t1", 1_000, 3_000));

        a.merge(&b);
        assert_eq!(a.total_num_ops, 2);
        assert_eq!(a.min_response_time, Some(200));
        assert_eq!(a.max_response_time, Some(2_000));

        a.reset();
        assert_eq!(a.total_num_ops, 0);
        assert_eq!(a.operation_name, "Login");
        assert_eq!(a.quality, rt_quality());
    }

    #[test]
    fn test_passed_rt_percentile() {
        let mut summary = OperationStatsSummary::new("Login", rt_quality());
        for _ in 0..9 {
            summary.add_stats(&OperationStats::new("Login", "t1", 1_000, 1_100));
        }
        summary.add_stats(&OperationStats::new("Login", "t1", 1_000, 5_000));
        assert!(summary.passed_rt());

        summary.add_stats(&OperationStats::new("Login", "t1", 1_000, 5_000));
        assert!(!summary.passed_rt());
    }

    #[test]
    fn test_passed_mix_pct() {
        let mut summary = OperationStatsSummary::new("Login", rt_quality());
        for _ in 0..50 {
            summary.add_stats(&OperationStats::new("Login", "t1", 1, 2));
        }
        assert!(summary.passed_mix_pct(100));
        assert!(summary.passed_mix_pct(105));
        assert!(!summary.passed_mix_pct(200));
    }
}
