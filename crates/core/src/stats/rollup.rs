// Derived metrics for a completed interval

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use super::summary::StatsSummary;

/// Pass/fail and share of one operation inside a rollup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct OperationRollup {
    pub total_num_ops: u64,
    pub mix_pct: f64,
    pub passed_rt: bool,
    pub passed_mix_pct: bool,
    /// Mean latency in seconds, 0 when nothing was timed
    pub average_response_time: f64,
}

/// Throughput and verdict for one (workload, spec, interval)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StatsRollup {
    pub workload_name: String,
    pub stats_interval_spec_name: String,
    pub interval_name: String,
    pub interval_start_time: i64,
    pub interval_end_time: i64,
    pub start_active_users: i64,
    pub end_active_users: i64,
    pub interval_duration_sec: f64,
    pub total_num_ops: u64,
    pub total_num_failed: u64,
    #[serde(rename = "totalNumFailedRT")]
    pub total_num_failed_rt: u64,
    /// Ops per second
    pub throughput: f64,
    /// Ops per second excluding failures and RT failures
    pub effective_throughput: f64,
    /// Seconds
    pub avg_rt: f64,
    /// Seconds
    pub avg_cycle_time: f64,
    pub pct_passing: f64,
    pub interval_passed: bool,
    pub operations: BTreeMap<String, OperationRollup>,
}

impl StatsRollup {
    pub fn from_summary(summary: &StatsSummary) -> Self {
        let duration_sec = (summary.interval_end_time - summary.interval_start_time) as f64 / 1000.0;

        let mut total_num_ops = 0u64;
        let mut total_num_rt_ops = 0u64;
        let mut total_num_failed = 0u64;
        let mut total_num_failed_rt = 0u64;
        let mut total_rt = 0i64;
        let mut total_cycle_time = 0i64;
        for op in summary.op_name_to_stats_map.values() {
            total_num_ops += op.total_num_ops;
            total_num_rt_ops += op.total_num_rt_ops;
            total_num_failed += op.total_num_failed;
            total_num_failed_rt += op.total_num_failed_rt;
            total_rt += op.total_response_time;
            total_cycle_time += op.total_cycle_time;
        }

        let mut interval_passed = true;
        let operations = summary
            .op_name_to_stats_map
            .iter()
            .map(|(name, op)| {
                let (passed_rt, passed_mix_pct) = if op.quality.required_mix_pct > 0.0 {
                    (op.passed_rt(), op.passed_mix_pct(total_num_ops))
                } else {
                    (true, true)
                };
                interval_passed &= passed_rt && passed_mix_pct;
                let rollup = OperationRollup {
                    total_num_ops: op.total_num_ops,
                    mix_pct: ratio(op.total_num_ops as f64, total_num_ops as f64) * 100.0,
                    passed_rt,
                    passed_mix_pct,
                    average_response_time: ratio(
                        op.total_response_time as f64 / 1000.0,
                        op.total_num_rt_ops as f64,
                    ),
                };
                (name.clone(), rollup)
            })
            .collect();

        let effective_ops = total_num_ops.saturating_sub(total_num_failed + total_num_failed_rt);

        Self {
            workload_name: summary.workload_name.clone(),
            stats_interval_spec_name: summary.stats_interval_spec_name.clone(),
            interval_name: summary.interval_name.clone(),
            interval_start_time: summary.interval_start_time,
            interval_end_time: summary.interval_end_time,
            start_active_users: summary.start_active_users,
            end_active_users: summary.end_active_users,
            interval_duration_sec: duration_sec,
            total_num_ops,
            total_num_failed,
            total_num_failed_rt,
            throughput: ratio(total_num_ops as f64, duration_sec),
            effective_throughput: ratio(effective_ops as f64, duration_sec),
            avg_rt: ratio(total_rt as f64 / 1000.0, total_num_rt_ops as f64),
            avg_cycle_time: ratio(total_cycle_time as f64 / 1000.0, total_num_ops as f64),
            pct_passing: ratio(
                total_num_ops.saturating_sub(total_num_failed_rt) as f64,
                total_num_ops as f64,
            ),
            interval_passed,
            operations,
        }
    }

    /// Header row matching [`StatsRollup::csv_row`]
    pub fn csv_header() -> &'static str {
        "interval,startTime,endTime,startUsers,endUsers,durationSec,totalOps,failed,failedRT,throughput,effectiveThroughput,avgRT,avgCycleTime,pctPassing,passed"
    }

    pub fn csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{:.3},{},{},{},{:.3},{:.3},{:.4},{:.4},{:.4},{}",
            self.interval_name,
            self.interval_start_time,
            self.interval_end_time,
            self.start_active_users,
            self.end_active_users,
            self.interval_duration_sec,
            self.total_num_ops,
            self.total_num_failed,
            self.total_num_failed_rt,
            self.throughput,
            self.effective_throughput,
            self.avg_rt,
            self.avg_cycle_time,
            self.pct_passing,
            self.interval_passed
        )
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::operation::{OperationStats, QualityBar};
    use crate::stats::summary::{OperationQuality, ALL_TARGETS};

    fn quality(mix: f64) -> QualityBar {
        QualityBar {
            response_time_limit: 1.0,
            response_time_limit_percentile: 90.0,
            use_response_time: true,
            required_mix_pct: mix,
            mix_pct_tolerance: 0.2,
        }
    }

    fn summary() -> StatsSummary {
        let ops = vec![
            OperationQuality {
                name: "Login".into(),
                quality: quality(50.0),
            },
            OperationQuality {
                name: "Bid".into(),
                quality: quality(50.0),
            },
        ];
        let mut summary = StatsSummary::new("w1", ALL_TARGETS, "loadpath", &ops);
        summary.interval_start_time = 10_000;
        summary.interval_end_time = 20_000;
        summary.interval_name = "3".into();
        for _ in 0..5 {
            summary.add_stats(&OperationStats::new("Login", "t1", 1_000, 1_200).with_cycle_time(2_000));
            summary.add_stats(&OperationStats::new("Bid", "t1", 1_000, 1_400).with_cycle_time(2_000));
        }
        summary
    }

    #[test]
    fn test_rollup_metrics() {
        let rollup = StatsRollup::from_summary(&summary());
        assert_eq!(rollup.interval_duration_sec, 10.0);
        assert_eq!(rollup.total_num_ops, 10);
        assert!((rollup.throughput - 1.0).abs() < 1e-9);
        assert!((rollup.effective_throughput - 1.0).abs() < 1e-9);
        assert!((rollup.avg_rt - 0.3).abs() < 1e-9);
        assert!((rollup.avg_cycle_time - 2.0).abs() < 1e-9);
        assert!((rollup.pct_passing - 1.0).abs() < 1e-9);
        assert!(rollup.interval_passed);
        assert!((rollup.operations["Bid"].mix_pct - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_rollup_fails_on_mix() {
        let mut s = summary();
        for _ in 0..10 {
            s.add_stats(&OperationStats::new("Login", "t1", 1_000, 1_100));
        }
        let rollup = StatsRollup::from_summary(&s);
        assert!(!rollup.interval_passed);
        assert!(!rollup.operations["Bid"].passed_mix_pct);
    }

    #[test]
    fn test_rollup_fails_on_rt() {
        let mut s = summary();
        for _ in 0..3 {
            s.add_stats(&OperationStats::new("Bid", "t1", 1_000, 9_000));
            s.add_stats(&OperationStats::new("Login", "t1", 1_000, 1_100));
        }
        let rollup = StatsRollup::from_summary(&s);
        assert!(!rollup.operations["Bid"].passed_rt);
        assert!(!rollup.interval_passed);
        assert_eq!(rollup.total_num_failed_rt, 3);
    }

    #[test]
    fn test_empty_interval_passes() {
        let s = StatsSummary::new("w1", ALL_TARGETS, "loadpath", &[]);
        let rollup = StatsRollup::from_summary(&s);
        assert_eq!(rollup.throughput, 0.0);
        assert!(rollup.interval_passed);
        assert!(rollup.csv_row().ends_with("true"));
    }
}
