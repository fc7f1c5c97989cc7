// StatsSummary: one aggregation window for one (workload, spec, target)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use super::operation::{OperationStats, OperationStatsSummary, QualityBar};
use crate::messages::StatsIntervalCompleteMessage;

/// Target name used by per-workload summaries
pub const ALL_TARGETS: &str = "all";

/// Users value meaning "not recorded"
pub const UNSET_USERS: i64 = -1;

/// Name and quality bar of one operation tracked by a summary
#[derive(Debug, Clone, PartialEq)]
pub struct OperationQuality {
    pub name: String,
    pub quality: QualityBar,
}

/// Print flags carried from the interval spec to the aggregator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct PrintFlags {
    #[serde(default)]
    pub print_summary: bool,
    #[serde(default)]
    pub print_intervals: bool,
    #[serde(default)]
    pub print_csv: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub workload_name: String,
    pub target_name: String,
    #[serde(default)]
    pub host_name: String,
    pub stats_interval_spec_name: String,
    #[serde(default)]
    pub interval_name: String,
    /// Epoch millis, 0 when unset
    #[serde(default)]
    pub interval_start_time: i64,
    /// Epoch millis, 0 when unset
    #[serde(default)]
    pub interval_end_time: i64,
    #[serde(default = "unset_users")]
    pub start_active_users: i64,
    #[serde(default = "unset_users")]
    pub end_active_users: i64,
    #[serde(flatten)]
    pub print: PrintFlags,
    #[serde(default)]
    pub op_name_to_stats_map: BTreeMap<String, OperationStatsSummary>,
}

fn unset_users() -> i64 {
    UNSET_USERS
}

impl StatsSummary {
    pub fn new(
        workload_name: impl Into<String>,
        target_name: impl Into<String>,
        stats_interval_spec_name: impl Into<String>,
        operations: &[OperationQuality],
    ) -> Self {
        let op_name_to_stats_map = operations
            .iter()
            .map(|op| {
                (
                    op.name.clone(),
                    OperationStatsSummary::new(op.name.clone(), op.quality.clone()),
                )
            })
            .collect();

        Self {
            workload_name: workload_name.into(),
            target_name: target_name.into(),
            host_name: String::new(),
            stats_interval_spec_name: stats_interval_spec_name.into(),
            interval_name: String::new(),
            interval_start_time: 0,
            interval_end_time: 0,
            start_active_users: UNSET_USERS,
            end_active_users: UNSET_USERS,
            print: PrintFlags::default(),
            op_name_to_stats_map,
        }
    }

    pub fn with_print_flags(mut self, print: PrintFlags) -> Self {
        self.print = print;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host_name = host.into();
        self
    }

    /// Fold one sample in. Unknown operations get a summary with no quality bar.
    pub fn add_stats(&mut self, stats: &OperationStats) {
        self.op_name_to_stats_map
            .entry(stats.operation_name.clone())
            .or_insert_with(|| {
                OperationStatsSummary::new(stats.operation_name.clone(), QualityBar::default())
            })
            .add_stats(stats);
    }

    /// Merge another window's counters into this one
    pub fn merge(&mut self, other: &StatsSummary) {
        fill_if_empty(&mut self.workload_name, &other.workload_name);
        fill_if_empty(&mut self.target_name, &other.target_name);
        fill_if_empty(&mut self.host_name, &other.host_name);
        fill_if_empty(&mut self.stats_interval_spec_name, &other.stats_interval_spec_name);
        fill_if_empty(&mut self.interval_name, &other.interval_name);

        self.interval_start_time = match (self.interval_start_time, other.interval_start_time) {
            (0, t) | (t, 0) => t,
            (a, b) => a.min(b),
        };
        self.interval_end_time = self.interval_end_time.max(other.interval_end_time);

        if self.start_active_users == UNSET_USERS {
            self.start_active_users = other.start_active_users;
        }
        if self.end_active_users == UNSET_USERS {
            self.end_active_users = other.end_active_users;
        }

        self.print.print_summary |= other.print.print_summary;
        self.print.print_intervals |= other.print.print_intervals;
        self.print.print_csv |= other.print.print_csv;

        for (name, op) in &other.op_name_to_stats_map {
            self.op_name_to_stats_map
                .entry(name.clone())
                .or_default()
                .merge(op);
        }
    }

    /// Zero every counter and clear the interval stamp
    pub fn reset(&mut self) {
        self.interval_name.clear();
        self.interval_start_time = 0;
        self.interval_end_time = 0;
        self.start_active_users = UNSET_USERS;
        self.end_active_users = UNSET_USERS;
        for op in self.op_name_to_stats_map.values_mut() {
            op.reset();
        }
    }

    /// Record which interval this window covers
    pub fn stamp(&mut self, msg: &StatsIntervalCompleteMessage, host_name: &str) {
        self.interval_name = msg.cur_interval_name.clone();
        self.interval_start_time = msg.cur_interval_start_time;
        self.interval_end_time = msg.last_interval_end_time;
        self.start_active_users = msg.interval_start_users;
        self.end_active_users = msg.interval_end_users;
        self.host_name = host_name.to_string();
    }

    pub fn total_num_ops(&self) -> u64 {
        self.op_name_to_stats_map
            .values()
            .map(|op| op.total_num_ops)
            .sum()
    }
}

fn fill_if_empty(dst: &mut String, src: &str) {
    if dst.is_empty() {
        dst.push_str(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops() -> Vec<OperationQuality> {
        vec![
            OperationQuality {
                name: "Login".into(),
                quality: QualityBar {
                    response_time_limit: 1.0,
                    response_time_limit_percentile: 90.0,
                    use_response_time: true,
                    required_mix_pct: 40.0,
                    mix_pct_tolerance: 0.1,
                },
            },
            OperationQuality {
                name: "Bid".into(),
                quality: QualityBar::default(),
            },
        ]
    }

    fn summary_with(samples: &[(&str, i64, i64)]) -> StatsSummary {
        let mut summary = StatsSummary::new("w1", ALL_TARGETS, "steady", &ops());
        for (name, start, end) in samples {
            summary.add_stats(&OperationStats::new(*name, "t1", *start, *end));
        }
        summary
    }

    #[test]
    fn test_new_prepopulates_operations() {
        let summary = StatsSummary::new("w1", ALL_TARGETS, "steady", &ops());
        assert_eq!(summary.op_name_to_stats_map.len(), 2);
        assert_eq!(summary.start_active_users, UNSET_USERS);
        assert_eq!(summary.total_num_ops(), 0);
    }

    #[test]
    fn test_unknown_operation_added() {
        let summary = summary_with(&[("Logout", 10, 20)]);
        assert_eq!(summary.op_name_to_stats_map["Logout"].total_num_ops, 1);
    }

    #[test]
    fn test_merge_commutative_and_associative() {
        let a = summary_with(&[("Login", 100, 300), ("Bid", 100, 150)]);
        let b = summary_with(&[("Login", 100, 2_500)]);
        let c = summary_with(&[("Bid", 200, 210), ("Logout", 5, 6)]);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);

        let mut ab_c = ab.clone();
        ab_c.merge(&c);
        let mut bc = b.clone();
        bc.merge(&c);
        let mut a_bc = a.clone();
        a_bc.merge(&bc);
        assert_eq!(ab_c, a_bc);
        assert_eq!(ab_c.total_num_ops(), 5);
    }

    #[test]
    fn test_reset_is_zero_element() {
        let mut a = summary_with(&[("Login", 100, 300)]);
        let b = a.clone();
        a.reset();
        assert_eq!(a.total_num_ops(), 0);

        let mut merged = b.clone();
        merged.merge(&a);
        assert_eq!(merged, b);
    }

    #[test]
    fn test_stamp_and_wire_format() {
        let mut summary = summary_with(&[("Login", 100, 300)]);
        summary.stamp(
            &StatsIntervalCompleteMessage {
                completed_spec_name: "steady".into(),
                cur_interval_name: "2".into(),
                cur_interval_start_time: 1_000,
                last_interval_end_time: 61_000,
                interval_start_users: 10,
                interval_end_users: 20,
            },
            "driver1",
        );
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["intervalName"], "2");
        assert_eq!(json["hostName"], "driver1");
        assert_eq!(json["endActiveUsers"], 20);
        assert_eq!(json["opNameToStatsMap"]["Login"]["totalNumOps"], 1);

        let parsed: StatsSummary = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, summary);
    }
}
