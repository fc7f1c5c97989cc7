//! Statistics: samples, aggregation windows, node collectors and the master aggregator

pub mod aggregator;
pub mod collector;
pub mod interval_spec;
pub mod operation;
pub mod rollup;
pub mod summary;

pub use aggregator::{RollupStatus, StatsAggregator};
pub use collector::{
    BufferedStatsCollector, Granularity, HttpStatsSink, StatsCollector, StatsSink, TrackedSpec,
};
pub use interval_spec::{
    spawn_interval_spec, FixedInterval, Interval, IntervalClock, IntervalListener,
    IntervalSequence, IntervalSpecKind, StatsIntervalSpecConfig,
};
pub use operation::{OperationStats, OperationStatsSummary, QualityBar};
pub use rollup::{OperationRollup, StatsRollup};
pub use summary::{OperationQuality, PrintFlags, StatsSummary, ALL_TARGETS, UNSET_USERS};
