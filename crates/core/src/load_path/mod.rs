//! Load paths and the controllers that combine their interval verdicts

pub mod controller;
pub mod remote;
pub mod runner;
pub mod schedule;

pub use controller::{
    ChannelWatcher, ControllerPolicy, IntervalResultWatcher, IntervalVerdict,
    LoadPathController, LocalLoadPathController, Mode, PolicyState,
};
pub use remote::{HttpWatcher, RemoteLoadPathController};
pub use runner::{
    fetch_rollup, HttpRollupSource, LoadPathRunner, LoadTarget, LocalRollupSource, RollupPoll,
    RollupSource,
};
pub use schedule::{
    nice_round, FindMaxLoadPath, FindMaxLoadPathConfig, FixedLoadPath, FixedLoadPathConfig,
    IntervalLoadPath, IntervalLoadPathConfig, LoadInterval, LoadPathConfig, LoadPathOutcome,
    LoadSchedule, LoadStep, RampLoadInterval, UniformLoadInterval,
};
