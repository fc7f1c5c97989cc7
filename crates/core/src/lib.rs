// Rampart Core
//
// Control plane of a distributed benchmark harness: load paths and the
// controllers that combine their interval verdicts, distributed stats
// collection, and the behavior state machines simulated users walk.
//
// Key design decisions:
// - The run host owns runs, workloads, the stats aggregator and the load-path
//   controller; driver nodes own simulated users and stats collectors
// - Seams that may cross the network are traits (StatsSink, RollupSource,
//   LoadPathController, IntervalResultWatcher, LoadTarget, OperationExecutor)
// - Everything here is HTTP-server agnostic; rampart-driver mounts it on axum

pub mod behavior;
pub mod error;
pub mod lifecycle;
pub mod load_path;
pub mod messages;
pub mod node;
pub mod run;
pub mod stats;
pub mod telemetry;
pub mod transport;
pub mod user;
pub mod workload;

// Re-exports for convenience
pub use error::{DriverError, Result};
pub use lifecycle::LifecycleState;
pub use messages::{
    ActiveUsersResponse, AddWorkloadMessage, BasicResponse, ChangeUsersMessage,
    InitializeRunStatsMessage, InitializeWorkloadMessage, IntervalResultMessage,
    IsStartedResponse, RegisterWatcherMessage, RunStateResponse, RunTimestampMessage,
    StatsIntervalCompleteMessage,
};
pub use transport::{PeerClient, TransportError, DEFAULT_PEER_PORT};

pub use behavior::{BehaviorError, BehaviorSpec, BehaviorSpecRegistry, TransitionChooserKind};
pub use load_path::{
    ControllerPolicy, LoadPathConfig, LoadPathController, LoadPathOutcome,
    LocalLoadPathController, RemoteLoadPathController,
};
pub use node::NodeWorkload;
pub use run::{Run, RunConfig, RunStatus, StatsHost, WorkloadStatus};
pub use stats::{StatsAggregator, StatsRollup, StatsSummary};
pub use user::{DryRunExecutor, OperationExecutor, OperationRequest, OperationResult};
pub use workload::{Workload, WorkloadConfig};
