// OpenAPI specification generation
//
// Served at /api-doc/openapi.json and printed by the export-openapi binary.

use crate::api;
use rampart_core::stats::{
    OperationRollup, OperationStatsSummary, PrintFlags, QualityBar, RollupStatus,
};
use rampart_core::{
    ActiveUsersResponse, BasicResponse, ChangeUsersMessage, InitializeRunStatsMessage,
    InitializeWorkloadMessage, IntervalResultMessage, IsStartedResponse, LifecycleState,
    RegisterWatcherMessage, RunStateResponse, RunStatus, RunTimestampMessage,
    StatsIntervalCompleteMessage, StatsRollup, StatsSummary, WorkloadStatus,
};
use utoipa::OpenApi;

/// OpenAPI documentation for the Rampart control plane
#[derive(OpenApi)]
#[openapi(
    paths(
        api::driver::add_workload,
        api::driver::initialize_workload,
        api::driver::change_active_users,
        api::driver::stats_interval_complete,
        api::driver::stop_workload,
        api::driver::exit,
        api::run::add_run,
        api::run::get_run,
        api::run::initialize_run,
        api::run::start_run,
        api::run::stop_run,
        api::run::shutdown_run,
        api::run::get_state,
        api::run::is_started,
        api::run::get_active_users,
        api::run::change_active_users,
        api::stats::post_stats_summary,
        api::stats::initialize_run,
        api::stats::run_started,
        api::stats::run_complete,
        api::stats::get_rollup,
        api::load_path::register_watcher,
        api::load_path::remove_watcher,
        api::load_path::post_interval_result,
        api::load_path::notify,
    ),
    components(
        schemas(
            BasicResponse, LifecycleState,
            InitializeWorkloadMessage, ChangeUsersMessage, StatsIntervalCompleteMessage,
            InitializeRunStatsMessage, RunTimestampMessage,
            ActiveUsersResponse, IsStartedResponse, RunStateResponse, RunStatus, WorkloadStatus,
            StatsSummary, StatsRollup, OperationRollup, OperationStatsSummary, QualityBar,
            PrintFlags, RollupStatus,
            IntervalResultMessage, RegisterWatcherMessage,
        )
    ),
    tags(
        (name = "driver", description = "Workloads on this driver node"),
        (name = "runs", description = "Run lifecycle on the run host"),
        (name = "stats", description = "Stats aggregation on the stats host"),
        (name = "load-path-controller", description = "Combined interval verdicts")
    ),
    info(
        title = "Rampart Control Plane",
        version = "0.1.0",
        description = "Control plane of the Rampart distributed benchmark driver",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;

impl ApiDoc {
    /// Pretty-printed JSON spec
    pub fn to_json() -> String {
        ApiDoc::openapi()
            .to_pretty_json()
            .unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}
