// Driver-node routes: the run host drives workloads on this node through these

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use rampart_core::behavior::BehaviorSpec;
use rampart_core::{
    AddWorkloadMessage, BasicResponse, ChangeUsersMessage, InitializeWorkloadMessage,
    StatsIntervalCompleteMessage, WorkloadConfig,
};
use serde::Deserialize;

use super::common::{success, ApiResult};
use crate::services::NodeService;

/// Initialize body; may carry the workload definition instead of a prior add
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeWorkloadRequest {
    #[serde(flatten)]
    pub init: InitializeWorkloadMessage,
    #[serde(default)]
    pub workload: Option<WorkloadConfig>,
    #[serde(default)]
    pub behavior_specs: Vec<BehaviorSpec>,
}

/// App state for driver routes
#[derive(Clone)]
pub struct AppState {
    pub nodes: Arc<NodeService>,
}

impl AppState {
    pub fn new(nodes: Arc<NodeService>) -> Self {
        Self { nodes }
    }
}

/// Create driver routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/driver/run/:run/workload/:workload", post(add_workload))
        .route(
            "/driver/run/:run/workload/:workload/initialize",
            post(initialize_workload),
        )
        .route(
            "/driver/run/:run/workload/:workload/users",
            post(change_active_users),
        )
        .route(
            "/driver/run/:run/workload/:workload/statsIntervalComplete",
            post(stats_interval_complete),
        )
        .route("/driver/run/:run/workload/:workload/stop", post(stop_workload))
        .route("/driver/exit/:run", post(exit))
        .with_state(state)
}

/// POST /driver/run/{run}/workload/{workload} - Register a workload definition
#[utoipa::path(
    post,
    path = "/driver/run/{run}/workload/{workload}",
    params(
        ("run" = String, Path, description = "Run name"),
        ("workload" = String, Path, description = "Workload name")
    ),
    responses(
        (status = 200, description = "Workload added", body = BasicResponse),
        (status = 409, description = "Workload already initialized", body = BasicResponse)
    ),
    tag = "driver"
)]
pub async fn add_workload(
    State(state): State<AppState>,
    Path((run, workload)): Path<(String, String)>,
    Json(msg): Json<AddWorkloadMessage>,
) -> ApiResult<Json<BasicResponse>> {
    state.nodes.add_workload(&run, &workload, msg)?;
    Ok(success(format!("Workload {workload} added")))
}

/// POST /driver/run/{run}/workload/{workload}/initialize - Build this node's share
#[utoipa::path(
    post,
    path = "/driver/run/{run}/workload/{workload}/initialize",
    params(
        ("run" = String, Path, description = "Run name"),
        ("workload" = String, Path, description = "Workload name")
    ),
    request_body = InitializeWorkloadMessage,
    responses(
        (status = 200, description = "Workload initialized", body = BasicResponse),
        (status = 409, description = "Workload unknown, invalid or already initialized", body = BasicResponse)
    ),
    tag = "driver"
)]
pub async fn initialize_workload(
    State(state): State<AppState>,
    Path((run, workload)): Path<(String, String)>,
    Json(req): Json<InitializeWorkloadRequest>,
) -> ApiResult<Json<BasicResponse>> {
    let inline = req.workload.map(|workload| AddWorkloadMessage {
        workload,
        behavior_specs: req.behavior_specs,
    });
    state
        .nodes
        .initialize_workload(&run, &workload, req.init, inline)?;
    Ok(success(format!("Workload {workload} initialized")))
}

/// POST /driver/run/{run}/workload/{workload}/users - Set this node's active users
#[utoipa::path(
    post,
    path = "/driver/run/{run}/workload/{workload}/users",
    params(
        ("run" = String, Path, description = "Run name"),
        ("workload" = String, Path, description = "Workload name")
    ),
    request_body = ChangeUsersMessage,
    responses(
        (status = 200, description = "Active users changed", body = BasicResponse),
        (status = 409, description = "Too many users or workload not running", body = BasicResponse)
    ),
    tag = "driver"
)]
pub async fn change_active_users(
    State(state): State<AppState>,
    Path((run, workload)): Path<(String, String)>,
    Json(msg): Json<ChangeUsersMessage>,
) -> ApiResult<Json<BasicResponse>> {
    state
        .nodes
        .change_active_users(&run, &workload, msg.active_users)?;
    Ok(success(format!(
        "Workload {workload} now has {} active users",
        msg.active_users
    )))
}

/// POST /driver/run/{run}/workload/{workload}/statsIntervalComplete - Close a stats interval
#[utoipa::path(
    post,
    path = "/driver/run/{run}/workload/{workload}/statsIntervalComplete",
    params(
        ("run" = String, Path, description = "Run name"),
        ("workload" = String, Path, description = "Workload name")
    ),
    request_body = StatsIntervalCompleteMessage,
    responses(
        (status = 200, description = "Summaries shipped to the stats host", body = BasicResponse),
        (status = 409, description = "Workload not initialized", body = BasicResponse)
    ),
    tag = "driver"
)]
pub async fn stats_interval_complete(
    State(state): State<AppState>,
    Path((run, workload)): Path<(String, String)>,
    Json(msg): Json<StatsIntervalCompleteMessage>,
) -> ApiResult<Json<BasicResponse>> {
    state
        .nodes
        .stats_interval_complete(&run, &workload, &msg)
        .await?;
    Ok(success(format!(
        "Interval {} of {} complete",
        msg.cur_interval_name, msg.completed_spec_name
    )))
}

/// POST /driver/run/{run}/workload/{workload}/stop - Stop every user of a workload
#[utoipa::path(
    post,
    path = "/driver/run/{run}/workload/{workload}/stop",
    params(
        ("run" = String, Path, description = "Run name"),
        ("workload" = String, Path, description = "Workload name")
    ),
    responses(
        (status = 200, description = "Workload stopped", body = BasicResponse),
        (status = 409, description = "Workload not initialized", body = BasicResponse)
    ),
    tag = "driver"
)]
pub async fn stop_workload(
    State(state): State<AppState>,
    Path((run, workload)): Path<(String, String)>,
) -> ApiResult<Json<BasicResponse>> {
    state.nodes.stop_workload(&run, &workload).await?;
    Ok(success(format!("Workload {workload} stopped")))
}

/// POST /driver/exit/{run} - Drop a run's workloads and exit when configured to
#[utoipa::path(
    post,
    path = "/driver/exit/{run}",
    params(("run" = String, Path, description = "Run name")),
    responses((status = 200, description = "Run shut down on this node", body = BasicResponse)),
    tag = "driver"
)]
pub async fn exit(State(state): State<AppState>, Path(run): Path<String>) -> Json<BasicResponse> {
    state.nodes.exit(&run).await;
    success(format!("Driver exiting run {run}"))
}
