// Run routes (served by the run host)

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use rampart_core::{
    ActiveUsersResponse, BasicResponse, ChangeUsersMessage, IsStartedResponse, LifecycleState,
    RunConfig, RunStateResponse, RunStatus,
};

use super::common::{success, ApiResult};
use crate::services::RunService;

/// App state for run routes
#[derive(Clone)]
pub struct AppState {
    pub runs: Arc<RunService>,
}

impl AppState {
    pub fn new(runs: Arc<RunService>) -> Self {
        Self { runs }
    }
}

/// Create run routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/run/:run", post(add_run).get(get_run))
        .route("/run/:run/initialize", post(initialize_run))
        .route("/run/:run/start", post(start_run))
        .route("/run/:run/stop", post(stop_run))
        .route("/run/:run/shutdown", post(shutdown_run))
        .route("/run/:run/state", get(get_state))
        .route("/run/:run/isStarted", get(is_started))
        .route("/run/:run/users", get(get_active_users))
        .route("/run/:run/workload/:workload/users", post(change_active_users))
        .with_state(state)
}

/// POST /run/{run} - Add a run
#[utoipa::path(
    post,
    path = "/run/{run}",
    params(("run" = String, Path, description = "Run name")),
    responses(
        (status = 200, description = "Run added", body = RunStatus),
        (status = 409, description = "Run exists or its configuration is invalid", body = BasicResponse)
    ),
    tag = "runs"
)]
pub async fn add_run(
    State(state): State<AppState>,
    Path(run): Path<String>,
    Json(config): Json<RunConfig>,
) -> ApiResult<Json<RunStatus>> {
    Ok(Json(state.runs.add_run(&run, config)?))
}

/// GET /run/{run} - Run status and finished workloads
#[utoipa::path(
    get,
    path = "/run/{run}",
    params(("run" = String, Path, description = "Run name")),
    responses(
        (status = 200, description = "Run status", body = RunStatus),
        (status = 409, description = "Run not found", body = BasicResponse)
    ),
    tag = "runs"
)]
pub async fn get_run(
    State(state): State<AppState>,
    Path(run): Path<String>,
) -> ApiResult<Json<RunStatus>> {
    Ok(Json(state.runs.status(&run)?))
}

/// POST /run/{run}/initialize - Prepare the stats host and every node
#[utoipa::path(
    post,
    path = "/run/{run}/initialize",
    params(("run" = String, Path, description = "Run name")),
    responses(
        (status = 200, description = "Run initialized", body = BasicResponse),
        (status = 409, description = "Run not found, not pending, or a node failed", body = BasicResponse),
        (status = 502, description = "Stats host unreachable", body = BasicResponse)
    ),
    tag = "runs"
)]
pub async fn initialize_run(
    State(state): State<AppState>,
    Path(run): Path<String>,
) -> ApiResult<Json<BasicResponse>> {
    state.runs.initialize(&run).await?;
    Ok(success(format!("Run {run} initialized")))
}

/// POST /run/{run}/start - Start load paths and stats intervals
#[utoipa::path(
    post,
    path = "/run/{run}/start",
    params(("run" = String, Path, description = "Run name")),
    responses(
        (status = 200, description = "Run started", body = BasicResponse),
        (status = 409, description = "Run not found or not initialized", body = BasicResponse)
    ),
    tag = "runs"
)]
pub async fn start_run(
    State(state): State<AppState>,
    Path(run): Path<String>,
) -> ApiResult<Json<BasicResponse>> {
    state.runs.start(&run).await?;
    Ok(success(format!("Run {run} started")))
}

/// POST /run/{run}/stop - Stop every workload
#[utoipa::path(
    post,
    path = "/run/{run}/stop",
    params(("run" = String, Path, description = "Run name")),
    responses(
        (status = 200, description = "Run stopped", body = BasicResponse),
        (status = 409, description = "Run not found", body = BasicResponse)
    ),
    tag = "runs"
)]
pub async fn stop_run(
    State(state): State<AppState>,
    Path(run): Path<String>,
) -> ApiResult<Json<BasicResponse>> {
    state.runs.stop(&run).await?;
    Ok(success(format!("Run {run} stopped")))
}

/// POST /run/{run}/shutdown - Stop the run and tell every driver to exit
#[utoipa::path(
    post,
    path = "/run/{run}/shutdown",
    params(("run" = String, Path, description = "Run name")),
    responses(
        (status = 200, description = "Run shut down", body = BasicResponse),
        (status = 409, description = "Run not found", body = BasicResponse)
    ),
    tag = "runs"
)]
pub async fn shutdown_run(
    State(state): State<AppState>,
    Path(run): Path<String>,
) -> ApiResult<Json<BasicResponse>> {
    state.runs.shutdown(&run).await?;
    Ok(success(format!("Run {run} shut down")))
}

/// GET /run/{run}/state - Lifecycle state
#[utoipa::path(
    get,
    path = "/run/{run}/state",
    params(("run" = String, Path, description = "Run name")),
    responses(
        (status = 200, description = "Run state", body = RunStateResponse),
        (status = 409, description = "Run not found", body = BasicResponse)
    ),
    tag = "runs"
)]
pub async fn get_state(
    State(state): State<AppState>,
    Path(run): Path<String>,
) -> ApiResult<Json<RunStateResponse>> {
    Ok(Json(RunStateResponse {
        state: state.runs.state(&run)?,
    }))
}

/// GET /run/{run}/isStarted - Whether the run has been started
#[utoipa::path(
    get,
    path = "/run/{run}/isStarted",
    params(("run" = String, Path, description = "Run name")),
    responses(
        (status = 200, description = "Started flag", body = IsStartedResponse),
        (status = 409, description = "Run not found", body = BasicResponse)
    ),
    tag = "runs"
)]
pub async fn is_started(
    State(state): State<AppState>,
    Path(run): Path<String>,
) -> ApiResult<Json<IsStartedResponse>> {
    Ok(Json(IsStartedResponse {
        is_started: state.runs.state(&run)? >= LifecycleState::Running,
    }))
}

/// GET /run/{run}/users - Active users per workload
#[utoipa::path(
    get,
    path = "/run/{run}/users",
    params(("run" = String, Path, description = "Run name")),
    responses(
        (status = 200, description = "Active users", body = ActiveUsersResponse),
        (status = 409, description = "Run not found", body = BasicResponse)
    ),
    tag = "runs"
)]
pub async fn get_active_users(
    State(state): State<AppState>,
    Path(run): Path<String>,
) -> ApiResult<Json<ActiveUsersResponse>> {
    Ok(Json(state.runs.active_users(&run)?))
}

/// POST /run/{run}/workload/{workload}/users - Set a workload's total active users
#[utoipa::path(
    post,
    path = "/run/{run}/workload/{workload}/users",
    params(
        ("run" = String, Path, description = "Run name"),
        ("workload" = String, Path, description = "Workload name")
    ),
    request_body = ChangeUsersMessage,
    responses(
        (status = 200, description = "Active users changed", body = BasicResponse),
        (status = 409, description = "Too many users or workload not active", body = BasicResponse)
    ),
    tag = "runs"
)]
pub async fn change_active_users(
    State(state): State<AppState>,
    Path((run, workload)): Path<(String, String)>,
    Json(msg): Json<ChangeUsersMessage>,
) -> ApiResult<Json<BasicResponse>> {
    state
        .runs
        .change_active_users(&run, &workload, msg.active_users)
        .await?;
    Ok(success(format!(
        "Workload {workload} now has {} active users",
        msg.active_users
    )))
}
