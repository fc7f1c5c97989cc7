// Load path controller routes
//
// `register`, `remove` and `result` are served by the process owning a run's
// controller. `notify` is served by participants proxying to a remote owner.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use rampart_core::{BasicResponse, IntervalResultMessage, RegisterWatcherMessage};

use super::common::{success, ApiResult};
use crate::services::ControllerService;

/// App state for load path controller routes
#[derive(Clone)]
pub struct AppState {
    pub controllers: Arc<ControllerService>,
}

impl AppState {
    pub fn new(controllers: Arc<ControllerService>) -> Self {
        Self { controllers }
    }
}

/// Create load path controller routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/loadPathController/run/:run/register", post(register_watcher))
        .route("/loadPathController/run/:run/remove", post(remove_watcher))
        .route("/loadPathController/run/:run/result", post(post_interval_result))
        .route(
            "/loadPathController/run/:run/loadPath/:load_path/notify",
            post(notify),
        )
        .with_state(state)
}

/// POST /loadPathController/run/{run}/register - Register a remote participant
#[utoipa::path(
    post,
    path = "/loadPathController/run/{run}/register",
    params(("run" = String, Path, description = "Run name")),
    request_body = RegisterWatcherMessage,
    responses((status = 200, description = "Watcher registered", body = BasicResponse)),
    tag = "load-path-controller"
)]
pub async fn register_watcher(
    State(state): State<AppState>,
    Path(run): Path<String>,
    Json(msg): Json<RegisterWatcherMessage>,
) -> ApiResult<Json<BasicResponse>> {
    let name = msg.load_path_name.clone();
    state.controllers.register(&run, msg).await?;
    Ok(success(format!("Watcher for {name} registered")))
}

/// POST /loadPathController/run/{run}/remove - Remove a participant
#[utoipa::path(
    post,
    path = "/loadPathController/run/{run}/remove",
    params(("run" = String, Path, description = "Run name")),
    request_body = RegisterWatcherMessage,
    responses(
        (status = 200, description = "Watcher removed", body = BasicResponse),
        (status = 409, description = "No controller for this run", body = BasicResponse)
    ),
    tag = "load-path-controller"
)]
pub async fn remove_watcher(
    State(state): State<AppState>,
    Path(run): Path<String>,
    Json(msg): Json<RegisterWatcherMessage>,
) -> ApiResult<Json<BasicResponse>> {
    let name = msg.load_path_name.clone();
    state.controllers.remove(&run, msg).await?;
    Ok(success(format!("Watcher for {name} removed")))
}

/// POST /loadPathController/run/{run}/result - A participant's verdict for one interval
#[utoipa::path(
    post,
    path = "/loadPathController/run/{run}/result",
    params(("run" = String, Path, description = "Run name")),
    request_body = IntervalResultMessage,
    responses(
        (status = 200, description = "Verdict recorded", body = BasicResponse),
        (status = 409, description = "No controller for this run", body = BasicResponse)
    ),
    tag = "load-path-controller"
)]
pub async fn post_interval_result(
    State(state): State<AppState>,
    Path(run): Path<String>,
    Json(msg): Json<IntervalResultMessage>,
) -> ApiResult<Json<BasicResponse>> {
    let interval = msg.interval_name.clone();
    state.controllers.post_result(&run, msg).await?;
    Ok(success(format!("Result for interval {interval} recorded")))
}

/// POST /loadPathController/run/{run}/loadPath/{load_path}/notify - Combined verdict from the owner
#[utoipa::path(
    post,
    path = "/loadPathController/run/{run}/loadPath/{load_path}/notify",
    params(
        ("run" = String, Path, description = "Run name"),
        ("load_path" = String, Path, description = "Load path name")
    ),
    request_body = IntervalResultMessage,
    responses(
        (status = 200, description = "Verdict delivered", body = BasicResponse),
        (status = 409, description = "No proxy controller for this run", body = BasicResponse)
    ),
    tag = "load-path-controller"
)]
pub async fn notify(
    State(state): State<AppState>,
    Path((run, load_path)): Path<(String, String)>,
    Json(msg): Json<IntervalResultMessage>,
) -> ApiResult<Json<BasicResponse>> {
    let interval = msg.interval_name.clone();
    state.controllers.notify(&run, &load_path, msg).await?;
    Ok(success(format!("Verdict for interval {interval} delivered")))
}
