// Stats host routes

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use rampart_core::stats::RollupStatus;
use rampart_core::{
    BasicResponse, InitializeRunStatsMessage, RunTimestampMessage, StatsAggregator, StatsSummary,
};

use super::common::{success, ApiResult};

/// App state for stats routes
#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<StatsAggregator>,
}

impl AppState {
    pub fn new(aggregator: Arc<StatsAggregator>) -> Self {
        Self { aggregator }
    }
}

/// Create stats routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/stats/run/:run", post(post_stats_summary))
        .route("/stats/initialize/run/:run", post(initialize_run))
        .route("/stats/started/:run", post(run_started))
        .route("/stats/complete/:run", post(run_complete))
        .route(
            "/stats/run/:run/workload/:workload/specName/:spec/intervalName/:interval/rollup",
            get(get_rollup),
        )
        .with_state(state)
}

/// POST /stats/run/{run} - Merge one node's summary
#[utoipa::path(
    post,
    path = "/stats/run/{run}",
    params(("run" = String, Path, description = "Run name")),
    request_body = StatsSummary,
    responses(
        (status = 200, description = "Summary merged", body = BasicResponse),
        (status = 409, description = "Run not initialized on this stats host", body = BasicResponse)
    ),
    tag = "stats"
)]
pub async fn post_stats_summary(
    State(state): State<AppState>,
    Path(run): Path<String>,
    Json(summary): Json<StatsSummary>,
) -> ApiResult<Json<BasicResponse>> {
    let interval = summary.interval_name.clone();
    let completed = state.aggregator.post_stats_summary(&run, summary).await?;
    let message = if completed.is_some() {
        format!("Interval {interval} complete")
    } else {
        format!("Summary for interval {interval} recorded")
    };
    Ok(success(message))
}

/// POST /stats/initialize/run/{run} - Expect summaries from these hosts
#[utoipa::path(
    post,
    path = "/stats/initialize/run/{run}",
    params(("run" = String, Path, description = "Run name")),
    request_body = InitializeRunStatsMessage,
    responses((status = 200, description = "Run stats initialized", body = BasicResponse)),
    tag = "stats"
)]
pub async fn initialize_run(
    State(state): State<AppState>,
    Path(run): Path<String>,
    Json(msg): Json<InitializeRunStatsMessage>,
) -> Json<BasicResponse> {
    state.aggregator.initialize_run(&run, msg);
    success(format!("Stats initialized for run {run}"))
}

/// POST /stats/started/{run} - Record the run start time
#[utoipa::path(
    post,
    path = "/stats/started/{run}",
    params(("run" = String, Path, description = "Run name")),
    request_body = RunTimestampMessage,
    responses(
        (status = 200, description = "Start recorded", body = BasicResponse),
        (status = 409, description = "Run not initialized", body = BasicResponse)
    ),
    tag = "stats"
)]
pub async fn run_started(
    State(state): State<AppState>,
    Path(run): Path<String>,
    Json(msg): Json<RunTimestampMessage>,
) -> ApiResult<Json<BasicResponse>> {
    state.aggregator.run_started(&run, msg.timestamp)?;
    Ok(success(format!("Run {run} started")))
}

/// POST /stats/complete/{run} - Print whole-run totals
#[utoipa::path(
    post,
    path = "/stats/complete/{run}",
    params(("run" = String, Path, description = "Run name")),
    request_body = RunTimestampMessage,
    responses(
        (status = 200, description = "Run totals printed", body = BasicResponse),
        (status = 409, description = "Run not initialized", body = BasicResponse)
    ),
    tag = "stats"
)]
pub async fn run_complete(
    State(state): State<AppState>,
    Path(run): Path<String>,
    Json(msg): Json<RunTimestampMessage>,
) -> ApiResult<Json<BasicResponse>> {
    let totals = state.aggregator.run_complete(&run, msg.timestamp)?;
    Ok(success(format!(
        "Run {run} complete with {} stats specs",
        totals.len()
    )))
}

/// GET .../rollup - Progress and, once complete, the rollup of one interval
#[utoipa::path(
    get,
    path = "/stats/run/{run}/workload/{workload}/specName/{spec}/intervalName/{interval}/rollup",
    params(
        ("run" = String, Path, description = "Run name"),
        ("workload" = String, Path, description = "Workload name"),
        ("spec" = String, Path, description = "Stats interval spec name"),
        ("interval" = String, Path, description = "Interval name")
    ),
    responses(
        (status = 200, description = "Rollup status", body = RollupStatus),
        (status = 409, description = "Run not initialized", body = BasicResponse)
    ),
    tag = "stats"
)]
pub async fn get_rollup(
    State(state): State<AppState>,
    Path((run, workload, spec, interval)): Path<(String, String, String, String)>,
) -> ApiResult<Json<RollupStatus>> {
    Ok(Json(
        state
            .aggregator
            .rollup_status(&run, &workload, &spec, &interval)?,
    ))
}
