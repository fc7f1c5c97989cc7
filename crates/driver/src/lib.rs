// Rampart Driver Library
// Decision: Shared library for binaries (driver server, OpenAPI export) and router tests

pub mod api;
pub mod config;
pub mod openapi;
pub mod services;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

pub use config::{ConfigError, DriverConfig};
pub use services::Services;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(openapi::ApiDoc::openapi())
}

/// Build the full router over a set of services
pub fn app(services: &Services) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api-doc/openapi.json", get(openapi_json))
        .merge(api::driver::routes(api::driver::AppState::new(
            services.nodes.clone(),
        )))
        .merge(api::run::routes(api::run::AppState::new(services.runs.clone())))
        .merge(api::stats::routes(api::stats::AppState::new(
            services.aggregator.clone(),
        )))
        .merge(api::load_path::routes(api::load_path::AppState::new(
            services.controllers.clone(),
        )))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use rampart_core::{BasicResponse, LoadPathController};
    use tower::ServiceExt;

    fn test_app() -> (Router, Services) {
        let config = DriverConfig::default()
            .with_hostname("master")
            .with_exit_on_shutdown(false);
        let services = Services::new(&config).unwrap();
        (app(&services), services)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn workload() -> serde_json::Value {
        serde_json::json!({
            "name": "browse",
            "behaviorSpecName": "user",
            "maxUsers": 10,
            "loadPath": {"type": "interval", "name": "steady", "loadIntervals": [
                {"type": "uniform", "name": "only", "duration": 30, "users": 10}
            ]}
        })
    }

    fn behavior() -> serde_json::Value {
        serde_json::json!({
            "name": "user",
            "operations": ["a", "b"],
            "transitionMatrices": [[[0, 1]], [[1, 0]]]
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = test_app();
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_openapi_lists_control_plane_paths() {
        let (app, _) = test_app();
        let response = app.oneshot(get("/api-doc/openapi.json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response).await;
        assert!(body["paths"]["/run/{run}/start"].is_object());
        assert!(body["paths"]["/loadPathController/run/{run}/result"].is_object());
    }

    #[tokio::test]
    async fn test_driver_workload_lifecycle() {
        let (app, services) = test_app();

        let response = app
            .clone()
            .oneshot(post_json(
                "/driver/run/r1/workload/browse/users",
                serde_json::json!({"activeUsers": 1}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: BasicResponse = body_json(response).await;
        assert!(!body.is_success());

        let response = app
            .clone()
            .oneshot(post_json(
                "/driver/run/r1/workload/browse/initialize",
                serde_json::json!({
                    "hostname": "driver0",
                    "nodeNumber": 0,
                    "numNodes": 1,
                    "statsHostName": "master",
                    "statsPortNumber": 7500,
                    "runName": "r1",
                    "workload": workload(),
                    "behaviorSpecs": [behavior()]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(post_json(
                "/driver/run/r1/workload/browse/users",
                serde_json::json!({"activeUsers": 11}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(post_json(
                "/driver/run/r1/workload/browse/users",
                serde_json::json!({"activeUsers": 4}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(services.nodes.workload("r1", "browse").unwrap().active_users(), 4);

        let response = app
            .oneshot(post_json("/driver/run/r1/workload/browse/stop", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(services.nodes.workload("r1", "browse").unwrap().active_users(), 0);
    }

    #[tokio::test]
    async fn test_run_routes() {
        let (app, _) = test_app();
        let config = serde_json::json!({
            "name": "r1",
            "hosts": ["driver1"],
            "workloads": [workload()],
            "behaviorSpecs": [behavior()]
        });

        let response = app.clone().oneshot(post_json("/run/r1", config.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.clone().oneshot(post_json("/run/r1", config)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app.clone().oneshot(get("/run/r1/state")).await.unwrap();
        let body: serde_json::Value = body_json(response).await;
        assert_eq!(body["state"], "PENDING");

        let response = app.clone().oneshot(get("/run/r1/isStarted")).await.unwrap();
        let body: serde_json::Value = body_json(response).await;
        assert_eq!(body["isStarted"], false);

        let response = app
            .clone()
            .oneshot(post_json("/run/r1/start", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app.clone().oneshot(get("/run/r1/users")).await.unwrap();
        let body: serde_json::Value = body_json(response).await;
        assert_eq!(body["workloadActiveUsers"]["browse"], 0);

        let response = app.oneshot(get("/run/ghost")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_stats_routes() {
        let (app, _) = test_app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/stats/initialize/run/r1",
                serde_json::json!({
                    "hosts": ["driver0"],
                    "statsOutputDirName": "",
                    "workloadNameToNumTargetsMap": {"browse": 1}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(post_json(
                "/stats/run/r1",
                serde_json::json!({
                    "workloadName": "browse",
                    "targetName": "all",
                    "hostName": "driver0",
                    "statsIntervalSpecName": "steady",
                    "intervalName": "only",
                    "intervalStartTime": 1000,
                    "intervalEndTime": 31000,
                    "startActiveUsers": 10,
                    "endActiveUsers": 10
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(get(
                "/stats/run/r1/workload/browse/specName/steady/intervalName/only/rollup",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response).await;
        assert_eq!(body["numSamplesExpected"], 1);
        assert_eq!(body["numSamplesReceived"], 1);
        assert_eq!(body["rollup"]["intervalDurationSec"], 30.0);

        let response = app
            .oneshot(post_json("/stats/run/ghost", serde_json::json!({
                "workloadName": "browse",
                "targetName": "all",
                "statsIntervalSpecName": "steady"
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_controller_routes() {
        let (app, services) = test_app();
        let local = services
            .controllers
            .owned_controller("r1", rampart_core::ControllerPolicy::AllPass)
            .unwrap();
        let (watcher, mut verdicts) = rampart_core::load_path::ChannelWatcher::new();
        local
            .register_interval_result_callback("lp1", std::sync::Arc::new(watcher))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                "/loadPathController/run/r1/result",
                serde_json::json!({"loadPathName": "lp1", "intervalName": "QOS-1", "passed": true}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let verdict = verdicts.recv().await.unwrap();
        assert!(verdict.passed);

        let response = app
            .oneshot(post_json(
                "/loadPathController/run/r1/loadPath/lp1/notify",
                serde_json::json!({"loadPathName": "lp1", "intervalName": "QOS-1", "passed": true}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
