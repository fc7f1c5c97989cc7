// Rampart driver server
//
// Every host in a benchmark runs this process. Which roles it plays (driver
// node, run host, stats host, controller owner) follows from the runs posted to it.

use anyhow::{Context, Result};
use rampart_core::telemetry::{init_telemetry, TelemetryConfig};
use rampart_driver::{app, DriverConfig, Services};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "info,rampart_driver=debug")
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.service_name == "rampart" {
        telemetry_config.service_name = "rampart-driver".to_string();
    }
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("info,rampart_driver=debug".to_string());
    }
    telemetry_config.service_version = Some(env!("CARGO_PKG_VERSION").to_string());
    init_telemetry(telemetry_config);

    let config = DriverConfig::from_env().context("Invalid driver configuration")?;
    tracing::info!(
        bind_addr = %config.bind_addr,
        hostname = %config.hostname,
        peer_port = config.peer_port,
        timeout_ms = config.http_timeout.as_millis() as u64,
        "rampart-driver starting"
    );

    let services = Services::new(&config).context("Failed to create peer HTTP client")?;
    let mut exit = services.nodes.exit_signal();
    let app = app(&services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("HTTP server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received shutdown signal");
                }
                _ = exit.wait_for(|exit| *exit) => {
                    tracing::info!("Run requested driver exit");
                }
            }
        })
        .await
        .context("Server error")?;

    tracing::info!("Driver shutdown complete");
    Ok(())
}
