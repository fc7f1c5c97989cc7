// Telemetry Module
//
// Console tracing setup shared by Rampart binaries. Configuration is
// environment driven (RUST_LOG / LOG_LEVEL).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name reported in the startup event
    pub service_name: String,

    /// Service version
    pub service_version: Option<String>,

    /// Whether to emit console logs
    pub enable_console: bool,

    /// Log filter directive (e.g., "info,rampart_driver=debug")
    pub log_filter: Option<String>,

    /// Include span targets in console output
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "rampart".to_string(),
            service_version: None,
            enable_console: true,
            log_filter: None,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("RAMPART_SERVICE_NAME")
                .unwrap_or_else(|_| "rampart".to_string()),
            service_version: None,
            enable_console: std::env::var("RAMPART_LOG_CONSOLE")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            with_target: true,
        }
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Effective filter directive, falling back to `info`
    pub fn filter_directive(&self) -> String {
        self.log_filter
            .clone()
            .unwrap_or_else(|| "info".to_string())
    }
}

/// Initialize the global tracing subscriber
///
/// Call once at process start. An invalid filter directive falls back to `info`.
pub fn init_telemetry(config: TelemetryConfig) {
    let filter = EnvFilter::try_new(config.filter_directive())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = if config.enable_console {
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(config.with_target)
                .with_filter(filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry().with(console_layer).init();

    tracing::info!(
        service = %config.service_name,
        version = config.service_version.as_deref().unwrap_or("unknown"),
        "telemetry initialized"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "rampart");
        assert!(config.enable_console);
        assert!(config.log_filter.is_none());
        assert_eq!(config.filter_directive(), "info");
    }

    #[test]
    fn test_builder() {
        let config = TelemetryConfig::default()
            .with_service_name("rampart-driver")
            .with_log_filter("debug");
        assert_eq!(config.service_name, "rampart-driver");
        assert_eq!(config.filter_directive(), "debug");
    }
}
