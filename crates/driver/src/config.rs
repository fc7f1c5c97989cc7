// Driver process configuration
//
// Read once at startup from the environment (after dotenvy loads .env).
// Run, workload and behavior configuration arrives later over the REST API.

use std::net::SocketAddr;
use std::time::Duration;

use rampart_core::DEFAULT_PEER_PORT;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

/// Configuration for one driver process
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Address the HTTP server binds to
    pub bind_addr: SocketAddr,
    /// Name peers use to reach this process
    pub hostname: String,
    /// Port assumed for host entries that carry none
    pub peer_port: u16,
    /// Timeout for every peer request
    pub http_timeout: Duration,
    /// Service time of the built-in dry-run executor
    pub dry_run_service_time: Duration,
    /// Whether `/driver/exit/{run}` ends the process
    pub exit_on_shutdown: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PEER_PORT)),
            hostname: "localhost".to_string(),
            peer_port: DEFAULT_PEER_PORT,
            http_timeout: Duration::from_millis(30_000),
            dry_run_service_time: Duration::from_millis(100),
            exit_on_shutdown: true,
        }
    }
}

impl DriverConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bind_addr = parse_var("RAMPART_BIND_ADDR")?.unwrap_or(defaults.bind_addr);
        let peer_port = parse_var("RAMPART_PEER_PORT")?.unwrap_or(defaults.peer_port);
        let hostname = std::env::var("RAMPART_HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or(defaults.hostname);
        let http_timeout = parse_var("RAMPART_HTTP_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.http_timeout);
        let dry_run_service_time = parse_var("RAMPART_DRY_RUN_SERVICE_TIME_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.dry_run_service_time);
        let exit_on_shutdown =
            parse_var("RAMPART_EXIT_ON_SHUTDOWN")?.unwrap_or(defaults.exit_on_shutdown);

        Ok(Self {
            bind_addr,
            hostname,
            peer_port,
            http_timeout,
            dry_run_service_time,
            exit_on_shutdown,
        })
    }

    /// How peers address this process ("hostname:port")
    pub fn self_host(&self) -> String {
        format!("{}:{}", self.hostname, self.bind_addr.port())
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_exit_on_shutdown(mut self, exit: bool) -> Self {
        self.exit_on_shutdown = exit;
        self
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.bind_addr.port(), 7500);
        assert_eq!(config.peer_port, 7500);
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.self_host(), "localhost:7500");
    }

    #[test]
    fn test_builder() {
        let config = DriverConfig::default()
            .with_hostname("driver3")
            .with_exit_on_shutdown(false);
        assert_eq!(config.self_host(), "driver3:7500");
        assert!(!config.exit_on_shutdown);
    }

    #[test]
    fn test_invalid_value_rejected() {
        // Unique variable name so parallel tests don't race on it
        std::env::set_var("RAMPART_TEST_BAD_PORT", "not-a-port");
        let err = parse_var::<u16>("RAMPART_TEST_BAD_PORT").unwrap_err();
        assert!(err.to_string().contains("not-a-port"));
        std::env::remove_var("RAMPART_TEST_BAD_PORT");
        assert!(parse_var::<u16>("RAMPART_TEST_BAD_PORT").unwrap().is_none());
    }
}
