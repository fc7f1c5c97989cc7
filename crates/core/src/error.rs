// Error types for run, workload and driver-node operations

use thiserror::Error;

use crate::lifecycle::LifecycleState;
use crate::transport::TransportError;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors surfaced by run/workload orchestration
///
/// Everything except `Transport` is a recoverable run-state conflict and maps
/// to HTTP 409 at the API boundary.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Configuration is missing or inconsistent
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Run has not been added
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Run with this name is already known
    #[error("Run already exists: {0}")]
    RunExists(String),

    /// Workload is not part of the run
    #[error("Workload {workload} not found in run {run}")]
    WorkloadNotFound { run: String, workload: String },

    /// Lifecycle transition is not allowed from the current state
    #[error("{entity} {name} cannot move from {from} to {to}")]
    InvalidState {
        entity: &'static str,
        name: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    /// More active users requested than the workload allows
    #[error("Requested {requested} active users but maximum is {max}")]
    TooManyUsers { requested: u64, max: u64 },

    /// Behavior construction failed
    #[error("Behavior error: {0}")]
    Behavior(#[from] crate::behavior::BehaviorError),

    /// Peer communication failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl DriverError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        DriverError::Configuration(msg.into())
    }

    pub fn workload_not_found(run: impl Into<String>, workload: impl Into<String>) -> Self {
        DriverError::WorkloadNotFound {
            run: run.into(),
            workload: workload.into(),
        }
    }

    /// Whether this error is a configuration problem (fatal at initialize)
    pub fn is_configuration(&self) -> bool {
        matches!(self, DriverError::Configuration(_) | DriverError::Behavior(_))
    }
}
