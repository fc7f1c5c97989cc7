//! Run and workload lifecycle
//!
//! Both runs and workloads move through the same five states. Transitions
//! only ever go forward and are driven by explicit control calls.

use std::fmt;

use serde::{Deserialize, Serialize};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use crate::error::{DriverError, Result};

/// Lifecycle state shared by runs and workloads
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    #[default]
    Pending,
    Initialized,
    Running,
    Stopping,
    Completed,
}

impl LifecycleState {
    /// Whether moving to `next` keeps the lifecycle strictly monotonic
    pub fn can_advance_to(self, next: LifecycleState) -> bool {
        next > self
    }

    /// Check a transition, producing a 409-class error when it goes backwards
    pub fn advance(
        &mut self,
        next: LifecycleState,
        entity: &'static str,
        name: &str,
    ) -> Result<()> {
        if !self.can_advance_to(next) {
            return Err(DriverError::InvalidState {
                entity,
                name: name.to_string(),
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    pub fn is_active(self) -> bool {
        matches!(self, LifecycleState::Initialized | LifecycleState::Running)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Pending => "PENDING",
            LifecycleState::Initialized => "INITIALIZED",
            LifecycleState::Running => "RUNNING",
            LifecycleState::Stopping => "STOPPING",
            LifecycleState::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}
