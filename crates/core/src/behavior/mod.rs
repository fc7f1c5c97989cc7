//! Simulated-user behaviors
//!
//! A user walks a [`BehaviorSpec`]'s transition matrices. After each operation
//! the operation's [`TransitionChooserKind`] looks at what the user has learned
//! about the system under test ([`ProviderState`]) and picks which matrix the
//! next operation is drawn from. Operations that join an auction start a
//! sub-behavior that runs concurrently under the user until a chooser stops it.

pub mod chooser;
pub mod providers;
pub mod registry;
pub mod spec;
pub mod strategy;
pub mod tree;

use thiserror::Error;
use uuid::Uuid;

pub use chooser::{ChooserContext, TransitionChooserKind, TransitionChooserResponse};
pub use providers::{
    BidSnapshot, BiddingState, ItemSnapshot, ProviderState, ProviderUpdate, UserProfile,
};
pub use registry::BehaviorSpecRegistry;
pub use spec::{BehaviorSpec, NO_ASYNC_BEHAVIOR};
pub use strategy::{BidStrategy, BidStrategyKind, RandomBidStrategy};
pub use tree::{BehaviorTree, ScheduledOperation, Transition};

pub type BehaviorId = Uuid;

#[derive(Debug, Error)]
pub enum BehaviorError {
    #[error("Invalid behavior spec {spec}: {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("Unknown behavior spec: {0}")]
    UnknownSpec(String),

    #[error("Behavior spec {spec} has no matrix {matrix} for operation {operation}")]
    NoTransition {
        spec: String,
        operation: usize,
        matrix: usize,
    },
}

impl BehaviorError {
    pub fn invalid_spec(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        BehaviorError::InvalidSpec {
            spec: spec.into(),
            reason: reason.into(),
        }
    }
}
