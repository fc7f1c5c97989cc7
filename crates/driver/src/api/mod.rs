// HTTP API routes
//
// One submodule per role, each with its own AppState.

pub mod common;
pub mod driver;
pub mod load_path;
pub mod run;
pub mod stats;

pub use common::{ApiError, ApiResult};
