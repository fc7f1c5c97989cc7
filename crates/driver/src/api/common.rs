// Common response handling for the control-plane API
//
// Every endpoint answers with the {status, message} envelope. Domain errors
// are run-state conflicts (409); failures talking to a peer are 502.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rampart_core::{BasicResponse, DriverError};

/// Error returned by handlers
#[derive(Debug)]
pub struct ApiError(pub DriverError);

impl From<DriverError> for ApiError {
    fn from(err: DriverError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            DriverError::Transport(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(status = status.as_u16(), error = %self.0, "request rejected");
        (status, Json(BasicResponse::failure(self.0.to_string()))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// 200 with a success envelope
pub fn success(message: impl Into<String>) -> Json<BasicResponse> {
    Json(BasicResponse::success(message))
}
