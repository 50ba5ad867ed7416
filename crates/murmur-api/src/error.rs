use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use murmur_core::PipelineError;

/// Maps pipeline errors onto HTTP responses with a JSON `error` body.
#[derive(Debug)]
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::NotFound | PipelineError::UserNotFound => StatusCode::NOT_FOUND,
            PipelineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PipelineError::Storage(e) => {
                error!("Storage error: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        // Storage details stay in the logs
        let message = match &self.0 {
            PipelineError::Storage(_) => "internal error".to_string(),
            other => other.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
