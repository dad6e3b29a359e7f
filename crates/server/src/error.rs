use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use leafline_pipeline::PipelineError;
use leafline_store::StoreError;

/// Errors that can occur when running the Leafline server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A configuration error. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error (e.g. binding the listener).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The request is missing its tenant header.
    #[error("missing X-Tenant-Id header")]
    MissingTenant,

    /// The addressed resource does not exist under this tenant.
    #[error("not found: {0}")]
    NotFound(String),

    /// A pipeline-level error surfaced through the API.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// A store-level error surfaced through the API.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::MissingTenant => (StatusCode::BAD_REQUEST, self.to_string()),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            Self::Config(_) | Self::Io(_) | Self::Pipeline(_) | Self::Store(_) => {
                // Internal details are logged, not leaked to the caller.
                tracing::error!(error = %self, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };
        let body = serde_json::json!({ "success": false, "error": message });
        (status, axum::Json(body)).into_response()
    }
}
