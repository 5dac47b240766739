//! Error taxonomy for the controller.
//!
//! Every fallible internal operation returns a typed error; handlers convert the
//! final `Result` into an HTTP response at the edge via `IntoResponse`. See the
//! error handling design notes for the mapping from variant to HTTP status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::capability::ValidationError;

/// Top-level controller error, covering every HTTP-surfaced failure mode.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid capability: {0}")]
    InvalidCapability(#[from] ValidationError),

    #[error("worker not registered: {worker_id}")]
    WorkerNotRegistered { worker_id: String },

    #[error("no worker available for capability {capability}")]
    NoWorkerAvailable { capability: String },

    #[error("missing or invalid peer certificate")]
    Unauthenticated,

    #[error("policy denied the request")]
    PolicyDenied,

    #[error("malformed request body: {0}")]
    MalformedBody(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    /// Stable wire error code, distinct from the HTTP status (which is informational
    /// framing; the `error` field is what clients branch on).
    fn error_kind(&self) -> &'static str {
        match self {
            ControllerError::InvalidCapability(_) => "invalid_capability",
            ControllerError::WorkerNotRegistered { .. } => "worker_not_registered",
            ControllerError::NoWorkerAvailable { .. } => "no_worker_available",
            ControllerError::Unauthenticated => "unauthenticated",
            ControllerError::PolicyDenied => "policy_denied",
            ControllerError::MalformedBody(_) => "malformed_body",
            ControllerError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ControllerError::InvalidCapability(_) => StatusCode::BAD_REQUEST,
            ControllerError::WorkerNotRegistered { .. } => StatusCode::NOT_FOUND,
            ControllerError::NoWorkerAvailable { .. } => StatusCode::NOT_FOUND,
            ControllerError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ControllerError::PolicyDenied => StatusCode::FORBIDDEN,
            ControllerError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            ControllerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ControllerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.error_kind();

        let body = match &self {
            ControllerError::InvalidCapability(ValidationError::BadField { field, .. }) => json!({
                "error": kind,
                "field": field,
            }),
            ControllerError::InvalidCapability(ValidationError::Duplicate { key }) => json!({
                "error": kind,
                "key": key,
            }),
            ControllerError::WorkerNotRegistered { worker_id } => json!({
                "error": kind,
                "worker_id": worker_id,
            }),
            ControllerError::NoWorkerAvailable { capability } => json!({
                "error": kind,
                "capability": capability,
            }),
            ControllerError::Internal(_) => {
                let correlation_id = uuid::Uuid::new_v4();
                tracing::error!(error = %self, %correlation_id, "internal error handling request");
                return (
                    status,
                    Json(json!({ "error": kind, "correlation_id": correlation_id.to_string() })),
                )
                    .into_response();
            }
            _ => json!({ "error": kind }),
        };

        (status, Json(body)).into_response()
    }
}
