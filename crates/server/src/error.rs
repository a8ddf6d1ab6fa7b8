//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("node {0} is not connected")]
    NodeNotConnected(i64),

    #[error("command timed out after {0:?}")]
    CommandTimeout(std::time::Duration),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("metadata error: {0}")]
    Metadata(#[from] meridian_metadata::MetadataError),

    #[error("core error: {0}")]
    Core(#[from] meridian_core::Error),

    #[error("signer error: {0}")]
    Signer(#[from] meridian_signer::SignerError),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::NodeNotConnected(_) => "node_not_connected",
            Self::CommandTimeout(_) => "command_timeout",
            Self::Internal(_) => "internal_error",
            Self::Metadata(_) => "metadata_error",
            Self::Core(_) => "core_error",
            Self::Signer(_) => "signer_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        use meridian_metadata::MetadataError;

        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NodeNotConnected(_) => StatusCode::CONFLICT,
            Self::CommandTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Metadata(e) => match e {
                MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
                MetadataError::AlreadyExists(_) => StatusCode::CONFLICT,
                MetadataError::Constraint(_) => StatusCode::CONFLICT,
                MetadataError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
                MetadataError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(_) => StatusCode::BAD_REQUEST,
            Self::Signer(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<crate::stream::CommandError> for ApiError {
    fn from(err: crate::stream::CommandError) -> Self {
        use crate::stream::{CommandError, PushError};

        match err {
            CommandError::Push(PushError::NotConnected(node_id)) => Self::NodeNotConnected(node_id),
            CommandError::Push(PushError::QueueFull(node_id)) => {
                Self::Conflict(format!("command queue of node {node_id} is full"))
            }
            CommandError::Timeout(after) => Self::CommandTimeout(after),
            CommandError::Dropped => Self::Internal("command waiter was dropped".to_string()),
            CommandError::Encode(e) => Self::BadRequest(format!("invalid command payload: {e}")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
