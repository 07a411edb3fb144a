//! HTTP error mapping.
//!
//! Every error response has the shape
//! `{"error": {"code": "authentication_required", "message": "..."}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use herald_core::HubError;
use serde::Serialize;
use thiserror::Error;

/// Structured JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Machine-readable code and human-readable message.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Admission or upgrade error from the hub.
    #[error(transparent)]
    Hub(#[from] HubError),

    /// Malformed query or body.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Client announced an incompatible protocol version.
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(String),
}

impl ApiError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Hub(HubError::AuthenticationRequired) => "authentication_required",
            ApiError::Hub(HubError::UpgradeFailed(_)) => "upgrade_failed",
            ApiError::Hub(HubError::ShuttingDown) => "shutting_down",
            ApiError::Hub(HubError::CapacityExceeded { .. }) => "capacity_exceeded",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::UnsupportedVersion(_) => "unsupported_version",
        }
    }

    /// HTTP status for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Hub(HubError::AuthenticationRequired) => StatusCode::UNAUTHORIZED,
            ApiError::Hub(HubError::UpgradeFailed(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Hub(HubError::ShuttingDown | HubError::CapacityExceeded { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnsupportedVersion(_) => StatusCode::UPGRADE_REQUIRED,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}
