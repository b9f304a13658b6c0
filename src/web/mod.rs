//! HTTP admin surface.
//!
//! [`WebError`] is the boundary error type: every handler returns it, and it
//! renders as a JSON `{error, code}` body with a status derived from the
//! underlying [`ShardError`].

pub mod routes;

use crate::core::ShardError;
use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde::Serialize;

pub use routes::build_router;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub enum WebError {
    Shard(ShardError),
    Input(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<ShardError> for WebError {
    fn from(err: ShardError) -> Self {
        WebError::Shard(err)
    }
}

impl WebError {
    fn parts(self) -> (StatusCode, String, &'static str) {
        match self {
            WebError::Shard(err) => {
                let (status, code) = match &err {
                    ShardError::InvalidTenantKey(_) => (StatusCode::BAD_REQUEST, "invalid_tenant"),
                    ShardError::Config(_) => (StatusCode::BAD_REQUEST, "invalid_config"),
                    ShardError::CrossShardAccess { .. } => {
                        (StatusCode::FORBIDDEN, "cross_shard_access")
                    }
                    ShardError::UnknownShard(_)
                    | ShardError::MigrationNotFound(_)
                    | ShardError::TableNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                    ShardError::StaleWrite { .. } => (StatusCode::CONFLICT, "stale_write"),
                    ShardError::InvalidState(_)
                    | ShardError::VerificationMismatch { .. }
                    | ShardError::Cancelled => (StatusCode::CONFLICT, "conflict"),
                    ShardError::ShardUnavailable { .. } | ShardError::Timeout { .. } => {
                        (StatusCode::SERVICE_UNAVAILABLE, "shard_unavailable")
                    }
                    ShardError::Backend(_) | ShardError::Io(_) | ShardError::LockError(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                    }
                };
                (status, err.to_string(), code)
            }
            WebError::Input(msg) => (StatusCode::BAD_REQUEST, msg, "input_error"),
            WebError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "not_found"),
            WebError::Conflict(msg) => (StatusCode::CONFLICT, msg, "conflict"),
            WebError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, "internal_error"),
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, message, code) = self.parts();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), code, error = %message, "request failed");
        }

        let body = Json(ErrorResponse {
            error: message,
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WebError>;
