//! Service error taxonomy and HTTP mapping.
//!
//! Every fallible operation in the crate surfaces one of these kinds. The
//! HTTP layer renders them as a JSON payload carrying a machine-readable
//! `error` label, a human message, and the request id assigned by the
//! request-id middleware.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

tokio::task_local! {
    /// Request id for the in-flight request, scoped by the request-id
    /// middleware so error rendering can see it without threading it
    /// through every handler.
    pub static REQUEST_ID: Uuid;
}

/// Returns the current request id, if rendering inside a request scope.
pub fn current_request_id() -> Option<Uuid> {
    REQUEST_ID.try_with(|id| *id).ok()
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Malformed body or query parameters.
    #[error("{0}")]
    Validation(String),

    /// Unknown code, mapping, or job.
    #[error("{0}")]
    NotFound(String),

    /// Fixed-window limiter tripped.
    #[error("{message}")]
    RateLimited { message: String, retry_after_secs: u64 },

    /// Pipeline deadline expired.
    #[error("{0}")]
    Deadline(String),

    /// External model or upstream WHO service failure.
    #[error("upstream service error: {0}")]
    Upstream(String),

    /// Database failure; transient errors are not retried here.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Anything unexpected.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable label for the error payload.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::Deadline(_) => "mapping_timeout",
            Self::Upstream(_) => "upstream_unavailable",
            Self::Database(_) => "database_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Deadline(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<&'static str>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = match &self {
            Self::RateLimited { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        };
        let suggestion = match &self {
            Self::Deadline(_) => {
                Some("use POST /mapping/batch/async for long-running translations")
            }
            _ => None,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, label = self.label(), "request failed");
        }

        let body = ErrorBody {
            error: self.label(),
            message: self.to_string(),
            request_id: current_request_id(),
            retry_after,
            suggestion,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        assert_eq!(AppError::Validation("x".into()).label(), "validation_error");
        assert_eq!(AppError::NotFound("x".into()).label(), "not_found");
        assert_eq!(AppError::Deadline("x".into()).label(), "mapping_timeout");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            AppError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::RateLimited {
                message: "slow down".into(),
                retry_after_secs: 30
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::Deadline("timeout".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            AppError::Upstream("model".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
