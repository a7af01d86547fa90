//! Error types for eta-daemon

use axum::{
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use eta_engine::EngineError;
use eta_storage::StorageError;
use serde::Serialize;
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server startup error
    #[error("Server error: {0}")]
    Server(String),

    /// Reference seeding error
    #[error("Seed error: {0}")]
    Seed(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Engine construction error
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// API-specific errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request
    #[error("{message}")]
    InvalidRequest {
        message: String,
        details: Option<serde_json::Value>,
    },

    /// Resource not found
    #[error("{0}")]
    NotFound(String),

    /// Idempotency key reused with another body
    #[error("{0}")]
    Conflict(String),

    /// Token bucket exhausted
    #[error("rate limit exceeded")]
    RateLimited {
        limit: u32,
        reset_at: DateTime<Utc>,
        retry_after_secs: u64,
    },

    /// Storage contended past the retry budget; safe to retry
    #[error("{0}")]
    StorageBusy(String),

    /// Internal error
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ApiError::InvalidRequest {
            message: message.into(),
            details: None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest { .. } => "invalid_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::StorageBusy(_) => "storage_busy",
            ApiError::Internal(_) => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::StorageBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Malformed(validation) => ApiError::invalid(validation.to_string()),
            EngineError::RateLimited {
                limit,
                reset_at,
                retry_after_secs,
                ..
            } => ApiError::RateLimited {
                limit,
                reset_at,
                retry_after_secs,
            },
            EngineError::Conflict { .. } => ApiError::Conflict(err.to_string()),
            EngineError::SegmentNotFound(_) => ApiError::NotFound(err.to_string()),
            EngineError::TransientStorage { .. } => ApiError::StorageBusy(err.to_string()),
            ref other if other.is_contention() => ApiError::StorageBusy(err.to_string()),
            other => {
                tracing::error!(error = %other, "request failed");
                ApiError::Internal("internal server error".to_string())
            }
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let details = match &self {
            ApiError::InvalidRequest { details, .. } => details.clone(),
            ApiError::RateLimited {
                retry_after_secs, ..
            } => Some(serde_json::json!({ "retry_after_secs": retry_after_secs })),
            ApiError::StorageBusy(_) => Some(serde_json::json!({ "retryable": true })),
            _ => None,
        };

        let body = ErrorResponse {
            error: code.to_string(),
            message: self.to_string(),
            details,
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited {
            limit,
            reset_at,
            retry_after_secs,
        } = self
        {
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
            headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limit));
            headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(0u32));
            headers.insert(RATE_LIMIT_RESET, HeaderValue::from(reset_at.timestamp()));
        }
        response
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type alias for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
