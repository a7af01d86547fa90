//! Request-level errors for the learning engine
//!
//! Per-segment problems (bad duration, stale timestamp, outliers) are not
//! errors: they become [`eta_types::RejectionReason`] values in the response.
//! Everything here aborts the whole request.

use chrono::{DateTime, Utc};
use eta_storage::StorageError;
use eta_types::{SegmentKey, ValidationError};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Structurally invalid request, rejected before any state is touched.
    #[error("malformed request: {0}")]
    Malformed(#[from] ValidationError),

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited {
        limit: u32,
        remaining: u32,
        reset_at: DateTime<Utc>,
        retry_after_secs: u64,
    },

    /// Idempotency key reused with a different body.
    #[error("idempotency key {key:?} was already used with a different request body")]
    Conflict { key: String },

    /// Storage stayed contended through every retry. Safe to retry later
    /// with the same idempotency key.
    #[error("storage busy after {attempts} attempts: {message}")]
    TransientStorage { attempts: u32, message: String },

    #[error("segment not found: {0}")]
    SegmentNotFound(SegmentKey),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Unexpected storage failure. The transaction was rolled back.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// Transient contention worth another attempt inside the retry loop.
    pub fn is_contention(&self) -> bool {
        matches!(self, EngineError::Storage(err) if err.is_busy())
    }

    /// Idempotency key reused with a different body.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }

    /// Whether the client may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::TransientStorage { .. } | EngineError::RateLimited { .. }
        ) || self.is_contention()
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_busy_storage_is_contention() {
        assert!(EngineError::Storage(StorageError::Busy("locked".into())).is_contention());
        assert!(!EngineError::Storage(StorageError::Backend("disk".into())).is_contention());
        assert!(!EngineError::Conflict { key: "k".into() }.is_contention());
    }

    #[test]
    fn exhausted_retries_stay_retryable_for_clients() {
        let err = EngineError::TransientStorage {
            attempts: 4,
            message: "database is locked".into(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_contention());
        assert!(!EngineError::Conflict { key: "k".into() }.is_retryable());
    }
}
