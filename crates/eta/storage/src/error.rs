use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Transient contention (lock held by another writer, pool exhausted).
    /// Safe to retry the whole transaction.
    #[error("storage busy: {0}")]
    Busy(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}
