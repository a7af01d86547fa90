use thiserror::Error;

/// Structural problems with a request. Any of these fails the request
/// before rate limiting or idempotency are consulted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("direction_id must be 0 or 1, got {0}")]
    InvalidDirection(u8),

    #[error("device_bucket must be a 64-character hex digest")]
    InvalidDeviceBucket,

    #[error("submission must contain at least one segment")]
    NoSegments,

    #[error("too many segments ({count}), max is {max}")]
    TooManySegments { count: usize, max: usize },

    #[error("segment {index}: {field} must not be empty")]
    EmptySegmentField { index: usize, field: &'static str },

    #[error("segment {index}: duration_sec must be finite")]
    NonFiniteDuration { index: usize },

    #[error("segment {index}: dwell_sec must be finite and non-negative")]
    InvalidDwell { index: usize },

    #[error("segment {index}: mapmatch_confidence {value} outside [0, 1]")]
    ConfidenceOutOfRange { index: usize, value: f64 },

    #[error("idempotency key must be 1..={max_len} printable ASCII characters")]
    InvalidIdempotencyKey { max_len: usize },
}
