//! Core types for the transit ETA learner.
//!
//! This crate holds the shared vocabulary of the system:
//! - segment identity and reference data
//! - the 192 time bins (weekday/weekend x 15-minute slots)
//! - per-(segment, bin) running statistics rows
//! - append-only rejection, idempotency and rate-limit records
//! - submission and prediction contracts with structural validation

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod bin;
mod error;
mod prediction;
mod records;
mod segment;
mod stats;
mod submission;

pub use bin::{DayType, InvalidTimeBin, TimeBin, BINS_PER_DAY, BIN_MINUTES, TOTAL_BINS};
pub use error::ValidationError;
pub use prediction::{ConfidenceLabel, Prediction, PredictionQuery};
pub use records::{
    IdempotencyRecord, RateLimitBucket, RejectionReason, RejectionRecord, UnknownRejectionReason,
};
pub use segment::{SegmentKey, SegmentReference};
pub use stats::SegmentBinStats;
pub use submission::{
    OutcomeStatus, RideSubmission, SegmentObservation, SegmentOutcome, SubmissionResponse,
    DEVICE_BUCKET_HEX_LEN,
};
