//! Learning engine for crowdsourced transit segment travel times.
//!
//! Write path: a ride submission passes structural validation, the per-device
//! rate limiter and the idempotency guard, then each segment observation is
//! resolved into a time bin, checked for plausibility and against the outlier
//! filter, and folded into the online statistics for its (segment, bin). All
//! state changes for one submission commit in a single storage transaction.
//!
//! Read path: a prediction blends the learned duration with the scheduled one,
//! weighted by how many samples back it.
//!
//! Components take an immutable [`EngineConfig`] and an injected [`Clock`] at
//! construction; there is no global state.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod clock;
mod config;
pub mod coordinator;
mod engine;
mod error;
pub mod idempotency;
pub mod outlier;
pub mod predict;
pub mod rate_limit;
pub mod retry;
pub mod stats;
pub mod time_bin;
pub mod validate;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    EngineConfig, IdempotencyConfig, LearningConfig, RateLimitConfig, RetryConfig,
    TimeBinConfig, ValidationConfig,
};
pub use coordinator::{SubmissionCoordinator, SubmissionOutcome};
pub use engine::EtaEngine;
pub use error::{EngineError, EngineResult};
pub use idempotency::{IdempotencyCheck, IdempotencyGuard};
pub use outlier::{OutlierFilter, OutlierVerdict};
pub use predict::{BlendEstimate, BlendPredictor};
pub use rate_limit::{bucket_prefix, RateDecision, RateLimiter};
pub use retry::{with_retry, RetryPolicy};
pub use stats::{OnlineStatsStore, StatsUpdate};
pub use time_bin::TimeBinResolver;
pub use validate::ObservationValidator;
