//! Immutable engine configuration
//!
//! Built once at start-up and handed to every component by reference. All
//! fields have serde defaults so partial files and environment overlays work.

use crate::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub time_bins: TimeBinConfig,
}

impl EngineConfig {
    /// Reject values that would make the numerics meaningless.
    pub fn validate(&self) -> EngineResult<()> {
        let l = &self.learning;
        let v = &self.validation;
        let r = &self.rate_limit;
        let checks: [(bool, &str); 12] = [
            (l.prior_strength > 0.0, "learning.prior_strength must be positive"),
            (l.ema_half_life_days > 0.0, "learning.ema_half_life_days must be positive"),
            (l.outlier_sigma > 0.0, "learning.outlier_sigma must be positive"),
            (l.min_sigma_sec >= 0.0, "learning.min_sigma_sec must not be negative"),
            (l.stale_after_days > 0, "learning.stale_after_days must be positive"),
            (v.min_duration_sec > 0.0, "validation.min_duration_sec must be positive"),
            (
                v.max_duration_sec > v.min_duration_sec,
                "validation.max_duration_sec must exceed min_duration_sec",
            ),
            (
                (0.0..=1.0).contains(&v.min_mapmatch_confidence),
                "validation.min_mapmatch_confidence must be within [0, 1]",
            ),
            (v.max_segments_per_ride > 0, "validation.max_segments_per_ride must be positive"),
            (r.capacity > 0, "rate_limit.capacity must be positive"),
            (r.refill_per_hour > 0.0, "rate_limit.refill_per_hour must be positive"),
            (self.retry.max_attempts > 0, "retry.max_attempts must be positive"),
        ];
        if let Some((_, message)) = checks.iter().find(|(ok, _)| !ok) {
            return Err(EngineError::InvalidConfig((*message).to_string()));
        }
        if self.time_bins.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(EngineError::InvalidConfig(
                "time_bins.utc_offset_minutes must be within one day".to_string(),
            ));
        }
        if self.idempotency.max_key_len == 0 || self.idempotency.ttl_hours == 0 {
            return Err(EngineError::InvalidConfig(
                "idempotency.max_key_len and ttl_hours must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Learning and prediction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Prior strength `n0` in the blend weight `n / (n + n0)`.
    #[serde(default = "default_prior_strength")]
    pub prior_strength: f64,
    #[serde(default = "default_ema_half_life_days")]
    pub ema_half_life_days: f64,
    /// Outlier threshold in standard deviations.
    #[serde(default = "default_outlier_sigma")]
    pub outlier_sigma: f64,
    /// Rows with this many samples or fewer admit everything.
    #[serde(default = "default_outlier_min_samples")]
    pub outlier_min_samples: u64,
    /// Rows whose sigma is below this have no usable spread; the outlier
    /// test admits every sample against them.
    #[serde(default = "default_min_sigma_sec")]
    pub min_sigma_sec: f64,
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: u32,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            prior_strength: default_prior_strength(),
            ema_half_life_days: default_ema_half_life_days(),
            outlier_sigma: default_outlier_sigma(),
            outlier_min_samples: default_outlier_min_samples(),
            min_sigma_sec: default_min_sigma_sec(),
            stale_after_days: default_stale_after_days(),
        }
    }
}

impl LearningConfig {
    pub fn ema_half_life(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.ema_half_life_days * 86_400_000.0) as i64)
    }
}

/// Per-segment plausibility checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_min_duration_sec")]
    pub min_duration_sec: f64,
    #[serde(default = "default_max_duration_sec")]
    pub max_duration_sec: f64,
    #[serde(default = "default_max_observation_age_hours")]
    pub max_observation_age_hours: u32,
    #[serde(default = "default_max_future_skew_secs")]
    pub max_future_skew_secs: u32,
    #[serde(default = "default_min_mapmatch_confidence")]
    pub min_mapmatch_confidence: f64,
    #[serde(default = "default_max_segments_per_ride")]
    pub max_segments_per_ride: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_duration_sec: default_min_duration_sec(),
            max_duration_sec: default_max_duration_sec(),
            max_observation_age_hours: default_max_observation_age_hours(),
            max_future_skew_secs: default_max_future_skew_secs(),
            min_mapmatch_confidence: default_min_mapmatch_confidence(),
            max_segments_per_ride: default_max_segments_per_ride(),
        }
    }
}

/// Token bucket parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rate_capacity")]
    pub capacity: u32,
    #[serde(default = "default_refill_per_hour")]
    pub refill_per_hour: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_rate_capacity(),
            refill_per_hour: default_refill_per_hour(),
        }
    }
}

impl RateLimitConfig {
    /// Tokens added per second.
    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_hour / 3600.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u32,
    #[serde(default = "default_max_key_len")]
    pub max_key_len: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            max_key_len: default_max_key_len(),
        }
    }
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.ttl_hours))
    }
}

/// Backoff for transactions that hit storage contention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Random jitter as a fraction of the delay (0.1 = +/-10%).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Reference timezone for bin resolution, as a fixed UTC offset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeBinConfig {
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

fn default_prior_strength() -> f64 {
    20.0
}

fn default_ema_half_life_days() -> f64 {
    30.0
}

fn default_outlier_sigma() -> f64 {
    3.0
}

fn default_outlier_min_samples() -> u64 {
    5
}

fn default_min_sigma_sec() -> f64 {
    1e-6
}

fn default_stale_after_days() -> u32 {
    90
}

fn default_min_duration_sec() -> f64 {
    1.0
}

fn default_max_duration_sec() -> f64 {
    7200.0
}

fn default_max_observation_age_hours() -> u32 {
    168
}

fn default_max_future_skew_secs() -> u32 {
    60
}

fn default_min_mapmatch_confidence() -> f64 {
    0.7
}

fn default_max_segments_per_ride() -> usize {
    50
}

fn default_true() -> bool {
    true
}

fn default_rate_capacity() -> u32 {
    500
}

fn default_refill_per_hour() -> f64 {
    500.0
}

fn default_ttl_hours() -> u32 {
    24
}

fn default_max_key_len() -> usize {
    128
}

fn default_retry_attempts() -> u32 {
    4
}

fn default_initial_delay_ms() -> u64 {
    20
}

fn default_max_delay_ms() -> u64 {
    400
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}
