//! Per-segment plausibility checks
//!
//! These run before the outlier filter, in a fixed order, and the first
//! failing check decides the reason. A failure rejects only that segment.
//! Reference lookups (`unknown_segment`) need storage and are applied by the
//! coordinator right after these.

use crate::config::ValidationConfig;
use chrono::{DateTime, Duration, Utc};
use eta_types::{RejectionReason, SegmentObservation};

#[derive(Debug, Clone)]
pub struct ObservationValidator {
    min_duration_sec: f64,
    max_duration_sec: f64,
    max_age: Duration,
    max_future_skew: Duration,
    min_mapmatch_confidence: f64,
}

impl ObservationValidator {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            min_duration_sec: config.min_duration_sec,
            max_duration_sec: config.max_duration_sec,
            max_age: Duration::hours(i64::from(config.max_observation_age_hours)),
            max_future_skew: Duration::seconds(i64::from(config.max_future_skew_secs)),
            min_mapmatch_confidence: config.min_mapmatch_confidence,
        }
    }

    pub fn check(
        &self,
        observation: &SegmentObservation,
        now: DateTime<Utc>,
    ) -> Result<(), RejectionReason> {
        let duration = observation.duration_sec;
        if !duration.is_finite() || duration <= 0.0 {
            return Err(RejectionReason::InvalidDuration);
        }
        if duration < self.min_duration_sec || duration > self.max_duration_sec {
            return Err(RejectionReason::ImplausibleDuration);
        }
        if observation.observed_at > now + self.max_future_skew {
            return Err(RejectionReason::FutureTimestamp);
        }
        if observation.observed_at < now - self.max_age {
            return Err(RejectionReason::StaleTimestamp);
        }
        if observation.mapmatch_confidence < self.min_mapmatch_confidence {
            return Err(RejectionReason::LowMapmatchConfidence);
        }
        Ok(())
    }
}
