//! Blend Predictor
//!
//! `predicted = w * learned + (1 - w) * schedule` with `w = n / (n + n0)`.
//! Read-only; callers fetch the committed row and schedule duration first.

use crate::config::LearningConfig;
use chrono::{DateTime, Duration, Utc};
use eta_types::{ConfidenceLabel, SegmentBinStats};

/// z-score of the 90th percentile of a normal distribution.
const P90_Z: f64 = 1.28;
/// Wider multiplier used while the sample count is too low to trust sigma.
const P90_LOW_N_Z: f64 = 1.5;
/// Sigma fallback as a fraction of the schedule when no spread is known.
const SCHEDULE_SIGMA_FRACTION: f64 = 0.1;

/// Everything the read path derives from one row and its schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendEstimate {
    pub predicted_duration_sec: f64,
    pub blend_weight: f64,
    pub learned_duration_sec: Option<f64>,
    pub sample_count: u64,
    pub confidence: ConfidenceLabel,
    pub p50_sec: f64,
    pub p90_sec: f64,
    pub low_n_warning: bool,
    pub stale: bool,
}

#[derive(Debug, Clone)]
pub struct BlendPredictor {
    prior_strength: f64,
    stale_after: Duration,
}

impl BlendPredictor {
    pub fn new(config: &LearningConfig) -> Self {
        Self {
            prior_strength: config.prior_strength,
            stale_after: Duration::days(i64::from(config.stale_after_days)),
        }
    }

    pub fn blend_weight(&self, n: u64) -> f64 {
        let n = n as f64;
        n / (n + self.prior_strength)
    }

    pub fn estimate(
        &self,
        stats: Option<&SegmentBinStats>,
        schedule_sec: f64,
        now: DateTime<Utc>,
    ) -> BlendEstimate {
        let empty = SegmentBinStats::empty();
        let stats = stats.unwrap_or(&empty);
        let n = stats.n;
        let learned = stats.learned_estimate();

        let (weight, predicted) = match learned {
            Some(learned) => {
                let w = self.blend_weight(n);
                (w, w * learned + (1.0 - w) * schedule_sec)
            }
            None => (0.0, schedule_sec),
        };

        let low_n_warning = n < ConfidenceLabel::HIGH_MIN_SAMPLES;
        let variance = stats.variance();
        let p90 = if low_n_warning {
            let sigma = if variance > 0.0 {
                variance.sqrt()
            } else {
                schedule_sec * SCHEDULE_SIGMA_FRACTION
            };
            predicted + P90_LOW_N_Z * sigma
        } else {
            predicted + P90_Z * variance.sqrt()
        };

        let stale = match stats.last_updated {
            Some(updated) => now - updated > self.stale_after,
            None => n > 0,
        };

        BlendEstimate {
            predicted_duration_sec: predicted,
            blend_weight: weight,
            learned_duration_sec: learned,
            sample_count: n,
            confidence: ConfidenceLabel::from_sample_count(n),
            p50_sec: predicted,
            p90_sec: p90,
            low_n_warning,
            stale,
        }
    }
}
