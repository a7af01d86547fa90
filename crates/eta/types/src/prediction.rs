//! Prediction contracts

use crate::bin::TimeBin;
use crate::segment::SegmentKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse confidence derived from the bin's sample count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLabel {
    Low,
    Medium,
    High,
}

impl ConfidenceLabel {
    /// Samples needed for `high`.
    pub const HIGH_MIN_SAMPLES: u64 = 8;
    /// Samples needed for `medium`.
    pub const MEDIUM_MIN_SAMPLES: u64 = 3;

    pub fn from_sample_count(n: u64) -> Self {
        if n >= Self::HIGH_MIN_SAMPLES {
            Self::High
        } else if n >= Self::MEDIUM_MIN_SAMPLES {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for ConfidenceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-path query for one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionQuery {
    pub segment: SegmentKey,
    /// Defaults to the engine clock when absent.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_holiday: bool,
}

impl PredictionQuery {
    pub fn now(segment: SegmentKey) -> Self {
        Self {
            segment,
            at: None,
            is_holiday: false,
        }
    }

    pub fn at(segment: SegmentKey, at: DateTime<Utc>) -> Self {
        Self {
            segment,
            at: Some(at),
            is_holiday: false,
        }
    }

    pub fn holiday(mut self, is_holiday: bool) -> Self {
        self.is_holiday = is_holiday;
        self
    }
}

/// Blended duration estimate for one (segment, bin).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub segment: SegmentKey,
    pub bin: TimeBin,
    pub query_time: DateTime<Utc>,
    pub predicted_duration_sec: f64,
    #[serde(rename = "confidence_label")]
    pub confidence: ConfidenceLabel,
    pub sample_count: u64,
    /// Share of the prediction sourced from learned data, `n / (n + n0)`.
    pub blend_weight: f64,
    pub schedule_duration_sec: f64,
    pub learned_duration_sec: Option<f64>,
    pub p50_sec: f64,
    pub p90_sec: f64,
    pub low_n_warning: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub stale: bool,
}
