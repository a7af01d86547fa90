use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Running statistics row for one (segment, bin).
///
/// `mean`/`m2` are Welford accumulators; `ema_mean` is the time-decayed
/// average. An absent row behaves exactly like [`SegmentBinStats::empty`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentBinStats {
    pub n: u64,
    pub mean: f64,
    pub m2: f64,
    pub ema_mean: Option<f64>,
    pub ema_updated_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl SegmentBinStats {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Sample variance `M2 / (n - 1)`, zero below two samples. Never negative.
    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        (self.m2 / (self.n - 1) as f64).max(0.0)
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Learned duration estimate: EMA when present, Welford mean otherwise.
    pub fn learned_estimate(&self) -> Option<f64> {
        if self.n == 0 {
            return None;
        }
        Some(self.ema_mean.unwrap_or(self.mean))
    }
}
