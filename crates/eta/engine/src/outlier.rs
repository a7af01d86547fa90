//! Outlier Filter
//!
//! Boundary policy: a row needs strictly more than `min_samples`
//! observations before anything is judged, and a sample is rejected only
//! when its distance from the mean strictly exceeds `k * sigma`. A sample
//! exactly on the threshold is admitted. Sigma is the sample standard
//! deviation `sqrt(M2 / (n - 1))`, unscaled. A row whose sigma is below
//! `min_sigma_sec` has no spread to judge against and admits everything.

use crate::config::LearningConfig;
use eta_types::SegmentBinStats;

/// Result of an outlier check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutlierVerdict {
    Admit,
    Reject {
        /// Distance from the mean in effective sigmas.
        z: f64,
    },
}

impl OutlierVerdict {
    pub fn is_admitted(self) -> bool {
        matches!(self, OutlierVerdict::Admit)
    }
}

#[derive(Debug, Clone)]
pub struct OutlierFilter {
    sigma: f64,
    min_samples: u64,
    min_sigma: f64,
}

impl OutlierFilter {
    pub fn new(config: &LearningConfig) -> Self {
        Self {
            sigma: config.outlier_sigma,
            min_samples: config.outlier_min_samples,
            min_sigma: config.min_sigma_sec,
        }
    }

    pub fn check(&self, stats: &SegmentBinStats, value: f64) -> OutlierVerdict {
        if stats.n <= self.min_samples {
            return OutlierVerdict::Admit;
        }
        let sigma = stats.std_dev();
        if sigma < self.min_sigma {
            return OutlierVerdict::Admit;
        }
        let distance = (value - stats.mean).abs();
        if distance > self.sigma * sigma {
            OutlierVerdict::Reject {
                z: distance / sigma,
            }
        } else {
            OutlierVerdict::Admit
        }
    }
}
