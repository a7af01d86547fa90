//! Online Statistics Store
//!
//! Welford running mean/variance plus a time-decayed EMA, updated together
//! for every admitted observation. Every sample passes the outlier filter
//! against the current row first; a rejected sample leaves the row
//! untouched. Values must already be finite and positive.

use crate::config::LearningConfig;
use crate::outlier::{OutlierFilter, OutlierVerdict};
use crate::EngineResult;
use chrono::{DateTime, Duration, Utc};
use eta_storage::StoreTransaction;
use eta_types::{SegmentBinStats, SegmentKey, TimeBin};

/// One Welford step: `n' = n + 1`, `mean' = mean + d / n'`,
/// `m2' = m2 + d * (x - mean')`.
pub fn welford_step(n: u64, mean: f64, m2: f64, value: f64) -> (u64, f64, f64) {
    let n_next = n.saturating_add(1);
    let delta = value - mean;
    let mean_next = mean + delta / n_next as f64;
    // delta and (value - mean_next) always share a sign, so m2 never shrinks.
    let m2_next = (m2 + delta * (value - mean_next)).max(0.0);
    (n_next, mean_next, m2_next)
}

/// EMA weight for a sample arriving `elapsed` after the previous one:
/// `1 - 0.5^(elapsed / half_life)`.
pub fn ema_alpha(elapsed: Duration, half_life: Duration) -> f64 {
    let half_life_ms = half_life.num_milliseconds();
    if half_life_ms <= 0 {
        return 1.0;
    }
    let elapsed_ms = elapsed.num_milliseconds().max(0) as f64;
    (1.0 - 0.5_f64.powf(elapsed_ms / half_life_ms as f64)).clamp(0.0, 1.0)
}

/// Outcome of offering one sample to a row.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsUpdate {
    Applied(SegmentBinStats),
    /// Row left as it was.
    Rejected { z: f64, current: SegmentBinStats },
}

#[derive(Debug, Clone)]
pub struct OnlineStatsStore {
    half_life: Duration,
    outlier: OutlierFilter,
}

impl OnlineStatsStore {
    pub fn new(config: &LearningConfig) -> Self {
        Self {
            half_life: config.ema_half_life(),
            outlier: OutlierFilter::new(config),
        }
    }

    /// Fold one observation into a row and return the new row.
    ///
    /// EMA decay runs on observation time; out-of-order samples get zero
    /// elapsed time and never move `ema_updated_at` backwards.
    pub fn apply(
        &self,
        current: &SegmentBinStats,
        value: f64,
        observed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SegmentBinStats {
        let (n, mean, m2) = welford_step(current.n, current.mean, current.m2, value);

        let (ema_mean, ema_updated_at) = match (current.ema_mean, current.ema_updated_at) {
            (Some(previous), Some(updated_at)) => {
                let alpha = ema_alpha(observed_at - updated_at, self.half_life);
                (
                    alpha * value + (1.0 - alpha) * previous,
                    updated_at.max(observed_at),
                )
            }
            _ => (value, observed_at),
        };

        SegmentBinStats {
            n,
            mean,
            m2,
            ema_mean: Some(ema_mean),
            ema_updated_at: Some(ema_updated_at),
            last_updated: Some(now),
        }
    }

    /// Gate, then read-modify-write one row inside the caller's transaction.
    /// The read sees earlier writes of the same transaction, so repeated
    /// segments in one submission accumulate.
    pub async fn update(
        &self,
        tx: &mut dyn StoreTransaction,
        segment: &SegmentKey,
        bin: TimeBin,
        value: f64,
        observed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> EngineResult<StatsUpdate> {
        let current = tx.get_stats(segment, bin).await?.unwrap_or_default();
        if let OutlierVerdict::Reject { z } = self.outlier.check(&current, value) {
            return Ok(StatsUpdate::Rejected { z, current });
        }
        let next = self.apply(&current, value, observed_at, now);
        tx.put_stats(segment, bin, &next).await?;
        Ok(StatsUpdate::Applied(next))
    }
}
