//! Persisted safety and audit records

use crate::bin::TimeBin;
use crate::segment::SegmentKey;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Why a single segment observation was not folded into the statistics.
///
/// Ordered by the position of the check in the admission pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    InvalidDuration,
    ImplausibleDuration,
    FutureTimestamp,
    StaleTimestamp,
    #[serde(rename = "low_mapmatch_conf")]
    LowMapmatchConfidence,
    UnknownSegment,
    OutlierSigma,
}

impl RejectionReason {
    pub const ALL: [RejectionReason; 7] = [
        RejectionReason::InvalidDuration,
        RejectionReason::ImplausibleDuration,
        RejectionReason::FutureTimestamp,
        RejectionReason::StaleTimestamp,
        RejectionReason::LowMapmatchConfidence,
        RejectionReason::UnknownSegment,
        RejectionReason::OutlierSigma,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidDuration => "invalid_duration",
            Self::ImplausibleDuration => "implausible_duration",
            Self::FutureTimestamp => "future_timestamp",
            Self::StaleTimestamp => "stale_timestamp",
            Self::LowMapmatchConfidence => "low_mapmatch_conf",
            Self::UnknownSegment => "unknown_segment",
            Self::OutlierSigma => "outlier_sigma",
        }
    }

    /// True for the statistical rejection, false for input validation.
    pub fn is_statistical(self) -> bool {
        matches!(self, Self::OutlierSigma)
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a stored reason code is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown rejection reason: {0}")]
pub struct UnknownRejectionReason(pub String);

impl FromStr for RejectionReason {
    type Err = UnknownRejectionReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| UnknownRejectionReason(s.to_string()))
    }
}

/// Append-only log entry written for every rejected segment observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub segment: SegmentKey,
    pub bin: TimeBin,
    pub value: f64,
    pub mapmatch_confidence: f64,
    pub reason: RejectionReason,
    pub recorded_at: DateTime<Utc>,
}

/// Stored outcome of a first successful submission under a client key.
///
/// `response` is the serialized response body, replayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub body_hash: String,
    pub response: String,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// A record older than `ttl` is treated as absent.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.created_at) > ttl
    }
}

/// Token bucket state for one rotating client bucket id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub bucket_id: String,
    pub tokens: f64,
    pub last_refill: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_round_trip_through_strings() {
        for reason in RejectionReason::ALL {
            assert_eq!(reason.as_str().parse::<RejectionReason>().unwrap(), reason);
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason.as_str()));
        }
        assert!("bogus".parse::<RejectionReason>().is_err());
    }

    #[test]
    fn only_outlier_is_statistical() {
        assert!(RejectionReason::OutlierSigma.is_statistical());
        assert!(!RejectionReason::StaleTimestamp.is_statistical());
    }

    #[test]
    fn idempotency_expiry_is_strictly_past_ttl() {
        let created_at = Utc::now();
        let record = IdempotencyRecord {
            key: "k".into(),
            body_hash: "h".into(),
            response: "{}".into(),
            created_at,
        };
        let ttl = Duration::hours(24);
        assert!(!record.is_expired(created_at + ttl, ttl));
        assert!(record.is_expired(created_at + ttl + Duration::seconds(1), ttl));
    }
}
