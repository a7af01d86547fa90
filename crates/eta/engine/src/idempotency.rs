//! Idempotency Guard
//!
//! States per key: absent -> stored; stored + same body -> replay;
//! stored + different body -> conflict; stored + expired -> absent.
//! The record is written in the same transaction as the statistics it
//! describes, so a replay can never observe half-applied work.

use crate::config::IdempotencyConfig;
use crate::{EngineError, EngineResult};
use chrono::{DateTime, Duration, Utc};
use eta_types::{IdempotencyRecord, RideSubmission, SubmissionResponse, ValidationError};
use tracing::debug;

/// What to do with a submission given any existing record for its key.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyCheck {
    /// No live record: process the submission.
    Fresh,
    /// Same key, same body: return the stored response.
    Replay(SubmissionResponse),
}

#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    ttl: Duration,
    max_key_len: usize,
}

impl IdempotencyGuard {
    pub fn new(config: &IdempotencyConfig) -> Self {
        Self {
            ttl: config.ttl(),
            max_key_len: config.max_key_len,
        }
    }

    /// Keys are 1..=max_key_len printable ASCII characters.
    pub fn validate_key(&self, key: &str) -> Result<(), ValidationError> {
        let printable = key.bytes().all(|b| b.is_ascii_graphic());
        if key.is_empty() || key.len() > self.max_key_len || !printable {
            return Err(ValidationError::InvalidIdempotencyKey {
                max_len: self.max_key_len,
            });
        }
        Ok(())
    }

    /// Hash of the canonical serialization of the parsed body. Formatting
    /// differences and field order in the original JSON do not matter.
    pub fn body_hash(&self, submission: &RideSubmission) -> EngineResult<String> {
        let canonical = serde_json::to_vec(submission)?;
        Ok(blake3::hash(&canonical).to_hex().to_string())
    }

    pub fn check(
        &self,
        key: &str,
        existing: Option<&IdempotencyRecord>,
        body_hash: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<IdempotencyCheck> {
        let Some(record) = existing else {
            return Ok(IdempotencyCheck::Fresh);
        };
        if record.is_expired(now, self.ttl) {
            debug!(key, created_at = %record.created_at, "idempotency record expired, treating as absent");
            return Ok(IdempotencyCheck::Fresh);
        }
        if record.body_hash != body_hash {
            return Err(EngineError::Conflict {
                key: key.to_string(),
            });
        }
        let response: SubmissionResponse = serde_json::from_str(&record.response)?;
        Ok(IdempotencyCheck::Replay(response))
    }

    pub fn record(
        &self,
        key: &str,
        body_hash: String,
        response: &SubmissionResponse,
        now: DateTime<Utc>,
    ) -> EngineResult<IdempotencyRecord> {
        Ok(IdempotencyRecord {
            key: key.to_string(),
            body_hash,
            response: serde_json::to_string(response)?,
            created_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use eta_types::SegmentObservation;

    fn guard() -> IdempotencyGuard {
        IdempotencyGuard::new(&IdempotencyConfig::default())
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 22, 12, 0, 0).unwrap()
    }

    fn ride(duration_sec: f64) -> RideSubmission {
        RideSubmission {
            route_id: "500D".into(),
            direction_id: 0,
            device_bucket: "b".repeat(64),
            segments: vec![SegmentObservation {
                from_stop_id: "S1".into(),
                to_stop_id: "S2".into(),
                duration_sec,
                dwell_sec: None,
                observed_at: now(),
                mapmatch_confidence: 0.9,
                is_holiday: false,
            }],
        }
    }

    fn stored(body_hash: &str, created_at: DateTime<Utc>) -> IdempotencyRecord {
        guard()
            .record("K1", body_hash.to_string(), &SubmissionResponse::default(), created_at)
            .unwrap()
    }

    #[test]
    fn unreadable_stored_response_is_not_a_conflict() {
        let mut record = stored("h1", now());
        record.response = "{truncated".to_string();
        let err = guard().check("K1", Some(&record), "h1", now()).unwrap_err();
        assert!(matches!(err, EngineError::Serialization(_)));
        assert!(!err.is_conflict());

        let err = guard().check("K1", Some(&record), "h2", now()).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn key_rules() {
        let g = guard();
        assert!(g.validate_key("ride-2025-10-22-0001").is_ok());
        assert!(g.validate_key("").is_err());
        assert!(g.validate_key("has space").is_err());
        assert!(g.validate_key(&"k".repeat(129)).is_err());
        assert!(g.validate_key(&"k".repeat(128)).is_ok());
    }

    #[test]
    fn hash_depends_on_content_only() {
        let g = guard();
        assert_eq!(g.body_hash(&ride(120.0)).unwrap(), g.body_hash(&ride(120.0)).unwrap());
        assert_ne!(g.body_hash(&ride(120.0)).unwrap(), g.body_hash(&ride(121.0)).unwrap());

        let compact: RideSubmission = serde_json::from_str(
            &serde_json::to_string(&ride(120.0)).unwrap(),
        )
        .unwrap();
        let pretty: RideSubmission = serde_json::from_str(
            &serde_json::to_string_pretty(&ride(120.0)).unwrap(),
        )
        .unwrap();
        assert_eq!(g.body_hash(&compact).unwrap(), g.body_hash(&pretty).unwrap());
    }

    #[test]
    fn state_machine() {
        let g = guard();
        assert_eq!(g.check("K1", None, "h1", now()).unwrap(), IdempotencyCheck::Fresh);

        let record = stored("h1", now() - Duration::hours(1));
        assert_eq!(
            g.check("K1", Some(&record), "h1", now()).unwrap(),
            IdempotencyCheck::Replay(SubmissionResponse::default())
        );
        assert!(matches!(
            g.check("K1", Some(&record), "h2", now()),
            Err(EngineError::Conflict { .. })
        ));

        let expired = stored("h1", now() - Duration::hours(25));
        assert_eq!(
            g.check("K1", Some(&expired), "h2", now()).unwrap(),
            IdempotencyCheck::Fresh
        );
    }
}
