//! Ride submission contract
//!
//! A submission carries one ride's worth of segment observations for a single
//! route and direction. Structural checks live here; per-segment plausibility
//! checks run later and never fail the whole request.

use crate::bin::TimeBin;
use crate::error::ValidationError;
use crate::records::RejectionReason;
use crate::segment::SegmentKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Length of the hex-encoded SHA-256 digest clients send as `device_bucket`.
pub const DEVICE_BUCKET_HEX_LEN: usize = 64;

/// One ride summary as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideSubmission {
    pub route_id: String,
    pub direction_id: u8,
    /// Rotating, salted digest of the device id. Never a raw identifier.
    pub device_bucket: String,
    pub segments: Vec<SegmentObservation>,
}

/// A single timed traversal of one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentObservation {
    pub from_stop_id: String,
    pub to_stop_id: String,
    pub duration_sec: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dwell_sec: Option<f64>,
    #[serde(alias = "observed_at_utc")]
    pub observed_at: DateTime<Utc>,
    #[serde(default = "default_mapmatch_confidence", alias = "mapmatch_conf")]
    pub mapmatch_confidence: f64,
    /// Routes a weekday observation into the weekend bins.
    #[serde(default)]
    pub is_holiday: bool,
}

fn default_mapmatch_confidence() -> f64 {
    1.0
}

impl RideSubmission {
    /// Segment key for one of this submission's observations.
    pub fn segment_key(&self, observation: &SegmentObservation) -> SegmentKey {
        SegmentKey::new(
            self.route_id.clone(),
            self.direction_id,
            observation.from_stop_id.clone(),
            observation.to_stop_id.clone(),
        )
    }

    /// Structural validation. Per-segment plausibility is not checked here.
    pub fn validate(&self, max_segments: usize) -> Result<(), ValidationError> {
        if self.route_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("route_id"));
        }
        if self.direction_id > 1 {
            return Err(ValidationError::InvalidDirection(self.direction_id));
        }
        if !is_hex_digest(&self.device_bucket) {
            return Err(ValidationError::InvalidDeviceBucket);
        }
        if self.segments.is_empty() {
            return Err(ValidationError::NoSegments);
        }
        if self.segments.len() > max_segments {
            return Err(ValidationError::TooManySegments {
                count: self.segments.len(),
                max: max_segments,
            });
        }

        for (index, segment) in self.segments.iter().enumerate() {
            if segment.from_stop_id.trim().is_empty() {
                return Err(ValidationError::EmptySegmentField {
                    index,
                    field: "from_stop_id",
                });
            }
            if segment.to_stop_id.trim().is_empty() {
                return Err(ValidationError::EmptySegmentField {
                    index,
                    field: "to_stop_id",
                });
            }
            if !segment.duration_sec.is_finite() {
                return Err(ValidationError::NonFiniteDuration { index });
            }
            if let Some(dwell) = segment.dwell_sec {
                if !dwell.is_finite() || dwell < 0.0 {
                    return Err(ValidationError::InvalidDwell { index });
                }
            }
            let confidence = segment.mapmatch_confidence;
            if !(0.0..=1.0).contains(&confidence) {
                return Err(ValidationError::ConfidenceOutOfRange {
                    index,
                    value: confidence,
                });
            }
        }

        Ok(())
    }
}

fn is_hex_digest(value: &str) -> bool {
    value.len() == DEVICE_BUCKET_HEX_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Whether one observation was folded into the statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Accepted,
    Rejected,
}

/// Per-segment result reported back to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentOutcome {
    pub index: usize,
    pub from_stop_id: String,
    pub to_stop_id: String,
    pub bin: TimeBin,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectionReason>,
}

impl SegmentOutcome {
    pub fn is_accepted(&self) -> bool {
        self.status == OutcomeStatus::Accepted
    }
}

/// Response body of a processed submission. Replays return it verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub accepted_count: u32,
    pub rejected_count: u32,
    pub rejected_by_reason: BTreeMap<String, u32>,
    pub outcomes: Vec<SegmentOutcome>,
}

impl SubmissionResponse {
    pub fn from_outcomes(outcomes: Vec<SegmentOutcome>) -> Self {
        let mut response = Self::default();
        for outcome in &outcomes {
            match outcome.reason {
                None => response.accepted_count += 1,
                Some(reason) => {
                    response.rejected_count += 1;
                    *response
                        .rejected_by_reason
                        .entry(reason.as_str().to_string())
                        .or_insert(0) += 1;
                }
            }
        }
        response.outcomes = outcomes;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn observation(from: &str, to: &str) -> SegmentObservation {
        SegmentObservation {
            from_stop_id: from.into(),
            to_stop_id: to.into(),
            duration_sec: 120.0,
            dwell_sec: Some(15.0),
            observed_at: Utc.with_ymd_and_hms(2025, 10, 22, 10, 33, 0).unwrap(),
            mapmatch_confidence: 0.9,
            is_holiday: false,
        }
    }

    fn submission() -> RideSubmission {
        RideSubmission {
            route_id: "500D".into(),
            direction_id: 0,
            device_bucket: "a".repeat(64),
            segments: vec![observation("S1", "S2"), observation("S2", "S3")],
        }
    }

    #[test]
    fn valid_submission_passes() {
        assert_eq!(submission().validate(50), Ok(()));
    }

    #[test]
    fn raw_device_identifiers_are_rejected() {
        let mut ride = submission();
        ride.device_bucket = "356938035643809".into();
        assert_eq!(ride.validate(50), Err(ValidationError::InvalidDeviceBucket));

        ride.device_bucket = "z".repeat(64);
        assert_eq!(ride.validate(50), Err(ValidationError::InvalidDeviceBucket));
    }

    #[test]
    fn structural_limits() {
        let mut ride = submission();
        ride.direction_id = 2;
        assert_eq!(ride.validate(50), Err(ValidationError::InvalidDirection(2)));

        let mut ride = submission();
        ride.segments.clear();
        assert_eq!(ride.validate(50), Err(ValidationError::NoSegments));

        let ride = submission();
        assert_eq!(
            ride.validate(1),
            Err(ValidationError::TooManySegments { count: 2, max: 1 })
        );

        let mut ride = submission();
        ride.segments[1].mapmatch_confidence = 1.5;
        assert!(matches!(
            ride.validate(50),
            Err(ValidationError::ConfidenceOutOfRange { index: 1, .. })
        ));

        let mut ride = submission();
        ride.segments[0].dwell_sec = Some(-1.0);
        assert_eq!(
            ride.validate(50),
            Err(ValidationError::InvalidDwell { index: 0 })
        );
    }

    #[test]
    fn negative_duration_is_not_structural() {
        // Positivity is a per-segment check, not a request failure.
        let mut ride = submission();
        ride.segments[0].duration_sec = -4.0;
        assert_eq!(ride.validate(50), Ok(()));
    }

    #[test]
    fn accepts_legacy_field_names_and_defaults() {
        let json = r#"{
            "route_id": "500D",
            "direction_id": 1,
            "device_bucket": "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
            "segments": [{
                "from_stop_id": "S1",
                "to_stop_id": "S2",
                "duration_sec": 95.5,
                "observed_at_utc": "2025-10-22T10:33:00Z"
            }]
        }"#;
        let ride: RideSubmission = serde_json::from_str(json).unwrap();
        assert_eq!(ride.segments[0].mapmatch_confidence, 1.0);
        assert!(!ride.segments[0].is_holiday);
        assert_eq!(ride.segment_key(&ride.segments[0]).to_string(), "500D/1:S1->S2");
    }

    #[test]
    fn response_counts_reasons() {
        let bin = TimeBin::new(40).unwrap();
        let outcome = |index, reason: Option<RejectionReason>| SegmentOutcome {
            index,
            from_stop_id: "A".into(),
            to_stop_id: "B".into(),
            bin,
            status: if reason.is_some() {
                OutcomeStatus::Rejected
            } else {
                OutcomeStatus::Accepted
            },
            reason,
        };
        let response = SubmissionResponse::from_outcomes(vec![
            outcome(0, None),
            outcome(1, Some(RejectionReason::OutlierSigma)),
            outcome(2, Some(RejectionReason::OutlierSigma)),
            outcome(3, Some(RejectionReason::StaleTimestamp)),
        ]);
        assert_eq!(response.accepted_count, 1);
        assert_eq!(response.rejected_count, 3);
        assert_eq!(response.rejected_by_reason["outlier_sigma"], 2);
        assert_eq!(response.rejected_by_reason["stale_timestamp"], 1);
    }
}
