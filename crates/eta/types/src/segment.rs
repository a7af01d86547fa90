//! Segment identity and reference data

use serde::{Deserialize, Serialize};
use std::fmt;

/// Directed stop-to-stop edge on a specific route and direction.
///
/// Segments are immutable reference data owned by the external import
/// process; the learner only ever keys rows by them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentKey {
    pub route_id: String,
    pub direction_id: u8,
    pub from_stop_id: String,
    pub to_stop_id: String,
}

impl SegmentKey {
    pub fn new(
        route_id: impl Into<String>,
        direction_id: u8,
        from_stop_id: impl Into<String>,
        to_stop_id: impl Into<String>,
    ) -> Self {
        Self {
            route_id: route_id.into(),
            direction_id,
            from_stop_id: from_stop_id.into(),
            to_stop_id: to_stop_id.into(),
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}->{}",
            self.route_id, self.direction_id, self.from_stop_id, self.to_stop_id
        )
    }
}

/// Reference row for one segment: identity plus its scheduled duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentReference {
    #[serde(flatten)]
    pub segment: SegmentKey,
    pub scheduled_duration_sec: f64,
}
