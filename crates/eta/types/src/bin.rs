//! Time bins
//!
//! A day is split into 96 fifteen-minute slots. Weekdays use bins 0..=95,
//! weekends (and holidays) use 96..=191.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Width of one bin in minutes.
pub const BIN_MINUTES: u32 = 15;

/// Bins per day type.
pub const BINS_PER_DAY: u16 = 96;

/// Total number of bins across both day types.
pub const TOTAL_BINS: u16 = 2 * BINS_PER_DAY;

/// Day classification used to pick the bin half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayType {
    Weekday,
    Weekend,
}

/// A bin id in `0..192`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct TimeBin(u16);

/// Raised when a raw bin id falls outside `0..192`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("time bin {0} out of range 0..192")]
pub struct InvalidTimeBin(pub u16);

impl TimeBin {
    pub fn new(id: u16) -> Result<Self, InvalidTimeBin> {
        if id < TOTAL_BINS {
            Ok(Self(id))
        } else {
            Err(InvalidTimeBin(id))
        }
    }

    /// Build a bin from a day type and a slot; slots past the end of the
    /// day clamp to the last slot.
    pub fn from_parts(day_type: DayType, slot: u16) -> Self {
        let slot = slot.min(BINS_PER_DAY - 1);
        match day_type {
            DayType::Weekday => Self(slot),
            DayType::Weekend => Self(BINS_PER_DAY + slot),
        }
    }

    pub fn id(self) -> u16 {
        self.0
    }

    pub fn day_type(self) -> DayType {
        if self.0 < BINS_PER_DAY {
            DayType::Weekday
        } else {
            DayType::Weekend
        }
    }

    /// Slot within the day, `0..96`.
    pub fn slot(self) -> u16 {
        self.0 % BINS_PER_DAY
    }

    /// Minutes since local midnight at which this bin starts.
    pub fn start_minute(self) -> u32 {
        u32::from(self.slot()) * BIN_MINUTES
    }
}

impl TryFrom<u16> for TimeBin {
    type Error = InvalidTimeBin;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TimeBin> for u16 {
    fn from(bin: TimeBin) -> Self {
        bin.0
    }
}

impl fmt::Display for TimeBin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_ids() {
        assert!(TimeBin::new(191).is_ok());
        assert_eq!(TimeBin::new(192), Err(InvalidTimeBin(192)));
    }

    #[test]
    fn parts_round_trip() {
        let bin = TimeBin::from_parts(DayType::Weekend, 42);
        assert_eq!(bin.id(), 138);
        assert_eq!(bin.day_type(), DayType::Weekend);
        assert_eq!(bin.slot(), 42);
        assert_eq!(bin.start_minute(), 630);
    }

    #[test]
    fn slot_clamps_to_end_of_day() {
        assert_eq!(TimeBin::from_parts(DayType::Weekday, 500).id(), 95);
    }

    #[test]
    fn deserialization_enforces_range() {
        assert!(serde_json::from_str::<TimeBin>("17").is_ok());
        assert!(serde_json::from_str::<TimeBin>("400").is_err());
    }
}
