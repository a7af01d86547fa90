//! Time Bin Resolver
//!
//! Maps a UTC timestamp to one of the 192 bins using a fixed reference
//! offset. Pure and total; timestamps are already parsed by the caller.

use crate::config::TimeBinConfig;
use crate::{EngineError, EngineResult};
use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc, Weekday};
use eta_types::{DayType, TimeBin, BIN_MINUTES};

#[derive(Debug, Clone, Copy)]
pub struct TimeBinResolver {
    offset: FixedOffset,
}

impl TimeBinResolver {
    pub fn new(config: &TimeBinConfig) -> EngineResult<Self> {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60).ok_or_else(|| {
            EngineError::InvalidConfig(format!(
                "utc offset of {} minutes is out of range",
                config.utc_offset_minutes
            ))
        })?;
        Ok(Self { offset })
    }

    /// Resolver pinned to UTC.
    pub fn utc() -> Self {
        Self {
            offset: Utc.fix(),
        }
    }

    pub fn day_type(&self, at: DateTime<Utc>, is_holiday: bool) -> DayType {
        let local = at.with_timezone(&self.offset);
        match local.weekday() {
            Weekday::Sat | Weekday::Sun => DayType::Weekend,
            _ if is_holiday => DayType::Weekend,
            _ => DayType::Weekday,
        }
    }

    /// Holidays resolve into the weekend half of the bins.
    pub fn resolve(&self, at: DateTime<Utc>, is_holiday: bool) -> TimeBin {
        let local = at.with_timezone(&self.offset);
        let minutes = local.hour() * 60 + local.minute();
        let slot = u16::try_from(minutes / BIN_MINUTES).unwrap_or(u16::MAX);
        TimeBin::from_parts(self.day_type(at, is_holiday), slot)
    }
}
