use chrono::{NaiveDate, NaiveTime, TimeDelta};

use crate::model::TimeRange;

use super::EngineError;

/// Width of one bookable slot.
pub const SLOT_UNIT: TimeDelta = TimeDelta::hours(1);

/// Fixed-width slot boundaries from opening toward closing.
///
/// A range that would end past closing, or wrap past midnight, is never
/// produced. Cloning restarts the sequence from the clone point.
#[derive(Debug, Clone)]
pub struct Grid {
    next_start: Option<NaiveTime>,
    closing: NaiveTime,
    unit: TimeDelta,
}

impl Iterator for Grid {
    type Item = TimeRange;

    fn next(&mut self) -> Option<TimeRange> {
        let start = self.next_start?;
        let (end, wrapped) = start.overflowing_add_signed(self.unit);
        if wrapped != 0 || end > self.closing {
            self.next_start = None;
            return None;
        }
        self.next_start = (end < self.closing).then_some(end);
        Some(TimeRange::new(start, end))
    }
}

pub fn generate_grid(
    opening: NaiveTime,
    closing: NaiveTime,
    unit: TimeDelta,
) -> Result<Grid, EngineError> {
    if unit <= TimeDelta::zero() {
        return Err(EngineError::InvalidDuration(format!(
            "slot unit must be positive, got {}s",
            unit.num_seconds()
        )));
    }
    if opening >= closing {
        return Err(EngineError::InvalidTimeRange(format!(
            "opening {} is not before closing {}",
            format_time_of_day(opening),
            format_time_of_day(closing)
        )));
    }
    Ok(Grid {
        next_start: Some(opening),
        closing,
        unit,
    })
}

/// True when whole `unit` steps from `hours.start` land exactly on `hours.end`.
pub fn tiles_exactly(hours: &TimeRange, unit: TimeDelta) -> bool {
    let span = hours.duration().num_seconds();
    let step = unit.num_seconds();
    step > 0 && span > 0 && span % step == 0
}

/// Accepts `HH:MM` and `HH:MM:SS`.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, EngineError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| EngineError::InvalidTimeRange(format!("unparsable time of day: {s:?}")))
}

pub fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| EngineError::InvalidTimeRange(format!("unparsable date: {s:?}")))
}

pub fn format_time_of_day(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}
