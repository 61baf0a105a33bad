use crate::model::TimeRange;

use super::EngineError;

const SECS_PER_HOUR: i64 = 3_600;

/// Amount owed for `range` at `rate_per_hour`. Only whole hours are priced.
pub fn price(rate_per_hour: u64, range: &TimeRange) -> Result<u64, EngineError> {
    let secs = range.duration().num_seconds();
    if secs <= 0 || secs % SECS_PER_HOUR != 0 {
        return Err(EngineError::InvalidDuration(format!(
            "{secs}s is not a positive whole number of hours"
        )));
    }
    let hours = (secs / SECS_PER_HOUR) as u64;
    rate_per_hour
        .checked_mul(hours)
        .ok_or(EngineError::LimitExceeded("booking amount overflows"))
}
