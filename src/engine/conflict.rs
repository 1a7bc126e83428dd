use chrono::Datelike;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Half-open overlap: `[a, b)` and `[c, d)` share a night iff `a < d && c < b`.
/// Checking out and checking in on the same day is not a conflict.
pub fn overlaps(existing: &Stay, candidate: &Stay) -> bool {
    existing.overlaps(candidate)
}

/// Reject empty, inverted, out-of-range and overlong stays. Runs before any
/// overlap check, so the checker never sees a zero-night range.
pub(crate) fn validate_stay(stay: &Stay) -> Result<(), EngineError> {
    if stay.check_out <= stay.check_in {
        return Err(EngineError::InvalidDateRange(*stay));
    }
    if stay.check_in.year() < MIN_VALID_YEAR || stay.check_out.year() > MAX_VALID_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(())
}

/// First booking on the room that still holds any of `stay`'s nights.
pub(crate) fn find_conflict<'a>(rs: &'a RoomState, stay: &Stay) -> Option<&'a Booking> {
    rs.blocking(stay).next()
}

pub(crate) fn check_no_conflict(rs: &RoomState, stay: &Stay) -> Result<(), EngineError> {
    match find_conflict(rs, stay) {
        Some(existing) => Err(EngineError::RoomUnavailable {
            room_id: rs.room.id,
            stay: *stay,
            conflict: Some(existing.id),
        }),
        None => Ok(()),
    }
}
