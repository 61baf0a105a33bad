use std::time::Duration;

use ulid::Ulid;

use crate::model::TimeRange;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidTimeRange(String),
    InvalidDuration(String),
    VenueNotFound(Ulid),
    GameNotOffered { venue_id: Ulid, game: String },
    SlotConflict(TimeRange),
    BookingNotFound(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    /// Lock acquisition did not finish within the operation deadline.
    Timeout(Duration),
    WalError(String),
}

impl EngineError {
    /// Store-level failures that may succeed on a second attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Timeout(_) | EngineError::WalError(_))
    }

    /// SQLSTATE reported to wire clients for this kind of failure.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::InvalidTimeRange(_)
            | EngineError::InvalidDuration(_)
            | EngineError::GameNotOffered { .. } => "22023",
            EngineError::VenueNotFound(_) | EngineError::BookingNotFound(_) => "P0002",
            EngineError::SlotConflict(_) => "23P01",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::Timeout(_) => "57014",
            EngineError::WalError(_) => "58030",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidTimeRange(msg) => write!(f, "invalid time range: {msg}"),
            EngineError::InvalidDuration(msg) => write!(f, "invalid duration: {msg}"),
            EngineError::VenueNotFound(id) => write!(f, "venue not found: {id}"),
            EngineError::GameNotOffered { venue_id, game } => {
                write!(f, "game {game:?} not offered at venue {venue_id}")
            }
            EngineError::SlotConflict(range) => write!(
                f,
                "slot already booked: [{}, {})",
                range.start.format("%H:%M"),
                range.end.format("%H:%M")
            ),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Timeout(d) => write!(f, "timed out after {}ms", d.as_millis()),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
