use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open time-of-day range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Identity of one bookable calendar day at one venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DayKey {
    pub venue_id: Ulid,
    pub date: NaiveDate,
}

impl DayKey {
    pub fn new(venue_id: Ulid, date: NaiveDate) -> Self {
        Self { venue_id, date }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Venue {
    pub id: Ulid,
    pub name: Option<String>,
    pub opening: NaiveTime,
    pub closing: NaiveTime,
    pub rate_per_hour: u64,
    /// Lowercased game names.
    pub games: BTreeSet<String>,
}

impl Venue {
    pub fn hours(&self) -> TimeRange {
        TimeRange::new(self.opening, self.closing)
    }

    pub fn offers(&self, game: &str) -> bool {
        self.games.contains(&game.trim().to_lowercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Booked,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Booked => "booked",
        }
    }
}

/// One fixed-width row of a venue's day grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub range: TimeRange,
    pub status: SlotStatus,
    /// Set iff `status` is `Booked`.
    pub booking_id: Option<Ulid>,
}

impl Slot {
    pub fn available(id: Ulid, range: TimeRange) -> Self {
        Self {
            id,
            range,
            status: SlotStatus::Available,
            booking_id: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == SlotStatus::Available
    }
}

/// Slot identity as written to the WAL. Rows always open as `Available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRow {
    pub id: Ulid,
    pub range: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub venue_id: Ulid,
    pub date: NaiveDate,
    pub booked_at: DateTime<Utc>,
    pub range: TimeRange,
    pub game: String,
    pub amount: u64,
}

impl Booking {
    pub fn day(&self) -> DayKey {
        DayKey::new(self.venue_id, self.date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub customer_id: Ulid,
    pub venue_id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub game: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingReceipt {
    pub booking_id: Ulid,
    pub amount: u64,
}

/// The event types — flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VenueRegistered {
        venue: Venue,
    },
    VenueRemoved {
        id: Ulid,
    },
    DayOpened {
        venue_id: Ulid,
        date: NaiveDate,
        slots: Vec<SlotRow>,
    },
    BookingCommitted {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        venue_id: Ulid,
        date: NaiveDate,
        customer_id: Ulid,
    },
}

impl Event {
    pub fn venue_id(&self) -> Ulid {
        match self {
            Event::VenueRegistered { venue } => venue.id,
            Event::VenueRemoved { id } => *id,
            Event::DayOpened { venue_id, .. } | Event::BookingCancelled { venue_id, .. } => {
                *venue_id
            }
            Event::BookingCommitted { booking } => booking.venue_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::VenueRegistered { .. } => "venue_registered",
            Event::VenueRemoved { .. } => "venue_removed",
            Event::DayOpened { .. } => "day_opened",
            Event::BookingCommitted { .. } => "booking_committed",
            Event::BookingCancelled { .. } => "booking_cancelled",
        }
    }
}

/// One transaction's worth of events. This is the WAL record format: a
/// commit is replayed whole or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub events: Vec<Event>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn range_basics() {
        let r = TimeRange::new(t(9, 0), t(10, 30));
        assert_eq!(r.duration(), TimeDelta::minutes(90));
        assert!(r.contains(&TimeRange::new(t(9, 0), t(10, 0))));
        assert!(!r.contains(&TimeRange::new(t(10, 0), t(11, 0))));
    }

    #[test]
    fn venue_game_lookup_ignores_case() {
        let venue = Venue {
            id: Ulid::new(),
            name: None,
            opening: t(9, 0),
            closing: t(12, 0),
            rate_per_hour: 100,
            games: ["football".to_string()].into_iter().collect(),
        };
        assert!(venue.offers("Football"));
        assert!(venue.offers(" football "));
        assert!(!venue.offers("cricket"));
    }

    #[test]
    fn commit_serialization_roundtrip() {
        let commit = Commit {
            events: vec![Event::BookingCommitted {
                booking: Booking {
                    id: Ulid::new(),
                    customer_id: Ulid::new(),
                    venue_id: Ulid::new(),
                    date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
                    booked_at: Utc::now(),
                    range: TimeRange::new(t(10, 0), t(11, 0)),
                    game: "squash".into(),
                    amount: 100,
                },
            }],
        };
        let bytes = bincode::serialize(&commit).unwrap();
        let decoded: Commit = bincode::deserialize(&bytes).unwrap();
        assert_eq!(commit, decoded);
    }
}
