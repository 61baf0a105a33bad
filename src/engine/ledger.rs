use chrono::Utc;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::calendar::format_time_of_day;
use super::pricing::price;
use super::{Engine, EngineError};

fn validate_request(venue: &Venue, req: &BookingRequest) -> Result<TimeRange, EngineError> {
    if !venue.offers(&req.game) {
        return Err(EngineError::GameNotOffered {
            venue_id: venue.id,
            game: req.game.clone(),
        });
    }
    if req.start >= req.end {
        return Err(EngineError::InvalidTimeRange(format!(
            "start {} is not before end {}",
            format_time_of_day(req.start),
            format_time_of_day(req.end)
        )));
    }
    let range = TimeRange::new(req.start, req.end);
    if !venue.hours().contains(&range) {
        return Err(EngineError::InvalidTimeRange(format!(
            "{}-{} is outside opening hours {}-{}",
            format_time_of_day(req.start),
            format_time_of_day(req.end),
            format_time_of_day(venue.opening),
            format_time_of_day(venue.closing)
        )));
    }
    Ok(range)
}

impl Engine {
    /// Reserve `[start, end)` at a venue for one customer.
    ///
    /// Opening the day, claiming its rows and recording the booking commit
    /// as a single WAL frame. On any failure nothing is persisted.
    pub async fn book_slot(&self, req: BookingRequest) -> Result<BookingReceipt, EngineError> {
        let venue = self.get_venue(&req.venue_id)?;
        let range = validate_request(&venue, &req)?;
        let amount = price(venue.rate_per_hour, &range)?;

        let key = DayKey::new(req.venue_id, req.date);
        let mut txn = self.lock_day(key).await?;
        let staged = self.stage_open(&mut txn, key, venue.opening, venue.closing)?;
        if let Err(e) = staged.day.check_claim(&range) {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }
        let held = self
            .tables
            .by_customer
            .get(&req.customer_id)
            .map_or(0, |ids| ids.len());
        if held >= MAX_BOOKINGS_PER_CUSTOMER {
            return Err(EngineError::LimitExceeded("too many bookings for customer"));
        }

        let booking = Booking {
            id: Ulid::new(),
            customer_id: req.customer_id,
            venue_id: req.venue_id,
            date: req.date,
            booked_at: Utc::now(),
            range,
            game: req.game.trim().to_lowercase(),
            amount,
        };
        let receipt = BookingReceipt {
            booking_id: booking.id,
            amount,
        };
        txn.stage(Event::BookingCommitted { booking });
        txn.commit().await?;

        if staged.opened {
            metrics::counter!(observability::DAYS_OPENED_TOTAL).increment(1);
        }
        metrics::counter!(observability::BOOKINGS_COMMITTED_TOTAL).increment(1);
        tracing::info!(
            "booked {} at {} on {} {}-{} for {amount}",
            receipt.booking_id,
            req.venue_id,
            req.date,
            format_time_of_day(range.start),
            format_time_of_day(range.end)
        );
        Ok(receipt)
    }

    /// Release a booking's slots and delete it. Returns the removed record.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let key = self
            .tables
            .bookings
            .get(&id)
            .map(|b| b.day())
            .ok_or(EngineError::BookingNotFound(id))?;
        let mut txn = self.lock_day(key).await.map_err(|e| match e {
            EngineError::VenueNotFound(_) => EngineError::BookingNotFound(id),
            other => other,
        })?;
        // A concurrent cancel may have won while we waited for the lock.
        let booking = self
            .tables
            .bookings
            .get(&id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::BookingNotFound(id))?;

        txn.stage(Event::BookingCancelled {
            id,
            venue_id: booking.venue_id,
            date: booking.date,
            customer_id: booking.customer_id,
        });
        txn.commit().await?;

        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        tracing::info!("cancelled booking {id}");
        Ok(booking)
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.read_retrying("get_booking", || async move {
            self.tables
                .bookings
                .get(&id)
                .map(|b| b.value().clone())
                .ok_or(EngineError::BookingNotFound(id))
        })
        .await
    }

    /// A customer's bookings in the order they were made. Unknown
    /// customers have none.
    pub async fn list_bookings(&self, customer_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        self.read_retrying("list_bookings", || async move {
            let ids = self
                .tables
                .by_customer
                .get(&customer_id)
                .map(|ids| ids.value().clone())
                .unwrap_or_default();
            Ok(ids
                .iter()
                .filter_map(|id| self.tables.bookings.get(id).map(|b| b.value().clone()))
                .collect())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime};

    use super::*;

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    fn venue() -> Venue {
        Venue {
            id: Ulid::new(),
            name: None,
            opening: t(9),
            closing: t(12),
            rate_per_hour: 100,
            games: ["football".to_string()].into_iter().collect(),
        }
    }

    fn request(venue: &Venue, start: u32, end: u32, game: &str) -> BookingRequest {
        BookingRequest {
            customer_id: Ulid::new(),
            venue_id: venue.id,
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            start: t(start),
            end: t(end),
            game: game.into(),
        }
    }

    #[test]
    fn request_within_hours_is_valid() {
        let v = venue();
        assert_eq!(
            validate_request(&v, &request(&v, 11, 12, "Football")).unwrap(),
            TimeRange::new(t(11), t(12))
        );
    }

    #[test]
    fn request_before_opening_rejected() {
        let v = venue();
        assert!(matches!(
            validate_request(&v, &request(&v, 8, 10, "football")),
            Err(EngineError::InvalidTimeRange(_))
        ));
    }

    #[test]
    fn request_past_closing_rejected() {
        let v = venue();
        assert!(matches!(
            validate_request(&v, &request(&v, 11, 13, "football")),
            Err(EngineError::InvalidTimeRange(_))
        ));
    }

    #[test]
    fn inverted_request_rejected() {
        let v = venue();
        assert!(matches!(
            validate_request(&v, &request(&v, 11, 10, "football")),
            Err(EngineError::InvalidTimeRange(_))
        ));
    }

    #[test]
    fn unknown_game_checked_first() {
        let v = venue();
        assert!(matches!(
            validate_request(&v, &request(&v, 8, 7, "cricket")),
            Err(EngineError::GameNotOffered { .. })
        ));
    }
}
