use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::txn::{Held, Txn};
use super::{DayState, Engine, EngineError};

/// Day view a transaction will leave behind, if it commits.
pub(crate) struct StagedDay {
    pub(crate) day: DayState,
    pub(crate) opened: bool,
}

impl Engine {
    /// Start a transaction holding the venue gate (shared) and the day's
    /// write lock. The venue is re-checked under the gate, since removal
    /// may have won the race for it.
    pub(crate) async fn lock_day(&self, key: DayKey) -> Result<Txn, EngineError> {
        let gate = self.gate(&key.venue_id)?;
        let shared = self.bounded(gate.read_owned()).await?;
        if !self.tables.venues.contains_key(&key.venue_id) {
            return Err(EngineError::VenueNotFound(key.venue_id));
        }
        // A rolled-back open may have removed the entry while we waited;
        // only a guard on the state still in the map is usable.
        let guard = loop {
            let day = self.tables.day(key);
            let guard = self.bounded(day.clone().write_owned()).await?;
            let current = self
                .tables
                .days
                .get(&key)
                .is_some_and(|entry| Arc::ptr_eq(entry.value(), &day));
            if current {
                break guard;
            }
        };

        let mut txn = self.begin();
        txn.hold(Held::GateShared { _guard: shared });
        txn.hold_day(guard);
        Ok(txn)
    }

    /// Stage the grid for a day that has no rows yet. Returns the day as
    /// it will look once `txn` applies.
    pub(crate) fn stage_open(
        &self,
        txn: &mut Txn,
        key: DayKey,
        opening: NaiveTime,
        closing: NaiveTime,
    ) -> Result<StagedDay, EngineError> {
        let mut day = txn
            .day(key)
            .cloned()
            .unwrap_or_else(|| DayState::new(key.venue_id, key.date));
        if !day.is_empty() {
            return Ok(StagedDay { day, opened: false });
        }

        if self.tables.open_days(&key.venue_id) >= self.max_open_days {
            return Err(EngineError::LimitExceeded("too many open days at venue"));
        }

        let slots = day.plan_open(opening, closing)?;
        for row in &slots {
            day.insert_slot(Slot::available(row.id, row.range));
        }
        let opened = !slots.is_empty();
        if opened {
            txn.stage(Event::DayOpened {
                venue_id: key.venue_id,
                date: key.date,
                slots,
            });
        }
        Ok(StagedDay { day, opened })
    }

    async fn open_day(
        &self,
        venue_id: Ulid,
        date: NaiveDate,
        opening: NaiveTime,
        closing: NaiveTime,
    ) -> Result<StagedDay, EngineError> {
        let key = DayKey::new(venue_id, date);
        let mut txn = self.lock_day(key).await?;
        let staged = self.stage_open(&mut txn, key, opening, closing)?;
        txn.commit().await?;
        if staged.opened {
            metrics::counter!(observability::DAYS_OPENED_TOTAL).increment(1);
            tracing::debug!("opened {} slots for {venue_id} on {date}", staged.day.slots.len());
        }
        Ok(staged)
    }

    /// Materialise the slot grid for (venue, date). `false` if the day
    /// already had rows.
    pub async fn ensure_day(
        &self,
        venue_id: Ulid,
        date: NaiveDate,
        opening: NaiveTime,
        closing: NaiveTime,
    ) -> Result<bool, EngineError> {
        self.open_day(venue_id, date, opening, closing)
            .await
            .map(|staged| staged.opened)
    }

    async fn read_day(
        &self,
        venue_id: Ulid,
        date: NaiveDate,
    ) -> Result<Option<DayState>, EngineError> {
        if !self.tables.venues.contains_key(&venue_id) {
            return Err(EngineError::VenueNotFound(venue_id));
        }
        let Some(day) = self
            .tables
            .days
            .get(&DayKey::new(venue_id, date))
            .map(|e| e.value().clone())
        else {
            return Ok(None);
        };
        let guard = self.bounded(day.read_owned()).await?;
        Ok(Some(guard.clone()))
    }

    /// Available rows ordered by start. Does not open the day.
    pub async fn list_available(
        &self,
        venue_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Slot>, EngineError> {
        Ok(self
            .read_day(venue_id, date)
            .await?
            .map(|day| day.available().cloned().collect())
            .unwrap_or_default())
    }

    /// Every row with its status. Does not open the day.
    pub async fn list_slots(
        &self,
        venue_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Slot>, EngineError> {
        Ok(self
            .read_day(venue_id, date)
            .await?
            .map(|day| day.slots)
            .unwrap_or_default())
    }

    /// Free ranges at a venue on `date`, opening the day on first use.
    pub async fn check_availability(
        &self,
        venue_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<TimeRange>, EngineError> {
        self.read_retrying("check_availability", || async move {
            let venue = self.get_venue(&venue_id)?;
            let staged = self.open_day(venue_id, date, venue.opening, venue.closing).await?;
            Ok::<_, EngineError>(staged.day.available().map(|s| s.range).collect())
        })
        .await
    }
}
