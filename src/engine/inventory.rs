use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::calendar::{generate_grid, SLOT_UNIT};
use super::EngineError;

/// Slot rows for one (venue, date), sorted by `range.start`.
#[derive(Debug, Clone)]
pub struct DayState {
    pub venue_id: Ulid,
    pub date: NaiveDate,
    pub slots: Vec<Slot>,
}

impl DayState {
    pub fn new(venue_id: Ulid, date: NaiveDate) -> Self {
        Self {
            venue_id,
            date,
            slots: Vec::new(),
        }
    }

    pub fn key(&self) -> DayKey {
        DayKey::new(self.venue_id, self.date)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Insert a row keeping sort order. A row whose (start, end) already
    /// exists is rejected and `false` returned.
    pub fn insert_slot(&mut self, slot: Slot) -> bool {
        match self
            .slots
            .binary_search_by_key(&slot.range.start, |s| s.range.start)
        {
            Ok(pos) if self.slots[pos].range == slot.range => false,
            Ok(pos) | Err(pos) => {
                self.slots.insert(pos, slot);
                true
            }
        }
    }

    /// Rows to create for a fresh day: one per grid range without an
    /// existing row.
    pub fn plan_open(
        &self,
        opening: chrono::NaiveTime,
        closing: chrono::NaiveTime,
    ) -> Result<Vec<SlotRow>, EngineError> {
        let grid = generate_grid(opening, closing, SLOT_UNIT)?;
        Ok(grid
            .filter(|range| !self.slots.iter().any(|s| s.range == *range))
            .map(|range| SlotRow { id: Ulid::new(), range })
            .collect())
    }

    pub fn available(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter().filter(|s| s.is_available())
    }

    /// Rows lying within `range`, in order.
    fn within<'a>(&'a self, range: &'a TimeRange) -> impl Iterator<Item = &'a Slot> + 'a {
        let right_bound = self.slots.partition_point(|s| s.range.start < range.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| range.contains(&s.range))
    }

    /// Check that the rows within `range` tile it exactly and are all
    /// Available. Returns their ids; mutates nothing.
    pub fn check_claim(&self, range: &TimeRange) -> Result<Vec<Ulid>, EngineError> {
        let mut cursor = range.start;
        let mut ids = Vec::new();
        for slot in self.within(range) {
            if slot.range.start != cursor || !slot.is_available() {
                return Err(EngineError::SlotConflict(*range));
            }
            cursor = slot.range.end;
            ids.push(slot.id);
        }
        if ids.is_empty() || cursor != range.end {
            return Err(EngineError::SlotConflict(*range));
        }
        Ok(ids)
    }

    /// Flip every row within `range` to Booked under `booking_id`.
    /// All-or-nothing: on conflict nothing changes.
    pub fn claim(&mut self, range: &TimeRange, booking_id: Ulid) -> Result<usize, EngineError> {
        let ids = self.check_claim(range)?;
        for slot in self.slots.iter_mut().filter(|s| ids.contains(&s.id)) {
            slot.status = SlotStatus::Booked;
            slot.booking_id = Some(booking_id);
        }
        Ok(ids.len())
    }

    /// Return every row held by `booking_id` to Available. Unknown ids are
    /// a no-op.
    pub fn release(&mut self, booking_id: Ulid) -> usize {
        let mut released = 0;
        for slot in self
            .slots
            .iter_mut()
            .filter(|s| s.booking_id == Some(booking_id))
        {
            slot.status = SlotStatus::Available;
            slot.booking_id = None;
            released += 1;
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveTime;

    use super::*;

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    fn r(start: u32, end: u32) -> TimeRange {
        TimeRange::new(t(start), t(end))
    }

    fn opened_day(open: u32, close: u32) -> DayState {
        let mut day = DayState::new(Ulid::new(), NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
        for row in day.plan_open(t(open), t(close)).unwrap() {
            assert!(day.insert_slot(Slot::available(row.id, row.range)));
        }
        day
    }

    fn statuses(day: &DayState) -> Vec<SlotStatus> {
        day.slots.iter().map(|s| s.status).collect()
    }

    #[test]
    fn duplicate_range_rejected() {
        let mut day = opened_day(9, 12);
        assert!(!day.insert_slot(Slot::available(Ulid::new(), r(10, 11))));
        assert_eq!(day.slots.len(), 3);
    }

    #[test]
    fn plan_open_skips_existing_rows() {
        let mut day = DayState::new(Ulid::new(), NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
        day.insert_slot(Slot::available(Ulid::new(), r(10, 11)));
        let plan = day.plan_open(t(9), t(12)).unwrap();
        let ranges: Vec<_> = plan.iter().map(|row| row.range).collect();
        assert_eq!(ranges, vec![r(9, 10), r(11, 12)]);
    }

    #[test]
    fn rows_stay_sorted() {
        let mut day = DayState::new(Ulid::new(), NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
        day.insert_slot(Slot::available(Ulid::new(), r(11, 12)));
        day.insert_slot(Slot::available(Ulid::new(), r(9, 10)));
        day.insert_slot(Slot::available(Ulid::new(), r(10, 11)));
        let starts: Vec<_> = day.slots.iter().map(|s| s.range.start).collect();
        assert_eq!(starts, vec![t(9), t(10), t(11)]);
    }

    #[test]
    fn claim_single_slot() {
        let mut day = opened_day(9, 12);
        let booking = Ulid::new();
        assert_eq!(day.claim(&r(10, 11), booking).unwrap(), 1);
        assert_eq!(
            statuses(&day),
            vec![SlotStatus::Available, SlotStatus::Booked, SlotStatus::Available]
        );
        assert_eq!(day.slots[1].booking_id, Some(booking));
    }

    #[test]
    fn claim_spanning_slots() {
        let mut day = opened_day(9, 12);
        assert_eq!(day.claim(&r(9, 11), Ulid::new()).unwrap(), 2);
        assert_eq!(day.available().count(), 1);
    }

    #[test]
    fn claim_over_booked_slot_changes_nothing() {
        let mut day = opened_day(9, 12);
        day.claim(&r(11, 12), Ulid::new()).unwrap();
        let before = day.slots.clone();
        let result = day.claim(&r(10, 12), Ulid::new());
        assert!(matches!(result, Err(EngineError::SlotConflict(_))));
        assert_eq!(day.slots, before);
    }

    #[test]
    fn claim_outside_rows_conflicts() {
        let mut day = opened_day(9, 12);
        assert!(matches!(
            day.claim(&r(11, 13), Ulid::new()),
            Err(EngineError::SlotConflict(_))
        ));
        assert!(matches!(
            day.claim(&r(7, 8), Ulid::new()),
            Err(EngineError::SlotConflict(_))
        ));
        assert_eq!(day.available().count(), 3);
    }

    #[test]
    fn claim_misaligned_range_conflicts() {
        let mut day = opened_day(9, 12);
        let misaligned = TimeRange::new(
            NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(10, 30, 0).unwrap(),
        );
        assert!(matches!(
            day.claim(&misaligned, Ulid::new()),
            Err(EngineError::SlotConflict(_))
        ));
    }

    #[test]
    fn claim_on_unopened_day_conflicts() {
        let mut day = DayState::new(Ulid::new(), NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
        assert!(matches!(
            day.claim(&r(9, 10), Ulid::new()),
            Err(EngineError::SlotConflict(_))
        ));
    }

    #[test]
    fn release_restores_and_is_idempotent() {
        let mut day = opened_day(9, 12);
        let booking = Ulid::new();
        day.claim(&r(9, 11), booking).unwrap();
        assert_eq!(day.release(booking), 2);
        assert_eq!(day.available().count(), 3);
        assert!(day.slots.iter().all(|s| s.booking_id.is_none()));
        assert_eq!(day.release(booking), 0);
        assert_eq!(day.release(Ulid::new()), 0);
    }

    #[test]
    fn release_leaves_other_bookings_alone() {
        let mut day = opened_day(9, 12);
        let a = Ulid::new();
        let b = Ulid::new();
        day.claim(&r(9, 10), a).unwrap();
        day.claim(&r(10, 11), b).unwrap();
        day.release(a);
        assert_eq!(day.slots[1].booking_id, Some(b));
        assert_eq!(day.available().count(), 2);
    }
}
