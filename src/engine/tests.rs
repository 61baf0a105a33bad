use super::*;
use crate::limits::*;

use chrono::{NaiveDate, NaiveTime};

fn t(h: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, 0, 0).unwrap()
}

fn r(start: u32, end: u32) -> TimeRange {
    TimeRange::new(t(start), t(end))
}

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> (Engine, PathBuf) {
    let path = test_wal_path(name);
    let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
    (engine, path)
}

/// Football venue open 09:00-12:00 at 100 per hour.
fn football_venue() -> Venue {
    Venue {
        id: Ulid::new(),
        name: Some("Riverside Turf".into()),
        opening: t(9),
        closing: t(12),
        rate_per_hour: 100,
        games: ["football".to_string()].into_iter().collect(),
    }
}

fn request(
    venue_id: Ulid,
    customer_id: Ulid,
    date: NaiveDate,
    start: u32,
    end: u32,
) -> BookingRequest {
    BookingRequest {
        customer_id,
        venue_id,
        date,
        start: t(start),
        end: t(end),
        game: "football".into(),
    }
}

async fn registered(engine: &Engine) -> Venue {
    let venue = football_venue();
    engine.register_venue(venue.clone()).await.unwrap();
    venue
}

// ── Venue table ──────────────────────────────────────────

#[tokio::test]
async fn register_and_lookup_venue() {
    let (engine, _) = new_engine("register_lookup.wal");
    let mut venue = football_venue();
    venue.games = ["Football".to_string(), " Squash".to_string()].into_iter().collect();
    engine.register_venue(venue.clone()).await.unwrap();

    let stored = engine.get_venue(&venue.id).unwrap();
    assert_eq!(stored.games.len(), 2);
    assert!(stored.games.contains("squash"));
    assert_eq!(engine.venue_hours(&venue.id).unwrap(), (t(9), t(12)));
    assert_eq!(engine.venue_rate(&venue.id).unwrap(), 100);
    assert!(engine.venue_offers_game(&venue.id, "SQUASH").unwrap());
    assert!(!engine.venue_offers_game(&venue.id, "cricket").unwrap());
    assert_eq!(engine.list_venues().len(), 1);
}

#[tokio::test]
async fn duplicate_venue_rejected() {
    let (engine, _) = new_engine("duplicate_venue.wal");
    let venue = registered(&engine).await;
    assert_eq!(
        engine.register_venue(venue.clone()).await,
        Err(EngineError::AlreadyExists(venue.id))
    );
}

#[tokio::test]
async fn venue_with_partial_hour_rejected() {
    let (engine, _) = new_engine("partial_hour_venue.wal");
    let mut venue = football_venue();
    venue.closing = NaiveTime::from_hms_opt(11, 30, 0).unwrap();
    assert!(matches!(
        engine.register_venue(venue).await,
        Err(EngineError::InvalidDuration(_))
    ));
    assert!(engine.list_venues().is_empty());
}

#[tokio::test]
async fn venue_name_length_limited() {
    let (engine, _) = new_engine("venue_name_limit.wal");
    let mut venue = football_venue();
    venue.name = Some("x".repeat(MAX_NAME_LEN + 1));
    assert!(matches!(
        engine.register_venue(venue).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn unknown_venue_lookups_fail() {
    let (engine, _) = new_engine("unknown_venue.wal");
    let id = Ulid::new();
    assert_eq!(engine.get_venue(&id), Err(EngineError::VenueNotFound(id)));
    assert_eq!(engine.venue_rate(&id), Err(EngineError::VenueNotFound(id)));
    assert_eq!(
        engine.check_availability(id, d(1)).await,
        Err(EngineError::VenueNotFound(id))
    );
    assert_eq!(
        engine.book_slot(request(id, Ulid::new(), d(1), 9, 10)).await,
        Err(EngineError::VenueNotFound(id))
    );
    assert_eq!(engine.remove_venue(id).await, Err(EngineError::VenueNotFound(id)));
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn first_query_opens_grid() {
    let (engine, _) = new_engine("first_query.wal");
    let venue = registered(&engine).await;

    assert!(engine.list_slots(venue.id, d(1)).await.unwrap().is_empty());
    let free = engine.check_availability(venue.id, d(1)).await.unwrap();
    assert_eq!(free, vec![r(9, 10), r(10, 11), r(11, 12)]);

    let slots = engine.list_slots(venue.id, d(1)).await.unwrap();
    assert_eq!(slots.len(), 3);
    assert!(slots.iter().all(|s| s.is_available()));
}

#[tokio::test]
async fn availability_is_idempotent() {
    let (engine, _) = new_engine("availability_idempotent.wal");
    let venue = registered(&engine).await;

    let first = engine.check_availability(venue.id, d(1)).await.unwrap();
    let ids: Vec<Ulid> = engine
        .list_slots(venue.id, d(1))
        .await
        .unwrap()
        .iter()
        .map(|s| s.id)
        .collect();
    let appends = engine.wal_appends_since_compact().await;

    let second = engine.check_availability(venue.id, d(1)).await.unwrap();
    let ids_again: Vec<Ulid> = engine
        .list_slots(venue.id, d(1))
        .await
        .unwrap()
        .iter()
        .map(|s| s.id)
        .collect();

    assert_eq!(first, second);
    assert_eq!(ids, ids_again);
    // A second look at an opened day writes nothing.
    assert_eq!(engine.wal_appends_since_compact().await, appends);
}

#[tokio::test]
async fn ensure_day_reports_whether_it_opened() {
    let (engine, _) = new_engine("ensure_day.wal");
    let venue = registered(&engine).await;
    assert!(engine.ensure_day(venue.id, d(3), t(9), t(12)).await.unwrap());
    assert!(!engine.ensure_day(venue.id, d(3), t(9), t(12)).await.unwrap());
    assert_eq!(engine.list_available(venue.id, d(3)).await.unwrap().len(), 3);
}

#[tokio::test]
async fn days_are_independent() {
    let (engine, _) = new_engine("independent_days.wal");
    let venue = registered(&engine).await;
    engine
        .book_slot(request(venue.id, Ulid::new(), d(1), 9, 12))
        .await
        .unwrap();
    assert!(engine.check_availability(venue.id, d(1)).await.unwrap().is_empty());
    assert_eq!(engine.check_availability(venue.id, d(2)).await.unwrap().len(), 3);
}

// ── Booking ledger ───────────────────────────────────────

#[tokio::test]
async fn booking_scenario_for_morning_venue() {
    let (engine, _) = new_engine("morning_scenario.wal");
    let venue = registered(&engine).await;
    let customer = Ulid::new();

    assert_eq!(
        engine.check_availability(venue.id, d(1)).await.unwrap(),
        vec![r(9, 10), r(10, 11), r(11, 12)]
    );

    let receipt = engine
        .book_slot(request(venue.id, customer, d(1), 10, 11))
        .await
        .unwrap();
    assert_eq!(receipt.amount, 100);
    assert_eq!(
        engine.check_availability(venue.id, d(1)).await.unwrap(),
        vec![r(9, 10), r(11, 12)]
    );

    let conflict = engine
        .book_slot(request(venue.id, Ulid::new(), d(1), 10, 11))
        .await;
    assert_eq!(conflict, Err(EngineError::SlotConflict(r(10, 11))));

    let booking = engine.get_booking(receipt.booking_id).await.unwrap();
    assert_eq!(booking.customer_id, customer);
    assert_eq!(booking.range, r(10, 11));
    assert_eq!(booking.amount, 100);

    let slots = engine.list_slots(venue.id, d(1)).await.unwrap();
    assert_eq!(slots[1].status, SlotStatus::Booked);
    assert_eq!(slots[1].booking_id, Some(receipt.booking_id));
}

#[tokio::test]
async fn booking_without_prior_query_opens_day() {
    let (engine, _) = new_engine("book_unqueried.wal");
    let venue = registered(&engine).await;
    let receipt = engine
        .book_slot(request(venue.id, Ulid::new(), d(9), 9, 10))
        .await
        .unwrap();
    assert_eq!(receipt.amount, 100);
    let slots = engine.list_slots(venue.id, d(9)).await.unwrap();
    assert_eq!(slots.len(), 3);
    assert_eq!(slots.iter().filter(|s| !s.is_available()).count(), 1);
}

#[tokio::test]
async fn spanning_booking_claims_every_slot() {
    let (engine, _) = new_engine("spanning_booking.wal");
    let venue = registered(&engine).await;
    let receipt = engine
        .book_slot(request(venue.id, Ulid::new(), d(1), 9, 11))
        .await
        .unwrap();
    assert_eq!(receipt.amount, 200);
    assert_eq!(
        engine.check_availability(venue.id, d(1)).await.unwrap(),
        vec![r(11, 12)]
    );
    let claimed: Vec<_> = engine
        .list_slots(venue.id, d(1))
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.booking_id == Some(receipt.booking_id))
        .collect();
    assert_eq!(claimed.len(), 2);
}

#[tokio::test]
async fn partial_overlap_conflicts_without_side_effects() {
    let (engine, _) = new_engine("partial_overlap.wal");
    let venue = registered(&engine).await;
    engine
        .book_slot(request(venue.id, Ulid::new(), d(1), 11, 12))
        .await
        .unwrap();
    let before = engine.list_slots(venue.id, d(1)).await.unwrap();

    let loser = Ulid::new();
    assert!(matches!(
        engine.book_slot(request(venue.id, loser, d(1), 10, 12)).await,
        Err(EngineError::SlotConflict(_))
    ));
    assert_eq!(engine.list_slots(venue.id, d(1)).await.unwrap(), before);
    assert!(engine.list_bookings(loser).await.unwrap().is_empty());
}

#[tokio::test]
async fn booking_up_to_closing_succeeds() {
    let (engine, _) = new_engine("closing_boundary.wal");
    let venue = registered(&engine).await;
    assert!(engine
        .book_slot(request(venue.id, Ulid::new(), d(1), 11, 12))
        .await
        .is_ok());
}

#[tokio::test]
async fn booking_before_opening_rejected() {
    let (engine, _) = new_engine("opening_boundary.wal");
    let venue = registered(&engine).await;
    assert!(matches!(
        engine
            .book_slot(request(venue.id, Ulid::new(), d(1), 8, 10))
            .await,
        Err(EngineError::InvalidTimeRange(_))
    ));
    assert_eq!(engine.check_availability(venue.id, d(1)).await.unwrap().len(), 3);
}

#[tokio::test]
async fn booking_unoffered_game_rejected() {
    let (engine, _) = new_engine("unoffered_game.wal");
    let venue = registered(&engine).await;
    let mut req = request(venue.id, Ulid::new(), d(1), 9, 10);
    req.game = "cricket".into();
    assert!(matches!(
        engine.book_slot(req).await,
        Err(EngineError::GameNotOffered { .. })
    ));
    // Rejected before the day was touched.
    assert!(engine.list_slots(venue.id, d(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn game_match_ignores_case() {
    let (engine, _) = new_engine("game_case.wal");
    let venue = registered(&engine).await;
    let mut req = request(venue.id, Ulid::new(), d(1), 9, 10);
    req.game = "FootBall".into();
    let receipt = engine.book_slot(req).await.unwrap();
    assert_eq!(engine.get_booking(receipt.booking_id).await.unwrap().game, "football");
}

#[tokio::test]
async fn slot_count_is_conserved() {
    let (engine, _) = new_engine("conservation.wal");
    let venue = registered(&engine).await;
    let total = engine.check_availability(venue.id, d(1)).await.unwrap().len();

    let a = engine
        .book_slot(request(venue.id, Ulid::new(), d(1), 9, 10))
        .await
        .unwrap();
    engine
        .book_slot(request(venue.id, Ulid::new(), d(1), 10, 12))
        .await
        .unwrap();
    engine.cancel_booking(a.booking_id).await.unwrap();

    let slots = engine.list_slots(venue.id, d(1)).await.unwrap();
    let available = slots.iter().filter(|s| s.is_available()).count();
    let booked = slots.iter().filter(|s| !s.is_available()).count();
    assert_eq!(slots.len(), total);
    assert_eq!(available + booked, total);
    assert_eq!(booked, 2);
}

#[tokio::test]
async fn book_then_cancel_round_trip() {
    let (engine, _) = new_engine("book_cancel.wal");
    let venue = registered(&engine).await;
    let customer = Ulid::new();
    let before = engine.check_availability(venue.id, d(1)).await.unwrap();

    let receipt = engine
        .book_slot(request(venue.id, customer, d(1), 9, 11))
        .await
        .unwrap();
    let cancelled = engine.cancel_booking(receipt.booking_id).await.unwrap();
    assert_eq!(cancelled.id, receipt.booking_id);

    assert_eq!(engine.check_availability(venue.id, d(1)).await.unwrap(), before);
    assert!(engine
        .list_slots(venue.id, d(1))
        .await
        .unwrap()
        .iter()
        .all(|s| s.booking_id.is_none()));
    assert_eq!(
        engine.get_booking(receipt.booking_id).await,
        Err(EngineError::BookingNotFound(receipt.booking_id))
    );
    assert!(engine.list_bookings(customer).await.unwrap().is_empty());
    assert_eq!(
        engine.cancel_booking(receipt.booking_id).await,
        Err(EngineError::BookingNotFound(receipt.booking_id))
    );
}

#[tokio::test]
async fn list_bookings_keeps_insertion_order() {
    let (engine, _) = new_engine("list_order.wal");
    let venue = registered(&engine).await;
    let customer = Ulid::new();
    let late = engine
        .book_slot(request(venue.id, customer, d(1), 11, 12))
        .await
        .unwrap();
    let early = engine
        .book_slot(request(venue.id, customer, d(1), 9, 10))
        .await
        .unwrap();

    let ids: Vec<Ulid> = engine
        .list_bookings(customer)
        .await
        .unwrap()
        .iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(ids, vec![late.booking_id, early.booking_id]);
}

#[tokio::test]
async fn list_bookings_for_stranger_is_empty() {
    let (engine, _) = new_engine("list_empty.wal");
    assert_eq!(engine.list_bookings(Ulid::new()).await, Ok(Vec::new()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_bookings_one_wins() {
    let (engine, _) = new_engine("concurrent_bookings.wal");
    let engine = Arc::new(engine);
    let venue = registered(&engine).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let eng = engine.clone();
        let venue_id = venue.id;
        handles.push(tokio::spawn(async move {
            eng.book_slot(request(venue_id, Ulid::new(), d(1), 10, 11)).await
        }));
    }

    let mut won = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => won += 1,
            Err(EngineError::SlotConflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(conflicts, 15);
    let booked = engine
        .list_slots(venue.id, d(1))
        .await
        .unwrap()
        .into_iter()
        .filter(|s| !s.is_available())
        .count();
    assert_eq!(booked, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_queries_open_day_once() {
    let (engine, _) = new_engine("concurrent_open.wal");
    let engine = Arc::new(engine);
    let venue = registered(&engine).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let eng = engine.clone();
        let venue_id = venue.id;
        handles.push(tokio::spawn(async move {
            eng.ensure_day(venue_id, d(1), t(9), t(12)).await
        }));
    }
    let mut opened = 0;
    for h in handles {
        if h.await.unwrap().unwrap() {
            opened += 1;
        }
    }
    assert_eq!(opened, 1);
    assert_eq!(engine.list_slots(venue.id, d(1)).await.unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_bookings_one_wins() {
    let (engine, _) = new_engine("concurrent_overlap.wal");
    let engine = Arc::new(engine);
    let venue = registered(&engine).await;

    for day in 1..=10 {
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let mut handles = Vec::new();
        for (start, end) in [(9, 11), (10, 12)] {
            let eng = engine.clone();
            let barrier = barrier.clone();
            let venue_id = venue.id;
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                eng.book_slot(request(venue_id, Ulid::new(), d(day), start, end)).await
            }));
        }

        let mut won = 0;
        let mut conflicts = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => won += 1,
                Err(EngineError::SlotConflict(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((won, conflicts), (1, 1), "day {day}");
        let booked = engine
            .list_slots(venue.id, d(day))
            .await
            .unwrap()
            .into_iter()
            .filter(|s| !s.is_available())
            .count();
        assert_eq!(booked, 2, "day {day}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cancels_release_once() {
    let (engine, _) = new_engine("concurrent_cancel.wal");
    let engine = Arc::new(engine);
    let venue = registered(&engine).await;
    let receipt = engine
        .book_slot(request(venue.id, Ulid::new(), d(1), 9, 11))
        .await
        .unwrap();

    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let eng = engine.clone();
        let barrier = barrier.clone();
        let id = receipt.booking_id;
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            eng.cancel_booking(id).await
        }));
    }

    let mut cancelled = 0;
    let mut missing = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(booking) => {
                assert_eq!(booking.id, receipt.booking_id);
                cancelled += 1;
            }
            Err(EngineError::BookingNotFound(id)) => {
                assert_eq!(id, receipt.booking_id);
                missing += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((cancelled, missing), (1, 1));
    assert_eq!(engine.check_availability(venue.id, d(1)).await.unwrap().len(), 3);
}

// ── Day map bookkeeping ──────────────────────────────────

#[tokio::test]
async fn uncommitted_day_lock_leaves_no_entry() {
    let (engine, _) = new_engine("uncommitted_day.wal");
    let venue = registered(&engine).await;
    let key = DayKey::new(venue.id, d(1));

    let txn = engine.lock_day(key).await.unwrap();
    assert!(engine.tables.days.contains_key(&key));
    drop(txn);
    assert!(!engine.tables.days.contains_key(&key));
    assert_eq!(engine.tables.open_days(&venue.id), 0);
}

#[tokio::test]
async fn waiter_on_rolled_back_day_still_opens_it() {
    let (engine, _) = new_engine("rolled_back_waiter.wal");
    let engine = Arc::new(engine);
    let venue = registered(&engine).await;
    let key = DayKey::new(venue.id, d(1));

    let txn = engine.lock_day(key).await.unwrap();
    let eng = engine.clone();
    let waiter =
        tokio::spawn(async move { eng.ensure_day(key.venue_id, key.date, t(9), t(12)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(txn);

    assert_eq!(waiter.await.unwrap(), Ok(true));
    assert_eq!(engine.list_slots(venue.id, d(1)).await.unwrap().len(), 3);
    assert_eq!(engine.tables.open_days(&venue.id), 1);
}

#[tokio::test]
async fn rejected_day_opens_are_not_kept() {
    let path = test_wal_path("rejected_day_opens.wal");
    let engine = Engine::new(path, Arc::new(NotifyHub::new()))
        .unwrap()
        .with_max_open_days(2);
    let venue = registered(&engine).await;

    engine.check_availability(venue.id, d(1)).await.unwrap();
    engine.check_availability(venue.id, d(2)).await.unwrap();
    for day in 3..=12 {
        assert_eq!(
            engine.check_availability(venue.id, d(day)).await,
            Err(EngineError::LimitExceeded("too many open days at venue"))
        );
    }
    assert_eq!(
        engine
            .book_slot(request(venue.id, Ulid::new(), d(13), 9, 10))
            .await
            .map(|_| ()),
        Err(EngineError::LimitExceeded("too many open days at venue"))
    );

    assert_eq!(engine.tables.days.len(), 2);
    assert_eq!(engine.tables.open_days(&venue.id), 2);
    // Days already open stay bookable at the cap.
    engine
        .book_slot(request(venue.id, Ulid::new(), d(2), 9, 10))
        .await
        .unwrap();
}

// ── Cancellation and timeouts ────────────────────────────

#[tokio::test]
async fn timed_out_booking_leaves_no_trace() {
    let path = test_wal_path("timed_out_booking.wal");
    let engine = Engine::new(path, Arc::new(NotifyHub::new()))
        .unwrap()
        .with_op_timeout(Duration::from_millis(50));
    let venue = registered(&engine).await;
    let customer = Ulid::new();

    let day = engine.tables.day(DayKey::new(venue.id, d(1)));
    let blocker = day.write_owned().await;
    let result = engine
        .book_slot(request(venue.id, customer, d(1), 9, 10))
        .await;
    assert_eq!(result, Err(EngineError::Timeout(Duration::from_millis(50))));
    drop(blocker);

    assert!(engine.list_bookings(customer).await.unwrap().is_empty());
    assert!(engine.list_slots(venue.id, d(1)).await.unwrap().is_empty());
    assert_eq!(engine.check_availability(venue.id, d(1)).await.unwrap().len(), 3);
}

#[tokio::test]
async fn dropped_booking_future_leaves_no_trace() {
    let (engine, _) = new_engine("dropped_booking.wal");
    let venue = registered(&engine).await;
    let customer = Ulid::new();

    let day = engine.tables.day(DayKey::new(venue.id, d(1)));
    let blocker = day.write_owned().await;
    {
        let mut fut = tokio_test::task::spawn(
            engine.book_slot(request(venue.id, customer, d(1), 9, 10)),
        );
        tokio_test::assert_pending!(fut.poll());
    }
    drop(blocker);

    assert!(engine.list_bookings(customer).await.unwrap().is_empty());
    assert_eq!(engine.check_availability(venue.id, d(1)).await.unwrap().len(), 3);
}

// ── Venue removal ────────────────────────────────────────

#[tokio::test]
async fn removing_venue_drops_slots_and_bookings() {
    let (engine, path) = new_engine("remove_venue.wal");
    let venue = registered(&engine).await;
    let other = registered(&engine).await;
    let customer = Ulid::new();
    let gone = engine
        .book_slot(request(venue.id, customer, d(1), 9, 10))
        .await
        .unwrap();
    let kept = engine
        .book_slot(request(other.id, customer, d(1), 9, 10))
        .await
        .unwrap();

    engine.remove_venue(venue.id).await.unwrap();

    assert_eq!(
        engine.get_booking(gone.booking_id).await,
        Err(EngineError::BookingNotFound(gone.booking_id))
    );
    assert_eq!(
        engine.list_slots(venue.id, d(1)).await,
        Err(EngineError::VenueNotFound(venue.id))
    );
    let left: Vec<Ulid> = engine
        .list_bookings(customer)
        .await
        .unwrap()
        .iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(left, vec![kept.booking_id]);
    assert_eq!(
        engine.cancel_booking(gone.booking_id).await,
        Err(EngineError::BookingNotFound(gone.booking_id))
    );

    drop(engine);
    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(engine.list_venues(), vec![other]);
    assert_eq!(engine.list_bookings(customer).await.unwrap().len(), 1);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn wal_replay_reproduces_state() {
    let (engine, path) = new_engine("engine_replay.wal");
    let venue = registered(&engine).await;
    let customer = Ulid::new();
    let a = engine
        .book_slot(request(venue.id, customer, d(1), 9, 10))
        .await
        .unwrap();
    let b = engine
        .book_slot(request(venue.id, customer, d(1), 10, 12))
        .await
        .unwrap();
    engine.cancel_booking(a.booking_id).await.unwrap();
    let slots = engine.list_slots(venue.id, d(1)).await.unwrap();
    let booking = engine.get_booking(b.booking_id).await.unwrap();
    drop(engine);

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(engine.get_venue(&venue.id).unwrap(), venue);
    assert_eq!(engine.list_slots(venue.id, d(1)).await.unwrap(), slots);
    assert_eq!(engine.get_booking(b.booking_id).await.unwrap(), booking);
    assert_eq!(engine.list_bookings(customer).await.unwrap(), vec![booking]);
}

#[tokio::test]
async fn commits_after_torn_tail_survive_restart() {
    let (engine, path) = new_engine("engine_torn_tail.wal");
    let venue = registered(&engine).await;
    drop(engine);
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
    }

    let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
    let receipt = engine
        .book_slot(request(venue.id, Ulid::new(), d(1), 9, 10))
        .await
        .unwrap();
    drop(engine);

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let booking = engine.get_booking(receipt.booking_id).await.unwrap();
    assert_eq!(booking.range, r(9, 10));
    assert_eq!(
        engine.check_availability(venue.id, d(1)).await.unwrap(),
        vec![r(10, 11), r(11, 12)]
    );
}

#[tokio::test]
async fn compaction_preserves_state() {
    let (engine, path) = new_engine("engine_compact.wal");
    let venue = registered(&engine).await;
    let customer = Ulid::new();
    for day in 1..=5 {
        let receipt = engine
            .book_slot(request(venue.id, customer, d(day), 9, 10))
            .await
            .unwrap();
        engine.cancel_booking(receipt.booking_id).await.unwrap();
        engine
            .book_slot(request(venue.id, customer, d(day), 10, 12))
            .await
            .unwrap();
    }
    let bookings = engine.list_bookings(customer).await.unwrap();
    let slots = engine.list_slots(venue.id, d(3)).await.unwrap();
    let size_before = std::fs::metadata(&path).unwrap().len();

    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(
        size_after < size_before,
        "compacted WAL ({size_after}) should be smaller than original ({size_before})"
    );

    // Commits after compaction land in the new log.
    let late = engine
        .book_slot(request(venue.id, customer, d(3), 9, 10))
        .await
        .unwrap();
    drop(engine);

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let mut replayed = engine.list_bookings(customer).await.unwrap();
    assert_eq!(replayed.pop().map(|b| b.id), Some(late.booking_id));
    assert_eq!(replayed, bookings);
    let slot_ids: Vec<Ulid> = engine
        .list_slots(venue.id, d(3))
        .await
        .unwrap()
        .iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(slot_ids, slots.iter().map(|s| s.id).collect::<Vec<_>>());
    assert!(engine.check_availability(venue.id, d(3)).await.unwrap().is_empty());
}

// ── Change feed ──────────────────────────────────────────

#[tokio::test]
async fn subscribers_see_committed_events() {
    let (engine, _) = new_engine("change_feed.wal");
    let venue = registered(&engine).await;
    let mut rx = engine.subscribe(venue.id);

    let receipt = engine
        .book_slot(request(venue.id, Ulid::new(), d(1), 9, 10))
        .await
        .unwrap();

    let opened: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(opened["DayOpened"]["slots"].as_array().unwrap().len(), 3);
    let booked: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(
        booked["BookingCommitted"]["booking"]["id"],
        receipt.booking_id.to_string()
    );

    // Rejected bookings publish nothing.
    let _ = engine
        .book_slot(request(venue.id, Ulid::new(), d(1), 9, 10))
        .await;
    assert!(rx.try_recv().is_err());
}
