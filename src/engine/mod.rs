mod availability;
mod calendar;
mod error;
mod inventory;
mod ledger;
mod pricing;
mod txn;
mod venues;
#[cfg(test)]
mod tests;

pub use calendar::{
    format_time_of_day, generate_grid, parse_date, parse_time_of_day, tiles_exactly, Grid,
    SLOT_UNIT,
};
pub use error::EngineError;
pub use inventory::DayState;
pub use pricing::price;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use txn::Txn;

pub type SharedDayState = Arc<RwLock<DayState>>;

/// Per-venue gate. Day-level work holds it shared; venue removal and WAL
/// compaction hold it exclusively.
pub(crate) type VenueGate = Arc<RwLock<()>>;

pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

// ── Group-commit WAL channel ─────────────────────────────

pub(crate) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Commit, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is pending are written
/// together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { commit, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch: Vec<Pending> = vec![(commit, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { commit, response } => batch.push((commit, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

/// Append and sync a batch. On failure the whole batch is cut from the log
/// so no later frame lands behind a partial one.
fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(commit, _)| wal.append_buffered(commit))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.discard_unsynced()
    {
        tracing::error!("failed to discard unsynced WAL bytes: {e}");
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Send one commit to the writer and wait for it to be durable.
pub(crate) async fn append_commit(
    wal_tx: &mpsc::Sender<WalCommand>,
    commit: Commit,
) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append { commit, response: tx })
        .await
        .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::WalError(e.to_string()))
}

// ── Materialised state ───────────────────────────────────

pub(crate) type DayGuards = Vec<(DayKey, OwnedRwLockWriteGuard<DayState>)>;

/// In-memory tables rebuilt from the WAL. Mutated only by `apply`.
#[derive(Default)]
pub(crate) struct Tables {
    pub(crate) venues: DashMap<Ulid, Venue>,
    pub(crate) gates: DashMap<Ulid, VenueGate>,
    pub(crate) days: DashMap<DayKey, SharedDayState>,
    /// Venue → number of days with a materialised grid.
    pub(crate) open_days: DashMap<Ulid, usize>,
    pub(crate) bookings: DashMap<Ulid, Booking>,
    /// Customer → booking ids in creation order.
    pub(crate) by_customer: DashMap<Ulid, Vec<Ulid>>,
}

impl Tables {
    pub(crate) fn day(&self, key: DayKey) -> SharedDayState {
        self.days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(key.venue_id, key.date))))
            .clone()
    }

    pub(crate) fn open_days(&self, venue_id: &Ulid) -> usize {
        self.open_days.get(venue_id).map_or(0, |n| *n)
    }

    /// Remove the map entry for a day that never got rows, provided it is
    /// still the state the caller locked.
    pub(crate) fn forget_unopened(&self, key: DayKey, locked: &SharedDayState) {
        self.days
            .remove_if(&key, |_, day| Arc::ptr_eq(day, locked));
    }

    /// Run `f` on the day's state: through the caller's guard when one is
    /// held, otherwise by an uncontended lock (replay).
    fn with_day<R>(
        &self,
        key: DayKey,
        guards: &mut DayGuards,
        f: impl FnOnce(&mut DayState) -> R,
    ) -> Option<R> {
        if let Some((_, guard)) = guards.iter_mut().find(|(k, _)| *k == key) {
            return Some(f(guard));
        }
        let day = self.day(key);
        let mut guard = day.try_write().ok()?;
        Some(f(&mut guard))
    }

    /// Apply one committed event. Deterministic given the table contents,
    /// so replay reproduces exactly what the live engine did.
    pub(crate) fn apply(&self, event: &Event, guards: &mut DayGuards) {
        match event {
            Event::VenueRegistered { venue } => {
                self.gates
                    .entry(venue.id)
                    .or_insert_with(|| Arc::new(RwLock::new(())));
                self.venues.insert(venue.id, venue.clone());
            }
            Event::VenueRemoved { id } => {
                self.venues.remove(id);
                self.gates.remove(id);
                for (_, guard) in guards.iter_mut().filter(|(k, _)| k.venue_id == *id) {
                    guard.slots.clear();
                }
                self.days.retain(|key, _| key.venue_id != *id);
                self.open_days.remove(id);
                let mut dropped: Vec<(Ulid, Ulid)> = Vec::new();
                self.bookings.retain(|bid, b| {
                    let keep = b.venue_id != *id;
                    if !keep {
                        dropped.push((b.customer_id, *bid));
                    }
                    keep
                });
                for (customer_id, booking_id) in dropped {
                    self.forget_customer_booking(customer_id, booking_id);
                }
            }
            Event::DayOpened { venue_id, date, slots } => {
                if !self.venues.contains_key(venue_id) {
                    return;
                }
                let key = DayKey::new(*venue_id, *date);
                let applied = self.with_day(key, guards, |day| {
                    let was_empty = day.is_empty();
                    for row in slots {
                        day.insert_slot(Slot::available(row.id, row.range));
                    }
                    was_empty && !day.is_empty()
                });
                match applied {
                    Some(true) => *self.open_days.entry(*venue_id).or_default() += 1,
                    Some(false) => {}
                    None => {
                        tracing::error!("day {venue_id}/{date} busy during apply; slots not opened")
                    }
                }
            }
            Event::BookingCommitted { booking } => {
                if !self.venues.contains_key(&booking.venue_id) {
                    return;
                }
                let claimed = self
                    .with_day(booking.day(), guards, |day| day.claim(&booking.range, booking.id));
                match claimed {
                    Some(Ok(_)) => {
                        self.bookings.insert(booking.id, booking.clone());
                        self.by_customer
                            .entry(booking.customer_id)
                            .or_default()
                            .push(booking.id);
                    }
                    Some(Err(e)) => {
                        tracing::warn!("skipping booking {} on apply: {e}", booking.id);
                    }
                    None => tracing::error!("day busy during apply; booking {} lost", booking.id),
                }
            }
            Event::BookingCancelled {
                id,
                venue_id,
                date,
                customer_id,
            } => {
                let key = DayKey::new(*venue_id, *date);
                if self.days.contains_key(&key) || guards.iter().any(|(k, _)| *k == key) {
                    self.with_day(key, guards, |day| day.release(*id));
                }
                self.bookings.remove(id);
                self.forget_customer_booking(*customer_id, *id);
            }
        }
    }

    fn forget_customer_booking(&self, customer_id: Ulid, booking_id: Ulid) {
        let now_empty = match self.by_customer.get_mut(&customer_id) {
            Some(mut ids) => {
                ids.retain(|b| *b != booking_id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_customer.remove_if(&customer_id, |_, ids| ids.is_empty());
        }
    }
}

pub struct Engine {
    pub(crate) tables: Arc<Tables>,
    pub(crate) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Serialises venue registration, removal and compaction.
    pub(crate) admin: Arc<Mutex<()>>,
    pub(crate) op_timeout: Duration,
    pub(crate) max_open_days: usize,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, commits) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let tables = Arc::new(Tables::default());
        let mut no_guards = DayGuards::new();
        for commit in &commits {
            for event in &commit.events {
                tables.apply(event, &mut no_guards);
            }
        }
        tracing::debug!(
            "replayed {} commits: {} venues, {} bookings",
            commits.len(),
            tables.venues.len(),
            tables.bookings.len()
        );

        Ok(Self {
            tables,
            wal_tx,
            notify,
            admin: Arc::new(Mutex::new(())),
            op_timeout: DEFAULT_OP_TIMEOUT,
            max_open_days: crate::limits::MAX_OPEN_DAYS_PER_VENUE,
        })
    }

    /// Deadline for acquiring any lock a single operation needs.
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// Cap on materialised days per venue.
    pub fn with_max_open_days(mut self, max_open_days: usize) -> Self {
        self.max_open_days = max_open_days;
        self
    }

    pub(crate) fn begin(&self) -> Txn {
        Txn::new(self.tables.clone(), self.wal_tx.clone(), self.notify.clone())
    }

    /// Await `fut` under the operation deadline.
    pub(crate) async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = T>,
    ) -> Result<T, EngineError> {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| EngineError::Timeout(self.op_timeout))
    }

    pub(crate) fn gate(&self, venue_id: &Ulid) -> Result<VenueGate, EngineError> {
        self.tables
            .gates
            .get(venue_id)
            .map(|g| g.value().clone())
            .ok_or(EngineError::VenueNotFound(*venue_id))
    }

    /// Run an idempotent read, retrying once on a transient failure.
    pub(crate) async fn read_retrying<T, F, Fut>(
        &self,
        op: &'static str,
        f: F,
    ) -> Result<T, EngineError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, EngineError>>,
    {
        match f().await {
            Err(e) if e.is_transient() => {
                tracing::debug!("{op}: retrying after transient failure: {e}");
                f().await
            }
            other => other,
        }
    }

    /// Subscribe to committed changes at one venue (JSON payloads).
    pub fn subscribe(&self, venue_id: Ulid) -> broadcast::Receiver<String> {
        self.notify.subscribe(venue_id)
    }

    /// Rewrite the WAL with the minimal commits that recreate current state.
    /// Holds every venue gate exclusively, so no commit is in flight while
    /// the snapshot is taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _admin = self.admin.lock().await;
        let mut gates: Vec<(Ulid, VenueGate)> = self
            .tables
            .gates
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        gates.sort_by_key(|(id, _)| *id);
        let mut held = Vec::with_capacity(gates.len());
        for (_, gate) in gates {
            held.push(gate.write_owned().await);
        }

        let commits = self.snapshot().await;

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { commits, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    async fn snapshot(&self) -> Vec<Commit> {
        let mut venues: Vec<Venue> = self.tables.venues.iter().map(|e| e.value().clone()).collect();
        venues.sort_by_key(|v| v.id);

        let mut days_by_venue: BTreeMap<Ulid, Vec<(DayKey, SharedDayState)>> = BTreeMap::new();
        for entry in self.tables.days.iter() {
            days_by_venue
                .entry(entry.key().venue_id)
                .or_default()
                .push((*entry.key(), entry.value().clone()));
        }

        let mut commits = Vec::with_capacity(venues.len() + 1);
        for venue in venues {
            let mut events = vec![Event::VenueRegistered { venue: venue.clone() }];
            let mut days = days_by_venue.remove(&venue.id).unwrap_or_default();
            days.sort_by_key(|(key, _)| *key);
            for (key, day) in days {
                let guard = day.read().await;
                if guard.is_empty() {
                    continue;
                }
                events.push(Event::DayOpened {
                    venue_id: key.venue_id,
                    date: key.date,
                    slots: guard
                        .slots
                        .iter()
                        .map(|s| SlotRow { id: s.id, range: s.range })
                        .collect(),
                });
            }
            commits.push(Commit { events });
        }

        let mut customers: Vec<(Ulid, Vec<Ulid>)> = self
            .tables
            .by_customer
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        customers.sort_by_key(|(id, _)| *id);
        let bookings: Vec<Event> = customers
            .into_iter()
            .flat_map(|(_, ids)| ids)
            .filter_map(|id| self.tables.bookings.get(&id).map(|b| b.value().clone()))
            .map(|booking| Event::BookingCommitted { booking })
            .collect();
        if !bookings.is_empty() {
            commits.push(Commit { events: bookings });
        }
        commits
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
