use std::mem;
use std::sync::Arc;

use tokio::sync::{mpsc, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard};

use crate::model::*;
use crate::notify::NotifyHub;

use super::{append_commit, DayGuards, DayState, EngineError, Tables, WalCommand};

/// Locks a transaction keeps until its commit has been applied.
pub(crate) enum Held {
    Admin { _guard: OwnedMutexGuard<()> },
    GateShared { _guard: OwnedRwLockReadGuard<()> },
    GateExclusive { _guard: OwnedRwLockWriteGuard<()> },
}

/// Scoped transaction over locked day states.
///
/// Events are staged, never applied, until `commit`. Dropping a `Txn`
/// without committing discards what was staged and releases its locks, so
/// every early return (`?`, a timed-out or cancelled caller) is a rollback.
/// Once `commit` starts, the append and apply run on their own task and
/// always finish together.
pub(crate) struct Txn {
    tables: Arc<Tables>,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
    held: Vec<Held>,
    days: DayGuards,
    staged: Vec<Event>,
}

impl Txn {
    pub(crate) fn new(
        tables: Arc<Tables>,
        wal_tx: mpsc::Sender<WalCommand>,
        notify: Arc<NotifyHub>,
    ) -> Self {
        Self {
            tables,
            wal_tx,
            notify,
            held: Vec::new(),
            days: Vec::new(),
            staged: Vec::new(),
        }
    }

    pub(crate) fn hold(&mut self, lock: Held) {
        self.held.push(lock);
    }

    pub(crate) fn hold_day(&mut self, guard: OwnedRwLockWriteGuard<DayState>) {
        self.days.push((guard.key(), guard));
    }

    pub(crate) fn day(&self, key: DayKey) -> Option<&DayState> {
        self.days.iter().find(|(k, _)| *k == key).map(|(_, g)| &**g)
    }

    pub(crate) fn stage(&mut self, event: Event) {
        self.staged.push(event);
    }

    /// Make every staged event durable as one WAL frame, then apply them
    /// while the locks are still held.
    pub(crate) async fn commit(mut self) -> Result<(), EngineError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let commit = Commit {
            events: mem::take(&mut self.staged),
        };
        let mut days = mem::take(&mut self.days);
        let held = mem::take(&mut self.held);
        let tables = self.tables.clone();
        let notify = self.notify.clone();
        let wal_tx = self.wal_tx.clone();

        let task = tokio::spawn(async move {
            let _held = held;
            let events = commit.events.clone();
            let appended = append_commit(&wal_tx, commit).await;
            if appended.is_ok() {
                for event in &events {
                    tables.apply(event, &mut days);
                    notify.send(event);
                }
            }
            forget_unopened(&tables, &days);
            appended
        });
        task.await
            .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            tracing::debug!("rolled back {} staged event(s)", self.staged.len());
        }
        forget_unopened(&self.tables, &self.days);
    }
}

/// Locked days still without rows were only placeholders for this
/// transaction; take them back out of the day map.
fn forget_unopened(tables: &Tables, days: &DayGuards) {
    for (key, guard) in days {
        if guard.is_empty() {
            tables.forget_unopened(*key, OwnedRwLockWriteGuard::rwlock(guard));
        }
    }
}
