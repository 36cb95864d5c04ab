//! Table observer registrations.
//!
//! Observers are the seam every derived index hangs off: the table helper
//! dispatches to each registration after a CRDT transaction commits, in
//! commit order. Registrations are identified so a cancellation handle can
//! remove exactly one of them.

use std::sync::{Arc, Mutex, Weak};

use crate::BoxFuture;
use crate::validator::Validated;

/// Observes mutations on one table.
///
/// Add/update callbacks receive validated results; only valid rows are
/// fanned out to indexes, but the validated shape lets an observer log or
/// skip invalid ones. Delete receives only the id.
pub trait TableObserver: Send + Sync {
    /// A row was inserted.
    fn on_add<'a>(&'a self, row: &'a Validated) -> BoxFuture<'a, ()>;

    /// A row was updated (or fully replaced by an upsert).
    fn on_update<'a>(&'a self, row: &'a Validated) -> BoxFuture<'a, ()>;

    /// A row was deleted.
    fn on_delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ()>;
}

pub(crate) struct Registry {
    next_id: u64,
    entries: Vec<(u64, Arc<dyn TableObserver>)>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, observer: Arc<dyn TableObserver>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, observer));
        id
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.entries.retain(|(entry_id, _)| *entry_id != id);
    }

    /// Snapshot of current registrations, in registration order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn TableObserver>> {
        self.entries
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }
}

/// Identifies a single observer registration for removal.
///
/// The registration is removed on [`cancel`](ObserverHandle::cancel) or when
/// the handle is dropped.
pub struct ObserverHandle {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl ObserverHandle {
    pub(crate) fn new(id: u64, registry: &Arc<Mutex<Registry>>) -> Self {
        Self {
            id,
            registry: Arc::downgrade(registry),
        }
    }

    /// Remove this registration. Subsequent mutations no longer reach the
    /// observer; events already dispatched are unaffected.
    pub fn cancel(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().unwrap().remove(self.id);
        }
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle").field("id", &self.id).finish()
    }
}
