//! Per-thread registry of the handle each thread holds on each database.
//!
//! An entry exists while the thread has a transaction open on that
//! database, or while a [`ThreadedGuard`] is on its stack. Any acquisition
//! on the same thread and database reuses the registered lease, so every
//! statement of one logical transaction runs on one connection.

use crate::pool::RecyclableHandle;
use crate::types::DatabaseId;
use std::cell::RefCell;
use std::collections::HashMap;

thread_local! {
    static THREADED_HANDLES: RefCell<HashMap<DatabaseId, RecyclableHandle>> =
        RefCell::new(HashMap::new());
}

/// Returns a new reference to the lease this thread holds on `database`.
pub(crate) fn threaded_handle(database: DatabaseId) -> Option<RecyclableHandle> {
    THREADED_HANDLES
        .try_with(|map| map.borrow().get(&database).cloned())
        .ok()
        .flatten()
}

/// Returns whether this thread holds a registered lease on `database`.
pub(crate) fn has_threaded_handle(database: DatabaseId) -> bool {
    THREADED_HANDLES
        .try_with(|map| map.borrow().contains_key(&database))
        .unwrap_or(false)
}

/// Registers `handle` for `database` unless an entry already exists.
/// Returns whether an entry was added.
pub(crate) fn mark_threaded(database: DatabaseId, handle: &RecyclableHandle) -> bool {
    THREADED_HANDLES
        .try_with(|map| {
            let mut map = map.borrow_mut();
            if map.contains_key(&database) {
                false
            } else {
                map.insert(database, handle.clone());
                true
            }
        })
        .unwrap_or(false)
}

/// Removes the entry for `database`.
pub(crate) fn mark_unthreaded(database: DatabaseId) {
    // The lease may be the last reference; recycle it outside the borrow.
    let removed = THREADED_HANDLES
        .try_with(|map| map.borrow_mut().remove(&database))
        .ok()
        .flatten();
    drop(removed);
}

/// Removes the entry for `database` once its handle left the transaction.
pub(crate) fn release_if_idle(database: DatabaseId) {
    if let Some(handle) = threaded_handle(database) {
        if !handle.is_in_transaction() {
            drop(handle);
            mark_unthreaded(database);
        }
    }
}

/// Keeps a lease registered for the duration of a scope.
///
/// On drop the registry is restored: an entry this guard added is removed
/// unless the handle is still inside a transaction that outlives the scope.
/// The guard never rolls anything back.
#[derive(Debug)]
pub(crate) struct ThreadedGuard {
    database: DatabaseId,
    registered: bool,
}

impl ThreadedGuard {
    pub(crate) fn new(database: DatabaseId, handle: &RecyclableHandle) -> Self {
        let registered = mark_threaded(database, handle);
        Self {
            database,
            registered,
        }
    }
}

impl Drop for ThreadedGuard {
    fn drop(&mut self) {
        if self.registered {
            release_if_idle(self.database);
        }
    }
}
