//! Bounded, lazily populated pool of handles for one database path.
//!
//! ## Protocol
//!
//! - `get_handle` pops an idle handle or generates a new one while fewer
//!   than `max_handles` are alive, then runs the configure hook before the
//!   lease is returned.
//! - A *blockade* stops issuance; callers wait on the pool condvar until it
//!   is lifted. Already issued leases keep working.
//! - `close` stops issuance, waits for every lease to come back, drops
//!   every handle, runs the caller's closure once with the pool empty, then
//!   resumes issuance. The next `get_handle` reopens transparently. A drain
//!   is counted apart from blockades, so `unblockade` cannot end it early.
//!
//! Only bookkeeping happens under the pool mutex. Generating and
//! configuring handles, and all SQL, run outside it.

mod recyclable;

pub use recyclable::RecyclableHandle;

use crate::error::{CoreError, CoreResult};
use crate::handle::Handle;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Hooks the pool calls around the life of a handle.
pub trait HandleLifecycle: Send + Sync {
    /// Creates a handle bound to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot open the file.
    fn generate(&self, path: &Path) -> CoreResult<Handle> {
        Handle::open(path)
    }

    /// Prepares a handle right before it is issued.
    ///
    /// # Errors
    ///
    /// A failure discards the handle and fails the acquisition.
    fn will_configure(&self, handle: &mut Handle) -> CoreResult<()>;

    /// Resets per-lease state right before a handle returns to the pool.
    fn will_flow_back(&self, _handle: &mut Handle) {}
}

#[derive(Debug, Default)]
struct PoolState {
    free: Vec<Handle>,
    /// Handles in existence, including slots reserved for generation.
    alive: usize,
    leased: usize,
    /// Outstanding leases per acquiring thread.
    holders: HashMap<ThreadId, usize>,
    blockades: usize,
    drains: usize,
}

impl PoolState {
    fn is_issuing(&self) -> bool {
        self.blockades == 0 && self.drains == 0
    }

    fn lease_to(&mut self, holder: ThreadId) {
        self.leased += 1;
        *self.holders.entry(holder).or_insert(0) += 1;
    }

    fn release_from(&mut self, holder: ThreadId) {
        self.leased -= 1;
        if let Some(count) = self.holders.get_mut(&holder) {
            *count -= 1;
            if *count == 0 {
                self.holders.remove(&holder);
            }
        }
    }
}

pub(crate) struct PoolShared {
    path: PathBuf,
    max_handles: usize,
    timeout: Option<Duration>,
    lifecycle: Arc<dyn HandleLifecycle>,
    state: Mutex<PoolState>,
    changed: Condvar,
    closing: Mutex<()>,
}

impl PoolShared {
    /// Takes a handle back from its last lease, held by `holder`.
    pub(crate) fn recycle(&self, mut handle: Handle, holder: ThreadId) {
        self.lifecycle.will_flow_back(&mut handle);

        let mut reusable = true;
        if handle.is_in_transaction() {
            warn!(handle = %handle.id(), "handle returned inside a transaction, rolling back");
            if let Err(err) = handle.rollback_transaction() {
                warn!(handle = %handle.id(), error = %err, "rollback failed, discarding handle");
                reusable = false;
            }
        }

        let mut state = self.state.lock();
        state.release_from(holder);
        let discarded = if reusable && state.drains == 0 {
            state.free.push(handle);
            None
        } else {
            state.alive -= 1;
            Some(handle)
        };
        drop(state);
        self.changed.notify_all();

        if let Some(handle) = discarded {
            debug!(handle = %handle.id(), "discarded handle");
        }
    }

    fn forget_slot(&self, holder: ThreadId) {
        let mut state = self.state.lock();
        state.alive -= 1;
        state.release_from(holder);
        drop(state);
        self.changed.notify_all();
    }

    fn blockade(&self) {
        self.state.lock().blockades += 1;
    }

    fn unblockade(&self) {
        let mut state = self.state.lock();
        state.blockades = state.blockades.saturating_sub(1);
        drop(state);
        self.changed.notify_all();
    }
}

/// Bounded pool of [`Handle`]s bound to one path.
pub struct HandlePool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for HandlePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("HandlePool")
            .field("path", &self.shared.path)
            .field("alive", &state.alive)
            .field("idle", &state.free.len())
            .field("leased", &state.leased)
            .field("blockades", &state.blockades)
            .finish()
    }
}

impl HandlePool {
    /// Creates an empty pool. No handle is opened until the first request.
    pub fn new(
        path: impl Into<PathBuf>,
        max_handles: usize,
        timeout: Option<Duration>,
        lifecycle: Arc<dyn HandleLifecycle>,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                path: path.into(),
                max_handles: max_handles.max(1),
                timeout,
                lifecycle,
                state: Mutex::new(PoolState::default()),
                changed: Condvar::new(),
                closing: Mutex::new(()),
            }),
        }
    }

    /// Returns the path handles are bound to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Issues a lease on an idle or newly generated handle.
    ///
    /// Waits while the pool is blockaded, closing, or at capacity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Blockaded`] or [`CoreError::PoolExhausted`] when
    /// the configured timeout expires, or the generate/configure error.
    pub fn get_handle(&self) -> CoreResult<RecyclableHandle> {
        let shared = &self.shared;
        let holder = thread::current().id();
        let started = Instant::now();
        let deadline = shared.timeout.map(|timeout| started + timeout);

        let mut state = shared.state.lock();
        let idle = loop {
            if state.is_issuing() {
                if let Some(handle) = state.free.pop() {
                    state.lease_to(holder);
                    break Some(handle);
                }
                if state.alive < shared.max_handles {
                    state.alive += 1;
                    state.lease_to(holder);
                    break None;
                }
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    return Err(if state.is_issuing() {
                        CoreError::PoolExhausted
                    } else {
                        CoreError::Blockaded {
                            waited: started.elapsed(),
                        }
                    });
                }
                Some(deadline) => {
                    shared.changed.wait_until(&mut state, deadline);
                }
                None => shared.changed.wait(&mut state),
            }
        };
        drop(state);

        let mut handle = match idle {
            Some(handle) => handle,
            None => match shared.lifecycle.generate(&shared.path) {
                Ok(handle) => handle,
                Err(err) => {
                    shared.forget_slot(holder);
                    return Err(err);
                }
            },
        };

        if let Err(err) = shared.lifecycle.will_configure(&mut handle) {
            warn!(handle = %handle.id(), error = %err, "configure failed, discarding handle");
            drop(handle);
            shared.forget_slot(holder);
            return Err(err);
        }

        Ok(RecyclableHandle::new(handle, holder, Arc::clone(shared)))
    }

    /// Stops issuing handles until a matching [`HandlePool::unblockade`].
    /// Blockades nest.
    pub fn blockade(&self) {
        self.shared.blockade();
    }

    /// Lifts one blockade and wakes waiting callers.
    pub fn unblockade(&self) {
        self.shared.unblockade();
    }

    /// Returns whether issuance is currently stopped.
    #[must_use]
    pub fn is_blockaded(&self) -> bool {
        !self.shared.state.lock().is_issuing()
    }

    pub(crate) fn blockade_guard(&self) -> BlockadeGuard<'_> {
        self.shared.blockade();
        BlockadeGuard {
            shared: &self.shared,
        }
    }

    /// Drains the pool and runs `on_closed` once with zero live handles.
    ///
    /// Blocks until every outstanding lease has been dropped. Concurrent
    /// closes run one after the other.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the calling thread still
    /// holds a lease, which would otherwise never come back.
    pub fn close<R>(&self, on_closed: impl FnOnce() -> R) -> CoreResult<R> {
        let shared = &self.shared;
        if self.holds_lease() {
            return Err(CoreError::invalid_operation(
                "cannot close the pool while this thread holds one of its handles",
            ));
        }
        let _serial = shared.closing.lock();

        let mut state = shared.state.lock();
        state.drains += 1;
        let _drain = DrainGuard { shared };
        let idle = std::mem::take(&mut state.free);
        state.alive -= idle.len();
        drop(state);
        drop(idle);

        let mut state = shared.state.lock();
        while state.leased > 0 {
            shared.changed.wait(&mut state);
        }
        debug_assert_eq!(state.alive, 0);
        drop(state);

        debug!(path = %shared.path.display(), "pool drained");
        Ok(on_closed())
    }

    /// Returns whether the calling thread holds a lease on this pool.
    #[must_use]
    pub fn holds_lease(&self) -> bool {
        self.shared
            .state
            .lock()
            .holders
            .contains_key(&thread::current().id())
    }

    /// Drops every idle handle. Leased handles are unaffected.
    pub fn purge(&self) {
        let mut state = self.shared.state.lock();
        let idle = std::mem::take(&mut state.free);
        state.alive -= idle.len();
        drop(state);
        if !idle.is_empty() {
            debug!(count = idle.len(), "purged idle handles");
        }
    }

    /// Number of handles in existence, leased or idle.
    #[must_use]
    pub fn alive_handles(&self) -> usize {
        self.shared.state.lock().alive
    }

    /// Number of idle handles on the free list.
    #[must_use]
    pub fn idle_handles(&self) -> usize {
        self.shared.state.lock().free.len()
    }

    /// Number of outstanding leases.
    #[must_use]
    pub fn leased_handles(&self) -> usize {
        self.shared.state.lock().leased
    }

    /// Returns whether at least one handle is alive.
    #[must_use]
    pub fn is_opened(&self) -> bool {
        self.alive_handles() > 0
    }
}

/// Lifts a blockade on drop.
pub(crate) struct BlockadeGuard<'a> {
    shared: &'a PoolShared,
}

impl Drop for BlockadeGuard<'_> {
    fn drop(&mut self) {
        self.shared.unblockade();
    }
}

struct DrainGuard<'a> {
    shared: &'a PoolShared,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.drains -= 1;
        drop(state);
        self.shared.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Counting {
        configured: AtomicUsize,
        flowed_back: AtomicUsize,
    }

    impl HandleLifecycle for Counting {
        fn will_configure(&self, _handle: &mut Handle) -> CoreResult<()> {
            self.configured.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn will_flow_back(&self, _handle: &mut Handle) {
            self.flowed_back.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingConfigure;

    impl HandleLifecycle for FailingConfigure {
        fn will_configure(&self, _handle: &mut Handle) -> CoreResult<()> {
            Err(CoreError::invalid_operation("refused"))
        }
    }

    fn pool(dir: &Path, max: usize, timeout: Option<Duration>) -> (HandlePool, Arc<Counting>) {
        let hooks = Arc::new(Counting::default());
        let pool = HandlePool::new(dir.join("pool.db"), max, timeout, hooks.clone());
        (pool, hooks)
    }

    #[test]
    fn handles_are_reused() {
        let dir = tempdir().unwrap();
        let (pool, hooks) = pool(dir.path(), 4, None);

        let first = pool.get_handle().unwrap();
        let id = first.id();
        drop(first);
        assert_eq!(pool.idle_handles(), 1);

        let second = pool.get_handle().unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(pool.alive_handles(), 1);
        drop(second);

        assert_eq!(hooks.configured.load(Ordering::SeqCst), 2);
        assert_eq!(hooks.flowed_back.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn configure_failure_discards_handle() {
        let dir = tempdir().unwrap();
        let pool = HandlePool::new(dir.path().join("a.db"), 2, None, Arc::new(FailingConfigure));
        assert!(pool.get_handle().is_err());
        assert_eq!(pool.alive_handles(), 0);
        assert_eq!(pool.leased_handles(), 0);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let dir = tempdir().unwrap();
        let (pool, _) = pool(dir.path(), 1, Some(Duration::from_millis(20)));
        let _held = pool.get_handle().unwrap();
        assert!(matches!(pool.get_handle(), Err(CoreError::PoolExhausted)));
    }

    #[test]
    fn blockade_times_out() {
        let dir = tempdir().unwrap();
        let (pool, _) = pool(dir.path(), 2, Some(Duration::from_millis(20)));
        pool.blockade();
        assert!(pool.is_blockaded());
        assert!(matches!(
            pool.get_handle(),
            Err(CoreError::Blockaded { .. })
        ));
        pool.unblockade();
        assert!(!pool.is_blockaded());
        assert!(pool.get_handle().is_ok());
    }

    #[test]
    fn blockades_nest() {
        let dir = tempdir().unwrap();
        let (pool, _) = pool(dir.path(), 2, None);
        pool.blockade();
        {
            let _guard = pool.blockade_guard();
        }
        assert!(pool.is_blockaded());
        pool.unblockade();
        assert!(!pool.is_blockaded());
    }

    #[test]
    fn close_waits_for_leases() {
        let dir = tempdir().unwrap();
        let (pool, _) = pool(dir.path(), 4, None);
        let pool = Arc::new(pool);

        let idle = pool.get_handle().unwrap();
        drop(idle);
        let lease_id = {
            let (tx, rx) = std::sync::mpsc::channel();
            let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
            let worker = {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let lease = pool.get_handle().unwrap();
                    tx.send(lease.id()).unwrap();
                    release_rx.recv().unwrap();
                    drop(lease);
                })
            };
            let id = rx.recv().unwrap();

            let closer = {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.close(|| pool.alive_handles()).unwrap())
            };
            thread::sleep(Duration::from_millis(30));
            assert!(!closer.is_finished());

            release_tx.send(()).unwrap();
            worker.join().unwrap();
            assert_eq!(closer.join().unwrap(), 0);
            id
        };

        assert!(!pool.is_opened());
        let fresh = pool.get_handle().unwrap();
        assert_ne!(fresh.id(), lease_id);
    }

    #[test]
    fn unblockade_during_close_keeps_drain() {
        let dir = tempdir().unwrap();
        let (pool, _) = pool(dir.path(), 2, Some(Duration::from_millis(20)));
        let pool = Arc::new(pool);

        let (leased_tx, leased_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let lease = pool.get_handle().unwrap();
                leased_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                drop(lease);
            })
        };
        leased_rx.recv().unwrap();

        let closer = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.close(|| pool.alive_handles()).unwrap())
        };
        thread::sleep(Duration::from_millis(30));

        pool.unblockade();
        assert!(pool.is_blockaded());
        assert!(matches!(
            pool.get_handle(),
            Err(CoreError::Blockaded { .. })
        ));

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert_eq!(closer.join().unwrap(), 0);

        assert!(!pool.is_blockaded());
        assert!(pool.get_handle().is_ok());
    }

    #[test]
    fn close_with_own_lease_is_rejected() {
        let dir = tempdir().unwrap();
        let (pool, _) = pool(dir.path(), 2, None);
        let lease = pool.get_handle().unwrap();
        assert!(pool.holds_lease());
        assert!(matches!(
            pool.close(|| ()),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert!(!pool.is_blockaded());

        drop(lease);
        assert!(!pool.holds_lease());
        assert_eq!(pool.close(|| pool.alive_handles()).unwrap(), 0);
    }
}
