use super::PoolShared;
use crate::error::{CoreError, CoreResult};
use crate::handle::Handle;
use crate::types::HandleId;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::ThreadId;

/// A lease on one pooled [`Handle`].
///
/// Clones share the lease. When the last clone drops, the handle flows back
/// to its pool. The lease is `!Send`: a handle stays on the thread that
/// acquired it for as long as it is leased.
#[derive(Clone)]
pub struct RecyclableHandle {
    lease: Rc<Lease>,
}

struct Lease {
    id: HandleId,
    holder: ThreadId,
    handle: RefCell<Option<Handle>>,
    pool: Arc<PoolShared>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            self.pool.recycle(handle, self.holder);
        }
    }
}

impl RecyclableHandle {
    pub(super) fn new(handle: Handle, holder: ThreadId, pool: Arc<PoolShared>) -> Self {
        Self {
            lease: Rc::new(Lease {
                id: handle.id(),
                holder,
                handle: RefCell::new(Some(handle)),
                pool,
            }),
        }
    }

    /// Returns the identity of the leased handle.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.lease.id
    }

    /// Number of live references to this lease.
    #[must_use]
    pub fn reference_count(&self) -> usize {
        Rc::strong_count(&self.lease)
    }

    /// Runs `f` with exclusive access to the handle.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the handle is already
    /// borrowed further up the call stack, or the error of `f`.
    pub fn with<R>(&self, f: impl FnOnce(&mut Handle) -> CoreResult<R>) -> CoreResult<R> {
        let mut slot = self.lease.handle.try_borrow_mut().map_err(|_| {
            CoreError::invalid_operation("handle is already in use on this thread")
        })?;
        let handle = slot
            .as_mut()
            .ok_or_else(|| CoreError::invalid_operation("lease has been released"))?;
        f(handle)
    }

    /// Returns whether the handle has an open transaction.
    #[must_use]
    pub fn is_in_transaction(&self) -> bool {
        self.with(|handle| Ok(handle.is_in_transaction()))
            .unwrap_or(false)
    }
}

impl fmt::Debug for RecyclableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecyclableHandle")
            .field("id", &self.lease.id)
            .field("references", &self.reference_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::error::CoreResult;
    use crate::handle::Handle;
    use crate::pool::{HandleLifecycle, HandlePool};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct Plain;

    impl HandleLifecycle for Plain {
        fn will_configure(&self, _handle: &mut Handle) -> CoreResult<()> {
            Ok(())
        }
    }

    #[test]
    fn clones_share_one_lease() {
        let dir = tempdir().unwrap();
        let pool = HandlePool::new(dir.path().join("a.db"), 2, None, Arc::new(Plain));

        let lease = pool.get_handle().unwrap();
        let again = lease.clone();
        assert_eq!(lease.reference_count(), 2);
        assert_eq!(lease.id(), again.id());

        drop(lease);
        assert_eq!(pool.leased_handles(), 1);
        drop(again);
        assert_eq!(pool.leased_handles(), 0);
        assert_eq!(pool.idle_handles(), 1);
    }

    #[test]
    fn reentrant_borrow_is_rejected() {
        let dir = tempdir().unwrap();
        let pool = HandlePool::new(dir.path().join("a.db"), 2, None, Arc::new(Plain));
        let lease = pool.get_handle().unwrap();
        let inner = lease.clone();

        let nested = lease.with(|_| Ok(inner.with(|_| Ok(())).is_err())).unwrap();
        assert!(nested);
    }

    #[test]
    fn open_transaction_is_rolled_back_on_return() {
        let dir = tempdir().unwrap();
        let pool = HandlePool::new(dir.path().join("a.db"), 1, None, Arc::new(Plain));

        let lease = pool.get_handle().unwrap();
        lease
            .with(|h| {
                h.execute(&"CREATE TABLE t(v)".into())?;
                h.begin_transaction()?;
                h.execute(&"INSERT INTO t VALUES (1)".into())
            })
            .unwrap();
        drop(lease);

        let lease = pool.get_handle().unwrap();
        let rows: i64 = lease
            .with(|h| {
                assert!(!h.is_in_transaction());
                Ok(h.connection()
                    .query_row("SELECT count(*) FROM t", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(rows, 0);
    }
}
