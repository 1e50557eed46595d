//! Transactions on the calling thread's handle.

use super::Database;
use crate::error::{CoreError, CoreResult, RecordError};
use crate::handle::Handle;
use crate::pool::RecyclableHandle;
use crate::threaded::{self, ThreadedGuard};
use std::panic::{self, AssertUnwindSafe};
use tracing::warn;

impl Database {
    /// Begins a transaction on the calling thread's handle.
    ///
    /// The handle stays bound to the thread until the transaction ends.
    ///
    /// # Errors
    ///
    /// Returns an error if a transaction is already open on this thread.
    pub fn begin_transaction(&self) -> CoreResult<()> {
        self.begin_with(Handle::begin_transaction).record_threaded()
    }

    /// Commits the thread's transaction; a failed commit rolls back.
    ///
    /// # Errors
    ///
    /// Returns the commit error, or [`CoreError::InvalidOperation`] if no
    /// transaction is open on this thread.
    pub fn commit_or_rollback_transaction(&self) -> CoreResult<()> {
        self.end_with(Handle::commit_or_rollback_transaction)
            .record_threaded()
    }

    /// Rolls back the thread's transaction.
    ///
    /// # Errors
    ///
    /// Returns the rollback error, or [`CoreError::InvalidOperation`] if no
    /// transaction is open on this thread.
    pub fn rollback_transaction(&self) -> CoreResult<()> {
        self.end_with(Handle::rollback_transaction).record_threaded()
    }

    /// Opens a savepoint, or a transaction if none is open.
    ///
    /// # Errors
    ///
    /// Returns the engine error.
    pub fn begin_nested_transaction(&self) -> CoreResult<()> {
        self.begin_with(Handle::begin_nested_transaction)
            .record_threaded()
    }

    /// Releases the innermost savepoint, or commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns the engine error, or [`CoreError::InvalidOperation`] if no
    /// transaction is open on this thread.
    pub fn commit_or_rollback_nested_transaction(&self) -> CoreResult<()> {
        self.end_with(Handle::commit_or_rollback_nested_transaction)
            .record_threaded()
    }

    /// Rolls back the innermost savepoint, or the transaction.
    ///
    /// # Errors
    ///
    /// Returns the engine error, or [`CoreError::InvalidOperation`] if no
    /// transaction is open on this thread.
    pub fn rollback_nested_transaction(&self) -> CoreResult<()> {
        self.end_with(Handle::rollback_nested_transaction)
            .record_threaded()
    }

    /// Runs `callback` inside a transaction.
    ///
    /// `Ok(true)` commits. `Ok(false)`, an error or a panic rolls back; a
    /// panic is resumed after the rollback.
    ///
    /// # Errors
    ///
    /// Returns the callback error, [`CoreError::TransactionAborted`] when
    /// the callback asked for a rollback, or the commit error.
    pub fn run_transaction<F>(&self, callback: F) -> CoreResult<()>
    where
        F: FnOnce(&Database) -> CoreResult<bool>,
    {
        self.run_with(
            Handle::begin_transaction,
            Handle::commit_or_rollback_transaction,
            Handle::rollback_transaction,
            callback,
        )
        .record_threaded()
    }

    /// Runs `callback` inside a savepoint, or a transaction if none is open.
    ///
    /// # Errors
    ///
    /// Same as [`Database::run_transaction`].
    pub fn run_nested_transaction<F>(&self, callback: F) -> CoreResult<()>
    where
        F: FnOnce(&Database) -> CoreResult<bool>,
    {
        self.run_with(
            Handle::begin_nested_transaction,
            Handle::commit_or_rollback_nested_transaction,
            Handle::rollback_nested_transaction,
            callback,
        )
        .record_threaded()
    }

    /// Returns the transaction depth of the calling thread's handle.
    #[must_use]
    pub fn transaction_depth(&self) -> u32 {
        threaded::threaded_handle(self.id())
            .and_then(|handle| handle.with(|h| Ok(h.transaction_depth())).ok())
            .unwrap_or(0)
    }

    /// Returns whether the calling thread has a transaction open.
    #[must_use]
    pub fn is_in_transaction(&self) -> bool {
        self.transaction_depth() > 0
    }

    fn begin_with(&self, begin: fn(&mut Handle) -> CoreResult<()>) -> CoreResult<()> {
        let handle = self.acquire_handle()?;
        handle.with(begin)?;
        threaded::mark_threaded(self.id(), &handle);
        Ok(())
    }

    fn end_with(&self, end: fn(&mut Handle) -> CoreResult<()>) -> CoreResult<()> {
        let handle = self.threaded_transaction_handle()?;
        let result = handle.with(end);
        drop(handle);
        threaded::release_if_idle(self.id());
        result
    }

    fn threaded_transaction_handle(&self) -> CoreResult<RecyclableHandle> {
        threaded::threaded_handle(self.id())
            .filter(RecyclableHandle::is_in_transaction)
            .ok_or_else(|| CoreError::invalid_operation("no transaction is open on this thread"))
    }

    fn run_with<F>(
        &self,
        begin: fn(&mut Handle) -> CoreResult<()>,
        commit: fn(&mut Handle) -> CoreResult<()>,
        rollback: fn(&mut Handle) -> CoreResult<()>,
        callback: F,
    ) -> CoreResult<()>
    where
        F: FnOnce(&Database) -> CoreResult<bool>,
    {
        let handle = self.acquire_handle()?;
        let _guard = ThreadedGuard::new(self.id(), &handle);
        handle.with(begin)?;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(self)));
        match outcome {
            Ok(Ok(true)) => handle.with(commit),
            Ok(Ok(false)) => {
                handle.with(rollback)?;
                Err(CoreError::transaction_aborted("callback requested rollback"))
            }
            Ok(Err(err)) => {
                if let Err(rollback_err) = handle.with(rollback) {
                    warn!(error = %rollback_err, "rollback after failed callback failed");
                }
                Err(err)
            }
            Err(payload) => {
                if let Err(rollback_err) = handle.with(rollback) {
                    warn!(error = %rollback_err, "rollback after panic failed");
                }
                panic::resume_unwind(payload)
            }
        }
    }
}
