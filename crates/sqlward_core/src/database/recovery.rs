//! Recovery policy and corruption checks.

use super::Database;
use crate::error::{CoreError, CoreResult, RecordError};
use crate::repair::{RecoveryMode, RecoveryModeKind};
use rusqlite::{Connection, OpenFlags};
use std::cell::Cell;
use tracing::{info, warn};

thread_local! {
    static RECOVERING: Cell<bool> = const { Cell::new(false) };
}

struct RecoveringScope;

impl RecoveringScope {
    fn enter() -> Option<Self> {
        if RECOVERING.with(|r| r.replace(true)) {
            return None;
        }
        Some(Self)
    }
}

impl Drop for RecoveringScope {
    fn drop(&mut self) {
        RECOVERING.with(|r| r.set(false));
    }
}

impl Database {
    /// Installs the recovery mode used by [`Database::recover`] and by
    /// automatic recovery.
    pub fn set_recovery_mode(&self, mode: RecoveryMode) {
        info!(database = %self.shared.id, mode = ?mode.kind(), "recovery mode set");
        *self.shared.recovery.write() = Some(mode);
    }

    /// Removes the recovery mode.
    pub fn clear_recovery_mode(&self) {
        *self.shared.recovery.write() = None;
    }

    /// Returns the kind of the installed recovery mode.
    #[must_use]
    pub fn recovery_mode_kind(&self) -> Option<RecoveryModeKind> {
        self.shared.recovery.read().as_ref().map(RecoveryMode::kind)
    }

    /// Returns whether a recovery mode is installed.
    #[must_use]
    pub fn contains_recover_scheme(&self) -> bool {
        self.shared.recovery.read().is_some()
    }

    /// Runs the installed recovery mode.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoRecoveryScheme`] without a mode,
    /// [`CoreError::RecoveryFailed`] when a custom notification reports
    /// failure, or the error of the remove or deposit pass.
    pub fn recover(&self) -> CoreResult<()> {
        self.run_recovery().record_threaded()
    }

    fn run_recovery(&self) -> CoreResult<()> {
        let mode = self
            .shared
            .recovery
            .read()
            .clone()
            .ok_or(CoreError::NoRecoveryScheme)?;
        info!(database = %self.shared.id, mode = ?mode.kind(), "recovering");

        match mode {
            RecoveryMode::Custom(notify) => {
                if notify(self) {
                    Ok(())
                } else {
                    Err(CoreError::RecoveryFailed)
                }
            }
            RecoveryMode::Remove => {
                self.close_with(|| Ok(self.fs().remove_files(&self.paths())?))
            }
            RecoveryMode::Deposit => self.close_with(|| {
                self.deposit_files()?;
                let score = self.retrieve_files(&mut |_: f64| {})?;
                info!(database = %self.shared.id, score, "deposit recovery finished");
                Ok(())
            }),
        }
    }

    /// Recovers after `err` was observed, at most once per thread at a time.
    ///
    /// Returns `err` itself when no mode is installed, when recovery is
    /// already running on this thread, or when recovery fails.
    pub(crate) fn recover_after(&self, err: CoreError) -> CoreResult<()> {
        if !self.contains_recover_scheme() {
            return Err(err);
        }
        let Some(_scope) = RecoveringScope::enter() else {
            return Err(err);
        };
        warn!(database = %self.shared.id, error = %err, "corruption detected, recovering");
        match self.run_recovery() {
            Ok(()) => Ok(()),
            Err(failure) => {
                self.warn_absorbed("automatic recovery failed", &failure);
                Err(err)
            }
        }
    }

    /// Checks the file with a throwaway read-only connection.
    ///
    /// A missing or empty file is not corrupted. A file that cannot be
    /// opened or fails `PRAGMA quick_check` is.
    #[must_use]
    pub fn is_corrupted(&self) -> bool {
        let path = &self.shared.path;
        if self.fs().file_size(path).unwrap_or(0) == 0 {
            return false;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let Ok(conn) = Connection::open_with_flags(path, flags) else {
            return true;
        };
        match conn.query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0)) {
            Ok(result) => result != "ok",
            Err(err) => CoreError::from(err).is_corruption(),
        }
    }
}
