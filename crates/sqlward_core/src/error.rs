//! Error types for SQLWard core.
//!
//! Besides the usual `CoreResult` propagation, every failing public
//! [`crate::Database`] operation records a [`ThreadedError`] in a
//! thread-local register. Callers that only look at a boolean outcome can
//! retrieve the detail afterwards with [`crate::Database::threaded_error`].

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in SQLWard core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// File system error.
    #[error("storage error: {0}")]
    Storage(#[from] sqlward_storage::StorageError),

    /// Error reported by the SQL engine.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The database file set is corrupted.
    #[error("database corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// The pool stayed blockaded past the configured timeout.
    #[error("pool blockaded for {waited:?}")]
    Blockaded {
        /// How long the caller waited.
        waited: Duration,
    },

    /// Every handle slot stayed in use past the configured timeout.
    #[error("handle pool exhausted")]
    PoolExhausted,

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// A migration step or registration failed.
    #[error("migration failed: {message}")]
    MigrationFailed {
        /// Description of the failure.
        message: String,
    },

    /// A material file is missing, truncated or fails its checksum.
    #[error("invalid material: {message}")]
    InvalidMaterial {
        /// Description of the problem.
        message: String,
    },

    /// A transaction callback asked for a rollback.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for abort.
        reason: String,
    },

    /// `recover()` was called without a recovery mode.
    #[error("no recovery scheme configured")]
    NoRecoveryScheme,

    /// A custom recovery notification reported failure.
    #[error("recovery failed")]
    RecoveryFailed,
}

impl CoreError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a migration failed error.
    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid material error.
    pub fn invalid_material(message: impl Into<String>) -> Self {
        Self::InvalidMaterial {
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Returns whether this error means the file set is damaged.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Corrupted { .. } => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            ),
            _ => false,
        }
    }

    /// Returns the coarse category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(_) | Self::Io(_) => ErrorKind::Io,
            Self::Sqlite(_) if self.is_corruption() => ErrorKind::Corruption,
            Self::Sqlite(_) | Self::TransactionAborted { .. } => ErrorKind::Execution,
            Self::Corrupted { .. } | Self::InvalidMaterial { .. } => ErrorKind::Corruption,
            Self::MigrationFailed { .. } => ErrorKind::Migration,
            Self::Blockaded { .. } | Self::PoolExhausted | Self::InvalidOperation { .. } => {
                ErrorKind::Lifecycle
            }
            Self::NoRecoveryScheme | Self::RecoveryFailed => ErrorKind::Recovery,
        }
    }
}

/// Coarse error category recorded in the thread-scoped register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A file could not be opened, moved, sized or written.
    Io,
    /// The engine rejected a statement.
    Execution,
    /// The file set or a material is damaged.
    Corruption,
    /// A migration step failed.
    Migration,
    /// The pool refused to issue a handle or the call was misused.
    Lifecycle,
    /// Recovery could not be applied.
    Recovery,
}

/// Snapshot of the last error raised on the current thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadedError {
    /// Error category.
    pub kind: ErrorKind,
    /// Rendered error message.
    pub message: String,
}

impl fmt::Display for ThreadedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<&CoreError> for ThreadedError {
    fn from(err: &CoreError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

thread_local! {
    static THREADED_ERROR: RefCell<Option<ThreadedError>> = const { RefCell::new(None) };
}

/// Returns the last error recorded on the calling thread.
#[must_use]
pub fn threaded_error() -> Option<ThreadedError> {
    THREADED_ERROR.with(|slot| slot.borrow().clone())
}

/// Clears the calling thread's error register.
pub fn clear_threaded_error() {
    THREADED_ERROR.with(|slot| slot.borrow_mut().take());
}

pub(crate) fn record_threaded_error(err: &CoreError) {
    let _ = THREADED_ERROR.try_with(|slot| {
        *slot.borrow_mut() = Some(ThreadedError::from(err));
    });
}

/// Records failures of a public operation in the thread-scoped register.
pub(crate) trait RecordError {
    fn record_threaded(self) -> Self;
}

impl<T> RecordError for CoreResult<T> {
    fn record_threaded(self) -> Self {
        if let Err(err) = &self {
            record_threaded_error(err);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> CoreError {
        CoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(code),
            None,
        ))
    }

    #[test]
    fn corruption_classification() {
        assert!(CoreError::corrupted("bad page").is_corruption());
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_CORRUPT).is_corruption());
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_NOTADB).is_corruption());
        assert!(!sqlite_failure(rusqlite::ffi::SQLITE_BUSY).is_corruption());
        assert!(!CoreError::invalid_operation("x").is_corruption());
    }

    #[test]
    fn kinds() {
        assert_eq!(
            sqlite_failure(rusqlite::ffi::SQLITE_CORRUPT).kind(),
            ErrorKind::Corruption
        );
        assert_eq!(
            sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT).kind(),
            ErrorKind::Execution
        );
        assert_eq!(CoreError::PoolExhausted.kind(), ErrorKind::Lifecycle);
        assert_eq!(CoreError::migration_failed("x").kind(), ErrorKind::Migration);
    }

    #[test]
    fn register_is_per_thread() {
        clear_threaded_error();
        let result: CoreResult<()> = Err(CoreError::invalid_operation("closed"));
        let _ = result.record_threaded();

        let recorded = threaded_error().unwrap();
        assert_eq!(recorded.kind, ErrorKind::Lifecycle);
        assert!(recorded.message.contains("closed"));

        let other = std::thread::spawn(threaded_error).join().unwrap();
        assert!(other.is_none());

        clear_threaded_error();
        assert!(threaded_error().is_none());
    }

    #[test]
    fn success_does_not_touch_register() {
        clear_threaded_error();
        let ok: CoreResult<u8> = Ok(1);
        assert_eq!(ok.record_threaded().unwrap(), 1);
        assert!(threaded_error().is_none());
    }
}
