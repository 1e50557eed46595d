//! Database configuration.

use sqlward_storage::{FileSystem, LocalFileSystem};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// SQLite journal mode applied to every handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JournalMode {
    /// Write-ahead log (`P-wal`, `P-shm`).
    #[default]
    Wal,
    /// Rollback journal deleted after each transaction (`P-journal`).
    Delete,
    /// Rollback journal truncated after each transaction.
    Truncate,
}

impl JournalMode {
    /// Returns the pragma value for this mode.
    #[must_use]
    pub const fn as_pragma(self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
        }
    }
}

impl fmt::Display for JournalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_pragma())
    }
}

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on live handles (leased plus idle).
    pub max_handles: usize,

    /// How long `get_handle` waits on a blockade or a full pool.
    /// `None` waits indefinitely.
    pub blockade_timeout: Option<Duration>,

    /// SQLite busy timeout set on every handle.
    pub busy_timeout: Duration,

    /// Journal mode set on every handle.
    pub journal_mode: JournalMode,

    /// Rows copied per migration step.
    pub migration_batch_size: usize,

    /// Pause between background migration steps.
    pub migration_step_interval: Duration,

    /// File system used for every file-set operation.
    pub file_system: Arc<dyn FileSystem>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_handles: 32,
            blockade_timeout: None,
            busy_timeout: Duration::from_secs(5),
            journal_mode: JournalMode::Wal,
            migration_batch_size: 256,
            migration_step_interval: Duration::from_millis(1),
            file_system: Arc::new(LocalFileSystem::new()),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of live handles.
    #[must_use]
    pub fn max_handles(mut self, value: usize) -> Self {
        self.max_handles = value.max(1);
        self
    }

    /// Bounds how long `get_handle` may wait.
    #[must_use]
    pub fn blockade_timeout(mut self, value: Option<Duration>) -> Self {
        self.blockade_timeout = value;
        self
    }

    /// Sets the SQLite busy timeout.
    #[must_use]
    pub fn busy_timeout(mut self, value: Duration) -> Self {
        self.busy_timeout = value;
        self
    }

    /// Sets the journal mode.
    #[must_use]
    pub fn journal_mode(mut self, value: JournalMode) -> Self {
        self.journal_mode = value;
        self
    }

    /// Sets the number of rows copied per migration step.
    #[must_use]
    pub fn migration_batch_size(mut self, value: usize) -> Self {
        self.migration_batch_size = value.max(1);
        self
    }

    /// Sets the pause between background migration steps.
    #[must_use]
    pub fn migration_step_interval(mut self, value: Duration) -> Self {
        self.migration_step_interval = value;
        self
    }

    /// Replaces the file system collaborator.
    #[must_use]
    pub fn file_system(mut self, value: Arc<dyn FileSystem>) -> Self {
        self.file_system = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.max_handles, 32);
        assert!(config.blockade_timeout.is_none());
        assert_eq!(config.journal_mode, JournalMode::Wal);
        assert_eq!(config.migration_batch_size, 256);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .max_handles(0)
            .blockade_timeout(Some(Duration::from_millis(50)))
            .journal_mode(JournalMode::Delete)
            .migration_batch_size(10);

        assert_eq!(config.max_handles, 1);
        assert_eq!(config.blockade_timeout, Some(Duration::from_millis(50)));
        assert_eq!(config.journal_mode.as_pragma(), "DELETE");
        assert_eq!(config.migration_batch_size, 10);
    }
}
