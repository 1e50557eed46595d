//! A single connection to the database file.
//!
//! A [`Handle`] owns one `rusqlite::Connection` and the per-connection state
//! the pool needs to decide whether it must be (re)configured before use:
//! the version of the named configs it last applied and the migration epoch
//! it was last bound to.
//!
//! Transactions map onto SQLite directly. The outermost level uses
//! `BEGIN IMMEDIATE`/`COMMIT`/`ROLLBACK`; nested levels use savepoints named
//! `sqlward_lv_<n>`.

use crate::error::CoreResult;
use crate::schema;
use crate::types::{HandleId, Statement};
use rusqlite::{Connection, OpenFlags};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One live connection to the database file.
pub struct Handle {
    id: HandleId,
    path: PathBuf,
    conn: Connection,
    nested_level: u32,
    pub(crate) config_version: Option<u64>,
    pub(crate) migration_epoch: Option<u64>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("nested_level", &self.nested_level)
            .finish_non_exhaustive()
    }
}

impl Handle {
    /// Opens a read-write connection, creating the file if missing.
    ///
    /// The schema is read once so that a file that is not a database (or
    /// whose header is damaged) fails here instead of on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot open or read the file.
    pub fn open(path: &Path) -> CoreResult<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })?;

        let handle = Self {
            id: HandleId::next(),
            path: path.to_path_buf(),
            conn,
            nested_level: 0,
            config_version: None,
            migration_epoch: None,
        };
        debug!(handle = %handle.id, path = %path.display(), "opened handle");
        Ok(handle)
    }

    /// Returns the process-unique identity of this handle.
    #[must_use]
    pub const fn id(&self) -> HandleId {
        self.id
    }

    /// Returns the database path this handle is bound to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the underlying connection for queries.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Executes a statement, which may contain several commands.
    ///
    /// # Errors
    ///
    /// Returns the engine error if any command fails.
    pub fn execute(&self, statement: &Statement) -> CoreResult<()> {
        self.conn.execute_batch(statement.sql())?;
        Ok(())
    }

    /// Returns whether a table or view named `table` is visible to this
    /// handle, including temporary objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be read.
    pub fn table_exists(&self, table: &str) -> CoreResult<bool> {
        schema::object_exists(&self.conn, table)
    }

    /// Returns whether a transaction is open on this connection.
    #[must_use]
    pub fn is_in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Returns the current transaction depth: 0 outside a transaction,
    /// 1 for a plain transaction, plus one per open savepoint.
    #[must_use]
    pub fn transaction_depth(&self) -> u32 {
        if self.is_in_transaction() {
            self.nested_level + 1
        } else {
            0
        }
    }

    /// Begins a top-level transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if a transaction is already open or the write lock
    /// cannot be taken.
    pub fn begin_transaction(&mut self) -> CoreResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.nested_level = 0;
        Ok(())
    }

    /// Commits the top-level transaction, rolling back if the commit fails.
    ///
    /// # Errors
    ///
    /// Returns the commit error after the rollback.
    pub fn commit_or_rollback_transaction(&mut self) -> CoreResult<()> {
        if let Err(err) = self.conn.execute_batch("COMMIT") {
            warn!(handle = %self.id, error = %err, "commit failed, rolling back");
            self.rollback_transaction()?;
            return Err(err.into());
        }
        self.nested_level = 0;
        Ok(())
    }

    /// Rolls back the top-level transaction and every savepoint inside it.
    ///
    /// # Errors
    ///
    /// Returns an error if the rollback fails.
    pub fn rollback_transaction(&mut self) -> CoreResult<()> {
        self.nested_level = 0;
        if self.is_in_transaction() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    /// Opens a savepoint, or a top-level transaction if none is open.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the statement.
    pub fn begin_nested_transaction(&mut self) -> CoreResult<()> {
        if !self.is_in_transaction() {
            return self.begin_transaction();
        }
        let level = self.nested_level + 1;
        self.conn
            .execute_batch(&format!("SAVEPOINT {}", savepoint_name(level)))?;
        self.nested_level = level;
        Ok(())
    }

    /// Releases the innermost savepoint, or commits when none is open.
    ///
    /// A failed release rolls back to the savepoint and reports the error.
    ///
    /// # Errors
    ///
    /// Returns the release or commit error.
    pub fn commit_or_rollback_nested_transaction(&mut self) -> CoreResult<()> {
        if self.nested_level == 0 {
            return self.commit_or_rollback_transaction();
        }
        let name = savepoint_name(self.nested_level);
        if let Err(err) = self.conn.execute_batch(&format!("RELEASE {name}")) {
            self.rollback_nested_transaction()?;
            return Err(err.into());
        }
        self.nested_level -= 1;
        Ok(())
    }

    /// Rolls back and closes the innermost savepoint, or the transaction
    /// when none is open.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the rollback.
    pub fn rollback_nested_transaction(&mut self) -> CoreResult<()> {
        if self.nested_level == 0 {
            return self.rollback_transaction();
        }
        let name = savepoint_name(self.nested_level);
        self.nested_level -= 1;
        self.conn
            .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))?;
        Ok(())
    }
}

fn savepoint_name(level: u32) -> String {
    format!("sqlward_lv_{level}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn count(handle: &Handle) -> i64 {
        handle
            .connection()
            .query_row("SELECT count(*) FROM t", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn open_creates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        let handle = Handle::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(handle.path(), path);
        assert_eq!(handle.transaction_depth(), 0);
    }

    #[test]
    fn open_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        std::fs::write(&path, vec![0x5a; 4096]).unwrap();
        let err = Handle::open(&path).unwrap_err();
        assert!(err.is_corruption(), "{err}");
    }

    #[test]
    fn execute_and_table_exists() {
        let dir = tempdir().unwrap();
        let handle = Handle::open(&dir.path().join("a.db")).unwrap();
        assert!(!handle.table_exists("t").unwrap());
        handle
            .execute(&"CREATE TABLE t(v); INSERT INTO t VALUES (1)".into())
            .unwrap();
        assert!(handle.table_exists("t").unwrap());
        assert_eq!(count(&handle), 1);
    }

    #[test]
    fn nested_savepoints_roll_back_independently() {
        let dir = tempdir().unwrap();
        let mut handle = Handle::open(&dir.path().join("a.db")).unwrap();
        handle.execute(&"CREATE TABLE t(v)".into()).unwrap();

        handle.begin_nested_transaction().unwrap();
        assert_eq!(handle.transaction_depth(), 1);
        handle.execute(&"INSERT INTO t VALUES (1)".into()).unwrap();

        handle.begin_nested_transaction().unwrap();
        assert_eq!(handle.transaction_depth(), 2);
        handle.execute(&"INSERT INTO t VALUES (2)".into()).unwrap();
        handle.rollback_nested_transaction().unwrap();
        assert_eq!(handle.transaction_depth(), 1);

        handle.begin_nested_transaction().unwrap();
        handle.execute(&"INSERT INTO t VALUES (3)".into()).unwrap();
        handle.commit_or_rollback_nested_transaction().unwrap();

        handle.commit_or_rollback_nested_transaction().unwrap();
        assert_eq!(handle.transaction_depth(), 0);
        assert_eq!(count(&handle), 2);
    }

    #[test]
    fn rollback_discards_savepoints() {
        let dir = tempdir().unwrap();
        let mut handle = Handle::open(&dir.path().join("a.db")).unwrap();
        handle.execute(&"CREATE TABLE t(v)".into()).unwrap();

        handle.begin_transaction().unwrap();
        handle.begin_nested_transaction().unwrap();
        handle.execute(&"INSERT INTO t VALUES (1)".into()).unwrap();
        handle.rollback_transaction().unwrap();

        assert!(!handle.is_in_transaction());
        assert_eq!(handle.transaction_depth(), 0);
        assert_eq!(count(&handle), 0);
    }
}
