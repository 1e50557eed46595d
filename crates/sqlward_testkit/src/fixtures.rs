//! Test fixtures and database helpers.
//!
//! Provides convenience functions for setting up test databases
//! and common test scenarios.

use sqlward_core::{Config, CoreResult, Database};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// File name used for fixture databases.
pub const TEST_DATABASE_NAME: &str = "test.db";

/// A test database in its own temporary directory.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: TempDir,
}

impl TestDatabase {
    /// Creates a database with default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a database with custom configuration.
    pub fn with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open_with_config(temp_dir.path().join(TEST_DATABASE_NAME), config)
            .expect("Failed to open test database");
        Self { db, temp_dir }
    }

    /// Returns the main database file path.
    pub fn path(&self) -> PathBuf {
        self.db.path().to_path_buf()
    }

    /// Returns the temporary directory holding the file set.
    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Opens a second, independent `Database` on the same path.
    pub fn reopen(&self) -> Database {
        Database::open_with_config(self.db.path(), self.db.config().clone())
            .expect("Failed to reopen test database")
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Creates `table` if needed and inserts `rows` rows in one transaction.
///
/// Rows carry a text payload and a small blob so snapshots exercise
/// several storage classes.
///
/// # Errors
///
/// Returns the first statement error; nothing is inserted in that case.
pub fn populate(db: &Database, table: &str, rows: usize) -> CoreResult<()> {
    db.run_transaction(|db| {
        db.execute(format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\"(id INTEGER PRIMARY KEY, payload TEXT, data BLOB)"
        ))?;
        for i in 0..rows {
            db.execute(format!(
                "INSERT INTO \"{table}\"(payload, data) VALUES ('row-{i}', x'{:02x}{:02x}')",
                i % 256,
                (i / 256) % 256
            ))?;
        }
        Ok(true)
    })
}

/// Counts the rows of `table`.
///
/// # Errors
///
/// Returns the query error, e.g. when the table does not exist.
pub fn row_count(db: &Database, table: &str) -> CoreResult<i64> {
    db.with_handle(|handle| {
        Ok(handle
            .connection()
            .query_row(&format!("SELECT count(*) FROM \"{table}\""), [], |row| {
                row.get(0)
            })?)
    })
}

/// Runs a test with a temporary database.
///
/// # Example
///
/// ```rust
/// use sqlward_testkit::with_temp_db;
///
/// with_temp_db(|db| {
///     db.execute("CREATE TABLE t(v)").unwrap();
///     assert!(db.table_exists("t").unwrap());
/// });
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::new();
    f(&test_db.db)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a database with one populated table called `items`.
    pub fn populated_database(rows: usize) -> TestDatabase {
        let test_db = TestDatabase::new();
        populate(&test_db, "items", rows).expect("Failed to populate database");
        test_db
    }

    /// Creates a database with `tables` populated tables `table_0..`.
    pub fn multi_table_database(tables: usize, rows: usize) -> (TestDatabase, Vec<String>) {
        let test_db = TestDatabase::new();
        let names: Vec<String> = (0..tables).map(|i| format!("table_{i}")).collect();
        for name in &names {
            populate(&test_db, name, rows).expect("Failed to populate table");
        }
        (test_db, names)
    }
}
