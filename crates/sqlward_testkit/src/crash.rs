//! Corruption and fault injection for SQLWard.
//!
//! This module damages database files the way crashes and failing disks
//! do, and provides a file system wrapper that fails on demand, so tests
//! can verify that backup, deposit and retrieval behave.
//!
//! ## Usage
//!
//! ```rust
//! use sqlward_testkit::crash::{corrupt_by_truncation, FaultyFileSystem};
//! use sqlward_testkit::TestDatabase;
//! use sqlward_core::Config;
//! use std::sync::Arc;
//!
//! let faulty = Arc::new(FaultyFileSystem::new());
//! let db = TestDatabase::with_config(Config::new().file_system(faulty.clone()));
//! db.execute("CREATE TABLE t(v)").unwrap();
//!
//! faulty.set_fail_writes(true);
//! assert!(db.backup().is_err());
//! ```

use sqlward_core::{Database, RecoveryMode};
use sqlward_storage::{FileSystem, LocalFileSystem, StorageError, StorageResult};
use std::fs::OpenOptions;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::fixtures::{populate, row_count, TestDatabase};

/// Truncates `path` to `fraction` of its current length.
///
/// Returns the new length.
///
/// # Errors
///
/// Returns the I/O error.
pub fn corrupt_by_truncation(path: &Path, fraction: f64) -> io::Result<u64> {
    let file = OpenOptions::new().write(true).open(path)?;
    let len = file.metadata()?.len();
    let keep = (len as f64 * fraction.clamp(0.0, 1.0)) as u64;
    file.set_len(keep)?;
    file.sync_all()?;
    Ok(keep)
}

/// Overwrites `len` bytes at `offset` with a fixed pattern.
///
/// # Errors
///
/// Returns the I/O error.
pub fn corrupt_by_garbling(path: &Path, offset: u64, len: usize) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&vec![0xA5; len])?;
    file.sync_all()
}

fn injected(what: &str) -> StorageError {
    StorageError::Io(io::Error::new(io::ErrorKind::Other, format!("injected {what} failure")))
}

/// A file system that fails selected operations on demand.
///
/// Every flag defaults to off, in which case calls pass through to the
/// local file system.
#[derive(Debug)]
pub struct FaultyFileSystem {
    inner: Arc<dyn FileSystem>,
    fail_writes: AtomicBool,
    fail_moves: AtomicBool,
    fail_removes: AtomicBool,
    no_space: AtomicBool,
    failures: AtomicUsize,
}

impl FaultyFileSystem {
    /// Wraps the local file system.
    pub fn new() -> Self {
        Self::wrap(Arc::new(LocalFileSystem::new()))
    }

    /// Wraps an arbitrary file system.
    pub fn wrap(inner: Arc<dyn FileSystem>) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            fail_moves: AtomicBool::new(false),
            fail_removes: AtomicBool::new(false),
            no_space: AtomicBool::new(false),
            failures: AtomicUsize::new(0),
        }
    }

    /// Makes atomic writes and renames fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes multi-file moves fail.
    pub fn set_fail_moves(&self, fail: bool) {
        self.fail_moves.store(fail, Ordering::SeqCst);
    }

    /// Makes file and directory removal fail.
    pub fn set_fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Reports zero bytes of free space.
    pub fn set_no_space(&self, no_space: bool) {
        self.no_space.store(no_space, Ordering::SeqCst);
    }

    /// Clears every flag.
    pub fn reset(&self) {
        self.set_fail_writes(false);
        self.set_fail_moves(false);
        self.set_fail_removes(false);
        self.set_no_space(false);
    }

    /// Number of injected failures so far.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn check(&self, flag: &AtomicBool, what: &str) -> StorageResult<()> {
        if flag.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(injected(what));
        }
        Ok(())
    }
}

impl Default for FaultyFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for FaultyFileSystem {
    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn file_size(&self, path: &Path) -> StorageResult<u64> {
        self.inner.file_size(path)
    }

    fn create_directory(&self, path: &Path) -> StorageResult<()> {
        self.inner.create_directory(path)
    }

    fn move_files(&self, paths: &[PathBuf], directory: &Path) -> StorageResult<()> {
        self.check(&self.fail_moves, "move")?;
        self.inner.move_files(paths, directory)
    }

    fn remove_files(&self, paths: &[PathBuf]) -> StorageResult<()> {
        self.check(&self.fail_removes, "remove")?;
        self.inner.remove_files(paths)
    }

    fn remove_directory(&self, path: &Path) -> StorageResult<()> {
        self.check(&self.fail_removes, "remove")?;
        self.inner.remove_directory(path)
    }

    fn list_directory(&self, path: &Path) -> StorageResult<Vec<PathBuf>> {
        self.inner.list_directory(path)
    }

    fn read_file(&self, path: &Path) -> StorageResult<Vec<u8>> {
        self.inner.read_file(path)
    }

    fn read_prefix(&self, path: &Path, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_prefix(path, len)
    }

    fn write_file_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        self.check(&self.fail_writes, "write")?;
        self.inner.write_file_atomic(path, data)
    }

    fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        self.check(&self.fail_writes, "rename")?;
        self.inner.rename(from, to)
    }

    fn identifier(&self, path: &Path) -> StorageResult<u32> {
        self.inner.identifier(path)
    }

    fn available_space(&self, path: &Path) -> StorageResult<u64> {
        if self.no_space.load(Ordering::SeqCst) {
            return Ok(0);
        }
        self.inner.available_space(path)
    }
}

/// Result of a corruption recovery scenario.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the scenario passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Rows expected after recovery.
    pub expected_rows: i64,
    /// Rows found after recovery.
    pub actual_rows: i64,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    fn finish(description: &str, expected: i64, outcome: Result<i64, String>) -> Self {
        match outcome {
            Ok(actual) => Self {
                passed: actual == expected,
                description: description.to_string(),
                expected_rows: expected,
                actual_rows: actual,
                error: (actual != expected).then(|| "rows were lost".to_string()),
            },
            Err(error) => Self {
                passed: false,
                description: description.to_string(),
                expected_rows: expected,
                actual_rows: 0,
                error: Some(error),
            },
        }
    }
}

/// Populates `rows` rows, backs up, closes, truncates the file to half and
/// recovers with [`RecoveryMode::Deposit`].
pub fn deposit_after_truncation(rows: usize) -> CrashRecoveryResult {
    let description = "Deposit recovery after truncation";
    let test_db = TestDatabase::new();
    let outcome = run_truncation_scenario(&test_db, rows).map_err(|e| e.to_string());
    CrashRecoveryResult::finish(description, rows as i64, outcome)
}

fn run_truncation_scenario(
    test_db: &TestDatabase,
    rows: usize,
) -> Result<i64, Box<dyn std::error::Error>> {
    let db: &Database = test_db;
    populate(db, "items", rows)?;
    db.backup()?;
    db.close(|| ())?;
    corrupt_by_truncation(&test_db.path(), 0.5)?;

    db.set_recovery_mode(RecoveryMode::Deposit);
    db.recover()?;
    Ok(row_count(db, "items")?)
}
