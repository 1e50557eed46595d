//! Database facade.

mod migration;
mod recovery;
mod repair;
mod transaction;

use crate::config::Config;
use crate::configs::{HandleConfigs, BASIC_CONFIG_NAME, BASIC_CONFIG_ORDER};
use crate::error::{self, CoreError, CoreResult, RecordError, ThreadedError};
use crate::handle::Handle;
use crate::migration::Migration;
use crate::pool::{HandleLifecycle, HandlePool, RecyclableHandle};
use crate::repair::material::BackupFilter;
use crate::repair::retriever::sibling;
use crate::repair::{Factory, RecoveryMode};
use crate::threaded;
use crate::types::{DatabaseId, Statement, Tag};
use parking_lot::RwLock;
use sqlward_storage::FileSystem;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Hooks the pool runs on every handle of a database.
struct DatabaseHooks {
    configs: RwLock<HandleConfigs>,
    migration: Migration,
}

impl HandleLifecycle for DatabaseHooks {
    fn will_configure(&self, handle: &mut Handle) -> CoreResult<()> {
        let configs = self.configs.read().clone();
        if configs.is_stale(handle) {
            configs.apply(handle)?;
        }
        self.migration.rebind(handle)
    }

    fn will_flow_back(&self, handle: &mut Handle) {
        self.migration.will_flow_back(handle);
    }
}

pub(crate) struct DatabaseShared {
    id: DatabaseId,
    path: PathBuf,
    config: Config,
    tag: AtomicI64,
    pool: HandlePool,
    hooks: Arc<DatabaseHooks>,
    factory: Factory,
    recovery: RwLock<Option<RecoveryMode>>,
    backup_filter: RwLock<Option<BackupFilter>>,
}

/// A database file and everything layered on top of it.
///
/// `Database` is the entry point for client code. It composes a
/// [`HandlePool`] with transactions, online migration, backup and
/// recovery. Cloning is cheap and every clone shares the same pool.
///
/// # Opening a Database
///
/// ```rust
/// use sqlward_core::Database;
///
/// let dir = tempfile::tempdir().unwrap();
/// let db = Database::open(dir.path().join("app.db")).unwrap();
///
/// db.execute("CREATE TABLE users(id INTEGER PRIMARY KEY, name TEXT)").unwrap();
/// db.run_transaction(|db| {
///     db.execute("INSERT INTO users(name) VALUES ('ada')")?;
///     Ok(true)
/// })
/// .unwrap();
///
/// assert!(db.table_exists("users").unwrap());
/// ```
///
/// # Threads
///
/// Handles are leased per thread. While a thread has a transaction open,
/// every call it makes on this database reuses the same handle.
#[derive(Clone)]
pub struct Database {
    shared: Arc<DatabaseShared>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.shared.id)
            .field("path", &self.shared.path)
            .field("tag", &self.tag())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Opens the database at `path` with default configuration.
    ///
    /// No connection is made until the first handle is requested. Use
    /// [`Database::can_open`] to probe the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens the database at `path` with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created.
    pub fn open_with_config(path: impl AsRef<Path>, config: Config) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            config.file_system.create_directory(parent)?;
        }

        let mut configs = HandleConfigs::default();
        let busy_timeout = config.busy_timeout;
        let journal_mode = config.journal_mode;
        configs.set(
            BASIC_CONFIG_NAME,
            BASIC_CONFIG_ORDER,
            Arc::new(move |handle: &mut Handle| -> CoreResult<()> {
                let conn = handle.connection();
                conn.busy_timeout(busy_timeout)?;
                let _mode: String = conn.query_row(
                    &format!("PRAGMA journal_mode={}", journal_mode.as_pragma()),
                    [],
                    |row| row.get(0),
                )?;
                Ok(())
            }),
        );

        let hooks = Arc::new(DatabaseHooks {
            configs: RwLock::new(configs),
            migration: Migration::default(),
        });
        let pool = HandlePool::new(
            path.clone(),
            config.max_handles,
            config.blockade_timeout,
            Arc::clone(&hooks) as Arc<dyn HandleLifecycle>,
        );
        let id = DatabaseId::next();
        debug!(database = %id, path = %path.display(), "opened database");

        Ok(Self {
            shared: Arc::new(DatabaseShared {
                id,
                factory: Factory::new(&path),
                path,
                config,
                tag: AtomicI64::new(Tag::INVALID.as_i64()),
                pool,
                hooks,
                recovery: RwLock::new(None),
                backup_filter: RwLock::new(None),
            }),
        })
    }

    /// Returns the process-unique identity of this database.
    #[must_use]
    pub fn id(&self) -> DatabaseId {
        self.shared.id
    }

    /// Returns the configuration the database was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    fn fs(&self) -> &dyn FileSystem {
        self.shared.config.file_system.as_ref()
    }

    // ------------------------------------------------------------------
    // Tag
    // ------------------------------------------------------------------

    /// Sets the caller-defined tag.
    pub fn set_tag(&self, tag: Tag) {
        self.shared.tag.store(tag.as_i64(), Ordering::Release);
    }

    /// Returns the caller-defined tag, [`Tag::INVALID`] by default.
    #[must_use]
    pub fn tag(&self) -> Tag {
        Tag::new(self.shared.tag.load(Ordering::Acquire))
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    /// Returns a handle lease for the calling thread.
    ///
    /// A thread with an open transaction gets its transaction's handle.
    /// Otherwise an idle handle is issued, waiting while the pool is
    /// blockaded. A corrupted file triggers the recovery mode once.
    ///
    /// # Errors
    ///
    /// Returns the open/configure error, or a lifecycle error on timeout.
    pub fn get_handle(&self) -> CoreResult<RecyclableHandle> {
        self.acquire_handle().record_threaded()
    }

    pub(crate) fn acquire_handle(&self) -> CoreResult<RecyclableHandle> {
        if let Some(handle) = threaded::threaded_handle(self.shared.id) {
            return Ok(handle);
        }
        match self.shared.pool.get_handle() {
            Err(err) if err.is_corruption() => {
                self.recover_after(err)?;
                self.shared.pool.get_handle()
            }
            result => result,
        }
    }

    /// Runs `f` with the calling thread's handle.
    ///
    /// # Errors
    ///
    /// Returns the acquisition error or the error of `f`.
    pub fn with_handle<R>(&self, f: impl FnOnce(&mut Handle) -> CoreResult<R>) -> CoreResult<R> {
        self.acquire_handle()
            .and_then(|handle| handle.with(f))
            .record_threaded()
    }

    /// Executes a statement.
    ///
    /// A corruption error outside a transaction triggers the recovery mode
    /// once and the statement is retried.
    ///
    /// # Errors
    ///
    /// Returns the engine error.
    pub fn execute(&self, statement: impl Into<Statement>) -> CoreResult<()> {
        let statement = statement.into();
        self.execute_statement(&statement).record_threaded()
    }

    fn execute_statement(&self, statement: &Statement) -> CoreResult<()> {
        let handle = self.acquire_handle()?;
        match handle.with(|h| h.execute(statement)) {
            Err(err) if err.is_corruption() && !handle.is_in_transaction() => {
                drop(handle);
                self.recover_after(err)?;
                self.acquire_handle()?.with(|h| h.execute(statement))
            }
            result => result,
        }
    }

    /// Returns whether a table or view named `table` exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be read.
    pub fn table_exists(&self, table: &str) -> CoreResult<bool> {
        self.with_handle(|h| h.table_exists(table))
    }

    /// Returns whether a handle can be opened right now.
    #[must_use]
    pub fn can_open(&self) -> bool {
        self.get_handle().is_ok()
    }

    /// Returns whether the pool holds at least one live handle.
    #[must_use]
    pub fn is_opened(&self) -> bool {
        self.shared.pool.is_opened()
    }

    /// Number of live handles, leased or idle.
    #[must_use]
    pub fn alive_handles(&self) -> usize {
        self.shared.pool.alive_handles()
    }

    /// Number of idle handles.
    #[must_use]
    pub fn idle_handles(&self) -> usize {
        self.shared.pool.idle_handles()
    }

    /// Stops issuing handles to other callers until [`Database::unblockade`].
    pub fn blockade(&self) {
        self.shared.pool.blockade();
    }

    /// Lifts one blockade.
    pub fn unblockade(&self) {
        self.shared.pool.unblockade();
    }

    /// Returns whether handle issuance is stopped.
    #[must_use]
    pub fn is_blockaded(&self) -> bool {
        self.shared.pool.is_blockaded()
    }

    /// Waits for every lease to return, closes every handle, then runs
    /// `on_closed` once. The next request reopens the database.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] when called from a thread
    /// that still holds a handle of this database, whether through an open
    /// transaction or a [`RecyclableHandle`](crate::RecyclableHandle) from
    /// [`Database::get_handle`].
    pub fn close<R>(&self, on_closed: impl FnOnce() -> R) -> CoreResult<R> {
        self.close_pool(on_closed).record_threaded()
    }

    fn close_pool<R>(&self, on_closed: impl FnOnce() -> R) -> CoreResult<R> {
        if threaded::has_threaded_handle(self.shared.id) {
            return Err(CoreError::invalid_operation(
                "cannot close a database while this thread holds one of its handles",
            ));
        }
        self.shared.pool.close(on_closed)
    }

    /// Closes the pool and runs a fallible maintenance pass.
    pub(crate) fn close_with<R>(&self, f: impl FnOnce() -> CoreResult<R>) -> CoreResult<R> {
        self.close_pool(f)?
    }

    /// Drops idle handles.
    pub fn purge(&self) {
        self.shared.pool.purge();
    }

    // ------------------------------------------------------------------
    // Configs
    // ------------------------------------------------------------------

    /// Installs or replaces a named handle config.
    ///
    /// Configs run in ascending `order` on every handle issued after the
    /// change. Idle handles are reconfigured on their next issuance.
    pub fn set_config<F>(&self, name: &str, order: i32, config: F)
    where
        F: Fn(&mut Handle) -> CoreResult<()> + Send + Sync + 'static,
    {
        self.shared
            .hooks
            .configs
            .write()
            .set(name, order, Arc::new(config));
    }

    /// Removes a named handle config. Returns whether it existed.
    pub fn remove_config(&self, name: &str) -> bool {
        self.shared.hooks.configs.write().remove(name)
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Path of the main database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Path of the write-ahead log.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        sibling(&self.shared.path, "-wal")
    }

    /// Path of the rollback journal.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        sibling(&self.shared.path, "-journal")
    }

    /// Path of the shared-memory index.
    #[must_use]
    pub fn shm_path(&self) -> PathBuf {
        sibling(&self.shared.path, "-shm")
    }

    /// Path of the directory holding materials and deposits.
    #[must_use]
    pub fn factory_path(&self) -> &Path {
        self.shared.factory.directory()
    }

    /// Every file of the live file set.
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        vec![
            self.shared.path.clone(),
            self.wal_path(),
            self.journal_path(),
            self.shm_path(),
        ]
    }

    /// Moves the file set and its materials into `directory`.
    ///
    /// # Errors
    ///
    /// Returns the file system error; nothing is moved in that case.
    pub fn move_files(&self, directory: impl AsRef<Path>) -> CoreResult<()> {
        self.move_files_with_extra(directory, &[])
    }

    /// Like [`Database::move_files`], also moving `extra` files.
    ///
    /// # Errors
    ///
    /// Returns the file system error; nothing is moved in that case.
    pub fn move_files_with_extra(
        &self,
        directory: impl AsRef<Path>,
        extra: &[PathBuf],
    ) -> CoreResult<()> {
        let directory = directory.as_ref();
        let mut files = self.paths();
        files.extend(self.shared.factory.materials());
        files.extend_from_slice(extra);
        self.close_with(|| Ok(self.fs().move_files(&files, directory)?))
            .record_threaded()
    }

    /// Removes the file set and the factory directory.
    ///
    /// # Errors
    ///
    /// Returns the file system error.
    pub fn remove_files(&self) -> CoreResult<()> {
        self.close_with(|| {
            self.fs().remove_files(&self.paths())?;
            self.fs().remove_directory(self.shared.factory.directory())?;
            Ok(())
        })
        .record_threaded()
    }

    /// Combined size of the file set and its materials.
    ///
    /// # Errors
    ///
    /// Returns the file system error.
    pub fn files_size(&self) -> CoreResult<u64> {
        let mut files = self.paths();
        files.extend(self.shared.factory.materials());
        self.fs()
            .files_size(&files)
            .map_err(CoreError::from)
            .record_threaded()
    }

    /// Stable numeric identifier of the main file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist.
    pub fn identifier(&self) -> CoreResult<u32> {
        self.fs()
            .identifier(&self.shared.path)
            .map_err(CoreError::from)
            .record_threaded()
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Last error recorded by a failing operation on the calling thread.
    #[must_use]
    pub fn threaded_error() -> Option<ThreadedError> {
        error::threaded_error()
    }

    /// Clears the calling thread's error register.
    pub fn clear_threaded_error() {
        error::clear_threaded_error();
    }

    fn warn_absorbed(&self, what: &str, err: &CoreError) {
        warn!(database = %self.shared.id, error = %err, "{what}");
    }
}
