//! Migration entry points.

use super::{Database, DatabaseShared};
use crate::error::{CoreResult, RecordError, ThreadedError};
use crate::handle::Handle;
use crate::migration::{MigrationInfo, MigrationMode, MigrationState};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, warn};

impl Database {
    /// Registers a table migration.
    ///
    /// The pool is drained while the source table is moved aside, so this
    /// waits for outstanding handles. Registering a source whose shadow
    /// table already exists resumes an interrupted migration.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::MigrationFailed`] if the source is
    /// missing or already registered, or the engine error.
    pub fn add_migration_info(&self, info: MigrationInfo) -> CoreResult<()> {
        self.close_with(|| {
            let mut handle = Handle::open(&self.shared.path)?;
            self.shared.hooks.configs.read().clone().apply(&mut handle)?;
            self.shared
                .hooks
                .migration
                .register(handle.connection(), info)
        })
        .record_threaded()
    }

    /// Restricts which source tables may step.
    pub fn filter_migration<F>(&self, filter: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.shared.hooks.migration.set_filter(Some(Arc::new(filter)));
    }

    /// Registered migrations in stepping order.
    #[must_use]
    pub fn migration_infos(&self) -> Vec<MigrationInfo> {
        self.shared.hooks.migration.infos()
    }

    /// Returns the migration state.
    #[must_use]
    pub fn migration_state(&self) -> MigrationState {
        self.shared.hooks.migration.state()
    }

    /// Returns the error that stopped the last step, if any.
    #[must_use]
    pub fn migration_error(&self) -> Option<ThreadedError> {
        self.shared.hooks.migration.last_error()
    }

    /// Performs one migration step on the calling thread.
    ///
    /// Returns whether more steps remain. Once every migration finished
    /// this is a no-op returning `false`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::MigrationFailed`]; the migration stays
    /// in the migrating state and the next step retries the same batch.
    pub fn step_migration(&self) -> CoreResult<bool> {
        if self.migration_state() == MigrationState::Inactive {
            self.shared.hooks.migration.begin(MigrationMode::Manual);
        }
        self.step_once().record_threaded()
    }

    fn step_once(&self) -> CoreResult<bool> {
        let batch = self.shared.config.migration_batch_size;
        let migration = &self.shared.hooks.migration;
        self.acquire_handle()?
            .with(|handle| migration.step(handle, batch))
    }

    /// Starts stepping on a background thread until every migration is
    /// done or a step fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be spawned.
    pub fn async_migration(&self) -> CoreResult<()> {
        let migration = &self.shared.hooks.migration;
        if migration.begin(MigrationMode::Background) == MigrationState::Inactive {
            return Ok(());
        }

        let mut worker = migration.worker.lock();
        if worker.as_ref().is_some_and(|w| !w.is_finished()) {
            return Ok(());
        }
        let shared = Arc::downgrade(&self.shared);
        let spawned = thread::Builder::new()
            .name("sqlward-migration".to_string())
            .spawn(move || run_worker(shared));
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
        .record_threaded()
    }
}

fn run_worker(shared: Weak<DatabaseShared>) {
    debug!("migration worker started");
    loop {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let db = Database { shared };
        let interval = db.shared.config.migration_step_interval;
        let result = db.step_once();
        drop(db);

        match result {
            Ok(true) => thread::sleep(interval),
            Ok(false) => break,
            Err(err) => {
                warn!(error = %err, "background migration stopped");
                break;
            }
        }
    }
    debug!("migration worker stopped");
}

#[cfg(test)]
mod tests {
    use crate::migration::{MigrationInfo, MigrationMode, MigrationState};
    use crate::{Config, Database};
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn seeded(rows: i64) -> (tempfile::TempDir, Database) {
        let dir = tempdir().unwrap();
        let config = Config::new().migration_batch_size(16);
        let db = Database::open_with_config(dir.path().join("m.db"), config).unwrap();
        db.run_transaction(|db| {
            db.execute("CREATE TABLE old_t(id INTEGER PRIMARY KEY, v TEXT)")?;
            for i in 1..=rows {
                db.execute(format!("INSERT INTO old_t VALUES ({i}, 'v{i}')"))?;
            }
            Ok(true)
        })
        .unwrap();
        (dir, db)
    }

    #[test]
    fn manual_steps_until_done() {
        let (_dir, db) = seeded(40);
        db.add_migration_info(MigrationInfo::new("old_t", "new_t"))
            .unwrap();
        assert!(db.table_exists("old_t").unwrap());

        assert!(db.step_migration().unwrap());
        assert_eq!(
            db.migration_state(),
            MigrationState::Migrating(MigrationMode::Manual)
        );
        while db.step_migration().unwrap() {}

        assert_eq!(db.migration_state(), MigrationState::Inactive);
        assert!(!db.step_migration().unwrap());
        assert!(!db.table_exists("old_t").unwrap());
    }

    #[test]
    fn background_worker_finishes() {
        let (_dir, db) = seeded(100);
        db.add_migration_info(MigrationInfo::new("old_t", "new_t"))
            .unwrap();
        db.async_migration().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while db.migration_state() != MigrationState::Inactive {
            assert!(Instant::now() < deadline, "migration did not finish");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(db.migration_error().is_none());
        let rows: i64 = db
            .with_handle(|h| {
                Ok(h.connection()
                    .query_row("SELECT count(*) FROM new_t", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(rows, 100);
    }

    #[test]
    fn async_without_migrations_stays_inactive() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("m.db")).unwrap();
        db.async_migration().unwrap();
        assert_eq!(db.migration_state(), MigrationState::Inactive);
    }
}
