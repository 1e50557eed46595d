//! Backup, deposit and retrieval.

use super::Database;
use crate::error::{CoreError, CoreResult, RecordError};
use crate::repair::material::{Material, HEADER_SIZE};
use crate::repair::retriever;
use sqlward_storage::StorageError;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

impl Database {
    /// Restricts which tables [`Database::backup`] snapshots.
    pub fn filter_backup<F>(&self, filter: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        *self.shared.backup_filter.write() = Some(Arc::new(filter));
    }

    /// Writes a new backup material and rotates the previous one.
    ///
    /// Handle issuance is blockaded while the snapshot is taken. On failure
    /// the existing materials are left untouched.
    ///
    /// # Errors
    ///
    /// Returns the engine error, a storage error, or
    /// [`StorageError::InsufficientSpace`] wrapped in [`CoreError::Storage`].
    pub fn backup(&self) -> CoreResult<()> {
        self.write_backup().record_threaded()
    }

    fn write_backup(&self) -> CoreResult<()> {
        let handle = self.acquire_handle()?;
        let _blockade = self.shared.pool.blockade_guard();

        let identifier = self.fs().identifier(&self.shared.path)?;
        let filter = self.shared.backup_filter.read().clone();
        let material = handle.with(|h| {
            h.begin_nested_transaction()?;
            let snapshot = Material::snapshot(h.connection(), identifier, filter.as_ref());
            let released = h.rollback_nested_transaction();
            let material = snapshot?;
            released?;
            Ok(material)
        })?;
        drop(handle);

        let data = material.encode()?;
        let factory = &self.shared.factory;
        let fs = self.fs();
        fs.create_directory(factory.directory())?;
        let required = data.len() as u64;
        let available = fs.available_space(factory.directory())?;
        if available < required {
            return Err(StorageError::InsufficientSpace {
                required,
                available,
            }
            .into());
        }

        let incoming = factory.incoming_material();
        let last = factory.last_material();
        fs.write_file_atomic(&incoming, &data)?;
        if fs.exists(&last) {
            fs.rename(&last, &factory.first_material())?;
        }
        fs.rename(&incoming, &last)?;

        info!(
            database = %self.shared.id,
            tables = material.tables.len(),
            rows = material.row_count(),
            bytes = required,
            "backup written"
        );
        Ok(())
    }

    /// Paths of the live materials, newest first.
    #[must_use]
    pub fn material_paths(&self) -> Vec<PathBuf> {
        self.shared.factory.materials()
    }

    /// Deletes both live materials.
    ///
    /// # Errors
    ///
    /// Returns the file system error.
    pub fn remove_materials(&self) -> CoreResult<()> {
        let mut files = self.shared.factory.materials();
        files.push(self.shared.factory.incoming_material());
        self.fs()
            .remove_files(&files)
            .map_err(CoreError::from)
            .record_threaded()
    }

    /// Moves the file set and its materials into a new deposit directory.
    ///
    /// The next handle request starts from an empty file.
    ///
    /// # Errors
    ///
    /// Returns the file system error; nothing is moved in that case.
    /// Fails with [`crate::CoreError::InvalidOperation`] if this thread
    /// still holds a handle, as [`Database::close`] does.
    pub fn deposit(&self) -> CoreResult<()> {
        self.close_with(|| self.deposit_files()).record_threaded()
    }

    /// Runs with the pool closed.
    pub(crate) fn deposit_files(&self) -> CoreResult<()> {
        let mut files = self.paths();
        files.extend(self.shared.factory.materials());
        let fs = self.fs();
        if !files.iter().any(|f| fs.exists(f)) {
            debug!(database = %self.shared.id, "nothing to deposit");
            return Ok(());
        }
        let target = self.shared.factory.new_deposit();
        fs.move_files(&files, &target)?;
        info!(database = %self.shared.id, deposit = %target.display(), "file set deposited");
        Ok(())
    }

    /// Deletes every deposit.
    ///
    /// # Errors
    ///
    /// Returns the file system error.
    pub fn remove_deposit(&self) -> CoreResult<()> {
        self.fs()
            .remove_directory(&self.shared.factory.deposited_root())
            .map_err(CoreError::from)
            .record_threaded()
    }

    /// Deposit directories, oldest first.
    ///
    /// # Errors
    ///
    /// Returns the file system error.
    pub fn deposits(&self) -> CoreResult<Vec<PathBuf>> {
        self.shared.factory.deposits(self.fs()).record_threaded()
    }

    /// Returns whether a deposit exists.
    #[must_use]
    pub fn contains_deposited(&self) -> bool {
        self.deposits().is_ok_and(|d| !d.is_empty())
    }

    /// Rebuilds the database from the deposits not merged yet and the live
    /// file set. Merged deposits are marked and skipped by later calls, so
    /// rows deleted after a retrieval stay deleted.
    ///
    /// `on_progress` receives values in `[0, 1]` and always ends with
    /// `1.0`. Returns the fraction of known rows that were recovered.
    ///
    /// # Errors
    ///
    /// Returns an error if the rebuilt file cannot be written or installed,
    /// or if this thread still holds a handle.
    pub fn retrieve<F>(&self, mut on_progress: F) -> CoreResult<f64>
    where
        F: FnMut(f64),
    {
        self.close_with(|| self.retrieve_files(&mut on_progress))
            .record_threaded()
    }

    /// Runs with the pool closed.
    pub(crate) fn retrieve_files(&self, on_progress: &mut dyn FnMut(f64)) -> CoreResult<f64> {
        let fs = self.fs();
        let factory = &self.shared.factory;
        let deposits = factory.pending_deposits(fs)?;
        let sources = factory.sources(&deposits, &self.shared.path);
        let scratch = factory.restore_file();
        let outcome = retriever::rebuild(fs, &sources, &scratch, on_progress)?;

        fs.remove_files(&self.paths())?;
        fs.rename(&scratch, &self.shared.path)?;
        if let Some(restore) = scratch.parent() {
            fs.remove_directory(restore)?;
        }
        for deposit in &deposits {
            fs.write_file_atomic(&factory.retrieved_marker(deposit), &[])?;
        }
        info!(
            database = %self.shared.id,
            sources = sources.len(),
            expected = outcome.expected,
            recovered = outcome.recovered,
            "retrieval installed"
        );
        Ok(outcome.score)
    }

    /// Returns whether any live or deposited material has a valid header.
    #[must_use]
    pub fn can_retrieve(&self) -> bool {
        let fs = self.fs();
        let factory = &self.shared.factory;
        let Ok(deposits) = factory.pending_deposits(fs) else {
            return false;
        };
        let sources = factory.sources(&deposits, &self.shared.path);
        sources
            .iter()
            .flat_map(|source| source.materials.iter())
            .filter(|path| fs.exists(path))
            .any(|path| {
                fs.read_prefix(path, HEADER_SIZE)
                    .map_err(CoreError::from)
                    .and_then(|data| Material::peek(&data))
                    .is_ok()
            })
    }
}
