//! File system trait definition.

use crate::error::StorageResult;
use std::fmt;
use std::path::{Path, PathBuf};

/// The file operations SQLWard needs from the host.
///
/// A `FileSystem` knows nothing about SQLite or materials. It moves, removes,
/// measures and atomically writes files on behalf of the core, which owns every
/// path decision.
///
/// # Invariants
///
/// - Operations on missing sources are no-ops (`remove_files`, `move_files`)
///   unless documented otherwise
/// - `write_file_atomic` either installs the full contents or leaves the
///   destination untouched
/// - Implementations must be `Send + Sync`; the core shares one instance
///   across all threads of a database
///
/// # Implementors
///
/// - [`super::LocalFileSystem`] - OS file APIs
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Returns whether `path` exists.
    fn exists(&self, path: &Path) -> bool;

    /// Returns the size of a single file, or 0 when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    fn file_size(&self, path: &Path) -> StorageResult<u64>;

    /// Returns the combined size of every existing file in `paths`.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata of an existing file cannot be read.
    fn files_size(&self, paths: &[PathBuf]) -> StorageResult<u64> {
        let mut total = 0u64;
        for path in paths {
            total = total.saturating_add(self.file_size(path)?);
        }
        Ok(total)
    }

    /// Creates `path` and any missing parents.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    fn create_directory(&self, path: &Path) -> StorageResult<()>;

    /// Moves every existing file in `paths` into `directory`, keeping file names.
    ///
    /// Either all existing files are moved or none are: a failure part-way
    /// moves the already-moved files back.
    ///
    /// # Errors
    ///
    /// Returns an error if a move fails or a destination already exists.
    fn move_files(&self, paths: &[PathBuf], directory: &Path) -> StorageResult<()>;

    /// Removes every existing file in `paths`.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be removed.
    fn remove_files(&self, paths: &[PathBuf]) -> StorageResult<()>;

    /// Recursively removes a directory. Missing directories are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed.
    fn remove_directory(&self, path: &Path) -> StorageResult<()>;

    /// Lists the direct children of a directory, sorted by path.
    ///
    /// Returns an empty list for a missing directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    fn list_directory(&self, path: &Path) -> StorageResult<Vec<PathBuf>>;

    /// Reads a whole file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::NotFound`] for a missing file, or an I/O
    /// error.
    fn read_file(&self, path: &Path) -> StorageResult<Vec<u8>>;

    /// Reads at most `len` bytes from the start of a file.
    ///
    /// # Errors
    ///
    /// Same as [`FileSystem::read_file`].
    fn read_prefix(&self, path: &Path, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` to `path` through a temporary sibling and a rename.
    ///
    /// # Errors
    ///
    /// Returns an error if writing, syncing or renaming fails. The destination
    /// is untouched in that case.
    fn write_file_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()>;

    /// Renames `from` to `to`, replacing `to` if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the rename fails.
    fn rename(&self, from: &Path, to: &Path) -> StorageResult<()>;

    /// Computes a stable identifier for the file at `path`.
    ///
    /// The identifier follows the file across renames on the same volume and
    /// changes when the file is replaced by a new one.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::NotFound`] for a missing file.
    fn identifier(&self, path: &Path) -> StorageResult<u32>;

    /// Returns the free space, in bytes, of the volume holding `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be queried.
    fn available_space(&self, path: &Path) -> StorageResult<u64>;
}
