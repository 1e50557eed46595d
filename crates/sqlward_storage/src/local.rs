//! File system implementation backed by OS file APIs.

use crate::error::{StorageError, StorageResult};
use crate::filesystem::FileSystem;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// A [`FileSystem`] using `std::fs`.
///
/// # Durability
///
/// - `write_file_atomic` syncs the temporary file before renaming it and
///   syncs the parent directory afterwards
/// - `move_files` syncs the destination directory once all moves succeed
///
/// # Example
///
/// ```no_run
/// use sqlward_storage::{FileSystem, LocalFileSystem};
/// use std::path::Path;
///
/// let fs = LocalFileSystem::new();
/// fs.write_file_atomic(Path::new("notes.bin"), b"payload").unwrap();
/// assert_eq!(fs.file_size(Path::new("notes.bin")).unwrap(), 7);
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    /// Creates a new local file system.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn not_found_as(path: &Path, err: io::Error) -> StorageError {
    if err.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound(path.to_path_buf())
    } else {
        StorageError::Io(err)
    }
}

/// Moves one file, falling back to copy + remove across volumes.
fn move_file(from: &Path, to: &Path) -> StorageResult<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)?;
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Syncs a directory so that renames and removals inside it are durable.
///
/// Windows NTFS journals metadata updates, so there is nothing to do there.
#[cfg(unix)]
fn sync_directory(path: &Path) -> StorageResult<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> StorageResult<()> {
    Ok(())
}

impl FileSystem for LocalFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn file_size(&self, path: &Path) -> StorageResult<u64> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(metadata.len()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn create_directory(&self, path: &Path) -> StorageResult<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn move_files(&self, paths: &[PathBuf], directory: &Path) -> StorageResult<()> {
        self.create_directory(directory)?;

        let mut moved: Vec<(PathBuf, PathBuf)> = Vec::new();
        for source in paths {
            if !source.exists() {
                continue;
            }
            let Some(name) = source.file_name() else {
                continue;
            };
            let destination = directory.join(name);
            let result = if destination.exists() {
                Err(StorageError::AlreadyExists(destination.clone()))
            } else {
                move_file(source, &destination)
            };
            if let Err(err) = result {
                for (from, to) in moved.iter().rev() {
                    let _ = move_file(to, from);
                }
                return Err(err);
            }
            moved.push((source.clone(), destination));
        }

        if !moved.is_empty() {
            sync_directory(directory)?;
        }
        Ok(())
    }

    fn remove_files(&self, paths: &[PathBuf]) -> StorageResult<()> {
        for path in paths {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn remove_directory(&self, path: &Path) -> StorageResult<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn list_directory(&self, path: &Path) -> StorageResult<Vec<PathBuf>> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut children = Vec::new();
        for entry in entries {
            children.push(entry?.path());
        }
        children.sort();
        Ok(children)
    }

    fn read_file(&self, path: &Path) -> StorageResult<Vec<u8>> {
        fs::read(path).map_err(|err| not_found_as(path, err))
    }

    fn read_prefix(&self, path: &Path, len: usize) -> StorageResult<Vec<u8>> {
        let file = File::open(path).map_err(|err| not_found_as(path, err))?;
        let mut buffer = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    fn write_file_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(parent) = parent {
            fs::create_dir_all(parent)?;
        }

        let temp_path = temp_sibling(path);
        let mut file = File::create(&temp_path)?;
        if let Err(err) = file.write_all(data).and_then(|()| file.sync_all()) {
            drop(file);
            let _ = fs::remove_file(&temp_path);
            return Err(err.into());
        }
        drop(file);

        fs::rename(&temp_path, path)?;
        if let Some(parent) = parent {
            sync_directory(parent)?;
        }
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        fs::rename(from, to).map_err(|err| not_found_as(from, err))
    }

    fn identifier(&self, path: &Path) -> StorageResult<u32> {
        let metadata = fs::metadata(path).map_err(|err| not_found_as(path, err))?;

        let mut hasher = Sha256::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            hasher.update(metadata.dev().to_le_bytes());
            hasher.update(metadata.ino().to_le_bytes());
        }
        #[cfg(not(unix))]
        {
            hasher.update(path.as_os_str().as_encoded_bytes());
            if let Ok(created) = metadata.created() {
                let nanos = created
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos();
                hasher.update(nanos.to_le_bytes());
            }
        }
        let digest = hasher.finalize();
        Ok(u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]))
    }

    fn available_space(&self, path: &Path) -> StorageResult<u64> {
        // fs2 needs an existing path; walk up to the nearest ancestor.
        let mut existing = path;
        while !existing.exists() {
            match existing.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => existing = parent,
                _ => {
                    existing = Path::new(".");
                    break;
                }
            }
        }
        Ok(fs2::available_space(existing)?)
    }
}
