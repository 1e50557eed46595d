//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A file that must exist is missing.
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Not enough free space on the target volume.
    #[error("insufficient space: {required} bytes required, {available} available")]
    InsufficientSpace {
        /// Bytes the operation needs.
        required: u64,
        /// Bytes the volume reports as free.
        available: u64,
    },

    /// A destination already holds a file that would be clobbered.
    #[error("destination already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
}
