//! # SQLWard Storage
//!
//! File system collaborator for SQLWard.
//!
//! A SQLWard database is a *file set*: the primary file, its journal,
//! write-ahead log and shared-memory siblings, plus a factory directory
//! holding backup materials and deposits. The core decides which paths
//! belong together; this crate only performs the file operations.
//!
//! ## Design Principles
//!
//! - No knowledge of SQLite or material formats
//! - Must be `Send + Sync` so one instance serves every thread
//! - Multi-file moves are all-or-nothing
//!
//! ## Example
//!
//! ```rust
//! use sqlward_storage::{FileSystem, LocalFileSystem};
//!
//! let fs = LocalFileSystem::new();
//! let dir = tempfile::tempdir().unwrap();
//! let path = dir.path().join("blob");
//! fs.write_file_atomic(&path, b"hello").unwrap();
//! assert_eq!(fs.read_file(&path).unwrap(), b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod filesystem;
mod local;

pub use error::{StorageError, StorageResult};
pub use filesystem::FileSystem;
pub use local::LocalFileSystem;
