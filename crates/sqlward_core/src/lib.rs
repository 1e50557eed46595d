//! # SQLWard Core
//!
//! Handle pool, transactions, online migration, backup and recovery for
//! SQLite databases.
//!
//! This crate provides:
//! - A bounded pool of configured connections with blockade and drain
//! - Per-thread transaction binding with nested savepoints
//! - Online table migration that keeps the old table name usable
//! - Backup materials, deposits and corruption-tolerant retrieval
//! - Policy-driven automatic recovery
//!
//! ## Example
//!
//! ```rust
//! use sqlward_core::{Database, RecoveryMode};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let db = Database::open(dir.path().join("app.db")).unwrap();
//! db.set_recovery_mode(RecoveryMode::Deposit);
//!
//! db.execute("CREATE TABLE notes(id INTEGER PRIMARY KEY, body TEXT)").unwrap();
//! db.execute("INSERT INTO notes(body) VALUES ('hello')").unwrap();
//! db.backup().unwrap();
//!
//! let score = db.retrieve(|_| {}).unwrap();
//! assert_eq!(score, 1.0);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod configs;
mod database;
mod error;
mod handle;
pub mod migration;
pub mod pool;
pub mod repair;
mod schema;
mod threaded;
mod types;

pub use config::{Config, JournalMode};
pub use configs::{HandleConfig, BASIC_CONFIG_NAME, BASIC_CONFIG_ORDER};
pub use database::Database;
pub use error::{CoreError, CoreResult, ErrorKind, ThreadedError};
pub use handle::Handle;
pub use migration::{
    MigrationInfo, MigrationMode, MigrationState, MigrationTableFilter, SHADOW_PREFIX,
};
pub use pool::{HandleLifecycle, HandlePool, RecyclableHandle};
pub use repair::material::{BackupFilter, Material};
pub use repair::{RecoverNotification, RecoveryMode, RecoveryModeKind};
pub use types::{DatabaseId, HandleId, Statement, Tag};
