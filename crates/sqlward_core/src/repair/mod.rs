//! Backup materials, deposits, retrieval and recovery policy.
//!
//! Everything the repair subsystem writes lives in the *factory* directory
//! next to the database:
//!
//! ```text
//! P.factory/
//!   <name>.first.material      older material
//!   <name>.last.material       newer material
//!   deposited/<millis>-<uuid>/ quarantined file sets with their materials
//!   restore/<name>             scratch file of a running retrieval
//! ```

pub mod material;
pub(crate) mod retriever;

use crate::database::Database;
use crate::error::CoreResult;
use retriever::Source;
use sqlward_storage::FileSystem;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Custom recovery hook. Returns whether recovery succeeded.
pub type RecoverNotification = Arc<dyn Fn(&Database) -> bool + Send + Sync>;

/// What `recover()` does when the database is corrupted.
#[derive(Clone)]
pub enum RecoveryMode {
    /// Hand the database to an application callback.
    Custom(RecoverNotification),
    /// Delete the file set and start empty.
    Remove,
    /// Quarantine the file set, then rebuild from it and the materials.
    Deposit,
}

impl RecoveryMode {
    /// Returns the variant without its payload.
    #[must_use]
    pub fn kind(&self) -> RecoveryModeKind {
        match self {
            Self::Custom(_) => RecoveryModeKind::Custom,
            Self::Remove => RecoveryModeKind::Remove,
            Self::Deposit => RecoveryModeKind::Deposit,
        }
    }
}

impl fmt::Debug for RecoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.kind(), f)
    }
}

/// Payload-free form of [`RecoveryMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryModeKind {
    /// See [`RecoveryMode::Custom`].
    Custom,
    /// See [`RecoveryMode::Remove`].
    Remove,
    /// See [`RecoveryMode::Deposit`].
    Deposit,
}

const FIRST_MATERIAL: &str = "first.material";
const LAST_MATERIAL: &str = "last.material";
const DEPOSITED: &str = "deposited";
const RESTORE: &str = "restore";
const RETRIEVED: &str = "retrieved";

/// Layout of the factory directory of one database.
#[derive(Debug, Clone)]
pub(crate) struct Factory {
    directory: PathBuf,
    name: OsString,
}

impl Factory {
    pub fn new(database: &Path) -> Self {
        let name = database
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("database"));
        let mut directory = database.as_os_str().to_os_string();
        directory.push(".factory");
        Self {
            directory: PathBuf::from(directory),
            name,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_in(&self, dir: &Path, suffix: &str) -> PathBuf {
        let mut name = self.name.clone();
        name.push(".");
        name.push(suffix);
        dir.join(name)
    }

    pub fn first_material(&self) -> PathBuf {
        self.file_in(&self.directory, FIRST_MATERIAL)
    }

    pub fn last_material(&self) -> PathBuf {
        self.file_in(&self.directory, LAST_MATERIAL)
    }

    pub fn incoming_material(&self) -> PathBuf {
        self.file_in(&self.directory, "incoming.material")
    }

    pub fn materials(&self) -> Vec<PathBuf> {
        vec![self.last_material(), self.first_material()]
    }

    pub fn deposited_root(&self) -> PathBuf {
        self.directory.join(DEPOSITED)
    }

    /// A fresh, time-ordered deposit directory path.
    pub fn new_deposit(&self) -> PathBuf {
        let stamp = material::now_millis();
        self.deposited_root()
            .join(format!("{stamp:013}-{}", uuid::Uuid::new_v4()))
    }

    /// Existing deposit directories, oldest first.
    pub fn deposits(&self, fs: &dyn FileSystem) -> CoreResult<Vec<PathBuf>> {
        Ok(fs.list_directory(&self.deposited_root())?)
    }

    /// Marker left in a deposit once its rows were merged into the live
    /// file. Marked deposits are kept until removed but never merged again.
    pub fn retrieved_marker(&self, deposit: &Path) -> PathBuf {
        self.file_in(deposit, RETRIEVED)
    }

    /// Deposits not yet merged by a retrieval, oldest first.
    pub fn pending_deposits(&self, fs: &dyn FileSystem) -> CoreResult<Vec<PathBuf>> {
        let mut deposits = self.deposits(fs)?;
        deposits.retain(|dir| !fs.exists(&self.retrieved_marker(dir)));
        Ok(deposits)
    }

    pub fn restore_file(&self) -> PathBuf {
        self.directory.join(RESTORE).join(&self.name)
    }

    /// Retrieval sources: `deposits` in order, then the live file.
    pub fn sources(&self, deposits: &[PathBuf], live: &Path) -> Vec<Source> {
        let mut sources: Vec<Source> = deposits
            .iter()
            .map(|dir| Source {
                database: dir.join(&self.name),
                materials: vec![
                    self.file_in(&dir, LAST_MATERIAL),
                    self.file_in(&dir, FIRST_MATERIAL),
                ],
            })
            .collect();
        sources.push(Source {
            database: live.to_path_buf(),
            materials: self.materials(),
        });
        sources
    }
}
