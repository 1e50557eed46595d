//! CLI command implementations.

pub mod backup;
pub mod inspect;
pub mod migrate;
pub mod recover;
pub mod verify;

use sqlward_core::Database;
use std::path::Path;

/// Opens an existing database file.
pub(crate) fn open_existing(path: &Path) -> Result<Database, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No database found at {}", path.display()).into());
    }
    Ok(Database::open(path)?)
}
