//! Recover command implementation.

use crate::ModeArg;
use sqlward_core::{Database, RecoveryMode};
use std::path::Path;
use tracing::info;

/// Runs `mode` if the database is corrupted, or unconditionally with
/// `force`.
pub fn run(db_path: &Path, mode: ModeArg, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open(db_path)?;
    if !force && !db.is_corrupted() {
        println!("✓ Database is healthy; nothing to recover");
        return Ok(());
    }

    let mode = match mode {
        ModeArg::Remove => RecoveryMode::Remove,
        ModeArg::Deposit => RecoveryMode::Deposit,
    };
    info!("Recovering {} with {:?}", db_path.display(), mode);
    db.set_recovery_mode(mode);
    db.recover()?;

    println!("✓ Recovery finished");
    if db.is_corrupted() {
        return Err("Database is still corrupted after recovery".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_healthy_database_is_left_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h.db");
        let db = Database::open(&path).unwrap();
        db.execute("CREATE TABLE t(v)").unwrap();
        db.close(|| ()).unwrap();

        run(&path, ModeArg::Remove, false).unwrap();
        assert!(db.table_exists("t").unwrap());
    }

    #[test]
    fn test_forced_remove_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h.db");
        let db = Database::open(&path).unwrap();
        db.execute("CREATE TABLE t(v)").unwrap();
        db.close(|| ()).unwrap();

        run(&path, ModeArg::Remove, true).unwrap();
        assert!(!db.table_exists("t").unwrap());
    }
}
