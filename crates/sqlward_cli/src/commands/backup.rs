//! Backup, retrieve and deposit commands.
//!
//! These go through the `Database` API so materials land in the factory
//! directory with the same layout automatic recovery uses.

use super::open_existing;
use sqlward_core::Database;
use std::path::Path;
use tracing::info;

/// Writes a backup material, leaving `exclude` tables out.
pub fn create(db_path: &Path, exclude: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    info!("Creating backup of {}", db_path.display());

    let db = open_existing(db_path)?;
    if !exclude.is_empty() {
        db.filter_backup(move |table| !exclude.iter().any(|e| e == table));
    }
    db.backup()?;
    let size = db.files_size()?;
    db.close(|| ())?;

    println!("✓ Backup created successfully");
    for path in db.material_paths().iter().filter(|p| p.exists()) {
        println!("  Material: {}", path.display());
    }
    println!("  File set with materials: {} bytes", size);

    Ok(())
}

/// Rebuilds the database from deposits and materials.
pub fn retrieve(db_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    info!("Retrieving {}", db_path.display());

    let db = Database::open(db_path)?;
    if !db.can_retrieve() {
        println!("No usable material found; only readable rows will be kept.");
    }
    let mut reported = 0u32;
    let score = db.retrieve(|progress| {
        let percent = (progress * 100.0) as u32;
        if percent >= reported + 25 || (percent == 100 && reported < 100) {
            println!("  {percent:>3}%");
            reported = percent;
        }
    })?;

    println!("✓ Retrieval complete");
    println!("  Recovered: {:.1}% of known rows", score * 100.0);
    Ok(())
}

/// Moves the file set into a fresh deposit.
pub fn deposit(db_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_existing(db_path)?;
    db.deposit()?;
    println!("✓ File set deposited ({} deposits)", db.deposits()?.len());
    Ok(())
}

/// Deletes every deposit.
pub fn remove_deposit(db_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open(db_path)?;
    let count = db.deposits()?.len();
    db.remove_deposit()?;
    println!("✓ Removed {count} deposits");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seeded(path: &Path) {
        let db = Database::open(path).unwrap();
        db.execute("CREATE TABLE t(v); INSERT INTO t VALUES (1), (2), (3)")
            .unwrap();
        db.execute("CREATE TABLE skip(v); INSERT INTO skip VALUES (1)")
            .unwrap();
        db.close(|| ()).unwrap();
    }

    #[test]
    fn test_backup_deposit_retrieve() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cli.db");
        seeded(&path);

        create(&path, vec!["skip".to_string()]).unwrap();
        deposit(&path).unwrap();
        assert!(!path.exists());
        retrieve(&path).unwrap();

        let db = Database::open(&path).unwrap();
        let rows: i64 = db
            .with_handle(|h| Ok(h.connection().query_row("SELECT count(*) FROM t", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(rows, 3);

        remove_deposit(&path).unwrap();
        assert!(db.deposits().unwrap().is_empty());
    }

    #[test]
    fn test_missing_database_is_reported() {
        let dir = tempdir().unwrap();
        assert!(create(&dir.path().join("absent.db"), Vec::new()).is_err());
    }
}
