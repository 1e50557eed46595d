//! Verify command implementation.

use super::open_existing;
use sqlward_core::{Database, Material};
use sqlward_storage::{FileSystem, LocalFileSystem};
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Whether the database passed `PRAGMA quick_check`.
    pub database_ok: bool,
    /// Number of materials checked.
    pub materials_checked: usize,
    /// Number of materials that decoded and passed their checksum.
    pub valid_materials: usize,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.database_ok && self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying database at {}", path.display());
    println!();

    let db = open_existing(path)?;
    let result = verify(&db, &LocalFileSystem::new());
    print_result(&result);

    if !result.is_ok() {
        return Err("Verification failed".into());
    }
    Ok(())
}

fn verify(db: &Database, fs: &dyn FileSystem) -> VerifyResult {
    let mut result = VerifyResult {
        database_ok: !db.is_corrupted(),
        ..VerifyResult::default()
    };
    if !result.database_ok {
        result.errors.push("database failed quick_check".to_string());
    }

    for path in db.material_paths().iter().filter(|p| fs.exists(p)) {
        result.materials_checked += 1;
        let checked = fs
            .read_file(path)
            .map_err(|e| e.to_string())
            .and_then(|data| Material::decode(&data).map_err(|e| e.to_string()));
        match checked {
            Ok(_) => result.valid_materials += 1,
            Err(error) => result
                .errors
                .push(format!("{}: {}", path.display(), error)),
        }
    }
    result
}

fn print_result(result: &VerifyResult) {
    println!(
        "Database: {}",
        if result.database_ok { "✓ ok" } else { "✗ corrupted" }
    );
    println!(
        "Materials: {}/{} valid",
        result.valid_materials, result.materials_checked
    );
    for error in &result.errors {
        println!("  ✗ {}", error);
    }
    println!();
    if result.is_ok() {
        println!("✓ Verification passed");
    } else {
        println!("✗ Verification failed");
    }
}
