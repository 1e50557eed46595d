//! Migrate command implementation.

use super::open_existing;
use sqlward_core::MigrationInfo;
use std::path::Path;
use tracing::info;

/// Registers `source -> target` and steps it, at most `steps` times.
///
/// Re-running the command resumes a migration that was interrupted.
pub fn run(
    db_path: &Path,
    source: &str,
    target: &str,
    steps: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Migrating {} -> {} in {}", source, target, db_path.display());

    let db = open_existing(db_path)?;
    db.add_migration_info(MigrationInfo::new(source, target))?;

    let mut taken = 0usize;
    let mut pending = true;
    while pending && steps.map_or(true, |limit| taken < limit) {
        pending = db.step_migration()?;
        taken += 1;
    }

    if pending {
        println!("○ Migration paused after {taken} steps; run again to continue");
    } else {
        println!("✓ Migration complete ({taken} steps)");
    }
    Ok(())
}
