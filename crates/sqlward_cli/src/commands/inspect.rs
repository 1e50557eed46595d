//! Inspect command implementation.

use super::open_existing;
use serde::Serialize;
use sqlward_core::{Database, Material};
use sqlward_storage::{FileSystem, LocalFileSystem};
use std::path::Path;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// Main file size in bytes.
    pub file_size: u64,
    /// Write-ahead log size in bytes.
    pub wal_size: u64,
    /// File set plus materials, in bytes.
    pub total_size: u64,
    /// Journal mode reported by the engine.
    pub journal_mode: String,
    /// Whether `PRAGMA quick_check` failed.
    pub corrupted: bool,
    /// User tables and their row counts.
    pub tables: Vec<TableStats>,
    /// Live backup materials, newest first.
    pub materials: Vec<MaterialStats>,
    /// Number of deposits in the factory.
    pub deposits: usize,
}

/// Statistics for a single table.
#[derive(Debug, Serialize)]
pub struct TableStats {
    /// Table name.
    pub name: String,
    /// Number of rows, if the table could be read.
    pub rows: Option<i64>,
}

/// Summary of one material file.
#[derive(Debug, Serialize)]
pub struct MaterialStats {
    /// Material path.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Creation time in milliseconds since the epoch.
    pub created_at: Option<u64>,
    /// Number of tables captured.
    pub tables: Option<usize>,
    /// Number of rows captured.
    pub rows: Option<usize>,
    /// Why the material cannot be used, if it cannot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    let fs = LocalFileSystem::new();

    let corrupted = db.is_corrupted();
    let (journal_mode, tables) = if corrupted {
        (String::from("unknown"), Vec::new())
    } else {
        read_tables(&db)?
    };

    let materials = db
        .material_paths()
        .into_iter()
        .filter(|p| fs.exists(p))
        .map(|p| describe_material(&fs, &p))
        .collect();

    let result = InspectResult {
        path: path.display().to_string(),
        file_size: fs.file_size(path)?,
        wal_size: fs.file_size(&db.wal_path())?,
        total_size: db.files_size()?,
        journal_mode,
        corrupted,
        tables,
        materials,
        deposits: db.deposits()?.len(),
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn read_tables(db: &Database) -> Result<(String, Vec<TableStats>), Box<dyn std::error::Error>> {
    let (mode, names) = db.with_handle(|handle| {
        let conn = handle.connection();
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((mode, names))
    })?;

    let tables = names
        .into_iter()
        .map(|name| {
            let rows = db
                .with_handle(|handle| {
                    let sql = format!("SELECT count(*) FROM \"{}\"", name.replace('"', "\"\""));
                    Ok(handle.connection().query_row(&sql, [], |row| row.get(0))?)
                })
                .ok();
            TableStats { name, rows }
        })
        .collect();
    Ok((mode, tables))
}

fn describe_material(fs: &dyn FileSystem, path: &Path) -> MaterialStats {
    let size = fs.file_size(path).unwrap_or(0);
    let decoded = fs
        .read_file(path)
        .map_err(|e| e.to_string())
        .and_then(|data| Material::decode(&data).map_err(|e| e.to_string()));
    match decoded {
        Ok(material) => MaterialStats {
            path: path.display().to_string(),
            size,
            created_at: Some(material.created_at),
            tables: Some(material.tables.len()),
            rows: Some(material.row_count()),
            error: None,
        },
        Err(error) => MaterialStats {
            path: path.display().to_string(),
            size,
            created_at: None,
            tables: None,
            rows: None,
            error: Some(error),
        },
    }
}

fn print_text_output(result: &InspectResult) {
    println!("SQLWard Database Inspection");
    println!("===========================");
    println!();
    println!("Path: {}", result.path);
    println!("Journal mode: {}", result.journal_mode);
    println!("Corrupted: {}", if result.corrupted { "yes" } else { "no" });
    println!();
    println!("Storage:");
    println!("  Main file:   {}", format_size(result.file_size));
    println!("  WAL:         {}", format_size(result.wal_size));
    println!("  Total:       {}", format_size(result.total_size));
    println!();
    println!("Tables:");
    if result.tables.is_empty() {
        println!("  (none)");
    }
    for table in &result.tables {
        match table.rows {
            Some(rows) => println!("  {} ({} rows)", table.name, rows),
            None => println!("  {} (unreadable)", table.name),
        }
    }
    println!();
    println!("Materials:");
    if result.materials.is_empty() {
        println!("  (none)");
    }
    for material in &result.materials {
        match &material.error {
            Some(error) => println!("  {} - invalid: {}", material.path, error),
            None => println!(
                "  {} - {} tables, {} rows, {}",
                material.path,
                material.tables.unwrap_or(0),
                material.rows.unwrap_or(0),
                format_size(material.size)
            ),
        }
    }
    println!();
    println!("Deposits: {}", result.deposits);
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(12), "12 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_read_tables_counts_rows() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("a.db")).unwrap();
        db.execute("CREATE TABLE b(v); CREATE TABLE a(v); INSERT INTO a VALUES (1), (2)")
            .unwrap();

        let (mode, tables) = read_tables(&db).unwrap();
        assert_eq!(mode.to_ascii_lowercase(), "wal");
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].name, "a");
        assert_eq!(tables[0].rows, Some(2));
        assert_eq!(tables[1].rows, Some(0));
    }

    #[test]
    fn test_describe_invalid_material() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bogus.material");
        std::fs::write(&path, b"not a material").unwrap();
        let stats = describe_material(&LocalFileSystem::new(), &path);
        assert!(stats.error.is_some());
        assert_eq!(stats.size, 14);
    }
}
