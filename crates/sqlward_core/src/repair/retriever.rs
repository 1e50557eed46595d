//! Reconstruction of a database from damaged files and materials.

use super::material::{self, Material, MaterialRow, MaterialTable, MaterialValue};
use crate::error::{CoreError, CoreResult};
use crate::schema::{self, column_list, quote};
use rusqlite::{Connection, OpenFlags};
use sqlward_storage::FileSystem;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One file set to salvage from, plus the materials describing it.
#[derive(Debug, Clone)]
pub(crate) struct Source {
    pub database: PathBuf,
    /// Newest first.
    pub materials: Vec<PathBuf>,
}

/// Result of a retrieval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Outcome {
    pub score: f64,
    pub expected: u64,
    pub recovered: u64,
}

#[derive(Debug)]
struct Accumulated {
    table: MaterialTable,
    keyed: BTreeMap<i64, Vec<MaterialValue>>,
    unkeyed: Vec<Vec<MaterialValue>>,
}

impl Accumulated {
    fn new(mut table: MaterialTable) -> Self {
        table.rows = Vec::new();
        Self {
            table,
            keyed: BTreeMap::new(),
            unkeyed: Vec::new(),
        }
    }

    fn merge(&mut self, rows: Vec<MaterialRow>) {
        for row in rows {
            match row.rowid {
                Some(rowid) => {
                    self.keyed.insert(rowid, row.values);
                }
                None => self.unkeyed.push(row.values),
            }
        }
    }

    fn expected(&self) -> u64 {
        (self.keyed.len() + self.unkeyed.len()) as u64
    }
}

/// Loads the newest material of `source` that decodes, falling back to
/// older ones.
pub(crate) fn load_material(fs: &dyn FileSystem, source: &Source) -> Option<Material> {
    for path in &source.materials {
        if !fs.exists(path) {
            continue;
        }
        match fs
            .read_file(path)
            .map_err(CoreError::from)
            .and_then(|data| Material::decode(&data))
        {
            Ok(material) => return Some(material),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unusable material"),
        }
    }
    None
}

/// Reads every table of `path` it can. Tables that fail part-way are
/// returned with the rows read before the failure and `clean = false`.
fn salvage(fs: &dyn FileSystem, path: &Path) -> Vec<(MaterialTable, bool)> {
    if fs.file_size(path).unwrap_or(0) == 0 {
        return Vec::new();
    }
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = match Connection::open_with_flags(path, flags) {
        Ok(conn) => conn,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot open source");
            return Vec::new();
        }
    };
    let names = match schema::user_tables(&conn) {
        Ok(names) => names,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot read schema of source");
            return Vec::new();
        }
    };

    let mut salvaged = Vec::new();
    for name in names {
        let mut table = match material::describe_table(&conn, &name) {
            Ok(table) => table,
            Err(err) => {
                warn!(table = %name, error = %err, "cannot describe table");
                continue;
            }
        };
        let (rows, failure) = material::read_rows(&conn, &table);
        if let Some(err) = &failure {
            warn!(table = %name, rows = rows.len(), error = %err, "table only partly readable");
        }
        table.rows = rows;
        salvaged.push((table, failure.is_none()));
    }
    salvaged
}

/// Rebuilds the content of `sources` (oldest first) into `scratch`.
///
/// For each source, rows readable from the file win. Material rows fill in
/// the tables that could not be read completely.
pub(crate) fn rebuild(
    fs: &dyn FileSystem,
    sources: &[Source],
    scratch: &Path,
    on_progress: &mut dyn FnMut(f64),
) -> CoreResult<Outcome> {
    let mut tables: BTreeMap<String, Accumulated> = BTreeMap::new();
    let mut steps_done = 0usize;
    let source_steps = sources.len().max(1);

    for source in sources {
        let material = load_material(fs, source);
        let salvaged = salvage(fs, &source.database);
        debug!(
            database = %source.database.display(),
            material = material.is_some(),
            tables = salvaged.len(),
            "salvaged source"
        );

        let clean: Vec<&str> = salvaged
            .iter()
            .filter(|(_, clean)| *clean)
            .map(|(t, _)| t.name.as_str())
            .collect();
        if let Some(material) = &material {
            for table in &material.tables {
                if clean.contains(&table.name.as_str()) {
                    continue;
                }
                tables
                    .entry(table.name.clone())
                    .or_insert_with(|| Accumulated::new(table.clone()))
                    .merge(table.rows.clone());
            }
        }
        for (table, _) in salvaged {
            let rows = table.rows.clone();
            tables
                .entry(table.name.clone())
                .or_insert_with(|| Accumulated::new(table))
                .merge(rows);
        }

        steps_done += 1;
        on_progress(0.5 * steps_done as f64 / source_steps as f64);
    }

    fs.remove_files(&[
        scratch.to_path_buf(),
        sibling(scratch, "-journal"),
        sibling(scratch, "-wal"),
        sibling(scratch, "-shm"),
    ])?;
    if let Some(parent) = scratch.parent() {
        fs.create_directory(parent)?;
    }
    let mut conn = Connection::open(scratch)?;

    let expected: u64 = tables.values().map(Accumulated::expected).sum();
    let mut recovered = 0u64;
    let total = tables.len().max(1);
    for (done, acc) in tables.values().enumerate() {
        recovered += write_table(&mut conn, acc)?;
        on_progress(0.5 + 0.5 * (done + 1) as f64 / total as f64);
    }
    conn.close().map_err(|(_, err)| err)?;

    let score = if expected == 0 {
        1.0
    } else {
        recovered as f64 / expected as f64
    };
    on_progress(1.0);
    info!(expected, recovered, score, "retrieval rebuilt database");
    Ok(Outcome {
        score,
        expected,
        recovered,
    })
}

fn write_table(conn: &mut Connection, acc: &Accumulated) -> CoreResult<u64> {
    let table = &acc.table;
    if let Err(err) = conn.execute_batch(&table.sql) {
        warn!(table = %table.name, error = %err, "cannot recreate table");
        return Ok(0);
    }

    let with_rowid = table.has_rowid() && table.rowid_alias.is_none();
    let cols = column_list(&table.columns);
    let placeholders = vec!["?"; table.columns.len()].join(", ");
    let insert = if with_rowid {
        format!(
            "INSERT OR REPLACE INTO main.{}(rowid, {cols}) VALUES (?, {placeholders})",
            quote(&table.name)
        )
    } else {
        format!(
            "INSERT OR REPLACE INTO main.{}({cols}) VALUES ({placeholders})",
            quote(&table.name)
        )
    };

    let null = MaterialValue::Null;
    let tx = conn.transaction()?;
    let mut written = 0u64;
    {
        let mut stmt = tx.prepare(&insert)?;
        let keyed = acc.keyed.iter().map(|(rowid, values)| (Some(*rowid), values));
        let unkeyed = acc.unkeyed.iter().map(|values| (None, values));
        for (rowid, values) in keyed.chain(unkeyed) {
            let rowid_value = rowid.map(MaterialValue::Integer);
            let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(values.len() + 1);
            if with_rowid {
                params.push(rowid_value.as_ref().unwrap_or(&null));
            }
            params.extend(values.iter().map(|v| v as &dyn rusqlite::ToSql));
            match stmt.execute(params.as_slice()) {
                Ok(_) => written += 1,
                Err(err) => warn!(table = %table.name, error = %err, "row not recovered"),
            }
        }
    }
    tx.commit()?;

    for index in &table.indexes {
        if let Err(err) = conn.execute_batch(index) {
            warn!(table = %table.name, error = %err, "cannot recreate index");
        }
    }
    Ok(written)
}

pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlward_storage::LocalFileSystem;
    use tempfile::tempdir;

    fn write_db(path: &Path, rows: i64) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        for i in 1..=rows {
            conn.execute("INSERT INTO t VALUES (?1, ?2)", (i, format!("row {i}")))
                .unwrap();
        }
    }

    fn count(path: &Path) -> i64 {
        Connection::open(path)
            .unwrap()
            .query_row("SELECT count(*) FROM t", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn intact_source_is_copied() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let db = dir.path().join("a.db");
        write_db(&db, 10);

        let mut reports = Vec::new();
        let outcome = rebuild(
            &fs,
            &[Source {
                database: db,
                materials: Vec::new(),
            }],
            &dir.path().join("restore/a.db"),
            &mut |p| reports.push(p),
        )
        .unwrap();

        assert_eq!(outcome.score, 1.0);
        assert_eq!(outcome.recovered, 10);
        assert_eq!(reports.last().copied(), Some(1.0));
        assert!(reports.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(count(&dir.path().join("restore/a.db")), 10);
    }

    #[test]
    fn material_fills_unreadable_source() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let db = dir.path().join("a.db");
        write_db(&db, 5);

        let conn = Connection::open(&db).unwrap();
        let material = Material::snapshot(&conn, 0, None).unwrap();
        drop(conn);
        let material_path = dir.path().join("a.db.last.material");
        fs.write_file_atomic(&material_path, &material.encode().unwrap())
            .unwrap();
        std::fs::write(&db, b"not a database at all").unwrap();

        let outcome = rebuild(
            &fs,
            &[Source {
                database: db,
                materials: vec![dir.path().join("missing.material"), material_path],
            }],
            &dir.path().join("restore/a.db"),
            &mut |_| {},
        )
        .unwrap();

        assert_eq!(outcome.expected, 5);
        assert_eq!(outcome.score, 1.0);
        assert_eq!(count(&dir.path().join("restore/a.db")), 5);
    }

    #[test]
    fn nothing_to_recover_scores_one() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let outcome = rebuild(&fs, &[], &dir.path().join("restore/x.db"), &mut |_| {}).unwrap();
        assert_eq!(outcome.score, 1.0);
        assert_eq!(outcome.expected, 0);
    }
}
