//! Online table migration.
//!
//! A migration moves every row of a legacy *source* table into a *target*
//! table while the database stays in use.
//!
//! ## Lifecycle
//!
//! 1. **Register**: with the pool drained, the target is created from the
//!    source schema if missing and the source is renamed to a shadow table
//!    (`sqlward_migrating_<source>`).
//! 2. **Rebind**: every handle issued afterwards gets a TEMP view named after
//!    the source that unions the shadow and the target, with INSTEAD OF
//!    triggers routing inserts to the target and applying updates and deletes
//!    to both. Client SQL keeps using the legacy name.
//! 3. **Step**: inside one savepoint, a batch of shadow rows (highest rowid
//!    first) not yet present in the target is copied and then deleted from
//!    the shadow. When the shadow is empty it is dropped and the migration
//!    epoch is bumped, so handles drop their temp objects on next issuance.
//!
//! Row identity is the rowid, which makes re-running a step a no-op for rows
//! already copied.

use crate::error::{CoreError, CoreResult, ThreadedError};
use crate::handle::Handle;
use crate::schema::{self, column_list, quote};
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Prefix of the shadow table holding rows not yet migrated.
pub const SHADOW_PREFIX: &str = "sqlward_migrating_";

/// Predicate over source table names selecting which migrations may step.
pub type MigrationTableFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Describes one table migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    /// Legacy table whose rows are moved.
    pub source_table: String,
    /// Table receiving the rows.
    pub target_table: String,
    /// Columns to carry over. `None` carries every column the two tables
    /// have in common.
    pub columns: Option<Vec<String>>,
}

impl MigrationInfo {
    /// Creates a migration from `source_table` into `target_table`.
    pub fn new(source_table: impl Into<String>, target_table: impl Into<String>) -> Self {
        Self {
            source_table: source_table.into(),
            target_table: target_table.into(),
            columns: None,
        }
    }

    /// Restricts the migration to `columns`.
    #[must_use]
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    fn shadow_table(&self) -> String {
        format!("{SHADOW_PREFIX}{}", self.source_table)
    }
}

/// Who drives migration steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationMode {
    /// A worker thread steps until done.
    Background,
    /// The application calls `step_migration`.
    Manual,
}

/// Database-wide migration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// No migration is pending.
    Inactive,
    /// At least one migration has rows left.
    Migrating(MigrationMode),
}

#[derive(Debug, Clone)]
struct Descriptor {
    info: MigrationInfo,
    shadow: String,
    columns: Vec<String>,
    rowid_alias: Option<String>,
    finished: bool,
}

impl Descriptor {
    /// Column list for copies; carries the rowid unless a column aliases it.
    fn copy_columns(&self) -> String {
        let cols = column_list(&self.columns);
        if self.rowid_alias.is_some() {
            cols
        } else {
            format!("rowid, {cols}")
        }
    }
}

/// Per-database migration engine.
pub(crate) struct Migration {
    descriptors: RwLock<Vec<Descriptor>>,
    filter: RwLock<Option<MigrationTableFilter>>,
    state: Mutex<MigrationState>,
    last_error: Mutex<Option<ThreadedError>>,
    epoch: AtomicU64,
    step_lock: Mutex<()>,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("descriptors", &self.descriptors.read().len())
            .field("state", &*self.state.lock())
            .field("epoch", &self.epoch.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Default for Migration {
    fn default() -> Self {
        Self {
            descriptors: RwLock::new(Vec::new()),
            filter: RwLock::new(None),
            state: Mutex::new(MigrationState::Inactive),
            last_error: Mutex::new(None),
            epoch: AtomicU64::new(0),
            step_lock: Mutex::new(()),
            worker: Mutex::new(None),
        }
    }
}

impl Migration {
    pub fn state(&self) -> MigrationState {
        *self.state.lock()
    }

    pub fn last_error(&self) -> Option<ThreadedError> {
        self.last_error.lock().clone()
    }

    pub fn set_filter(&self, filter: Option<MigrationTableFilter>) {
        *self.filter.write() = filter;
    }

    pub fn infos(&self) -> Vec<MigrationInfo> {
        self.descriptors
            .read()
            .iter()
            .map(|d| d.info.clone())
            .collect()
    }

    /// Returns whether an unfinished migration passes the filter.
    pub fn has_pending(&self) -> bool {
        let filter = self.filter.read().clone();
        self.descriptors
            .read()
            .iter()
            .any(|d| is_eligible(d, filter.as_ref()))
    }

    /// Enters the migrating state, unless nothing is pending.
    pub fn begin(&self, mode: MigrationMode) -> MigrationState {
        let next = if self.has_pending() {
            MigrationState::Migrating(mode)
        } else {
            MigrationState::Inactive
        };
        *self.state.lock() = next;
        next
    }

    /// Registers a migration. Must run on a connection no other handle
    /// shares a view of, i.e. with the pool drained.
    pub fn register(&self, conn: &Connection, info: MigrationInfo) -> CoreResult<()> {
        if info.source_table == info.target_table {
            return Err(CoreError::migration_failed(
                "source and target tables must differ",
            ));
        }
        if self
            .descriptors
            .read()
            .iter()
            .any(|d| d.info.source_table == info.source_table)
        {
            return Err(CoreError::migration_failed(format!(
                "a migration from {} is already registered",
                info.source_table
            )));
        }

        conn.execute_batch("BEGIN IMMEDIATE")?;
        match prepare_tables(conn, &info) {
            Ok(descriptor) => {
                conn.execute_batch("COMMIT")?;
                info!(
                    source = %info.source_table,
                    target = %info.target_table,
                    finished = descriptor.finished,
                    "registered migration"
                );
                self.descriptors.write().push(descriptor);
                self.epoch.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(err)
            }
        }
    }

    /// Installs or removes the temp redirection objects on `handle` if its
    /// migration epoch is stale.
    pub fn rebind(&self, handle: &mut Handle) -> CoreResult<()> {
        let epoch = self.epoch.load(Ordering::Acquire);
        if handle.migration_epoch == Some(epoch) {
            return Ok(());
        }

        let descriptors = self.descriptors.read().clone();
        let conn = handle.connection();
        for descriptor in &descriptors {
            let view = quote(&descriptor.info.source_table);
            conn.execute_batch(&format!("DROP VIEW IF EXISTS temp.{view}"))?;
            if !descriptor.finished {
                conn.execute_batch(&redirect_sql(descriptor))?;
            }
        }
        handle.migration_epoch = Some(epoch);
        debug!(handle = %handle.id(), epoch, "rebound migrations");
        Ok(())
    }

    /// Forgets a stale binding so the next issuance re-checks it.
    pub fn will_flow_back(&self, handle: &mut Handle) {
        if handle.migration_epoch != Some(self.epoch.load(Ordering::Acquire)) {
            handle.migration_epoch = None;
        }
    }

    /// Performs one step. Returns whether eligible migrations remain.
    ///
    /// A step commits on its own, so `handle` must not be inside a
    /// transaction: a caller rollback would undo a step already recorded
    /// as done.
    pub fn step(&self, handle: &mut Handle, batch_size: usize) -> CoreResult<bool> {
        if handle.is_in_transaction() {
            return Err(CoreError::invalid_operation(
                "migration cannot step inside an open transaction",
            ));
        }
        let _serial = self.step_lock.lock();
        let filter = self.filter.read().clone();

        let next = self
            .descriptors
            .read()
            .iter()
            .find(|d| is_eligible(d, filter.as_ref()))
            .cloned();
        let Some(descriptor) = next else {
            *self.state.lock() = MigrationState::Inactive;
            return Ok(false);
        };

        match run_step(handle, &descriptor, batch_size) {
            Ok(drained) => {
                *self.last_error.lock() = None;
                if drained {
                    self.finish(&descriptor.info.source_table);
                }
            }
            Err(err) => {
                let err = CoreError::migration_failed(format!(
                    "{} -> {}: {err}",
                    descriptor.info.source_table, descriptor.info.target_table
                ));
                warn!(error = %err, "migration step failed");
                *self.last_error.lock() = Some(ThreadedError::from(&err));
                return Err(err);
            }
        }

        let remaining = self.has_pending();
        if !remaining {
            *self.state.lock() = MigrationState::Inactive;
            info!("all migrations finished");
        }
        Ok(remaining)
    }

    fn finish(&self, source: &str) {
        if let Some(d) = self
            .descriptors
            .write()
            .iter_mut()
            .find(|d| d.info.source_table == source)
        {
            d.finished = true;
            info!(source = %d.info.source_table, target = %d.info.target_table, "migration finished");
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

fn is_eligible(descriptor: &Descriptor, filter: Option<&MigrationTableFilter>) -> bool {
    !descriptor.finished && filter.map_or(true, |f| f(&descriptor.info.source_table))
}

fn prepare_tables(conn: &Connection, info: &MigrationInfo) -> CoreResult<Descriptor> {
    let shadow = info.shadow_table();
    let source_present = schema::main_table_exists(conn, &info.source_table)?;
    let shadow_present = schema::main_table_exists(conn, &shadow)?;
    let target_present = schema::main_table_exists(conn, &info.target_table)?;

    if !source_present && !shadow_present {
        if target_present {
            return Ok(Descriptor {
                info: info.clone(),
                shadow,
                columns: Vec::new(),
                rowid_alias: None,
                finished: true,
            });
        }
        return Err(CoreError::migration_failed(format!(
            "source table {} does not exist",
            info.source_table
        )));
    }

    if source_present {
        if !target_present {
            create_target_like(conn, &info.source_table, &info.target_table)?;
        }
        conn.execute_batch(&format!(
            "ALTER TABLE main.{} RENAME TO {}",
            quote(&info.source_table),
            quote(&shadow)
        ))?;
    } else if !target_present {
        create_target_like(conn, &shadow, &info.target_table)?;
    }

    if overlapping_rows(conn, &shadow, &info.target_table)? {
        return Err(CoreError::migration_failed(format!(
            "{} already holds rows with the rowids of {}",
            info.target_table, info.source_table
        )));
    }

    let source_columns = schema::table_columns(conn, &shadow)?;
    let target_columns = schema::table_columns(conn, &info.target_table)?;
    let columns: Vec<String> = match &info.columns {
        Some(explicit) => explicit.clone(),
        None => source_columns
            .iter()
            .filter(|c| target_columns.iter().any(|t| t.name == c.name))
            .map(|c| c.name.clone())
            .collect(),
    };
    if columns.is_empty() {
        return Err(CoreError::migration_failed(format!(
            "{} and {} have no column in common",
            info.source_table, info.target_table
        )));
    }
    let rowid_alias = schema::rowid_alias(&source_columns)
        .filter(|alias| schema::rowid_alias(&target_columns).as_deref() == Some(alias.as_str()))
        .filter(|alias| columns.contains(alias));

    Ok(Descriptor {
        info: info.clone(),
        shadow,
        columns,
        rowid_alias,
        finished: false,
    })
}

fn overlapping_rows(conn: &Connection, shadow: &str, target: &str) -> CoreResult<bool> {
    Ok(conn.query_row(
        &format!(
            "SELECT EXISTS (SELECT 1 FROM main.{} WHERE rowid IN (SELECT rowid FROM main.{}))",
            quote(shadow),
            quote(target)
        ),
        [],
        |row| row.get(0),
    )?)
}

fn create_target_like(conn: &Connection, from: &str, target: &str) -> CoreResult<()> {
    let sql = schema::table_sql(conn, from)?;
    let body = sql.as_deref().and_then(|s| s.find('(').map(|at| &s[at..]));
    let create = match body {
        Some(body) => format!("CREATE TABLE main.{} {body}", quote(target)),
        None => format!(
            "CREATE TABLE main.{} AS SELECT * FROM main.{} WHERE 0",
            quote(target),
            quote(from)
        ),
    };
    conn.execute_batch(&create)?;
    Ok(())
}

/// TEMP view plus INSTEAD OF triggers redirecting the legacy name.
fn redirect_sql(d: &Descriptor) -> String {
    let view = quote(&d.info.source_table);
    let shadow = quote(&d.shadow);
    let target = quote(&d.info.target_table);
    let cols = column_list(&d.columns);
    let trigger = |event: &str| quote(&format!("sqlward_{}_{event}", d.info.source_table));

    let next_rowid = format!(
        "(SELECT coalesce(max(m), 0) + 1 FROM (\
         SELECT max(rowid) AS m FROM {shadow} UNION ALL SELECT max(rowid) FROM {target}))"
    );
    let new_values = |skip_alias: bool| {
        d.columns
            .iter()
            .map(|c| {
                if skip_alias && d.rowid_alias.as_deref() == Some(c.as_str()) {
                    format!("coalesce(NEW.{q}, {next_rowid})", q = quote(c))
                } else {
                    format!("NEW.{}", quote(c))
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    };
    let insert = match &d.rowid_alias {
        Some(_) => format!(
            "INSERT INTO {target}({cols}) VALUES ({});",
            new_values(true)
        ),
        None => format!(
            "INSERT INTO {target}(rowid, {cols}) VALUES ({next_rowid}, {});",
            new_values(false)
        ),
    };
    let matches = match &d.rowid_alias {
        Some(alias) => format!("{q} = OLD.{q}", q = quote(alias)),
        None => d
            .columns
            .iter()
            .map(|c| format!("{q} IS OLD.{q}", q = quote(c)))
            .collect::<Vec<_>>()
            .join(" AND "),
    };
    let assignments = d
        .columns
        .iter()
        .map(|c| format!("{q} = NEW.{q}", q = quote(c)))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TEMP VIEW {view} AS \
             SELECT {cols} FROM main.{shadow} UNION ALL SELECT {cols} FROM main.{target};\n\
         CREATE TEMP TRIGGER {ins} INSTEAD OF INSERT ON {view} BEGIN {insert} END;\n\
         CREATE TEMP TRIGGER {upd} INSTEAD OF UPDATE ON {view} BEGIN \
             UPDATE {shadow} SET {assignments} WHERE {matches}; \
             UPDATE {target} SET {assignments} WHERE {matches}; END;\n\
         CREATE TEMP TRIGGER {del} INSTEAD OF DELETE ON {view} BEGIN \
             DELETE FROM {shadow} WHERE {matches}; \
             DELETE FROM {target} WHERE {matches}; END;",
        ins = trigger("insert"),
        upd = trigger("update"),
        del = trigger("delete"),
    )
}

/// Copies and removes one batch. Returns whether the shadow was dropped.
fn run_step(handle: &mut Handle, d: &Descriptor, batch_size: usize) -> CoreResult<bool> {
    handle.begin_nested_transaction()?;
    match copy_batch(handle.connection(), d, batch_size) {
        Ok(drained) => {
            handle.commit_or_rollback_nested_transaction()?;
            Ok(drained)
        }
        Err(err) => {
            if let Err(rollback) = handle.rollback_nested_transaction() {
                warn!(error = %rollback, "rollback after failed migration step failed");
            }
            Err(err)
        }
    }
}

fn copy_batch(conn: &Connection, d: &Descriptor, batch_size: usize) -> CoreResult<bool> {
    let shadow = quote(&d.shadow);
    let target = quote(&d.info.target_table);
    let cols = d.copy_columns();
    let batch = i64::try_from(batch_size).unwrap_or(i64::MAX);

    let copied = conn.execute(
        &format!(
            "INSERT INTO main.{target}({cols}) \
             SELECT {cols} FROM main.{shadow} \
             WHERE rowid IN (SELECT rowid FROM main.{shadow} ORDER BY rowid DESC LIMIT ?1) \
             AND rowid NOT IN (SELECT rowid FROM main.{target})"
        ),
        [batch],
    )?;
    let removed = conn.execute(
        &format!(
            "DELETE FROM main.{shadow} \
             WHERE rowid IN (SELECT rowid FROM main.{shadow} ORDER BY rowid DESC LIMIT ?1)"
        ),
        [batch],
    )?;
    debug!(source = %d.info.source_table, copied, removed, "migration batch");
    if removed > copied {
        warn!(
            source = %d.info.source_table,
            target = %d.info.target_table,
            skipped = removed - copied,
            "rows already present in target were not copied"
        );
    }

    let remaining: bool = conn.query_row(
        &format!("SELECT EXISTS (SELECT 1 FROM main.{shadow})"),
        [],
        |row| row.get(0),
    )?;
    if remaining {
        return Ok(false);
    }
    conn.execute_batch(&format!(
        "DROP VIEW IF EXISTS temp.{}; DROP TABLE main.{shadow};",
        quote(&d.info.source_table)
    ))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &std::path::Path) -> Handle {
        Handle::open(&dir.join("m.db")).unwrap()
    }

    fn count(handle: &Handle, table: &str) -> i64 {
        handle
            .connection()
            .query_row(&format!("SELECT count(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    fn seed(handle: &Handle, rows: i64) {
        handle
            .execute(&"CREATE TABLE old_t(id INTEGER PRIMARY KEY, v TEXT)".into())
            .unwrap();
        for i in 1..=rows {
            handle
                .connection()
                .execute("INSERT INTO old_t(id, v) VALUES (?1, ?2)", (i, format!("v{i}")))
                .unwrap();
        }
    }

    #[test]
    fn register_creates_target_and_shadow() {
        let dir = tempdir().unwrap();
        let mut handle = open(dir.path());
        seed(&handle, 3);

        let migration = Migration::default();
        migration
            .register(handle.connection(), MigrationInfo::new("old_t", "new_t"))
            .unwrap();
        assert!(schema::main_table_exists(handle.connection(), "new_t").unwrap());
        assert!(schema::main_table_exists(handle.connection(), "sqlward_migrating_old_t").unwrap());
        assert!(!handle.table_exists("old_t").unwrap());

        migration.rebind(&mut handle).unwrap();
        assert!(handle.table_exists("old_t").unwrap());
        assert_eq!(count(&handle, "old_t"), 3);
    }

    #[test]
    fn redirected_writes_reach_both_tables() {
        let dir = tempdir().unwrap();
        let mut handle = open(dir.path());
        seed(&handle, 4);
        let migration = Migration::default();
        migration
            .register(handle.connection(), MigrationInfo::new("old_t", "new_t"))
            .unwrap();
        migration.rebind(&mut handle).unwrap();

        assert!(migration.step(&mut handle, 2).unwrap());
        assert_eq!(count(&handle, "new_t"), 2);

        handle
            .execute(&"INSERT INTO old_t(v) VALUES ('fresh')".into())
            .unwrap();
        handle
            .execute(&"UPDATE old_t SET v = 'one' WHERE id = 1".into())
            .unwrap();
        handle
            .execute(&"DELETE FROM old_t WHERE id = 4".into())
            .unwrap();

        let fresh_id: i64 = handle
            .connection()
            .query_row("SELECT id FROM new_t WHERE v = 'fresh'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(fresh_id, 5);
        assert_eq!(count(&handle, "old_t"), 4);

        while migration.step(&mut handle, 2).unwrap() {}
        assert_eq!(migration.state(), MigrationState::Inactive);

        migration.rebind(&mut handle).unwrap();
        assert!(!handle.table_exists("old_t").unwrap());
        let one: String = handle
            .connection()
            .query_row("SELECT v FROM new_t WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(one, "one");
        assert_eq!(count(&handle, "new_t"), 4);
    }

    #[test]
    fn step_after_completion_is_noop() {
        let dir = tempdir().unwrap();
        let mut handle = open(dir.path());
        seed(&handle, 1);
        let migration = Migration::default();
        migration
            .register(handle.connection(), MigrationInfo::new("old_t", "new_t"))
            .unwrap();

        assert!(!migration.step(&mut handle, 10).unwrap());
        assert!(!migration.step(&mut handle, 10).unwrap());
        assert_eq!(count(&handle, "new_t"), 1);
    }

    #[test]
    fn step_inside_transaction_is_rejected() {
        let dir = tempdir().unwrap();
        let mut handle = open(dir.path());
        seed(&handle, 2);
        let migration = Migration::default();
        migration
            .register(handle.connection(), MigrationInfo::new("old_t", "new_t"))
            .unwrap();

        handle.begin_transaction().unwrap();
        let err = migration.step(&mut handle, 10).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
        handle.rollback_transaction().unwrap();
        assert!(migration.has_pending());

        while migration.step(&mut handle, 10).unwrap() {}
        assert_eq!(count(&handle, "new_t"), 2);
        assert!(!schema::main_table_exists(handle.connection(), "sqlward_migrating_old_t").unwrap());
    }

    #[test]
    fn overlapping_target_is_rejected() {
        let dir = tempdir().unwrap();
        let handle = open(dir.path());
        seed(&handle, 3);
        handle
            .execute(&"CREATE TABLE new_t(id INTEGER PRIMARY KEY, v TEXT); INSERT INTO new_t VALUES (2, 'taken')".into())
            .unwrap();

        let migration = Migration::default();
        let err = migration
            .register(handle.connection(), MigrationInfo::new("old_t", "new_t"))
            .unwrap_err();
        assert!(matches!(err, CoreError::MigrationFailed { .. }));
        assert!(schema::main_table_exists(handle.connection(), "old_t").unwrap());
        assert!(migration.infos().is_empty());
    }

    #[test]
    fn filter_excludes_tables() {
        let dir = tempdir().unwrap();
        let mut handle = open(dir.path());
        seed(&handle, 1);
        let migration = Migration::default();
        migration
            .register(handle.connection(), MigrationInfo::new("old_t", "new_t"))
            .unwrap();
        migration.set_filter(Some(Arc::new(|table: &str| table != "old_t")));

        assert!(!migration.has_pending());
        assert!(!migration.step(&mut handle, 10).unwrap());
        assert_eq!(count(&handle, "new_t"), 0);
    }

    #[test]
    fn missing_source_is_rejected() {
        let dir = tempdir().unwrap();
        let handle = open(dir.path());
        let migration = Migration::default();
        let err = migration
            .register(handle.connection(), MigrationInfo::new("nope", "new_t"))
            .unwrap_err();
        assert!(matches!(err, CoreError::MigrationFailed { .. }));
    }

    #[test]
    fn rowid_tables_keep_identity() {
        let dir = tempdir().unwrap();
        let mut handle = open(dir.path());
        handle
            .execute(&"CREATE TABLE logs(msg TEXT); INSERT INTO logs VALUES ('a'), ('b'), ('c'); DELETE FROM logs WHERE msg = 'b';".into())
            .unwrap();
        let migration = Migration::default();
        migration
            .register(handle.connection(), MigrationInfo::new("logs", "logs_v2"))
            .unwrap();
        while migration.step(&mut handle, 1).unwrap() {}

        let mut stmt = handle
            .connection()
            .prepare("SELECT rowid, msg FROM logs_v2 ORDER BY rowid")
            .unwrap();
        let rows: Vec<(i64, String)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(rows, vec![(1, "a".to_string()), (3, "c".to_string())]);
    }
}
