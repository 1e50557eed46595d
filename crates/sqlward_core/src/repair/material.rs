//! Backup material: a logical snapshot of the database content.
//!
//! ## Format
//!
//! ```text
//! | magic (4) | version (2) | body_len (8) | CBOR body (body_len) | sha256 (32) |
//! ```
//!
//! The checksum covers the header and the body. A header-only check
//! ([`Material::peek`]) is cheap enough to decide whether retrieval is
//! worth attempting.

use crate::error::{CoreError, CoreResult};
use crate::schema::{self, column_list, quote};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Magic bytes for material files.
pub const MATERIAL_MAGIC: [u8; 4] = *b"SQWM";
/// Current material format version.
pub const MATERIAL_VERSION: u16 = 1;
/// Header size (magic + version + body_len).
pub const HEADER_SIZE: usize = 4 + 2 + 8;
const FOOTER_SIZE: usize = 32;

/// Predicate over table names selecting what a backup covers.
pub type BackupFilter = std::sync::Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MaterialValue {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// 64-bit float.
    Real(f64),
    /// Text, kept as the stored bytes; SQLite does not enforce UTF-8.
    Text(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Raw bytes.
    Blob(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl From<ValueRef<'_>> for MaterialValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(v) => Self::Integer(v),
            ValueRef::Real(v) => Self::Real(v),
            ValueRef::Text(v) => Self::Text(v.to_vec()),
            ValueRef::Blob(v) => Self::Blob(v.to_vec()),
        }
    }
}

impl ToSql for MaterialValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            Self::Null => ValueRef::Null,
            Self::Integer(v) => ValueRef::Integer(*v),
            Self::Real(v) => ValueRef::Real(*v),
            Self::Text(v) => ValueRef::Text(v),
            Self::Blob(v) => ValueRef::Blob(v),
        }))
    }
}

/// One row; `rowid` is `None` for `WITHOUT ROWID` tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialRow {
    /// Row identity.
    pub rowid: Option<i64>,
    /// Values in [`MaterialTable::columns`] order.
    pub values: Vec<MaterialValue>,
}

/// Schema and rows of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialTable {
    /// Table name.
    pub name: String,
    /// `CREATE TABLE` statement.
    pub sql: String,
    /// Column names in declaration order.
    pub columns: Vec<String>,
    /// Column aliasing the rowid, if any.
    pub rowid_alias: Option<String>,
    /// `CREATE INDEX` statements.
    pub indexes: Vec<String>,
    /// Rows ordered by rowid.
    pub rows: Vec<MaterialRow>,
}

impl MaterialTable {
    /// Whether rows carry a rowid.
    #[must_use]
    pub fn has_rowid(&self) -> bool {
        !is_without_rowid(&self.sql)
    }
}

/// A full snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Material {
    /// Identifier of the file the snapshot was taken from.
    pub identifier: u32,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Tables covered by the backup filter.
    pub tables: Vec<MaterialTable>,
    /// Tables the filter excluded.
    pub excluded_tables: Vec<String>,
}

impl Material {
    /// Snapshots every table of `conn` accepted by `filter`.
    ///
    /// The caller provides read consistency (an open transaction).
    ///
    /// # Errors
    ///
    /// Returns the first engine error.
    pub fn snapshot(
        conn: &Connection,
        identifier: u32,
        filter: Option<&BackupFilter>,
    ) -> CoreResult<Self> {
        let mut tables = Vec::new();
        let mut excluded_tables = Vec::new();
        for name in schema::user_tables(conn)? {
            if filter.is_some_and(|f| !f(&name)) {
                excluded_tables.push(name);
                continue;
            }
            let mut table = describe_table(conn, &name)?;
            let (rows, failure) = read_rows(conn, &table);
            if let Some(err) = failure {
                return Err(err);
            }
            table.rows = rows;
            tables.push(table);
        }
        Ok(Self {
            identifier,
            created_at: now_millis(),
            tables,
            excluded_tables,
        })
    }

    /// Total number of rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }

    /// Serializes the material with header and checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if CBOR encoding fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut body = Vec::new();
        ciborium::into_writer(self, &mut body)
            .map_err(|e| CoreError::invalid_material(format!("encode: {e}")))?;

        let mut out = Vec::with_capacity(HEADER_SIZE + body.len() + FOOTER_SIZE);
        out.extend_from_slice(&MATERIAL_MAGIC);
        out.extend_from_slice(&MATERIAL_VERSION.to_le_bytes());
        out.extend_from_slice(&(body.len() as u64).to_le_bytes());
        out.extend_from_slice(&body);
        let digest = Sha256::digest(&out);
        out.extend_from_slice(&digest);
        Ok(out)
    }

    /// Parses and verifies a material.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidMaterial`] for a bad header, a length or
    /// checksum mismatch, or an undecodable body.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        let body_len = Self::peek(data)?;
        let body_len = usize::try_from(body_len)
            .map_err(|_| CoreError::invalid_material("body length overflows"))?;
        let expected = HEADER_SIZE
            .checked_add(body_len)
            .and_then(|n| n.checked_add(FOOTER_SIZE))
            .ok_or_else(|| CoreError::invalid_material("body length overflows"))?;
        if data.len() != expected {
            return Err(CoreError::invalid_material(format!(
                "expected {expected} bytes, found {}",
                data.len()
            )));
        }

        let (content, checksum) = data.split_at(HEADER_SIZE + body_len);
        if Sha256::digest(content).as_slice() != checksum {
            return Err(CoreError::invalid_material("checksum mismatch"));
        }
        ciborium::from_reader(&content[HEADER_SIZE..])
            .map_err(|e| CoreError::invalid_material(format!("decode: {e}")))
    }

    /// Validates the header and returns the declared body length.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidMaterial`] for a short buffer, a wrong
    /// magic, or an unsupported version.
    pub fn peek(data: &[u8]) -> CoreResult<u64> {
        if data.len() < HEADER_SIZE {
            return Err(CoreError::invalid_material("material too small"));
        }
        if data[..4] != MATERIAL_MAGIC {
            return Err(CoreError::invalid_material("bad magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != MATERIAL_VERSION {
            return Err(CoreError::invalid_material(format!(
                "unsupported version {version}"
            )));
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&data[6..HEADER_SIZE]);
        Ok(u64::from_le_bytes(len))
    }
}

/// Reads the schema of `name` without its rows.
pub(crate) fn describe_table(conn: &Connection, name: &str) -> CoreResult<MaterialTable> {
    let sql = schema::table_sql(conn, name)?
        .ok_or_else(|| CoreError::corrupted(format!("table {name} has no schema")))?;
    let columns = schema::table_columns(conn, name)?;
    Ok(MaterialTable {
        name: name.to_string(),
        rowid_alias: schema::rowid_alias(&columns),
        columns: columns.into_iter().map(|c| c.name).collect(),
        indexes: schema::index_sqls(conn, name)?,
        sql,
        rows: Vec::new(),
    })
}

/// Reads rows of `table` in rowid order until the end or the first error.
///
/// Returns the rows read so far together with the error, if any.
pub(crate) fn read_rows(
    conn: &Connection,
    table: &MaterialTable,
) -> (Vec<MaterialRow>, Option<CoreError>) {
    let mut rows = Vec::new();
    let has_rowid = table.has_rowid();
    let cols = column_list(&table.columns);
    let sql = if has_rowid {
        format!("SELECT rowid, {cols} FROM main.{} ORDER BY rowid", quote(&table.name))
    } else {
        format!("SELECT {cols} FROM main.{}", quote(&table.name))
    };

    let mut stmt = match conn.prepare(&sql) {
        Ok(stmt) => stmt,
        Err(err) => return (rows, Some(err.into())),
    };
    let mut cursor = match stmt.query([]) {
        Ok(cursor) => cursor,
        Err(err) => return (rows, Some(err.into())),
    };
    let offset = usize::from(has_rowid);
    loop {
        match cursor.next() {
            Ok(Some(row)) => {
                let rowid = if has_rowid {
                    match row.get::<_, i64>(0) {
                        Ok(id) => Some(id),
                        Err(err) => return (rows, Some(err.into())),
                    }
                } else {
                    None
                };
                let mut values = Vec::with_capacity(table.columns.len());
                for i in 0..table.columns.len() {
                    match row.get_ref(i + offset) {
                        Ok(value) => values.push(MaterialValue::from(value)),
                        Err(err) => return (rows, Some(err.into())),
                    }
                }
                rows.push(MaterialRow { rowid, values });
            }
            Ok(None) => return (rows, None),
            Err(err) => return (rows, Some(err.into())),
        }
    }
}

fn is_without_rowid(sql: &str) -> bool {
    let normalized: String = sql
        .to_ascii_uppercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    normalized.contains("WITHOUT ROWID")
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
