//! Schema queries shared by migration and repair.

use crate::error::CoreResult;
use rusqlite::{Connection, OptionalExtension};

/// One column of a table, as reported by `pragma_table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Column {
    pub name: String,
    pub decl_type: String,
    pub pk: i64,
}

/// Quotes an identifier for interpolation into SQL.
pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Returns whether a table or view is visible, including temp objects.
pub(crate) fn object_exists(conn: &Connection, name: &str) -> CoreResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE name = ?1 AND type IN ('table', 'view') \
             UNION ALL \
             SELECT 1 FROM sqlite_temp_master WHERE name = ?1 AND type IN ('table', 'view') \
             LIMIT 1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Returns whether `main` holds a table named `name`.
pub(crate) fn main_table_exists(conn: &Connection, name: &str) -> CoreResult<bool> {
    Ok(table_sql(conn, name)?.is_some())
}

/// Returns the `CREATE TABLE` statement of a table in `main`.
pub(crate) fn table_sql(conn: &Connection, name: &str) -> CoreResult<Option<String>> {
    let sql = conn
        .query_row(
            "SELECT sql FROM main.sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?;
    Ok(sql.flatten())
}

/// Returns the columns of a table in `main`, in declaration order.
pub(crate) fn table_columns(conn: &Connection, name: &str) -> CoreResult<Vec<Column>> {
    let mut stmt =
        conn.prepare("SELECT name, type, pk FROM pragma_table_info(?1, 'main') ORDER BY cid")?;
    let columns = stmt
        .query_map([name], |row| {
            Ok(Column {
                name: row.get(0)?,
                decl_type: row.get(1)?,
                pk: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Returns the column aliasing the rowid, if the table has one.
pub(crate) fn rowid_alias(columns: &[Column]) -> Option<String> {
    let mut keys = columns.iter().filter(|c| c.pk > 0);
    match (keys.next(), keys.next()) {
        (Some(key), None) if key.decl_type.eq_ignore_ascii_case("INTEGER") => {
            Some(key.name.clone())
        }
        _ => None,
    }
}

/// Lists the user tables of `main`, sorted by name.
pub(crate) fn user_tables(conn: &Connection) -> CoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM main.sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}

/// Returns the explicit `CREATE INDEX` statements of a table.
pub(crate) fn index_sqls(conn: &Connection, table: &str) -> CoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT sql FROM main.sqlite_master \
         WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL ORDER BY name",
    )?;
    let sqls = stmt
        .query_map([table], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(sqls)
}

/// Joins quoted column names with commas.
pub(crate) fn column_list<S: AsRef<str>>(columns: &[S]) -> String {
    columns
        .iter()
        .map(|c| quote(c.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE a(id INTEGER PRIMARY KEY, v TEXT);
             CREATE TABLE b(x, y, PRIMARY KEY(x, y));
             CREATE INDEX a_v ON a(v);
             CREATE TEMP VIEW tv AS SELECT 1;",
        )
        .unwrap();
        conn
    }

    #[test]
    fn quoting_doubles_quotes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(column_list(&["a", "b"]), "\"a\", \"b\"");
    }

    #[test]
    fn existence_checks() {
        let conn = memory();
        assert!(object_exists(&conn, "a").unwrap());
        assert!(object_exists(&conn, "tv").unwrap());
        assert!(!main_table_exists(&conn, "tv").unwrap());
        assert!(!object_exists(&conn, "missing").unwrap());
    }

    #[test]
    fn columns_and_alias() {
        let conn = memory();
        let a = table_columns(&conn, "a").unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(rowid_alias(&a).as_deref(), Some("id"));

        let b = table_columns(&conn, "b").unwrap();
        assert_eq!(rowid_alias(&b), None);
    }

    #[test]
    fn listing() {
        let conn = memory();
        assert_eq!(user_tables(&conn).unwrap(), vec!["a", "b"]);
        assert_eq!(index_sqls(&conn, "a").unwrap().len(), 1);
        assert!(index_sqls(&conn, "b").unwrap().is_empty());
    }
}
