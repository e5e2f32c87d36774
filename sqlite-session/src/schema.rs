//! Schema lookups through SQLite's pragma table-valued functions.

use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

/// Column layout of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<String>,
    /// `pk[i]` is true when column `i` is part of the primary key.
    pub pk: Vec<bool>,
}

impl TableInfo {
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn has_primary_key(&self) -> bool {
        self.pk.iter().any(|is_pk| *is_pk)
    }

    /// Primary key column indexes in declaration order of the key.
    pub fn pk_columns(&self) -> impl Iterator<Item = usize> + '_ {
        self.pk
            .iter()
            .enumerate()
            .filter_map(|(i, is_pk)| is_pk.then_some(i))
    }
}

/// How a table is stored, as `pragma_table_list` reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// An ordinary rowid table.
    Rowid,
    WithoutRowid,
    Virtual,
    /// A table backing a virtual table.
    Shadow,
    View,
}

/// A UNIQUE index (or the primary key) as a list of table column indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueIndex {
    pub name: String,
    pub is_primary_key: bool,
    pub columns: Vec<usize>,
}

/// Quote an identifier for inclusion in SQL, doubling embedded quotes.
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `"schema"."table"`
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Returns true if `schema` names a database attached to the connection.
///
/// `temp` always exists: SQLite creates it on first use, so it is missing
/// from `pragma_database_list` until a temporary object has been made.
pub fn database_exists(conn: &Connection, schema: &str) -> Result<bool> {
    if schema.eq_ignore_ascii_case("temp") {
        return Ok(true);
    }
    let found = conn
        .query_row(
            "SELECT 1 FROM pragma_database_list WHERE name = ?1 COLLATE NOCASE",
            [schema],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Reads the column names and primary key flags of `schema.table`.
///
/// Returns `None` when the table does not exist.
pub fn table_info(conn: &Connection, schema: &str, table: &str) -> Result<Option<TableInfo>> {
    let mut stmt = conn.prepare_cached(
        "SELECT name, pk FROM pragma_table_info(?1, ?2) ORDER BY cid",
    )?;
    let mut columns = Vec::new();
    let mut pk = Vec::new();
    let mut rows = stmt.query([table, schema])?;
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(0)?);
        pk.push(row.get::<_, i64>(1)? > 0);
    }
    if columns.is_empty() {
        return Ok(None);
    }
    Ok(Some(TableInfo {
        name: table.to_string(),
        columns,
        pk,
    }))
}

/// Name and kind of every table and view in `schema`, from
/// `PRAGMA schema.table_list`.
fn table_list(conn: &Connection, schema: &str) -> Result<Vec<(String, TableKind)>> {
    let mut stmt = conn.prepare(&format!("PRAGMA {}.table_list", quote_ident(schema)))?;
    let mut rows = stmt.query([])?;
    let mut tables = Vec::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        let kind: String = row.get(2)?;
        let kind = match kind.as_str() {
            "view" => TableKind::View,
            "virtual" => TableKind::Virtual,
            "shadow" => TableKind::Shadow,
            _ if row.get::<_, bool>(4)? => TableKind::WithoutRowid,
            _ => TableKind::Rowid,
        };
        tables.push((name, kind));
    }
    // A shadow table created in this connection is only flagged once the
    // schema is reloaded, so also match on the `<vtab>_<suffix>` naming.
    let virtuals: Vec<String> = tables
        .iter()
        .filter(|(_, kind)| *kind == TableKind::Virtual)
        .map(|(name, _)| name.to_ascii_lowercase())
        .collect();
    for (name, kind) in &mut tables {
        let owned = name
            .rsplit_once('_')
            .is_some_and(|(prefix, _)| virtuals.contains(&prefix.to_ascii_lowercase()));
        if owned && matches!(kind, TableKind::Rowid | TableKind::WithoutRowid) {
            *kind = TableKind::Shadow;
        }
    }
    Ok(tables)
}

/// Reports how `schema.table` is stored, or `None` if it does not exist.
pub fn table_kind(conn: &Connection, schema: &str, table: &str) -> Result<Option<TableKind>> {
    Ok(table_list(conn, schema)?
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(table))
        .map(|(_, kind)| kind))
}

/// Lists the ordinary rowid tables of `schema`, in name order.
///
/// Virtual tables, their shadow tables, `WITHOUT ROWID` tables and SQLite's
/// internal tables are left out.
pub fn list_tables(conn: &Connection, schema: &str) -> Result<Vec<String>> {
    let mut tables: Vec<String> = table_list(conn, schema)?
        .into_iter()
        .filter(|(name, kind)| *kind == TableKind::Rowid && !name.starts_with("sqlite_"))
        .map(|(name, _)| name)
        .collect();
    tables.sort();
    Ok(tables)
}

/// Discovers the primary key and every UNIQUE index of `schema.table`.
///
/// The primary key comes from the table's column list, so rowid-alias keys
/// (which have no backing index) are included. Indexes on expressions are
/// left out since their keys cannot be rebuilt from column values.
pub fn unique_indexes(conn: &Connection, schema: &str, table: &str) -> Result<Vec<UniqueIndex>> {
    let mut indexes = Vec::new();

    let mut pk_stmt = conn.prepare_cached(
        "SELECT cid FROM pragma_table_info(?1, ?2) WHERE pk > 0 ORDER BY pk",
    )?;
    let pk_columns = pk_stmt
        .query_map([table, schema], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    if !pk_columns.is_empty() {
        indexes.push(UniqueIndex {
            name: format!("{table}.primary_key"),
            is_primary_key: true,
            columns: pk_columns.into_iter().map(|cid| cid as usize).collect(),
        });
    }

    let mut list_stmt = conn.prepare_cached(
        "SELECT name FROM pragma_index_list(?1, ?2) \
         WHERE \"unique\" = 1 AND origin <> 'pk' ORDER BY seq",
    )?;
    let names = list_stmt
        .query_map([table, schema], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<String>, _>>()?;

    let mut info_stmt =
        conn.prepare_cached("SELECT cid FROM pragma_index_info(?1, ?2) ORDER BY seqno")?;
    for name in names {
        let cids = info_stmt
            .query_map([name.as_str(), schema], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        if cids.is_empty() || cids.iter().any(|cid| *cid < 0) {
            tracing::debug!(index = %name, table, "skipping expression index");
            continue;
        }
        indexes.push(UniqueIndex {
            name,
            is_primary_key: false,
            columns: cids.into_iter().map(|cid| cid as usize).collect(),
        });
    }

    Ok(indexes)
}
