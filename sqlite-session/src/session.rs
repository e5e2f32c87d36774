//! Change capture and changeset production.
//!
//! A [`Session`] records, per tracked table and row id, the first state it
//! saw for that row: an insert marker or the row's old column values. When a
//! changeset is requested the current row images are read back from the
//! database and diffed against those pre-images, so repeated changes to a row
//! collapse into their net effect.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension};

use crate::changeset::ChangeOp;
use crate::codec;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::hash::{hash_i64, BucketTable};
use crate::hook::{Database, MemoryRow, PreUpdate, RowAccessor};
use crate::schema::{self, quote_ident};
use crate::value::Value;

#[derive(Debug)]
struct SessionChange {
    rowid: i64,
    /// Encoded old values, or `None` if the row was inserted.
    old: Option<Vec<u8>>,
}

/// A row found only in the other database by [`Session::diff`]. It has no
/// rowid here, so it is keyed by its encoded primary key instead.
#[derive(Debug)]
struct RemovedRow {
    key: Vec<u8>,
    old: Vec<u8>,
}

#[derive(Debug)]
struct SessionTable {
    name: String,
    column_count: Option<usize>,
    changes: BucketTable<SessionChange>,
    removed: Vec<RemovedRow>,
}

impl SessionTable {
    fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.removed.is_empty()
    }

    fn check_column_count(&mut self, count: usize) -> Result<()> {
        match self.column_count {
            None => self.column_count = Some(count),
            Some(expected) if expected != count => {
                return Err(Error::SchemaMismatch {
                    table: self.name.clone(),
                    expected,
                    found: count,
                })
            }
            Some(_) => {}
        }
        Ok(())
    }
}

/// Reason a session stopped capturing.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Failure {
    OutOfMemory,
    SchemaMismatch {
        table: String,
        expected: usize,
        found: usize,
    },
    Accessor(&'static str),
}

impl Failure {
    fn from_error(err: Error) -> Self {
        match err {
            Error::OutOfMemory => Failure::OutOfMemory,
            Error::SchemaMismatch {
                table,
                expected,
                found,
            } => Failure::SchemaMismatch {
                table,
                expected,
                found,
            },
            Error::Misuse(reason) => Failure::Accessor(reason),
            _ => Failure::Accessor("row accessor failed"),
        }
    }

    fn to_error(&self) -> Error {
        match self {
            Failure::OutOfMemory => Error::OutOfMemory,
            Failure::SchemaMismatch {
                table,
                expected,
                found,
            } => Error::SchemaMismatch {
                table: table.clone(),
                expected: *expected,
                found: *found,
            },
            Failure::Accessor(reason) => Error::Misuse(reason),
        }
    }
}

/// Capture state shared between a [`Session`] and its connection's hook
/// chain.
#[derive(Debug)]
pub(crate) struct SessionState {
    db_name: String,
    enabled: bool,
    attach_all: bool,
    tables: Vec<SessionTable>,
    failure: Option<Failure>,
    config: SessionConfig,
}

impl SessionState {
    pub(crate) fn new(db_name: &str, config: SessionConfig) -> Self {
        Self {
            db_name: db_name.to_string(),
            enabled: true,
            attach_all: false,
            tables: Vec::new(),
            failure: None,
            config,
        }
    }

    fn find_table(&self, name: &str) -> Option<usize> {
        self.tables
            .iter()
            .position(|table| table.name.eq_ignore_ascii_case(name))
    }

    fn track(&mut self, name: &str) -> usize {
        if let Some(index) = self.find_table(name) {
            return index;
        }
        self.tables.push(SessionTable {
            name: name.to_string(),
            column_count: None,
            changes: BucketTable::new(self.config.min_buckets),
            removed: Vec::new(),
        });
        self.tables.len() - 1
    }

    /// Records one row mutation.
    ///
    /// Does nothing while disabled, after a failure, or for tables this
    /// session does not track.
    pub(crate) fn observe(&mut self, update: &PreUpdate<'_>, row: &dyn RowAccessor) {
        if !self.enabled || self.failure.is_some() {
            return;
        }
        if !update.db_name.eq_ignore_ascii_case(&self.db_name) {
            return;
        }
        let index = match self.find_table(update.table) {
            Some(index) => index,
            None if self.attach_all => self.track(update.table),
            None => return,
        };
        if let Err(err) = record(&mut self.tables[index], update, row) {
            self.fail(update.table, err);
        }
    }

    /// Marks the session failed and returns the error it will now report.
    fn fail(&mut self, table: &str, err: Error) -> Error {
        let failure = Failure::from_error(err);
        tracing::warn!(
            table,
            failure = ?failure,
            "session capture failed; no further changes will be recorded until reset"
        );
        let reported = failure.to_error();
        self.failure = Some(failure);
        reported
    }

    fn reset(&mut self) {
        for table in &mut self.tables {
            table.changes.clear();
            table.removed.clear();
            table.column_count = None;
        }
        self.failure = None;
    }
}

fn record(table: &mut SessionTable, update: &PreUpdate<'_>, row: &dyn RowAccessor) -> Result<()> {
    let count = row.column_count();
    table.check_column_count(count)?;

    let hash = hash_i64(update.new_rowid);
    if table
        .changes
        .find(hash, |change| change.rowid == update.new_rowid)
        .is_some()
    {
        return Ok(());
    }

    let old = match update.op {
        ChangeOp::Insert => None,
        ChangeOp::Update | ChangeOp::Delete => {
            let mut buf = Vec::new();
            buf.try_reserve(count * 9).map_err(|_| Error::OutOfMemory)?;
            for i in 0..count {
                codec::put_value(&mut buf, Some(&row.old(i)?));
            }
            Some(buf)
        }
    };
    table.changes.insert(
        hash,
        SessionChange {
            rowid: update.new_rowid,
            old,
        },
    )
}

/// A change capture session on one schema of a [`Database`].
///
/// Dropping the session detaches it from the connection.
pub struct Session<'db> {
    db: &'db Database,
    id: u64,
    state: Arc<Mutex<SessionState>>,
}

impl<'db> Session<'db> {
    pub fn new(db: &'db Database, schema: &str) -> Result<Self> {
        Self::with_config(db, schema, SessionConfig::default())
    }

    pub fn with_config(db: &'db Database, schema: &str, config: SessionConfig) -> Result<Self> {
        if !schema::database_exists(db.connection(), schema)? {
            return Err(Error::NoSuchDatabase(schema.to_string()));
        }
        let state = Arc::new(Mutex::new(SessionState::new(schema, config)));
        let id = db.hooks().attach(Arc::clone(&state));
        tracing::debug!(session = id, schema, "session created");
        Ok(Self { db, id, state })
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking `table`, or every table of the schema when `None`.
    ///
    /// Tracking all tables covers the tables that exist now; a table created
    /// later is captured once it is attached by name.
    pub fn attach(&self, table: Option<&str>) -> Result<()> {
        let schema = self.lock().db_name.clone();
        match table {
            Some(table) => {
                self.db.install_capture(&schema, table)?;
                self.lock().track(table);
                tracing::debug!(session = self.id, table, "table attached");
            }
            None => {
                let tables = schema::list_tables(self.db.connection(), &schema)?;
                for table in &tables {
                    self.db.install_capture(&schema, table)?;
                }
                self.lock().attach_all = true;
                tracing::debug!(
                    session = self.id,
                    tables = tables.len(),
                    "all tables attached"
                );
            }
        }
        Ok(())
    }

    /// Turns capture on or off and returns the new state.
    pub fn enable(&self, enabled: bool) -> bool {
        let mut state = self.lock();
        state.enabled = enabled;
        state.enabled
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// True if no row change has been captured.
    pub fn is_empty(&self) -> bool {
        self.lock().tables.iter().all(SessionTable::is_empty)
    }

    /// Forgets every captured change and clears a capture failure.
    pub fn reset(&self) {
        self.lock().reset();
    }

    /// Records the changes that would turn `from.table` into this session's
    /// copy of `table`, as if they had been made while the session watched.
    ///
    /// Rows only here are recorded as inserts, rows only in `from` as
    /// deletes and rows whose non-key columns differ as updates with the
    /// `from` values as their old image. Rows matched on primary key. Both
    /// copies must have the same columns and primary key; tables without a
    /// primary key are ignored. Runs whether or not the session is enabled,
    /// and a row already captured keeps its first image.
    pub fn diff(&self, from: &str, table: &str) -> Result<()> {
        let conn = self.db.connection();
        let mut state = self.lock();
        if let Some(failure) = &state.failure {
            return Err(failure.to_error());
        }
        let here = state.db_name.clone();
        if here.eq_ignore_ascii_case(from) {
            return Err(Error::Misuse("cannot diff a schema against itself"));
        }
        if !schema::database_exists(conn, from)? {
            return Err(Error::NoSuchDatabase(from.to_string()));
        }
        let info = schema::table_info(conn, &here, table)?
            .ok_or_else(|| Error::NoSuchTable(format!("{here}.{table}")))?;
        let other = schema::table_info(conn, from, table)?
            .ok_or_else(|| Error::NoSuchTable(format!("{from}.{table}")))?;
        let same_columns = info.column_count() == other.column_count()
            && info.pk == other.pk
            && info
                .columns
                .iter()
                .zip(&other.columns)
                .all(|(a, b)| a.eq_ignore_ascii_case(b));
        if !same_columns {
            return Err(Error::TableMismatch(table.to_string()));
        }
        if !info.has_primary_key() {
            tracing::debug!(table, "diff skipped table without primary key");
            return Ok(());
        }

        let sql = DiffSql::new(&here, from, &info);
        let count = info.column_count();
        let index = state.track(table);

        let inserted = query_rows(conn, &sql.inserted, 1 + count)?;
        let modified = query_rows(conn, &sql.modified, 1 + 2 * count)?;
        let removed = query_rows(conn, &sql.removed, count)?;
        tracing::debug!(
            table,
            from,
            inserted = inserted.len(),
            modified = modified.len(),
            removed = removed.len(),
            "diffed table"
        );

        let result = diff_into(
            &mut state.tables[index],
            &here,
            &info.pk,
            inserted,
            modified,
            removed,
        );
        result.map_err(|err| state.fail(table, err))
    }

    /// Produces a changeset from the captured changes and the current
    /// contents of the database.
    pub fn changeset(&self) -> Result<Vec<u8>> {
        let state = self.lock();
        if let Some(failure) = &state.failure {
            return Err(failure.to_error());
        }

        let conn = self.db.connection();
        let mut out = Vec::new();
        for table in &state.tables {
            let Some(count) = table.column_count else {
                continue;
            };
            if table.is_empty() {
                continue;
            }
            let found = schema::table_info(conn, &state.db_name, &table.name)?;
            let live_count = found.as_ref().map_or(0, |info| info.column_count());
            if live_count != count {
                return Err(Error::SchemaMismatch {
                    table: table.name.clone(),
                    expected: count,
                    found: live_count,
                });
            }
            let Some(info) = found else { continue };
            if !info.has_primary_key() {
                tracing::debug!(table = %table.name, "skipping table without primary key");
                continue;
            }

            tracing::debug!(
                table = %table.name,
                entries = table.changes.len(),
                buckets = table.changes.bucket_count(),
                "writing table changes"
            );

            let header_at = out.len();
            codec::put_table_header(&mut out, &table.name, count);

            let columns = info
                .columns
                .iter()
                .map(|column| quote_ident(column))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT {columns} FROM {} WHERE _rowid_ = ?1",
                schema::qualified(&state.db_name, &table.name)
            );
            let mut stmt = conn.prepare(&sql)?;

            let mut written = 0usize;
            for removed in &table.removed {
                out.push(ChangeOp::Delete.code());
                out.extend_from_slice(&removed.old);
                written += 1;
            }
            for change in table.changes.iter() {
                let current = stmt
                    .query_row([change.rowid], |row| {
                        (0..count)
                            .map(|i| row.get_ref(i).map(Value::from_value_ref))
                            .collect::<rusqlite::Result<Vec<_>>>()
                    })
                    .optional()?;
                let emitted = match (current, &change.old) {
                    (Some(current), Some(old)) => {
                        let old = codec::decode_record(old, count)?;
                        put_update(&mut out, &info.pk, &old, &current)
                    }
                    (Some(current), None) => {
                        out.push(ChangeOp::Insert.code());
                        codec::put_record(&mut out, current.iter().map(Some));
                        true
                    }
                    (None, Some(old)) => {
                        out.push(ChangeOp::Delete.code());
                        out.extend_from_slice(old);
                        true
                    }
                    (None, None) => false,
                };
                if emitted {
                    written += 1;
                }
            }

            if written == 0 {
                out.truncate(header_at);
            }
        }

        tracing::debug!(session = self.id, bytes = out.len(), "changeset produced");
        Ok(out)
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.db.hooks().detach(self.id);
        tracing::debug!(session = self.id, "session detached");
    }
}

/// Statements finding the rows that differ between two copies of a table.
struct DiffSql {
    /// `rowid, here.*` of rows missing from the other copy.
    inserted: String,
    /// `rowid, here.*, there.*` of rows whose non-key columns differ.
    modified: String,
    /// `there.*` of rows missing here.
    removed: String,
}

impl DiffSql {
    fn new(here: &str, there: &str, info: &schema::TableInfo) -> Self {
        let here_table = schema::qualified(here, &info.name);
        let there_table = schema::qualified(there, &info.name);
        let column = |table: &str, name: &str| format!("{table}.{}", quote_ident(name));
        let all = |table: &str| {
            info.columns
                .iter()
                .map(|name| column(table, name))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let pk_match = info
            .pk_columns()
            .map(|i| {
                let name = &info.columns[i];
                format!("{} = {}", column(&here_table, name), column(&there_table, name))
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        let mut differs = info
            .pk
            .iter()
            .zip(&info.columns)
            .filter(|(is_pk, _)| !**is_pk)
            .map(|(_, name)| {
                format!(
                    "{} IS NOT {}",
                    column(&here_table, name),
                    column(&there_table, name)
                )
            })
            .collect::<Vec<_>>()
            .join(" OR ");
        if differs.is_empty() {
            differs.push('0');
        }

        let here_columns = all(&here_table);
        let there_columns = all(&there_table);
        Self {
            inserted: format!(
                "SELECT {here_table}._rowid_, {here_columns} FROM {here_table} \
                 WHERE NOT EXISTS (SELECT 1 FROM {there_table} WHERE {pk_match})"
            ),
            modified: format!(
                "SELECT {here_table}._rowid_, {here_columns}, {there_columns} \
                 FROM {here_table}, {there_table} WHERE {pk_match} AND ({differs})"
            ),
            removed: format!(
                "SELECT {there_columns} FROM {there_table} \
                 WHERE NOT EXISTS (SELECT 1 FROM {here_table} WHERE {pk_match})"
            ),
        }
    }
}

fn query_rows(conn: &Connection, sql: &str, width: usize) -> Result<Vec<Vec<Value>>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| {
            (0..width)
                .map(|i| row.get_ref(i).map(Value::from_value_ref))
                .collect::<rusqlite::Result<Vec<_>>>()
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Feeds the rows found by [`DiffSql`] into `table` as captured changes.
fn diff_into(
    table: &mut SessionTable,
    db_name: &str,
    pk: &[bool],
    inserted: Vec<Vec<Value>>,
    modified: Vec<Vec<Value>>,
    removed: Vec<Vec<Value>>,
) -> Result<()> {
    let count = pk.len();
    table.check_column_count(count)?;
    let name = table.name.clone();
    let header = |op, rowid| PreUpdate {
        op,
        db_name,
        table: name.as_str(),
        old_rowid: rowid,
        new_rowid: rowid,
    };

    for mut row in inserted {
        let Value::Integer(rowid) = row.remove(0) else {
            continue;
        };
        let values = MemoryRow::new(ChangeOp::Insert, Vec::new(), row);
        record(table, &header(ChangeOp::Insert, rowid), &values)?;
    }

    for mut row in modified {
        let Value::Integer(rowid) = row.remove(0) else {
            continue;
        };
        let old = row.split_off(count);
        let values = MemoryRow::new(ChangeOp::Update, old, row);
        record(table, &header(ChangeOp::Update, rowid), &values)?;
    }

    for row in removed {
        let mut key = Vec::new();
        for (value, _) in row.iter().zip(pk).filter(|(_, is_pk)| **is_pk) {
            codec::put_value(&mut key, Some(value));
        }
        if table.removed.iter().any(|removed| removed.key == key) {
            continue;
        }
        let mut old = Vec::new();
        old.try_reserve(count * 9).map_err(|_| Error::OutOfMemory)?;
        codec::put_record(&mut old, row.iter().map(Some));
        table.removed.push(RemovedRow { key, old });
    }
    Ok(())
}

/// Appends an UPDATE row. The old record carries primary key columns and
/// changed columns; the new record carries changed columns only. Returns
/// false, writing nothing, when no column changed.
fn put_update(out: &mut Vec<u8>, pk: &[bool], old: &[Option<Value>], current: &[Value]) -> bool {
    let changed: Vec<bool> = old
        .iter()
        .zip(current)
        .map(|(old, current)| old.as_ref() != Some(current))
        .collect();
    if !changed.contains(&true) {
        return false;
    }

    out.push(ChangeOp::Update.code());
    codec::put_record(
        out,
        old.iter()
            .enumerate()
            .map(|(i, value)| (pk[i] || changed[i]).then_some(value.as_ref()).flatten()),
    );
    codec::put_record(
        out,
        current
            .iter()
            .enumerate()
            .map(|(i, value)| changed[i].then_some(value)),
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update<'a>(op: ChangeOp, table: &'a str, rowid: i64) -> PreUpdate<'a> {
        PreUpdate {
            op,
            db_name: "main",
            table,
            old_rowid: rowid,
            new_rowid: rowid,
        }
    }

    fn state() -> SessionState {
        let mut state = SessionState::new("main", SessionConfig { min_buckets: 4 });
        state.track("t");
        state
    }

    #[test]
    fn first_capture_wins() {
        let mut state = state();
        let first = MemoryRow::new(ChangeOp::Update, vec![Value::from("a")], vec![Value::from("b")]);
        let second = MemoryRow::new(ChangeOp::Update, vec![Value::from("b")], vec![Value::from("c")]);
        state.observe(&update(ChangeOp::Update, "t", 1), &first);
        state.observe(&update(ChangeOp::Update, "t", 1), &second);

        let table = &state.tables[0];
        assert_eq!(table.changes.len(), 1);
        let change = table.changes.iter().next().unwrap();
        let old = codec::decode_record(change.old.as_ref().unwrap(), 1).unwrap();
        assert_eq!(old, vec![Some(Value::from("a"))]);
    }

    #[test]
    fn insert_records_marker() {
        let mut state = state();
        let row = MemoryRow::new(ChangeOp::Insert, Vec::new(), vec![Value::Integer(1)]);
        state.observe(&update(ChangeOp::Insert, "t", 7), &row);
        let change = state.tables[0].changes.iter().next().unwrap();
        assert_eq!(change.rowid, 7);
        assert!(change.old.is_none());
    }

    #[test]
    fn ignores_untracked_tables_other_schemas_and_disabled_state() {
        let mut state = state();
        let row = MemoryRow::new(ChangeOp::Delete, vec![Value::Null], Vec::new());
        state.observe(&update(ChangeOp::Delete, "other", 1), &row);

        let mut temp = update(ChangeOp::Delete, "t", 1);
        temp.db_name = "temp";
        state.observe(&temp, &row);

        state.enabled = false;
        state.observe(&update(ChangeOp::Delete, "t", 1), &row);

        assert_eq!(state.tables.len(), 1);
        assert!(state.tables[0].changes.is_empty());
    }

    #[test]
    fn attach_all_tracks_tables_lazily() {
        let mut state = SessionState::new("main", SessionConfig::default());
        state.attach_all = true;
        let row = MemoryRow::new(ChangeOp::Delete, vec![Value::Null], Vec::new());
        state.observe(&update(ChangeOp::Delete, "late", 3), &row);
        assert_eq!(state.tables.len(), 1);
        assert_eq!(state.tables[0].name, "late");
    }

    #[test]
    fn column_count_drift_fails_until_reset() {
        let mut state = state();
        let narrow = MemoryRow::new(ChangeOp::Delete, vec![Value::Null], Vec::new());
        let wide = MemoryRow::new(ChangeOp::Delete, vec![Value::Null, Value::Null], Vec::new());
        state.observe(&update(ChangeOp::Delete, "t", 1), &narrow);
        state.observe(&update(ChangeOp::Delete, "t", 2), &wide);
        assert!(matches!(
            state.failure,
            Some(Failure::SchemaMismatch {
                expected: 1,
                found: 2,
                ..
            })
        ));

        state.observe(&update(ChangeOp::Delete, "t", 3), &narrow);
        assert_eq!(state.tables[0].changes.len(), 1);

        state.reset();
        assert!(state.failure.is_none());
        assert!(state.tables[0].changes.is_empty());
        state.observe(&update(ChangeOp::Delete, "t", 4), &wide);
        assert_eq!(state.tables[0].changes.len(), 1);
    }

    #[test]
    fn update_carries_pk_and_changed_columns() {
        let mut out = Vec::new();
        let old = vec![
            Some(Value::Integer(1)),
            Some(Value::from("a")),
            Some(Value::Integer(5)),
        ];
        let current = vec![Value::Integer(1), Value::from("b"), Value::Integer(5)];
        assert!(put_update(&mut out, &[true, false, false], &old, &current));

        let mut expected = vec![ChangeOp::Update.code()];
        codec::put_record(
            &mut expected,
            [Some(&Value::Integer(1)), Some(&Value::from("a")), None],
        );
        codec::put_record(&mut expected, [None, Some(&Value::from("b")), None]);
        assert_eq!(out, expected);
    }

    #[test]
    fn update_compares_storage_class() {
        let mut out = Vec::new();
        let old = vec![Some(Value::Integer(1)), Some(Value::Integer(1))];
        let same = vec![Value::Integer(1), Value::Integer(1)];
        assert!(!put_update(&mut out, &[true, false], &old, &same));
        assert!(out.is_empty());

        let real = vec![Value::Integer(1), Value::Real(1.0)];
        assert!(put_update(&mut out, &[true, false], &old, &real));
    }
}
