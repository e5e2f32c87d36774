//! Pre-update notifications and the per-connection hook chain.
//!
//! Sessions never see the connection's write path directly. Every row
//! mutation on a captured table is turned into one [`HookChain::notify`]
//! call carrying a [`PreUpdate`] header and a [`RowAccessor`] for the old and
//! new column values. The notification source shipped here is a pair of
//! scalar SQL functions called from `TEMP` triggers: the first stages one
//! column's old/new values, the second announces the row and hands the staged
//! values to the chain. Staging one column per call keeps wide tables under
//! SQLite's per-function argument limit.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::Null;
use rusqlite::Connection;

use crate::changeset::ChangeOp;
use crate::error::{Error, Result};
use crate::schema::{self, quote_ident, quote_literal, TableKind};
use crate::session::SessionState;
use crate::value::Value;

const STAGE_FUNCTION: &str = "__session_stage";
const NOTIFY_FUNCTION: &str = "__session_preupdate";

/// Header of one row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreUpdate<'a> {
    pub op: ChangeOp,
    pub db_name: &'a str,
    pub table: &'a str,
    /// Row id before the change. Equal to `new_rowid` for INSERT.
    pub old_rowid: i64,
    /// Row id after the change. Equal to `old_rowid` for DELETE.
    pub new_rowid: i64,
}

/// Lazy access to the column values of the row being changed.
pub trait RowAccessor {
    fn column_count(&self) -> usize;

    /// Value of column `index` before the change. Not available for INSERT.
    fn old(&self, index: usize) -> Result<Value>;

    /// Value of column `index` after the change. Not available for DELETE.
    fn new(&self, index: usize) -> Result<Value>;
}

/// A row accessor over values already held in memory.
#[derive(Debug, Clone)]
pub struct MemoryRow {
    op: ChangeOp,
    old: Vec<Value>,
    new: Vec<Value>,
}

impl MemoryRow {
    /// `old` is ignored for INSERT and `new` for DELETE.
    pub fn new(op: ChangeOp, old: Vec<Value>, new: Vec<Value>) -> Self {
        Self { op, old, new }
    }
}

impl RowAccessor for MemoryRow {
    fn column_count(&self) -> usize {
        match self.op {
            ChangeOp::Insert => self.new.len(),
            _ => self.old.len(),
        }
    }

    fn old(&self, index: usize) -> Result<Value> {
        if self.op == ChangeOp::Insert {
            return Err(Error::Misuse("old values are not available for INSERT"));
        }
        self.old.get(index).cloned().ok_or(Error::Range {
            index,
            count: self.old.len(),
        })
    }

    fn new(&self, index: usize) -> Result<Value> {
        if self.op == ChangeOp::Delete {
            return Err(Error::Misuse("new values are not available for DELETE"));
        }
        self.new.get(index).cloned().ok_or(Error::Range {
            index,
            count: self.new.len(),
        })
    }
}

#[derive(Debug, Default)]
struct ChainInner {
    next_id: u64,
    sessions: Vec<(u64, Arc<Mutex<SessionState>>)>,
}

/// Sessions attached to one connection.
///
/// `attach` and `detach` are the only mutators and take the chain's lock.
/// `notify` snapshots the list and calls each session in attach order.
#[derive(Debug, Default)]
pub struct HookChain {
    inner: Mutex<ChainInner>,
}

impl HookChain {
    fn lock(&self) -> MutexGuard<'_, ChainInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn attach(&self, session: Arc<Mutex<SessionState>>) -> u64 {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.sessions.push((id, session));
        id
    }

    pub(crate) fn detach(&self, id: u64) {
        self.lock().sessions.retain(|(session_id, _)| *session_id != id);
    }

    /// Number of attached sessions.
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers one row mutation to every attached session.
    pub fn notify(&self, update: &PreUpdate<'_>, row: &dyn RowAccessor) {
        let sessions: Vec<_> = self
            .lock()
            .sessions
            .iter()
            .map(|(_, session)| Arc::clone(session))
            .collect();
        for session in sessions {
            session
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .observe(update, row);
        }
    }
}

/// A SQLite connection together with its hook chain.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
    hooks: Arc<HookChain>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Takes ownership of `conn` and registers the notification functions.
    ///
    /// Turns on `recursive_triggers`: without it SQLite fires no DELETE
    /// trigger for rows removed by `REPLACE` conflict resolution, and those
    /// deletes would be missing from the changeset.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA recursive_triggers = ON")?;
        let hooks = Arc::new(HookChain::default());
        let staged: Arc<Mutex<Vec<(Value, Value)>>> = Arc::default();

        let stage = Arc::clone(&staged);
        conn.create_scalar_function(
            STAGE_FUNCTION,
            3,
            FunctionFlags::SQLITE_UTF8,
            move |ctx: &Context<'_>| {
                let index = ctx.get::<i64>(0)? as usize;
                let old = Value::from_value_ref(ctx.get_raw(1));
                let new = Value::from_value_ref(ctx.get_raw(2));
                let mut staged = stage.lock().unwrap_or_else(PoisonError::into_inner);
                if index == 0 {
                    staged.clear();
                }
                staged.push((old, new));
                Ok(Null)
            },
        )?;

        let chain = Arc::clone(&hooks);
        conn.create_scalar_function(
            NOTIFY_FUNCTION,
            5,
            FunctionFlags::SQLITE_UTF8,
            move |ctx: &Context<'_>| {
                let code = ctx.get::<i64>(0)?;
                let Some(op) = u8::try_from(code).ok().and_then(ChangeOp::from_code) else {
                    return Err(rusqlite::Error::UserFunctionError(
                        format!("unknown change operation code {code}").into(),
                    ));
                };
                let db_name: String = ctx.get(1)?;
                let table: String = ctx.get(2)?;
                let update = PreUpdate {
                    op,
                    db_name: &db_name,
                    table: &table,
                    old_rowid: ctx.get(3)?,
                    new_rowid: ctx.get(4)?,
                };
                let values = std::mem::take(
                    &mut *staged.lock().unwrap_or_else(PoisonError::into_inner),
                );
                let row = StagedRow { op, values };
                chain.notify(&update, &row);
                Ok(Null)
            },
        )?;

        Ok(Self { conn, hooks })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn hooks(&self) -> &Arc<HookChain> {
        &self.hooks
    }

    /// Installs the capture triggers for `schema.table` if they are not
    /// already present.
    ///
    /// Only ordinary rowid tables can be captured: changesets are written by
    /// reading rows back by rowid.
    pub fn install_capture(&self, schema: &str, table: &str) -> Result<()> {
        let unsupported = |reason| Error::UnsupportedTable {
            table: format!("{schema}.{table}"),
            reason,
        };
        match schema::table_kind(&self.conn, schema, table)? {
            None => return Err(Error::NoSuchTable(format!("{schema}.{table}"))),
            Some(TableKind::Rowid) => {}
            Some(TableKind::WithoutRowid) => return Err(unsupported("WITHOUT ROWID table")),
            Some(TableKind::Virtual) => return Err(unsupported("virtual table")),
            Some(TableKind::Shadow) => return Err(unsupported("shadow table of a virtual table")),
            Some(TableKind::View) => return Err(unsupported("view")),
        }
        let info = schema::table_info(&self.conn, schema, table)?
            .ok_or_else(|| Error::NoSuchTable(format!("{schema}.{table}")))?;

        let mut sql = String::new();
        for op in [ChangeOp::Insert, ChangeOp::Update, ChangeOp::Delete] {
            sql.push_str(&trigger_sql(schema, table, op, &info.columns));
        }
        self.conn.execute_batch(&sql)?;
        tracing::debug!(schema, table, "installed capture triggers");
        Ok(())
    }
}

fn trigger_sql(schema: &str, table: &str, op: ChangeOp, columns: &[String]) -> String {
    let (event, old_rowid, new_rowid) = match op {
        ChangeOp::Insert => ("INSERT", "NEW.rowid", "NEW.rowid"),
        ChangeOp::Update => ("UPDATE", "OLD.rowid", "NEW.rowid"),
        ChangeOp::Delete => ("DELETE", "OLD.rowid", "OLD.rowid"),
    };
    let name = quote_ident(&trigger_name(schema, table, event));

    let stage = columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let column = quote_ident(column);
            let (old, new) = match op {
                ChangeOp::Insert => ("NULL".to_string(), format!("NEW.{column}")),
                ChangeOp::Update => (format!("OLD.{column}"), format!("NEW.{column}")),
                ChangeOp::Delete => (format!("OLD.{column}"), "NULL".to_string()),
            };
            format!("{STAGE_FUNCTION}({i}, {old}, {new})")
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TEMP TRIGGER IF NOT EXISTS {name} AFTER {event} ON {target} BEGIN \
         SELECT {stage}; \
         SELECT {NOTIFY_FUNCTION}({code}, {db}, {tbl}, {old_rowid}, {new_rowid}); \
         END;\n",
        target = schema::qualified(schema, table),
        code = op.code(),
        db = quote_literal(schema),
        tbl = quote_literal(table),
    )
}

/// Name of the capture trigger for one event. The schema and table names are
/// length-prefixed so no two (schema, table) pairs share a name.
fn trigger_name(schema: &str, table: &str, event: &str) -> String {
    format!(
        "__session_{}_{schema}_{}_{table}_{}",
        schema.len(),
        table.len(),
        event.to_ascii_lowercase()
    )
}

/// Column values staged by the trigger for the row being announced.
struct StagedRow {
    op: ChangeOp,
    values: Vec<(Value, Value)>,
}

impl RowAccessor for StagedRow {
    fn column_count(&self) -> usize {
        self.values.len()
    }

    fn old(&self, index: usize) -> Result<Value> {
        if self.op == ChangeOp::Insert {
            return Err(Error::Misuse("old values are not available for INSERT"));
        }
        self.values
            .get(index)
            .map(|(old, _)| old.clone())
            .ok_or(Error::Range {
                index,
                count: self.values.len(),
            })
    }

    fn new(&self, index: usize) -> Result<Value> {
        if self.op == ChangeOp::Delete {
            return Err(Error::Misuse("new values are not available for DELETE"));
        }
        self.values
            .get(index)
            .map(|(_, new)| new.clone())
            .ok_or(Error::Range {
                index,
                count: self.values.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_stages_every_column_then_notifies() {
        let sql = trigger_sql(
            "main",
            "t",
            ChangeOp::Update,
            &["a".to_string(), "b".to_string()],
        );
        assert!(sql.contains("AFTER UPDATE ON \"main\".\"t\""));
        assert!(sql.contains("__session_stage(0, OLD.\"a\", NEW.\"a\")"));
        assert!(sql.contains("__session_stage(1, OLD.\"b\", NEW.\"b\")"));
        assert!(sql.contains("__session_preupdate(23, 'main', 't', OLD.rowid, NEW.rowid)"));
    }

    #[test]
    fn insert_trigger_never_references_old() {
        let sql = trigger_sql("main", "t", ChangeOp::Insert, &["a".to_string()]);
        assert!(!sql.contains("OLD."));
        let sql = trigger_sql("main", "t", ChangeOp::Delete, &["a".to_string()]);
        assert!(!sql.contains("NEW."));
    }

    #[test]
    fn missing_table_is_reported() {
        let db = Database::open_in_memory().unwrap();
        let err = db.install_capture("main", "nope").unwrap_err();
        assert!(matches!(err, Error::NoSuchTable(_)));
    }

    #[test]
    fn trigger_names_do_not_collide_across_underscores() {
        assert_ne!(
            trigger_name("main", "a_b", "INSERT"),
            trigger_name("main_a", "b", "INSERT")
        );
        assert_eq!(trigger_name("main", "t", "DELETE"), "__session_4_main_1_t_delete");
    }

    #[test]
    fn capture_installs_separately_for_lookalike_names() {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute_batch(
                "ATTACH ':memory:' AS main_a; \
                 CREATE TABLE main.a_b(x INTEGER PRIMARY KEY); \
                 CREATE TABLE main_a.b(x INTEGER PRIMARY KEY);",
            )
            .unwrap();
        db.install_capture("main", "a_b").unwrap();
        db.install_capture("main_a", "b").unwrap();
        let triggers: i64 = db
            .connection()
            .query_row(
                "SELECT count(*) FROM temp.sqlite_master WHERE type = 'trigger'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(triggers, 6);
    }

    #[test]
    fn only_rowid_tables_can_be_captured() {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute_batch(
                "CREATE TABLE kv(k TEXT PRIMARY KEY, v) WITHOUT ROWID; \
                 CREATE VIRTUAL TABLE docs USING fts5(body); \
                 CREATE VIEW v AS SELECT 1;",
            )
            .unwrap();
        for table in ["kv", "docs", "v"] {
            let err = db.install_capture("main", table).unwrap_err();
            assert!(matches!(err, Error::UnsupportedTable { .. }), "{table}: {err}");
        }
        db.connection()
            .execute("INSERT INTO kv VALUES('a', 1)", [])
            .unwrap();
    }

    #[test]
    fn connection_enables_recursive_triggers() {
        let db = Database::open_in_memory().unwrap();
        let on: bool = db
            .connection()
            .query_row("PRAGMA recursive_triggers", [], |row| row.get(0))
            .unwrap();
        assert!(on);
    }

    #[test]
    fn memory_row_enforces_sides() {
        let row = MemoryRow::new(ChangeOp::Insert, Vec::new(), vec![Value::Integer(1)]);
        assert_eq!(row.column_count(), 1);
        assert!(matches!(row.old(0), Err(Error::Misuse(_))));
        assert_eq!(row.new(0).unwrap(), Value::Integer(1));
        assert!(matches!(row.new(1), Err(Error::Range { index: 1, count: 1 })));
    }

    #[test]
    fn chain_attach_and_detach() {
        let chain = HookChain::default();
        let state = Arc::new(Mutex::new(SessionState::new(
            "main",
            crate::config::SessionConfig::default(),
        )));
        let a = chain.attach(Arc::clone(&state));
        let b = chain.attach(state);
        assert_ne!(a, b);
        assert_eq!(chain.len(), 2);
        chain.detach(a);
        assert_eq!(chain.len(), 1);
        chain.detach(b);
        assert!(chain.is_empty());
    }
}
