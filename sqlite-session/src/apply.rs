//! Replaying changesets with per-row conflict handling.
//!
//! Each row is written with a statement that only succeeds if the target row
//! still looks the way the changeset expects. When it does not, the row is
//! looked up by primary key to classify the conflict, and the caller's
//! [`ConflictHandler`] decides what happens next. The whole call runs inside
//! `SAVEPOINT changeset_apply` so an abort or error leaves the target as it
//! was.

use std::collections::HashMap;
use std::rc::Rc;

use rusqlite::{params_from_iter, Connection, ErrorCode, OptionalExtension};

use crate::changeset::{ChangeOp, ChangesetIter};
use crate::config::ApplyOptions;
use crate::error::{Error, Result};
use crate::schema::{self, quote_ident};
use crate::value::Value;

/// Why a row could not be applied as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// The row exists but its non-key columns differ from the expected old
    /// values. The target row is available through `conflict(i)`.
    Data,
    /// No row with the expected primary key exists.
    NotFound,
    /// An INSERT collided with an existing row on its primary key. The
    /// existing row is available through `conflict(i)`.
    Conflict,
    /// A constraint failed and no row with the same primary key exists.
    Constraint,
}

impl ConflictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictKind::Data => "DATA",
            ConflictKind::NotFound => "NOTFOUND",
            ConflictKind::Conflict => "CONFLICT",
            ConflictKind::Constraint => "CONSTRAINT",
        }
    }
}

/// A conflict handler's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictAction {
    /// Skip the row.
    Omit,
    /// Force the change through. Only valid for `Data` and `Conflict`.
    Replace,
    /// Stop and roll back everything this apply call wrote.
    Abort,
}

pub trait ConflictHandler {
    /// Called once per table section; returning false skips its rows.
    fn filter(&mut self, _table: &str) -> bool {
        true
    }

    fn on_conflict(&mut self, kind: ConflictKind, change: &ChangesetIter<'_>) -> ConflictAction;
}

impl<F> ConflictHandler for F
where
    F: FnMut(ConflictKind, &ChangesetIter<'_>) -> ConflictAction,
{
    fn on_conflict(&mut self, kind: ConflictKind, change: &ChangesetIter<'_>) -> ConflictAction {
        self(kind, change)
    }
}

/// The same answer for every conflict.
///
/// `Replace` answers `Omit` where replacing is not possible (`NotFound` and
/// `Constraint`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictPolicy {
    Omit,
    Replace,
    Abort,
}

impl ConflictHandler for ConflictPolicy {
    fn on_conflict(&mut self, kind: ConflictKind, _change: &ChangesetIter<'_>) -> ConflictAction {
        match self {
            ConflictPolicy::Omit => ConflictAction::Omit,
            ConflictPolicy::Abort => ConflictAction::Abort,
            ConflictPolicy::Replace => match kind {
                ConflictKind::Data | ConflictKind::Conflict => ConflictAction::Replace,
                ConflictKind::NotFound | ConflictKind::Constraint => ConflictAction::Omit,
            },
        }
    }
}

/// Row counts of a finished apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Rows written without conflict.
    pub applied: usize,
    /// Rows dropped by an `Omit` decision.
    pub omitted: usize,
    /// Rows forced through by a `Replace` decision.
    pub replaced: usize,
    /// Rows of filtered tables or tables whose schema does not fit.
    pub skipped: usize,
}

/// Applies `changeset` to the `main` schema of `conn`.
///
/// Without a handler any conflict fails the call and rolls it back.
pub fn apply(
    conn: &Connection,
    changeset: &[u8],
    handler: Option<&mut dyn ConflictHandler>,
) -> Result<ApplyReport> {
    apply_with_options(conn, changeset, handler, &ApplyOptions::default())
}

pub fn apply_with_options(
    conn: &Connection,
    changeset: &[u8],
    handler: Option<&mut dyn ConflictHandler>,
    options: &ApplyOptions,
) -> Result<ApplyReport> {
    let defer_fk: i64 = conn.query_row("PRAGMA defer_foreign_keys", [], |row| row.get(0))?;
    conn.execute_batch("PRAGMA defer_foreign_keys = 1")?;

    let result = apply_in_savepoint(conn, changeset, handler, options);

    if defer_fk == 0 && !conn.is_autocommit() {
        if let Err(err) = conn.execute_batch("PRAGMA defer_foreign_keys = 0") {
            tracing::warn!(error = %err, "failed to restore defer_foreign_keys");
        }
    }

    if let Ok(report) = &result {
        tracing::info!(
            applied = report.applied,
            omitted = report.omitted,
            replaced = report.replaced,
            skipped = report.skipped,
            "changeset applied"
        );
    }
    result
}

fn apply_in_savepoint(
    conn: &Connection,
    changeset: &[u8],
    handler: Option<&mut dyn ConflictHandler>,
    options: &ApplyOptions,
) -> Result<ApplyReport> {
    if options.use_savepoint {
        conn.execute_batch("SAVEPOINT changeset_apply")?;
    }

    let mut applier = Applier {
        conn,
        options,
        handler,
        report: ApplyReport::default(),
    };
    let mut iter = ChangesetIter::start(changeset);
    let outcome = applier.run(&mut iter);

    if !options.use_savepoint {
        return outcome.map(|()| applier.report);
    }
    let outcome = outcome.and_then(|()| {
        conn.execute_batch("RELEASE changeset_apply")
            .map_err(Error::from)
    });
    match outcome {
        Ok(()) => Ok(applier.report),
        Err(err) => {
            tracing::debug!(error = %err, "rolling back changeset apply");
            if let Err(rollback) =
                conn.execute_batch("ROLLBACK TO changeset_apply; RELEASE changeset_apply")
            {
                tracing::warn!(error = %rollback, "failed to roll back changeset apply");
            }
            Err(err)
        }
    }
}

/// Statements for one (table, column count) layout of the target.
#[derive(Debug)]
struct TablePlan {
    table: String,
    column_count: usize,
    pk_columns: Vec<usize>,
    /// Params: old values `?1..?n`, bypass flag `?n+1`.
    delete_sql: String,
    /// Params per column `i`: old `?4i+1`, old present `?4i+2`, new present
    /// `?4i+3`, new `?4i+4`; bypass flag `?4n+1`.
    update_sql: String,
    /// Params: new values `?1..?n`.
    insert_sql: String,
    /// Params: primary key values in key column order.
    select_sql: String,
}

impl TablePlan {
    fn new(schema: &str, table: &str, columns: &[String], pk: &[bool]) -> Self {
        let n = columns.len();
        let target = schema::qualified(schema, table);
        let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let pk_columns: Vec<usize> = (0..n).filter(|i| pk[*i]).collect();
        let column_list = quoted.join(", ");

        let delete_key = pk_columns
            .iter()
            .map(|i| format!("{} IS ?{}", quoted[*i], i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let delete_rest = and_or_true(
            (0..n)
                .filter(|i| !pk[*i])
                .map(|i| format!("{} IS ?{}", quoted[i], i + 1)),
        );
        let delete_sql = format!(
            "DELETE FROM {target} WHERE {delete_key} AND (?{} OR ({delete_rest}))",
            n + 1
        );

        let sets = (0..n)
            .map(|i| {
                format!(
                    "{c} = CASE WHEN ?{} THEN ?{} ELSE {c} END",
                    4 * i + 3,
                    4 * i + 4,
                    c = quoted[i]
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let update_key = pk_columns
            .iter()
            .map(|i| format!("{} IS ?{}", quoted[*i], 4 * i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let update_rest = and_or_true((0..n).filter(|i| !pk[*i]).map(|i| {
            format!(
                "(?{} = 0 OR {} IS ?{})",
                4 * i + 2,
                quoted[i],
                4 * i + 1
            )
        }));
        let update_sql = format!(
            "UPDATE {target} SET {sets} WHERE {update_key} AND (?{} OR ({update_rest}))",
            4 * n + 1
        );

        let placeholders = (1..=n)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let insert_sql = format!("INSERT INTO {target} ({column_list}) VALUES ({placeholders})");

        let select_key = pk_columns
            .iter()
            .enumerate()
            .map(|(param, i)| format!("{} IS ?{}", quoted[*i], param + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let select_sql = format!("SELECT {column_list} FROM {target} WHERE {select_key}");

        Self {
            table: table.to_string(),
            column_count: n,
            pk_columns,
            delete_sql,
            update_sql,
            insert_sql,
            select_sql,
        }
    }

    fn key(&self, values: &[Value]) -> Vec<Value> {
        self.pk_columns.iter().map(|i| values[*i].clone()).collect()
    }
}

fn and_or_true(terms: impl Iterator<Item = String>) -> String {
    let joined = terms.collect::<Vec<_>>().join(" AND ");
    if joined.is_empty() {
        "1".to_string()
    } else {
        joined
    }
}

fn flag(set: bool) -> Value {
    Value::Integer(i64::from(set))
}

fn is_constraint(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation
    )
}

fn old_values(iter: &ChangesetIter<'_>, n: usize) -> Result<Vec<Value>> {
    (0..n)
        .map(|i| Ok(iter.old(i)?.cloned().unwrap_or(Value::Null)))
        .collect()
}

fn new_values(iter: &ChangesetIter<'_>, n: usize) -> Result<Vec<Value>> {
    (0..n)
        .map(|i| Ok(iter.new(i)?.cloned().unwrap_or(Value::Null)))
        .collect()
}

enum Resolution {
    Omit,
    Replace,
}

struct Applier<'c, 'h> {
    conn: &'c Connection,
    options: &'c ApplyOptions,
    handler: Option<&'h mut dyn ConflictHandler>,
    report: ApplyReport,
}

impl Applier<'_, '_> {
    fn run(&mut self, iter: &mut ChangesetIter<'_>) -> Result<()> {
        let mut plans: HashMap<(String, usize), Option<Rc<TablePlan>>> = HashMap::new();
        let mut section = 0;
        let mut plan: Option<Rc<TablePlan>> = None;
        let mut deferred = Vec::new();

        while iter.next_row()? {
            if iter.section() != section {
                if let Some(done) = plan.take() {
                    self.retry_deferred(&done, std::mem::take(&mut deferred))?;
                }
                section = iter.section();
                let op = iter.op()?;
                plan = if self.filter(op.table) {
                    let key = (op.table.to_string(), op.column_count);
                    match plans.get(&key) {
                        Some(cached) => cached.clone(),
                        None => {
                            let built = self.plan(op.table, op.column_count)?.map(Rc::new);
                            plans.insert(key, built.clone());
                            built
                        }
                    }
                } else {
                    tracing::debug!(table = op.table, "table filtered out by handler");
                    None
                };
            }

            match plan.as_deref() {
                Some(current) => self.apply_row(iter, current, Some(&mut deferred))?,
                None => self.report.skipped += 1,
            }
        }

        if let Some(done) = plan {
            self.retry_deferred(&done, deferred)?;
        }
        Ok(())
    }

    fn filter(&mut self, table: &str) -> bool {
        match self.handler.as_mut() {
            Some(handler) => handler.filter(table),
            None => true,
        }
    }

    fn plan(&self, table: &str, column_count: usize) -> Result<Option<TablePlan>> {
        let schema = self.options.schema.as_str();
        let Some(info) = schema::table_info(self.conn, schema, table)? else {
            tracing::warn!(schema, table, "target table does not exist; skipping its changes");
            return Ok(None);
        };
        if info.column_count() < column_count {
            tracing::warn!(
                table,
                expected = column_count,
                found = info.column_count(),
                "target table has fewer columns than the changeset; skipping its changes"
            );
            return Ok(None);
        }
        if !info.has_primary_key() {
            tracing::warn!(table, "target table has no primary key; skipping its changes");
            return Ok(None);
        }
        if info.pk_columns().any(|i| i >= column_count) {
            tracing::warn!(
                table,
                "target primary key lies outside the changeset's columns; skipping its changes"
            );
            return Ok(None);
        }
        Ok(Some(TablePlan::new(
            schema,
            table,
            &info.columns[..column_count],
            &info.pk[..column_count],
        )))
    }

    fn exec_delete(&self, plan: &TablePlan, old: &[Value], bypass: bool) -> rusqlite::Result<usize> {
        let bypass = flag(bypass);
        let mut stmt = self.conn.prepare_cached(&plan.delete_sql)?;
        stmt.execute(params_from_iter(old.iter().chain(std::iter::once(&bypass))))
    }

    fn exec_update(
        &self,
        plan: &TablePlan,
        iter: &ChangesetIter<'_>,
        bypass: bool,
    ) -> Result<usize> {
        let n = plan.column_count;
        let mut params = Vec::with_capacity(4 * n + 1);
        for i in 0..n {
            let old = iter.old(i)?;
            let new = iter.new(i)?;
            params.push(old.cloned().unwrap_or(Value::Null));
            params.push(flag(old.is_some()));
            params.push(flag(new.is_some()));
            params.push(new.cloned().unwrap_or(Value::Null));
        }
        params.push(flag(bypass));
        let mut stmt = self.conn.prepare_cached(&plan.update_sql)?;
        Ok(stmt.execute(params_from_iter(&params))?)
    }

    fn exec_insert(&self, plan: &TablePlan, new: &[Value]) -> rusqlite::Result<usize> {
        let mut stmt = self.conn.prepare_cached(&plan.insert_sql)?;
        stmt.execute(params_from_iter(new))
    }

    fn find_row(&self, plan: &TablePlan, values: &[Value]) -> Result<Option<Vec<Value>>> {
        let mut stmt = self.conn.prepare_cached(&plan.select_sql)?;
        let n = plan.column_count;
        let row = stmt
            .query_row(params_from_iter(plan.key(values)), |row| {
                (0..n)
                    .map(|i| row.get_ref(i).map(Value::from_value_ref))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .optional()?;
        Ok(row)
    }

    fn apply_row(
        &mut self,
        iter: &mut ChangesetIter<'_>,
        plan: &TablePlan,
        deferred: Option<&mut Vec<u8>>,
    ) -> Result<()> {
        let n = plan.column_count;
        let kind = iter.op()?.kind;
        let bypass = !self.options.match_non_key_columns;
        let outcome = match kind {
            ChangeOp::Delete => self
                .exec_delete(plan, &old_values(iter, n)?, bypass)
                .map_err(Error::from),
            ChangeOp::Update => self.exec_update(plan, iter, bypass),
            ChangeOp::Insert => self
                .exec_insert(plan, &new_values(iter, n)?)
                .map_err(Error::from),
        };

        match outcome {
            Ok(0) => self.missing_row(iter, plan, kind),
            Ok(_) => {
                self.report.applied += 1;
                Ok(())
            }
            Err(Error::Sqlite(err)) if is_constraint(&err) => {
                self.constraint_failed(iter, plan, kind, deferred)
            }
            Err(err) => Err(err),
        }
    }

    /// A DELETE or UPDATE matched no row.
    fn missing_row(
        &mut self,
        iter: &mut ChangesetIter<'_>,
        plan: &TablePlan,
        kind: ChangeOp,
    ) -> Result<()> {
        let old = old_values(iter, plan.column_count)?;
        let existing = self.find_row(plan, &old)?;
        let conflict = if existing.is_some() {
            ConflictKind::Data
        } else {
            ConflictKind::NotFound
        };

        match self.resolve(conflict, iter, plan, existing)? {
            Resolution::Omit => self.report.omitted += 1,
            Resolution::Replace => {
                match kind {
                    ChangeOp::Delete => {
                        self.exec_delete(plan, &old, true)?;
                    }
                    ChangeOp::Update => {
                        self.exec_update(plan, iter, true)?;
                    }
                    ChangeOp::Insert => {}
                }
                self.report.replaced += 1;
            }
        }
        Ok(())
    }

    /// A write failed on a constraint.
    fn constraint_failed(
        &mut self,
        iter: &mut ChangesetIter<'_>,
        plan: &TablePlan,
        kind: ChangeOp,
        deferred: Option<&mut Vec<u8>>,
    ) -> Result<()> {
        if kind == ChangeOp::Insert {
            let new = new_values(iter, plan.column_count)?;
            if let Some(existing) = self.find_row(plan, &new)? {
                match self.resolve(ConflictKind::Conflict, iter, plan, Some(existing))? {
                    Resolution::Omit => self.report.omitted += 1,
                    Resolution::Replace => {
                        self.replace_insert(plan, &new)?;
                        self.report.replaced += 1;
                    }
                }
                return Ok(());
            }
        }

        if let Some(deferred) = deferred {
            tracing::debug!(table = %plan.table, op = %kind, "deferring row after constraint failure");
            deferred.extend_from_slice(iter.row_bytes());
            return Ok(());
        }

        match self.resolve(ConflictKind::Constraint, iter, plan, None)? {
            Resolution::Omit => self.report.omitted += 1,
            Resolution::Replace => {}
        }
        Ok(())
    }

    /// Deletes the row holding the new row's primary key, then inserts.
    fn replace_insert(&self, plan: &TablePlan, new: &[Value]) -> Result<()> {
        self.conn.execute_batch("SAVEPOINT replace_op")?;
        let written = self
            .exec_delete(plan, new, true)
            .and_then(|_| self.exec_insert(plan, new));
        match written {
            Ok(_) => {
                self.conn.execute_batch("RELEASE replace_op")?;
                Ok(())
            }
            Err(err) => {
                self.conn
                    .execute_batch("ROLLBACK TO replace_op; RELEASE replace_op")?;
                Err(err.into())
            }
        }
    }

    /// Replays rows that failed on a constraint until a round makes no
    /// progress, then hands whatever is left to the handler.
    fn retry_deferred(&mut self, plan: &TablePlan, rows: Vec<u8>) -> Result<()> {
        let mut pending = rows;
        let mut allow_defer = true;
        while !pending.is_empty() {
            let mut next = Vec::new();
            {
                let mut replay =
                    ChangesetIter::for_table_rows(&plan.table, plan.column_count, &pending);
                while replay.next_row()? {
                    let defer_into = if allow_defer { Some(&mut next) } else { None };
                    self.apply_row(&mut replay, plan, defer_into)?;
                }
            }
            if next.len() == pending.len() {
                allow_defer = false;
            }
            pending = next;
        }
        Ok(())
    }

    fn resolve(
        &mut self,
        kind: ConflictKind,
        iter: &mut ChangesetIter<'_>,
        plan: &TablePlan,
        conflicting: Option<Vec<Value>>,
    ) -> Result<Resolution> {
        let Some(handler) = self.handler.as_mut() else {
            return Err(match kind {
                ConflictKind::Conflict | ConflictKind::Constraint => Error::ConstraintViolation {
                    table: plan.table.clone(),
                },
                ConflictKind::Data | ConflictKind::NotFound => Error::Conflict {
                    kind,
                    table: plan.table.clone(),
                },
            });
        };

        iter.set_conflict(conflicting);
        let action = handler.on_conflict(kind, iter);
        iter.set_conflict(None);
        tracing::debug!(table = %plan.table, kind = kind.as_str(), ?action, "conflict handled");

        match action {
            ConflictAction::Omit => Ok(Resolution::Omit),
            ConflictAction::Replace => match kind {
                ConflictKind::Data | ConflictKind::Conflict => Ok(Resolution::Replace),
                ConflictKind::NotFound | ConflictKind::Constraint => Err(Error::Misuse(
                    "REPLACE is only valid for DATA and CONFLICT conflicts",
                )),
            },
            ConflictAction::Abort => Err(Error::Abort),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{put_record, put_table_header};

    #[test]
    fn builds_statements_for_layout() {
        let columns = vec!["a".to_string(), "b".to_string()];
        let plan = TablePlan::new("main", "t", &columns, &[true, false]);
        assert_eq!(
            plan.delete_sql,
            "DELETE FROM \"main\".\"t\" WHERE \"a\" IS ?1 AND (?3 OR (\"b\" IS ?2))"
        );
        assert_eq!(
            plan.update_sql,
            "UPDATE \"main\".\"t\" SET \
             \"a\" = CASE WHEN ?3 THEN ?4 ELSE \"a\" END, \
             \"b\" = CASE WHEN ?7 THEN ?8 ELSE \"b\" END \
             WHERE \"a\" IS ?1 AND (?9 OR ((?6 = 0 OR \"b\" IS ?5)))"
        );
        assert_eq!(
            plan.insert_sql,
            "INSERT INTO \"main\".\"t\" (\"a\", \"b\") VALUES (?1, ?2)"
        );
        assert_eq!(
            plan.select_sql,
            "SELECT \"a\", \"b\" FROM \"main\".\"t\" WHERE \"a\" IS ?1"
        );
    }

    #[test]
    fn key_only_tables_match_trivially() {
        let columns = vec!["k".to_string()];
        let plan = TablePlan::new("main", "k", &columns, &[true]);
        assert!(plan.delete_sql.ends_with("AND (?2 OR (1))"));
        assert!(plan.update_sql.ends_with("AND (?5 OR (1))"));
    }

    #[test]
    fn policy_never_replaces_missing_rows() {
        let data = Vec::new();
        let iter = ChangesetIter::start(&data);
        let mut policy = ConflictPolicy::Replace;
        assert_eq!(
            policy.on_conflict(ConflictKind::Data, &iter),
            ConflictAction::Replace
        );
        assert_eq!(
            policy.on_conflict(ConflictKind::NotFound, &iter),
            ConflictAction::Omit
        );
        assert_eq!(
            ConflictPolicy::Abort.on_conflict(ConflictKind::Constraint, &iter),
            ConflictAction::Abort
        );
    }

    #[test]
    fn missing_table_rows_are_skipped() {
        let conn = Connection::open_in_memory().unwrap();
        let mut cs = Vec::new();
        put_table_header(&mut cs, "ghost", 1);
        cs.push(ChangeOp::Insert.code());
        put_record(&mut cs, [Some(&Value::Integer(1))]);

        let report = apply(&conn, &cs, None).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.applied, 0);
    }
}
