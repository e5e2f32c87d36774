//! Merging changesets.
//!
//! A [`ChangeGroup`] combines changesets into one that has the same effect as
//! applying them in order. Changes to the same row (same table and primary
//! key) collapse into a single change:
//!
//! | first  | second | result                                   |
//! |--------|--------|------------------------------------------|
//! | INSERT | UPDATE | INSERT of the updated values             |
//! | INSERT | DELETE | nothing                                  |
//! | UPDATE | UPDATE | one UPDATE, dropped if it changes nothing |
//! | UPDATE | DELETE | DELETE of the original values            |
//! | DELETE | INSERT | UPDATE, dropped if the row is identical  |
//!
//! Any other pair cannot happen in a valid sequence; the first change is
//! kept and the second discarded.
//!
//! Table headers carry no primary key, so the key columns come from a schema
//! when one is given and are otherwise inferred: every column an UPDATE of
//! the table carries in its old record, or all columns when the table has no
//! UPDATE rows. An inferred key may be wider than the real one, in which case
//! some changes to the same row stay separate rows in the output. They are
//! still written in their original order.

use std::collections::HashMap;

use rusqlite::Connection;

use crate::changeset::{Change, ChangeOp, ChangesetIter};
use crate::codec;
use crate::error::{Error, Result};
use crate::schema;
use crate::value::Value;

#[derive(Debug)]
struct GroupTable {
    name: String,
    column_count: usize,
    rows: Vec<Change>,
}

/// Changesets waiting to be merged.
#[derive(Debug, Default)]
pub struct ChangeGroup<'c> {
    schema: Option<(&'c Connection, String)>,
    tables: Vec<GroupTable>,
}

impl<'c> ChangeGroup<'c> {
    /// A group that infers primary keys from the changesets themselves.
    pub fn new() -> Self {
        Self::default()
    }

    /// A group that reads primary keys from `schema` on `conn`. Tables
    /// missing there, or without a declared primary key, fall back to
    /// inference.
    pub fn with_schema(conn: &'c Connection, schema: &str) -> Self {
        Self {
            schema: Some((conn, schema.to_string())),
            tables: Vec::new(),
        }
    }

    /// Adds every row of `changeset`. A corrupt changeset, or one that
    /// disagrees with an earlier one on a table's column count, is rejected
    /// whole and leaves the group unchanged.
    pub fn add(&mut self, changeset: &[u8]) -> Result<()> {
        let mut iter = ChangesetIter::start(changeset);
        let mut rows = Vec::new();
        while iter.next_row()? {
            let op = iter.op()?;
            rows.push((op.column_count, iter.change()?));
        }
        iter.finalize()?;

        for (column_count, change) in &rows {
            if let Some(table) = self.find(&change.table) {
                if table.column_count != *column_count {
                    return Err(Error::SchemaMismatch {
                        table: change.table.clone(),
                        expected: table.column_count,
                        found: *column_count,
                    });
                }
            }
        }

        for (column_count, change) in rows {
            let index = match self
                .tables
                .iter()
                .position(|table| table.name.eq_ignore_ascii_case(&change.table))
            {
                Some(index) => index,
                None => {
                    self.tables.push(GroupTable {
                        name: change.table.clone(),
                        column_count,
                        rows: Vec::new(),
                    });
                    self.tables.len() - 1
                }
            };
            self.tables[index].rows.push(change);
        }
        Ok(())
    }

    fn find(&self, name: &str) -> Option<&GroupTable> {
        self.tables
            .iter()
            .find(|table| table.name.eq_ignore_ascii_case(name))
    }

    /// Writes the merged changeset. Tables appear in the order they were
    /// first seen and rows in the order of the first change to each row.
    pub fn output(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for table in &self.tables {
            let key = self.key_columns(table)?;
            let merged = merge_rows(&table.rows, &key);
            if merged.is_empty() {
                continue;
            }
            tracing::debug!(
                table = %table.name,
                input = table.rows.len(),
                output = merged.len(),
                "merged table changes"
            );
            codec::put_table_header(&mut out, &table.name, table.column_count);
            for row in merged {
                out.push(row.op.code());
                if row.op != ChangeOp::Insert {
                    codec::put_record(&mut out, row.old.iter().map(Option::as_ref));
                }
                if row.op != ChangeOp::Delete {
                    codec::put_record(&mut out, row.new.iter().map(Option::as_ref));
                }
            }
        }
        Ok(out)
    }

    /// `key[i]` is true when column `i` identifies the row.
    fn key_columns(&self, table: &GroupTable) -> Result<Vec<bool>> {
        if let Some((conn, schema)) = &self.schema {
            if let Some(info) = schema::table_info(conn, schema, &table.name)? {
                if info.column_count() != table.column_count {
                    return Err(Error::SchemaMismatch {
                        table: table.name.clone(),
                        expected: table.column_count,
                        found: info.column_count(),
                    });
                }
                if info.has_primary_key() {
                    return Ok(info.pk);
                }
            }
        }
        Ok(infer_key(table))
    }
}

fn infer_key(table: &GroupTable) -> Vec<bool> {
    let mut key = vec![true; table.column_count];
    for row in table.rows.iter().filter(|row| row.op == ChangeOp::Update) {
        for (is_key, old) in key.iter_mut().zip(&row.old) {
            *is_key &= old.is_some();
        }
    }
    if !key.contains(&true) {
        key.fill(true);
    }
    key
}

/// Encoded key column values: new values for an INSERT, old values otherwise.
fn row_key(row: &Change, key: &[bool]) -> Vec<u8> {
    let values = match row.op {
        ChangeOp::Insert => &row.new,
        _ => &row.old,
    };
    let mut out = Vec::new();
    for (value, _) in values.iter().zip(key).filter(|(_, is_key)| **is_key) {
        codec::put_value(&mut out, value.as_ref());
    }
    out
}

fn merge_rows(rows: &[Change], key: &[bool]) -> Vec<Change> {
    let mut slots: Vec<Option<Change>> = Vec::new();
    let mut index: HashMap<Vec<u8>, usize> = HashMap::new();

    for row in rows {
        let id = row_key(row, key);
        let existing = index
            .remove(&id)
            .and_then(|slot| slots[slot].take().map(|change| (slot, change)));
        match existing {
            None => {
                index.insert(id, slots.len());
                slots.push(Some(row.clone()));
            }
            Some((slot, first)) => {
                if let Some(merged) = merge(first, row, key) {
                    index.insert(row_key(&merged, key), slot);
                    slots[slot] = Some(merged);
                }
            }
        }
    }
    slots.into_iter().flatten().collect()
}

/// Combines two changes to the same row. `None` means the changes cancel.
fn merge(first: Change, second: &Change, key: &[bool]) -> Option<Change> {
    match (first.op, second.op) {
        (ChangeOp::Insert, ChangeOp::Update) => {
            let new = second
                .new
                .iter()
                .zip(first.new)
                .map(|(updated, inserted)| updated.clone().or(inserted))
                .collect();
            Some(Change {
                new,
                ..first
            })
        }
        (ChangeOp::Insert, ChangeOp::Delete) => None,
        (ChangeOp::Update, ChangeOp::Update) => {
            let old = pick(&first.old, &second.old);
            let new = pick(&second.new, &first.new);
            net_update(first.table, key, old, new)
        }
        (ChangeOp::Update, ChangeOp::Delete) => Some(Change {
            op: ChangeOp::Delete,
            old: pick(&first.old, &second.old),
            new: Vec::new(),
            ..first
        }),
        (ChangeOp::Delete, ChangeOp::Insert) => {
            net_update(first.table, key, first.old, second.new.clone())
        }
        _ => Some(first),
    }
}

/// Column-wise `preferred` where defined, `fallback` otherwise.
fn pick(preferred: &[Option<Value>], fallback: &[Option<Value>]) -> Vec<Option<Value>> {
    preferred
        .iter()
        .zip(fallback)
        .map(|(preferred, fallback)| preferred.as_ref().or(fallback.as_ref()).cloned())
        .collect()
}

/// Builds the UPDATE taking a row from `old` to `new`. Key columns are kept
/// in the old record; other columns appear only where they change. Returns
/// `None` when no non-key column changes.
fn net_update(
    table: String,
    key: &[bool],
    old: Vec<Option<Value>>,
    new: Vec<Option<Value>>,
) -> Option<Change> {
    let changed: Vec<bool> = old.iter().zip(&new).map(|(old, new)| old != new).collect();
    let required = key
        .iter()
        .zip(&changed)
        .any(|(is_key, changed)| !is_key && *changed);
    if !required {
        return None;
    }
    let old_record = old
        .into_iter()
        .enumerate()
        .map(|(i, value)| if key[i] || changed[i] { value } else { None })
        .collect();
    let new_record = new
        .into_iter()
        .enumerate()
        .map(|(i, value)| if !key[i] && changed[i] { value } else { None })
        .collect();
    Some(Change {
        table,
        op: ChangeOp::Update,
        old: old_record,
        new: new_record,
    })
}

/// Merges `b` into `a` as if both were applied in order, inferring primary
/// keys. Use [`ChangeGroup::with_schema`] when the schema is at hand.
pub fn concat(a: &[u8], b: &[u8]) -> Result<Vec<u8>> {
    let mut group = ChangeGroup::new();
    group.add(a)?;
    group.add(b)?;
    group.output()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::changes;
    use crate::codec::{put_record, put_table_header};

    fn row(buf: &mut Vec<u8>, op: ChangeOp, records: &[&[Option<Value>]]) {
        buf.push(op.code());
        for record in records {
            put_record(buf, record.iter().map(Option::as_ref));
        }
    }

    fn int(i: i64) -> Option<Value> {
        Some(Value::Integer(i))
    }

    fn text(s: &str) -> Option<Value> {
        Some(Value::from(s))
    }

    fn table(rows: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut buf = Vec::new();
        put_table_header(&mut buf, "t", 2);
        rows(&mut buf);
        buf
    }

    /// Merges with `t(a INTEGER PRIMARY KEY, b TEXT)` as the schema.
    fn merge_keyed(a: &[u8], b: &[u8]) -> Vec<Change> {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t(a INTEGER PRIMARY KEY, b TEXT)")
            .unwrap();
        let mut group = ChangeGroup::with_schema(&conn, "main");
        group.add(a).unwrap();
        group.add(b).unwrap();
        changes(&group.output().unwrap()).unwrap()
    }

    #[test]
    fn insert_then_delete_cancels() {
        let a = table(|b| row(b, ChangeOp::Insert, &[&[int(1), text("x")]]));
        let b = table(|b| row(b, ChangeOp::Delete, &[&[int(1), text("x")]]));
        assert!(concat(&a, &b).unwrap().is_empty());
    }

    #[test]
    fn insert_then_update_becomes_insert() {
        let a = table(|b| row(b, ChangeOp::Insert, &[&[int(1), text("x")]]));
        let b = table(|b| {
            row(
                b,
                ChangeOp::Update,
                &[&[int(1), text("x")], &[None, text("y")]],
            )
        });
        let rows = changes(&concat(&a, &b).unwrap()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].op, ChangeOp::Insert);
        assert_eq!(rows[0].new, vec![int(1), text("y")]);
    }

    #[test]
    fn updates_collapse_to_net_change() {
        let a = table(|b| {
            row(
                b,
                ChangeOp::Update,
                &[&[int(1), text("x")], &[None, text("y")]],
            )
        });
        let b = table(|b| {
            row(
                b,
                ChangeOp::Update,
                &[&[int(1), text("y")], &[None, text("z")]],
            )
        });
        let rows = merge_keyed(&a, &b);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].old, vec![int(1), text("x")]);
        assert_eq!(rows[0].new, vec![None, text("z")]);

        let back = table(|b| {
            row(
                b,
                ChangeOp::Update,
                &[&[int(1), text("y")], &[None, text("x")]],
            )
        });
        assert!(merge_keyed(&a, &back).is_empty());
    }

    #[test]
    fn update_then_delete_keeps_original_values() {
        let a = table(|b| {
            row(
                b,
                ChangeOp::Update,
                &[&[int(1), text("x")], &[None, text("y")]],
            )
        });
        let b = table(|b| row(b, ChangeOp::Delete, &[&[int(1), text("y")]]));
        let rows = merge_keyed(&a, &b);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].op, ChangeOp::Delete);
        assert_eq!(rows[0].old, vec![int(1), text("x")]);
    }

    #[test]
    fn delete_then_insert_becomes_update() {
        let a = table(|b| row(b, ChangeOp::Delete, &[&[int(1), text("x")]]));
        let b = table(|b| row(b, ChangeOp::Insert, &[&[int(1), text("y")]]));
        let rows = merge_keyed(&a, &b);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].op, ChangeOp::Update);
        assert_eq!(rows[0].old, vec![int(1), text("x")]);
        assert_eq!(rows[0].new, vec![None, text("y")]);

        let same = table(|b| row(b, ChangeOp::Insert, &[&[int(1), text("x")]]));
        assert!(merge_keyed(&a, &same).is_empty());
    }

    #[test]
    fn inferred_key_narrows_to_columns_every_update_carries() {
        let mut a = Vec::new();
        put_table_header(&mut a, "w", 3);
        row(&mut a, ChangeOp::Insert, &[&[int(1), text("x"), text("p")]]);
        let mut b = Vec::new();
        put_table_header(&mut b, "w", 3);
        row(
            &mut b,
            ChangeOp::Update,
            &[&[int(1), text("x"), None], &[None, text("y"), None]],
        );
        row(
            &mut b,
            ChangeOp::Update,
            &[&[int(1), None, text("p")], &[None, None, text("q")]],
        );

        let rows = changes(&concat(&a, &b).unwrap()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].op, ChangeOp::Insert);
        assert_eq!(rows[0].new, vec![int(1), text("y"), text("q")]);
    }

    #[test]
    fn inferred_key_keeps_unmatched_rows_in_order() {
        let a = table(|b| row(b, ChangeOp::Delete, &[&[int(1), text("x")]]));
        let b = table(|b| row(b, ChangeOp::Insert, &[&[int(1), text("y")]]));
        let rows = changes(&concat(&a, &b).unwrap()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].op, ChangeOp::Delete);
        assert_eq!(rows[1].op, ChangeOp::Insert);
    }

    #[test]
    fn unrelated_rows_and_tables_keep_first_seen_order() {
        let mut a = table(|b| row(b, ChangeOp::Insert, &[&[int(1), text("a")]]));
        put_table_header(&mut a, "u", 1);
        row(&mut a, ChangeOp::Delete, &[&[int(5)]]);
        let b = table(|b| row(b, ChangeOp::Insert, &[&[int(2), text("b")]]));

        let rows = changes(&concat(&a, &b).unwrap()).unwrap();
        let seen: Vec<_> = rows
            .iter()
            .map(|row| (row.table.as_str(), row.op))
            .collect();
        assert_eq!(
            seen,
            vec![
                ("t", ChangeOp::Insert),
                ("t", ChangeOp::Insert),
                ("u", ChangeOp::Delete)
            ]
        );
    }

    #[test]
    fn column_count_disagreement_is_rejected() {
        let a = table(|b| row(b, ChangeOp::Insert, &[&[int(1), text("a")]]));
        let mut b = Vec::new();
        put_table_header(&mut b, "T", 1);
        row(&mut b, ChangeOp::Delete, &[&[int(1)]]);

        let mut group = ChangeGroup::new();
        group.add(&a).unwrap();
        assert!(matches!(
            group.add(&b),
            Err(Error::SchemaMismatch {
                expected: 2,
                found: 1,
                ..
            })
        ));
        assert_eq!(changes(&group.output().unwrap()).unwrap().len(), 1);
    }

    #[test]
    fn corrupt_input_is_rejected() {
        let a = table(|b| row(b, ChangeOp::Insert, &[&[int(1), text("a")]]));
        let mut bad = a.clone();
        bad.push(0xff);
        assert!(concat(&a, &bad).unwrap_err().is_corrupt());
    }
}
