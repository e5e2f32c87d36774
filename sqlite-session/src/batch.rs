//! Overlap detection across changesets.
//!
//! A [`ChangeBatch`] fingerprints every row of every changeset added to it on
//! each unique index of the row's table (the primary key included). Two
//! changesets overlap when they produce the same fingerprint on the same
//! index, which means applying them in different orders could leave
//! different results.

use std::collections::HashMap;

use rusqlite::Connection;

use crate::changeset::{ChangeOp, ChangesetIter};
use crate::codec;
use crate::config::BatchConfig;
use crate::error::Result;
use crate::hash::{hash_bytes, BucketTable};
use crate::schema;
use crate::value::Value;

#[derive(Debug)]
struct BatchIndex {
    id: u32,
    name: String,
    columns: Vec<usize>,
}

#[derive(Debug)]
struct BatchEntry {
    index_id: u32,
    changeset_id: u64,
    key: Vec<u8>,
}

/// Fingerprint index over a sequence of changesets.
#[derive(Debug)]
pub struct ChangeBatch<'c> {
    conn: &'c Connection,
    tables: HashMap<String, Vec<BatchIndex>>,
    next_index_id: u32,
    changeset_id: u64,
    entries: BucketTable<BatchEntry>,
}

impl<'c> ChangeBatch<'c> {
    /// Creates a batch that reads index definitions from `conn`'s `main`
    /// schema.
    pub fn new(conn: &'c Connection) -> Self {
        Self::with_config(conn, BatchConfig::default())
    }

    pub fn with_config(conn: &'c Connection, config: BatchConfig) -> Self {
        Self {
            conn,
            tables: HashMap::new(),
            next_index_id: 0,
            changeset_id: 0,
            entries: BucketTable::new(config.min_buckets),
        }
    }

    /// Adds a changeset. Returns true if any of its rows shares a non-NULL
    /// unique key with a row of a changeset added earlier.
    pub fn add(&mut self, changeset: &[u8]) -> Result<bool> {
        self.changeset_id += 1;
        let changeset_id = self.changeset_id;

        let mut iter = ChangesetIter::start(changeset);
        let mut conflict = false;
        while iter.next_row()? {
            let op = iter.op()?;
            self.load_indexes(op.table)?;
            let Some(indexes) = self.tables.get(op.table) else {
                continue;
            };
            for index in indexes {
                if index.columns.iter().any(|column| *column >= op.column_count) {
                    continue;
                }
                if op.kind != ChangeOp::Insert {
                    if let Some(key) = fingerprint(&index.columns, |i| iter.old(i))? {
                        conflict |= insert_entry(&mut self.entries, index, changeset_id, key)?;
                    }
                }
                if op.kind != ChangeOp::Delete {
                    let new_or_old = |i| match iter.new(i) {
                        Ok(None) if op.kind == ChangeOp::Update => iter.old(i),
                        other => other,
                    };
                    if let Some(key) = fingerprint(&index.columns, new_or_old)? {
                        conflict |= insert_entry(&mut self.entries, index, changeset_id, key)?;
                    }
                }
            }
        }
        iter.finalize()?;

        tracing::debug!(
            changeset = changeset_id,
            entries = self.entries.len(),
            conflict,
            "changeset added to batch"
        );
        Ok(conflict)
    }

    /// Forgets every fingerprint. Index definitions stay cached.
    pub fn zero(&mut self) {
        self.entries.clear();
    }

    fn load_indexes(&mut self, table: &str) -> Result<()> {
        if self.tables.contains_key(table) {
            return Ok(());
        }
        let found = schema::unique_indexes(self.conn, "main", table)?;
        let mut indexes = Vec::with_capacity(found.len());
        for index in found {
            indexes.push(BatchIndex {
                id: self.next_index_id,
                name: index.name,
                columns: index.columns,
            });
            self.next_index_id += 1;
        }
        tracing::debug!(
            table,
            indexes = ?indexes.iter().map(|index| index.name.as_str()).collect::<Vec<_>>(),
            "loaded unique indexes"
        );
        self.tables.insert(table.to_string(), indexes);
        Ok(())
    }
}

/// Encodes the values of `columns`, or returns `None` if any of them is
/// NULL or not carried by the row.
fn fingerprint<'v, F>(columns: &[usize], mut lookup: F) -> Result<Option<Vec<u8>>>
where
    F: FnMut(usize) -> Result<Option<&'v Value>>,
{
    let mut key = Vec::new();
    for column in columns {
        match lookup(*column)? {
            Some(value) if !value.is_null() => codec::put_value(&mut key, Some(value)),
            _ => return Ok(None),
        }
    }
    Ok(Some(key))
}

/// Records `key` for `changeset_id`. Returns true if another changeset
/// already holds the same key on the same index.
fn insert_entry(
    entries: &mut BucketTable<BatchEntry>,
    index: &BatchIndex,
    changeset_id: u64,
    key: Vec<u8>,
) -> Result<bool> {
    let hash = hash_bytes(index.id, &key);
    let mut conflict = false;
    let mut duplicate = false;
    for entry in entries.chain(hash) {
        if entry.index_id == index.id && entry.key == key {
            if entry.changeset_id == changeset_id {
                duplicate = true;
            } else {
                conflict = true;
            }
        }
    }
    if conflict {
        tracing::debug!(index = %index.name, changeset = changeset_id, "overlapping row");
    }
    if !duplicate {
        entries.insert(
            hash,
            BatchEntry {
                index_id: index.id,
                changeset_id,
                key,
            },
        )?;
    }
    Ok(conflict)
}
