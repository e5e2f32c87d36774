//! Reading and inverting changesets.
//!
//! ```text
//! changeset := section*
//! section   := 'T' varint(col_count) cstring(table_name) row*
//! row       := 0x12 record(new)
//!            | 0x09 record(old)
//!            | 0x17 record(old) record(new)
//! ```

use crate::codec::{self, Input, TABLE_HEADER};
use crate::error::{Error, Result};
use crate::value::Value;

/// Kind of row change. The byte codes are SQLite's own opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub const fn code(self) -> u8 {
        match self {
            ChangeOp::Insert => 18,
            ChangeOp::Update => 23,
            ChangeOp::Delete => 9,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            18 => Some(ChangeOp::Insert),
            23 => Some(ChangeOp::Update),
            9 => Some(ChangeOp::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeOp::Insert => "INSERT",
            ChangeOp::Update => "UPDATE",
            ChangeOp::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Table and kind of the row an iterator is positioned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation<'a> {
    pub table: &'a str,
    pub column_count: usize,
    pub kind: ChangeOp,
}

/// Owned copy of one changeset row.
///
/// `old` is empty for INSERT and `new` is empty for DELETE. `None` marks a
/// column the row does not carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub table: String,
    pub op: ChangeOp,
    pub old: Vec<Option<Value>>,
    pub new: Vec<Option<Value>>,
}

/// Forward cursor over a changeset buffer.
///
/// Decoding errors are sticky: once a row fails to decode, every later call
/// to [`next_row`](Self::next_row) and [`finalize`](Self::finalize) reports
/// the same corruption. [`restart`](Self::restart) clears it.
#[derive(Debug, Clone)]
pub struct ChangesetIter<'a> {
    input: Input<'a>,
    table: Option<&'a str>,
    column_count: usize,
    section: usize,
    op: Option<ChangeOp>,
    /// Old values in `[0, n)`, new values in `[n, 2n)`.
    values: Vec<Option<Value>>,
    conflict: Option<Vec<Value>>,
    row_start: usize,
    corrupt: Option<(usize, &'static str)>,
    preset: Option<(&'a str, usize)>,
}

impl<'a> ChangesetIter<'a> {
    pub fn start(changeset: &'a [u8]) -> Self {
        Self {
            input: Input::new(changeset),
            table: None,
            column_count: 0,
            section: 0,
            op: None,
            values: Vec::new(),
            conflict: None,
            row_start: 0,
            corrupt: None,
            preset: None,
        }
    }

    /// Iterates bare rows of one table, as produced by concatenating
    /// [`row_bytes`](Self::row_bytes) of rows from a single section.
    pub(crate) fn for_table_rows(table: &'a str, column_count: usize, rows: &'a [u8]) -> Self {
        let mut iter = Self::start(rows);
        iter.preset = Some((table, column_count));
        iter.enter_table(table, column_count);
        iter
    }

    fn enter_table(&mut self, table: &'a str, column_count: usize) {
        self.table = Some(table);
        self.column_count = column_count;
        self.section += 1;
        self.values.clear();
        self.values.resize(2 * column_count, None);
    }

    /// Advances to the next row. Returns `Ok(false)` at the end of the
    /// buffer.
    pub fn next_row(&mut self) -> Result<bool> {
        if let Some((offset, reason)) = self.corrupt {
            return Err(Error::corrupt(offset, reason));
        }
        self.conflict = None;
        match self.advance() {
            Ok(more) => Ok(more),
            Err(err) => {
                self.op = None;
                if let Error::Corrupt { offset, reason } = err {
                    self.corrupt = Some((offset, reason));
                }
                Err(err)
            }
        }
    }

    fn advance(&mut self) -> Result<bool> {
        loop {
            if self.input.is_empty() {
                self.op = None;
                return Ok(false);
            }
            let start = self.input.pos();
            let byte = self.input.byte()?;

            if byte == TABLE_HEADER {
                let count = self.input.varint()?;
                if count == 0 {
                    return Err(Error::corrupt(start, "table declares zero columns"));
                }
                let count = usize::try_from(count)
                    .ok()
                    .filter(|count| *count <= self.input.data().len())
                    .ok_or_else(|| Error::corrupt(start, "column count exceeds changeset size"))?;
                let name = self.input.cstring()?;
                self.op = None;
                self.enter_table(name, count);
                continue;
            }

            let op = ChangeOp::from_code(byte)
                .ok_or_else(|| Error::corrupt(start, "unknown operation byte"))?;
            if self.table.is_none() {
                return Err(Error::corrupt(start, "row before any table header"));
            }

            let n = self.column_count;
            self.row_start = start;
            for slot in self.values.iter_mut() {
                *slot = None;
            }
            if op != ChangeOp::Insert {
                for i in 0..n {
                    self.values[i] = self.input.value()?;
                }
            }
            if op != ChangeOp::Delete {
                for i in 0..n {
                    self.values[n + i] = self.input.value()?;
                }
            }
            self.op = Some(op);
            return Ok(true);
        }
    }

    /// Table, column count and kind of the current row.
    pub fn op(&self) -> Result<Operation<'a>> {
        match (self.table, self.op) {
            (Some(table), Some(kind)) => Ok(Operation {
                table,
                column_count: self.column_count,
                kind,
            }),
            _ => Err(Error::Misuse("iterator is not positioned on a row")),
        }
    }

    /// Old value of column `index`; `None` if the row does not carry it.
    pub fn old(&self, index: usize) -> Result<Option<&Value>> {
        match self.op {
            None => Err(Error::Misuse("iterator is not positioned on a row")),
            Some(ChangeOp::Insert) => Err(Error::Misuse("INSERT rows have no old values")),
            Some(_) => {
                self.check_index(index)?;
                Ok(self.values[index].as_ref())
            }
        }
    }

    /// New value of column `index`; `None` if the row does not carry it.
    pub fn new(&self, index: usize) -> Result<Option<&Value>> {
        match self.op {
            None => Err(Error::Misuse("iterator is not positioned on a row")),
            Some(ChangeOp::Delete) => Err(Error::Misuse("DELETE rows have no new values")),
            Some(_) => {
                self.check_index(index)?;
                Ok(self.values[self.column_count + index].as_ref())
            }
        }
    }

    /// Column `index` of the target row that conflicts with the current
    /// change. Only valid inside a conflict handler that was given a row.
    pub fn conflict(&self, index: usize) -> Result<&Value> {
        let row = self
            .conflict
            .as_ref()
            .ok_or(Error::Misuse("no conflicting row outside a conflict handler"))?;
        self.check_index(index)?;
        Ok(&row[index])
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.column_count {
            return Err(Error::Range {
                index,
                count: self.column_count,
            });
        }
        Ok(())
    }

    /// Ends iteration, reporting any corruption seen along the way.
    pub fn finalize(self) -> Result<()> {
        match self.corrupt {
            Some((offset, reason)) => Err(Error::corrupt(offset, reason)),
            None => Ok(()),
        }
    }

    /// Rewinds to the first byte of the buffer.
    pub fn restart(&mut self) {
        self.input.set_pos(0);
        self.table = None;
        self.column_count = 0;
        self.section = 0;
        self.op = None;
        self.values.clear();
        self.conflict = None;
        self.row_start = 0;
        self.corrupt = None;
        if let Some((table, column_count)) = self.preset {
            self.enter_table(table, column_count);
        }
    }

    /// Owned copy of the current row.
    pub fn change(&self) -> Result<Change> {
        let op = self.op()?;
        let n = self.column_count;
        let old = match op.kind {
            ChangeOp::Insert => Vec::new(),
            _ => self.values[..n].to_vec(),
        };
        let new = match op.kind {
            ChangeOp::Delete => Vec::new(),
            _ => self.values[n..].to_vec(),
        };
        Ok(Change {
            table: op.table.to_string(),
            op: op.kind,
            old,
            new,
        })
    }

    /// Encoded bytes of the current row, operation byte included.
    pub(crate) fn row_bytes(&self) -> &'a [u8] {
        &self.input.data()[self.row_start..self.input.pos()]
    }

    /// Increments each time a table header is entered.
    pub(crate) fn section(&self) -> usize {
        self.section
    }

    pub(crate) fn set_conflict(&mut self, row: Option<Vec<Value>>) {
        self.conflict = row;
    }
}

/// Decodes every row of `changeset`.
pub fn changes(changeset: &[u8]) -> Result<Vec<Change>> {
    let mut iter = ChangesetIter::start(changeset);
    let mut out = Vec::new();
    while iter.next_row()? {
        out.push(iter.change()?);
    }
    iter.finalize()?;
    Ok(out)
}

/// Produces the changeset that undoes `changeset`.
///
/// INSERT and DELETE swap. An UPDATE keeps identifying columns in its old
/// record: each column of the inverted old record is the original new value
/// where one was carried and the original old value otherwise, and the
/// inverted new record carries the original old value wherever the original
/// carried a new one. Applying `invert` twice returns the input. An UPDATE
/// that sets a column without carrying its old value cannot be undone and is
/// reported as corrupt.
pub fn invert(changeset: &[u8]) -> Result<Vec<u8>> {
    let mut input = Input::new(changeset);
    let mut out = Vec::with_capacity(changeset.len());
    let mut column_count: Option<usize> = None;

    while !input.is_empty() {
        let start = input.pos();
        let byte = input.byte()?;
        if byte == TABLE_HEADER {
            let count = input.varint()?;
            if count == 0 {
                return Err(Error::corrupt(start, "table declares zero columns"));
            }
            input.cstring()?;
            column_count = Some(count as usize);
            out.extend_from_slice(&changeset[start..input.pos()]);
            continue;
        }

        let op = ChangeOp::from_code(byte)
            .ok_or_else(|| Error::corrupt(start, "unknown operation byte"))?;
        let n = column_count.ok_or_else(|| Error::corrupt(start, "row before any table header"))?;
        match op {
            ChangeOp::Insert | ChangeOp::Delete => {
                let record_start = input.pos();
                for _ in 0..n {
                    input.skip_value()?;
                }
                let inverted = if op == ChangeOp::Insert {
                    ChangeOp::Delete
                } else {
                    ChangeOp::Insert
                };
                out.push(inverted.code());
                out.extend_from_slice(&changeset[record_start..input.pos()]);
            }
            ChangeOp::Update => {
                let old = (0..n).map(|_| input.value()).collect::<Result<Vec<_>>>()?;
                let new = (0..n).map(|_| input.value()).collect::<Result<Vec<_>>>()?;
                if old.iter().zip(&new).any(|(old, new)| old.is_none() && new.is_some()) {
                    return Err(Error::corrupt(start, "update sets a column without its old value"));
                }
                out.push(ChangeOp::Update.code());
                codec::put_record(
                    &mut out,
                    old.iter()
                        .zip(&new)
                        .map(|(old, new)| new.as_ref().or(old.as_ref())),
                );
                codec::put_record(
                    &mut out,
                    old.iter()
                        .zip(&new)
                        .map(|(old, new)| new.as_ref().and(old.as_ref())),
                );
            }
        }
    }
    Ok(out)
}
