//! Error types for capture, changeset decoding and apply.

use crate::apply::ConflictKind;

/// Errors produced by sessions, changeset iteration, apply and batches.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An allocation for captured state could not be satisfied.
    #[error("out of memory while recording changes")]
    OutOfMemory,

    /// Declared column count disagrees with the live schema.
    #[error("schema mismatch on table {table}: expected {expected} columns, found {found}")]
    SchemaMismatch {
        table: String,
        expected: usize,
        found: usize,
    },

    /// Malformed changeset bytes.
    #[error("corrupt changeset at byte {offset}: {reason}")]
    Corrupt { offset: usize, reason: &'static str },

    /// The caller used an accessor in a state where it is not valid.
    #[error("misuse: {0}")]
    Misuse(&'static str),

    /// Column index outside `[0, count)`.
    #[error("column index {index} out of range for {count} columns")]
    Range { index: usize, count: usize },

    /// A row-level conflict that no handler resolved.
    #[error("unresolved {kind:?} conflict on table {table}")]
    Conflict { kind: ConflictKind, table: String },

    /// A constraint failed while applying and no handler was supplied.
    #[error("constraint violation while applying changes to {table}")]
    ConstraintViolation { table: String },

    /// The conflict handler asked to stop; everything applied was rolled back.
    #[error("changeset apply aborted by conflict handler")]
    Abort,

    #[error("no such table: {0}")]
    NoSuchTable(String),

    #[error("no such database: {0}")]
    NoSuchDatabase(String),

    /// The table exists but its changes cannot be captured.
    #[error("cannot capture changes to {table}: {reason}")]
    UnsupportedTable { table: String, reason: &'static str },

    /// Two copies of a table disagree on columns or primary key.
    #[error("table {0} has a different schema in the other database")]
    TableMismatch(String),

    /// Error reported by SQLite.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    pub(crate) fn corrupt(offset: usize, reason: &'static str) -> Self {
        Error::Corrupt { offset, reason }
    }

    /// True for errors caused by malformed changeset bytes.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Error::Corrupt { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
