//! Row-level change capture for SQLite.
//!
//! A [`Session`] records the changes made to tracked tables of a
//! [`Database`] and produces a changeset: a compact byte blob describing
//! each inserted, updated or deleted row. Changesets can be inspected with a
//! [`ChangesetIter`], inverted, merged with a [`ChangeGroup`], replayed
//! against another database with [`apply`], and checked for overlap with a
//! [`ChangeBatch`].

pub mod apply;
pub mod batch;
pub mod changeset;
pub mod codec;
pub mod config;
pub mod error;
pub mod group;
mod hash;
pub mod hook;
pub mod schema;
pub mod session;
pub mod value;

pub use apply::{
    apply, apply_with_options, ApplyReport, ConflictAction, ConflictHandler, ConflictKind,
    ConflictPolicy,
};
pub use batch::ChangeBatch;
pub use changeset::{changes, invert, Change, ChangeOp, ChangesetIter, Operation};
pub use config::{ApplyOptions, BatchConfig, SessionConfig};
pub use error::{Error, Result};
pub use group::{concat, ChangeGroup};
pub use hook::{Database, HookChain, MemoryRow, PreUpdate, RowAccessor};
pub use session::Session;
pub use value::Value;
