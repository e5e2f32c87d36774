// ABOUTME: Command implementations for the changeset-replicator CLI
// ABOUTME: Exports record, dump, invert, concat, apply and batch

pub mod apply;
pub mod batch;
pub mod concat;
pub mod dump;
pub mod invert;
pub mod record;

pub use apply::ApplyArgs;
pub use batch::BatchArgs;
pub use concat::ConcatArgs;
pub use dump::DumpArgs;
pub use invert::InvertArgs;
pub use record::RecordArgs;
