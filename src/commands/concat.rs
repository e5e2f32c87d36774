// ABOUTME: concat command: merge two changesets into one
// ABOUTME: Changes to the same row collapse; --db supplies primary keys

use anyhow::{Context, Result};
use clap::Args;
use rusqlite::Connection;
use sqlite_session::ChangeGroup;
use std::path::{Path, PathBuf};

use crate::utils;

#[derive(Args, Debug, Clone)]
pub struct ConcatArgs {
    /// Changeset applied first
    pub first: PathBuf,
    /// Changeset applied after it
    pub second: PathBuf,
    /// Where to write the merged changeset
    #[arg(long, value_name = "FILE")]
    pub out: PathBuf,
    /// Database whose schema gives each table's primary key. Without it keys
    /// are inferred from the changesets
    #[arg(long = "db", value_name = "PATH")]
    pub db: Option<PathBuf>,
}

pub fn command(args: ConcatArgs) -> Result<()> {
    let first = utils::read_changeset(&args.first)?;
    let second = utils::read_changeset(&args.second)?;
    let merged = merge(&first, &second, args.db.as_deref()).with_context(|| {
        format!(
            "Failed to merge {} and {}",
            args.first.display(),
            args.second.display()
        )
    })?;
    utils::write_changeset(&args.out, &merged)?;
    tracing::info!(
        "Wrote {} bytes ({} + {} in) to {}",
        merged.len(),
        first.len(),
        second.len(),
        args.out.display()
    );
    Ok(())
}

pub fn merge(first: &[u8], second: &[u8], db: Option<&Path>) -> Result<Vec<u8>> {
    let conn = db
        .map(|path| {
            Connection::open(path)
                .with_context(|| format!("Failed to open SQLite database {}", path.display()))
        })
        .transpose()?;
    let mut group = match &conn {
        Some(conn) => ChangeGroup::with_schema(conn, "main"),
        None => ChangeGroup::new(),
    };
    group.add(first)?;
    group.add(second)?;
    Ok(group.output()?)
}
