// ABOUTME: batch command: detect changesets that touch the same rows
// ABOUTME: Feeds files in order to a change batch and reports every overlap

use anyhow::{Context, Result};
use clap::Args;
use rusqlite::Connection;
use sqlite_session::{BatchConfig, ChangeBatch};
use std::path::{Path, PathBuf};

use crate::config::ReplicatorConfig;
use crate::utils;

/// Exit status used when at least one changeset overlaps an earlier one
pub const CONFLICT_EXIT_CODE: i32 = 2;

#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    /// Database whose schema defines the unique keys
    #[arg(long = "db", value_name = "PATH")]
    pub db: PathBuf,
    /// Changesets, in the order they would be applied
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

/// Returns true when an overlap was found
pub fn command(args: BatchArgs, config: &ReplicatorConfig) -> Result<bool> {
    let overlapping = find_overlaps(&args.db, &args.files, config.batch.clone())?;
    for path in &overlapping {
        println!("conflict: {}", path.display());
    }
    if overlapping.is_empty() {
        println!("No conflicts across {} changeset(s)", args.files.len());
    }
    Ok(!overlapping.is_empty())
}

/// Files that share a unique key with a file listed before them
pub fn find_overlaps(db: &Path, files: &[PathBuf], config: BatchConfig) -> Result<Vec<PathBuf>> {
    let conn = Connection::open(db)
        .with_context(|| format!("Failed to open SQLite database {}", db.display()))?;
    let mut batch = ChangeBatch::with_config(&conn, config);

    let mut overlapping = Vec::new();
    for path in files {
        let changeset = utils::read_changeset(path)?;
        let conflict = batch
            .add(&changeset)
            .with_context(|| format!("Failed to add {} to batch", path.display()))?;
        if conflict {
            tracing::warn!("{} overlaps an earlier changeset", path.display());
            overlapping.push(path.clone());
        }
    }
    Ok(overlapping)
}
