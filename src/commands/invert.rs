// ABOUTME: invert command: write the changeset that undoes another
// ABOUTME: Swaps inserts and deletes and exchanges update old/new values

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use crate::utils;

#[derive(Args, Debug, Clone)]
pub struct InvertArgs {
    /// Changeset to invert
    pub file: PathBuf,
    /// Where to write the inverted changeset
    #[arg(long, value_name = "FILE")]
    pub out: PathBuf,
}

pub fn command(args: InvertArgs) -> Result<()> {
    let changeset = utils::read_changeset(&args.file)?;
    let inverted = sqlite_session::invert(&changeset)
        .with_context(|| format!("Failed to invert {}", args.file.display()))?;
    utils::write_changeset(&args.out, &inverted)?;
    tracing::info!(
        "Inverted {} ({} bytes) into {}",
        args.file.display(),
        changeset.len(),
        args.out.display()
    );
    Ok(())
}
