// ABOUTME: dump command: print the rows of a changeset
// ABOUTME: Renders a human-readable listing or a JSON array of changes

use anyhow::{Context, Result};
use clap::Args;
use sqlite_session::{changes, ChangeOp};
use std::io::Write;
use std::path::PathBuf;

use crate::utils;

#[derive(Args, Debug, Clone)]
pub struct DumpArgs {
    /// Changeset file to print
    pub file: PathBuf,
    /// Emit JSON instead of text
    #[arg(long)]
    pub json: bool,
}

pub fn command(args: DumpArgs) -> Result<()> {
    let changeset = utils::read_changeset(&args.file)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if args.json {
        dump_json(&changeset, &mut out)?;
    } else {
        writeln!(
            out,
            "changeset {} ({} bytes, sha256 {})",
            args.file.display(),
            changeset.len(),
            utils::digest(&changeset)
        )?;
        dump_text(&changeset, &mut out)?;
    }
    Ok(())
}

/// Write one line per row, with a header line each time the table changes
pub fn dump_text<W: Write>(changeset: &[u8], out: &mut W) -> Result<()> {
    let rows = changes(changeset).context("Failed to decode changeset")?;
    let mut current: Option<(&str, usize)> = None;
    for row in &rows {
        let width = row.old.len().max(row.new.len());
        if current != Some((row.table.as_str(), width)) {
            writeln!(out, "table {} ({} columns)", row.table, width)?;
            current = Some((row.table.as_str(), width));
        }
        match row.op {
            ChangeOp::Insert => {
                writeln!(out, "  INSERT new: {}", utils::format_record(&row.new))?
            }
            ChangeOp::Delete => {
                writeln!(out, "  DELETE old: {}", utils::format_record(&row.old))?
            }
            ChangeOp::Update => writeln!(
                out,
                "  UPDATE old: {} new: {}",
                utils::format_record(&row.old),
                utils::format_record(&row.new)
            )?,
        }
    }
    writeln!(out, "{} row(s)", rows.len())?;
    Ok(())
}

pub fn dump_json<W: Write>(changeset: &[u8], out: &mut W) -> Result<()> {
    let rows = changes(changeset).context("Failed to decode changeset")?;
    let json: Vec<_> = rows.iter().map(utils::change_to_json).collect();
    serde_json::to_writer_pretty(&mut *out, &json)?;
    writeln!(out)?;
    Ok(())
}
