// ABOUTME: apply command: replay a changeset against a SQLite database
// ABOUTME: Maps --on-conflict to a conflict policy and logs every conflict

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use rusqlite::Connection;
use sqlite_session::{
    apply_with_options, ApplyOptions, ApplyReport, ChangesetIter, ConflictAction,
    ConflictHandler, ConflictKind, ConflictPolicy,
};
use std::path::{Path, PathBuf};

use crate::config::ReplicatorConfig;
use crate::utils;

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum OnConflict {
    /// Skip conflicting rows
    Omit,
    /// Overwrite on data and primary-key conflicts, skip the rest
    Replace,
    /// Stop and roll back
    Abort,
}

impl From<OnConflict> for ConflictPolicy {
    fn from(value: OnConflict) -> Self {
        match value {
            OnConflict::Omit => ConflictPolicy::Omit,
            OnConflict::Replace => ConflictPolicy::Replace,
            OnConflict::Abort => ConflictPolicy::Abort,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ApplyArgs {
    /// Target SQLite database
    #[arg(long = "db", value_name = "PATH")]
    pub db: PathBuf,
    /// Changeset to apply
    pub file: PathBuf,
    /// How to resolve conflicts. Without it any conflict fails the apply
    #[arg(long = "on-conflict", value_enum)]
    pub on_conflict: Option<OnConflict>,
    /// Match rows on primary key only, ignoring other old values
    #[arg(long = "pk-only")]
    pub pk_only: bool,
}

/// Applies a fixed policy and logs each conflict it resolves
struct LoggingHandler {
    policy: ConflictPolicy,
    conflicts: usize,
}

impl ConflictHandler for LoggingHandler {
    fn on_conflict(&mut self, kind: ConflictKind, change: &ChangesetIter<'_>) -> ConflictAction {
        self.conflicts += 1;
        let action = self.policy.on_conflict(kind, change);
        match change.change() {
            Ok(row) => tracing::warn!(
                table = %row.table,
                op = %row.op,
                kind = kind.as_str(),
                ?action,
                "Conflict on old {} new {}",
                utils::format_record(&row.old),
                utils::format_record(&row.new)
            ),
            Err(e) => tracing::warn!(kind = kind.as_str(), ?action, "Conflict: {}", e),
        }
        action
    }
}

pub fn command(args: ApplyArgs, config: &ReplicatorConfig) -> Result<()> {
    let mut options = config.apply.clone();
    if args.pk_only {
        options.match_non_key_columns = false;
    }
    let changeset = utils::read_changeset(&args.file)?;
    let report = apply_file(&args.db, &changeset, args.on_conflict, &options)?;
    println!(
        "Applied {} row(s), omitted {}, replaced {}, skipped {}",
        report.applied, report.omitted, report.replaced, report.skipped
    );
    Ok(())
}

pub fn apply_file(
    db: &Path,
    changeset: &[u8],
    on_conflict: Option<OnConflict>,
    options: &ApplyOptions,
) -> Result<ApplyReport> {
    let conn = Connection::open(db)
        .with_context(|| format!("Failed to open SQLite database {}", db.display()))?;

    let report = match on_conflict {
        Some(policy) => {
            let mut handler = LoggingHandler {
                policy: policy.into(),
                conflicts: 0,
            };
            let report = apply_with_options(&conn, changeset, Some(&mut handler), options);
            if handler.conflicts > 0 {
                tracing::info!("Resolved {} conflict(s) with {:?}", handler.conflicts, policy);
            }
            report
        }
        None => apply_with_options(&conn, changeset, None, options),
    }
    .with_context(|| format!("Failed to apply changeset to {}", db.display()))?;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlite_session::Error;

    fn target(dir: &Path) -> PathBuf {
        let path = dir.join("target.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch(
                "CREATE TABLE t(a INTEGER PRIMARY KEY, b); INSERT INTO t VALUES(1, 'local');",
            )
            .unwrap();
        path
    }

    fn insert_one() -> Vec<u8> {
        use sqlite_session::codec::{put_record, put_table_header};
        use sqlite_session::{ChangeOp, Value};
        let mut cs = Vec::new();
        put_table_header(&mut cs, "t", 2);
        cs.push(ChangeOp::Insert.code());
        put_record(&mut cs, [Some(&Value::Integer(1)), Some(&Value::from("remote"))]);
        cs
    }

    fn stored(path: &Path) -> String {
        Connection::open(path)
            .unwrap()
            .query_row("SELECT b FROM t WHERE a = 1", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn conflicts_fail_without_a_policy() {
        let dir = tempfile::tempdir().unwrap();
        let db = target(dir.path());
        let err = apply_file(&db, &insert_one(), None, &ApplyOptions::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ConstraintViolation { .. })
        ));
        assert_eq!(stored(&db), "local");
    }

    #[test]
    fn replace_overwrites_existing_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = target(dir.path());
        let report = apply_file(
            &db,
            &insert_one(),
            Some(OnConflict::Replace),
            &ApplyOptions::default(),
        )
        .unwrap();
        assert_eq!(report.replaced, 1);
        assert_eq!(stored(&db), "remote");
    }

    #[test]
    fn omit_keeps_existing_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = target(dir.path());
        let report = apply_file(
            &db,
            &insert_one(),
            Some(OnConflict::Omit),
            &ApplyOptions::default(),
        )
        .unwrap();
        assert_eq!(report.omitted, 1);
        assert_eq!(stored(&db), "local");
    }
}
