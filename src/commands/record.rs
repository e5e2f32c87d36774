// ABOUTME: record command: capture the changes made by a SQL script
// ABOUTME: Runs the script under a session and writes the resulting changeset

use anyhow::{Context, Result};
use clap::Args;
use sqlite_session::{changes, Database, Session, SessionConfig};
use std::path::{Path, PathBuf};

use crate::config::ReplicatorConfig;
use crate::utils;

#[derive(Args, Debug, Clone)]
pub struct RecordArgs {
    /// SQLite database the script runs against
    #[arg(long = "db", value_name = "PATH")]
    pub db: PathBuf,
    /// Schema to capture (main, temp, or an attached name)
    #[arg(long, default_value = "main")]
    pub schema: String,
    /// Tables to capture (repeatable). All tables when omitted
    #[arg(long = "table", value_name = "TABLE")]
    pub tables: Vec<String>,
    #[command(flatten)]
    pub source: SqlSource,
    /// Where to write the changeset
    #[arg(long, value_name = "FILE")]
    pub out: PathBuf,
}

#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct SqlSource {
    /// SQL statements to execute
    #[arg(long)]
    pub sql: Option<String>,
    /// File containing SQL statements to execute
    #[arg(long = "sql-file", value_name = "PATH")]
    pub sql_file: Option<PathBuf>,
}

pub fn command(args: RecordArgs, config: &ReplicatorConfig) -> Result<()> {
    let sql = utils::load_sql(args.source.sql, args.source.sql_file.as_deref())?;
    let changeset = record(
        &args.db,
        &args.schema,
        &args.tables,
        &sql,
        config.session.clone(),
    )?;
    utils::write_changeset(&args.out, &changeset)?;
    println!(
        "Recorded {} bytes to {} (sha256 {})",
        changeset.len(),
        args.out.display(),
        utils::digest(&changeset)
    );
    Ok(())
}

/// Execute `sql` against `db` and return the changeset it produced
pub fn record(
    db: &Path,
    schema: &str,
    tables: &[String],
    sql: &str,
    config: SessionConfig,
) -> Result<Vec<u8>> {
    let database = Database::open(db)
        .with_context(|| format!("Failed to open SQLite database {}", db.display()))?;
    let session = Session::with_config(&database, schema, config)
        .with_context(|| format!("Failed to start a session on schema '{}'", schema))?;

    if tables.is_empty() {
        session.attach(None).context("Failed to attach tables")?;
    } else {
        for table in tables {
            session
                .attach(Some(table))
                .with_context(|| format!("Failed to attach table '{}'", table))?;
        }
    }

    database
        .connection()
        .execute_batch(sql)
        .context("Failed to execute SQL")?;

    let changeset = session.changeset().context("Failed to build changeset")?;
    let rows = changes(&changeset)?.len();
    tracing::info!(
        "Captured {} row change(s) from {} ({} bytes)",
        rows,
        db.display(),
        changeset.len()
    );
    Ok(changeset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use sqlite_session::ChangeOp;

    #[test]
    fn records_only_requested_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch(
                "CREATE TABLE a(id INTEGER PRIMARY KEY, v); \
                 CREATE TABLE b(id INTEGER PRIMARY KEY, v);",
            )
            .unwrap();

        let changeset = record(
            &path,
            "main",
            &["a".to_string()],
            "INSERT INTO a VALUES(1, 'x'); INSERT INTO b VALUES(1, 'y');",
            SessionConfig::default(),
        )
        .unwrap();

        let rows = changes(&changeset).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].table, "a");
        assert_eq!(rows[0].op, ChangeOp::Insert);
    }

    #[test]
    fn missing_table_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.db");
        let err = record(
            &path,
            "main",
            &["ghost".to_string()],
            "SELECT 1",
            SessionConfig::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
