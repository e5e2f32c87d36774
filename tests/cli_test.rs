use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::{tempdir, TempDir};

const SCHEMA: &str = "CREATE TABLE t(a INTEGER PRIMARY KEY, b TEXT UNIQUE, c);";

fn run(home: &Path, args: &[&str]) -> Output {
    let bin_path = env!("CARGO_BIN_EXE_changeset-replicator");
    Command::new(bin_path)
        .args(args)
        .env("HOME", home)
        .env_remove("RUST_LOG")
        .env_remove("CHANGESET_REPLICATOR_CONFIG")
        .output()
        .expect("Failed to execute command")
}

fn database(dir: &Path, name: &str, setup: &str) -> PathBuf {
    let path = dir.join(name);
    Connection::open(&path).unwrap().execute_batch(setup).unwrap();
    path
}

fn rows(path: &Path) -> Vec<(i64, String, Option<i64>)> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn.prepare("SELECT a, b, c FROM t ORDER BY a").unwrap();
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    rows
}

fn s(path: &Path) -> &str {
    path.to_str().unwrap()
}

/// Records `sql` against a fresh copy of SCHEMA plus `seed` and returns the changeset path
fn record(dir: &TempDir, name: &str, seed: &str, sql: &str) -> PathBuf {
    let db = database(dir.path(), &format!("{name}.db"), &format!("{SCHEMA}{seed}"));
    let out = dir.path().join(format!("{name}.changeset"));
    let output = run(
        dir.path(),
        &["record", "--db", s(&db), "--table", "t", "--sql", sql, "--out", s(&out)],
    );
    assert!(
        output.status.success(),
        "record failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    out
}

#[test]
fn test_record_and_dump_json() {
    let dir = tempdir().unwrap();
    let cs = record(
        &dir,
        "src",
        "",
        "INSERT INTO t VALUES(1, 'x', NULL); INSERT INTO t VALUES(2, 'y', 7);",
    );

    let output = run(dir.path(), &["dump", s(&cs), "--json"]);
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let changes = json.as_array().unwrap();
    assert_eq!(changes.len(), 2);
    assert!(changes.iter().all(|c| c["op"] == "INSERT" && c["table"] == "t"));
    let second = changes.iter().find(|c| c["new"]["0"] == 2).unwrap();
    assert_eq!(second["new"]["1"], "y");
    assert_eq!(second["new"]["2"], 7);
}

#[test]
fn test_dump_text_reports_digest() {
    let dir = tempdir().unwrap();
    let cs = record(&dir, "src", "", "INSERT INTO t VALUES(1, 'x', NULL);");

    let output = run(dir.path(), &["dump", s(&cs)]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("sha256 "));
    assert!(stdout.contains("table t (3 columns)"));
    assert!(stdout.contains("INSERT new: [1, 'x', NULL]"));
    assert!(stdout.contains("1 row(s)"));
}

#[test]
fn test_apply_replays_recorded_changes() {
    let dir = tempdir().unwrap();
    let seed = "INSERT INTO t VALUES(1, 'one', 1); INSERT INTO t VALUES(2, 'two', 2);";
    let cs = record(
        &dir,
        "src",
        seed,
        "UPDATE t SET c = 10 WHERE a = 1; DELETE FROM t WHERE a = 2; \
         INSERT INTO t VALUES(3, 'three', 3);",
    );
    let target = database(dir.path(), "target.db", &format!("{SCHEMA}{seed}"));

    let output = run(dir.path(), &["apply", "--db", s(&target), s(&cs)]);
    assert!(
        output.status.success(),
        "apply failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("Applied 3 row(s)"));
    assert_eq!(
        rows(&target),
        vec![(1, "one".into(), Some(10)), (3, "three".into(), Some(3))]
    );
}

#[test]
fn test_invert_undoes_apply() {
    let dir = tempdir().unwrap();
    let seed = "INSERT INTO t VALUES(1, 'one', 1);";
    let cs = record(
        &dir,
        "src",
        seed,
        "UPDATE t SET b = 'uno' WHERE a = 1; INSERT INTO t VALUES(2, 'two', NULL);",
    );
    let target = database(dir.path(), "target.db", &format!("{SCHEMA}{seed}"));
    let before = rows(&target);

    let inverted = dir.path().join("inverted.changeset");
    let output = run(dir.path(), &["invert", s(&cs), "--out", s(&inverted)]);
    assert!(output.status.success());

    assert!(run(dir.path(), &["apply", "--db", s(&target), s(&cs)]).status.success());
    assert_ne!(rows(&target), before);
    assert!(run(dir.path(), &["apply", "--db", s(&target), s(&inverted)])
        .status
        .success());
    assert_eq!(rows(&target), before);
}

#[test]
fn test_concat_then_apply() {
    let dir = tempdir().unwrap();
    let first = record(&dir, "first", "", "INSERT INTO t VALUES(1, 'a', NULL);");
    let second = record(&dir, "second", "", "INSERT INTO t VALUES(2, 'b', NULL);");
    let combined = dir.path().join("combined.changeset");

    let output = run(
        dir.path(),
        &["concat", s(&first), s(&second), "--out", s(&combined)],
    );
    assert!(output.status.success());
    let header_len = "T\x03t\x00".len();
    assert_eq!(
        fs::read(&combined).unwrap().len(),
        fs::read(&first).unwrap().len() + fs::read(&second).unwrap().len() - header_len
    );

    let target = database(dir.path(), "target.db", SCHEMA);
    assert!(run(dir.path(), &["apply", "--db", s(&target), s(&combined)])
        .status
        .success());
    assert_eq!(rows(&target).len(), 2);
}

#[test]
fn test_concat_merges_changes_to_the_same_row() {
    let dir = tempdir().unwrap();
    let seed = "INSERT INTO t VALUES(1, 'one', 1);";
    let first = record(&dir, "first", seed, "UPDATE t SET c = 2 WHERE a = 1;");
    let second = record(&dir, "second", seed, "DELETE FROM t WHERE a = 1;");
    let schema_db = database(dir.path(), "schema.db", SCHEMA);
    let merged = dir.path().join("merged.changeset");

    let output = run(
        dir.path(),
        &[
            "concat",
            s(&first),
            s(&second),
            "--db",
            s(&schema_db),
            "--out",
            s(&merged),
        ],
    );
    assert!(
        output.status.success(),
        "concat failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let output = run(dir.path(), &["dump", s(&merged), "--json"]);
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let changes = json.as_array().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0]["op"], "DELETE");
    assert_eq!(changes[0]["old"]["2"], 1);

    let target = database(dir.path(), "target.db", &format!("{SCHEMA}{seed}"));
    assert!(run(dir.path(), &["apply", "--db", s(&target), s(&merged)])
        .status
        .success());
    assert!(rows(&target).is_empty());
}

#[test]
fn test_apply_conflict_policies() {
    let dir = tempdir().unwrap();
    let cs = record(&dir, "src", "", "INSERT INTO t VALUES(1, 'remote', NULL);");
    let target = database(
        dir.path(),
        "target.db",
        &format!("{SCHEMA}INSERT INTO t VALUES(1, 'local', NULL);"),
    );

    let output = run(dir.path(), &["apply", "--db", s(&target), s(&cs)]);
    assert!(!output.status.success());
    assert_eq!(rows(&target)[0].1, "local");

    let output = run(
        dir.path(),
        &["apply", "--db", s(&target), s(&cs), "--on-conflict", "omit"],
    );
    assert!(output.status.success());
    assert_eq!(rows(&target)[0].1, "local");

    let output = run(
        dir.path(),
        &["apply", "--db", s(&target), s(&cs), "--on-conflict", "replace"],
    );
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("replaced 1"));
    assert_eq!(rows(&target)[0].1, "remote");
}

#[test]
fn test_batch_exit_status() {
    let dir = tempdir().unwrap();
    let first = record(&dir, "first", "", "INSERT INTO t VALUES(1, 'a', NULL);");
    let disjoint = record(&dir, "disjoint", "", "INSERT INTO t VALUES(2, 'b', NULL);");
    let same_key = record(&dir, "same_key", "", "INSERT INTO t VALUES(3, 'a', NULL);");
    let schema_db = database(dir.path(), "schema.db", SCHEMA);

    let output = run(
        dir.path(),
        &["batch", "--db", s(&schema_db), s(&first), s(&disjoint)],
    );
    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains("No conflicts"));

    let output = run(
        dir.path(),
        &["batch", "--db", s(&schema_db), s(&first), s(&disjoint), s(&same_key)],
    );
    assert_eq!(output.status.code(), Some(2));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(&format!("conflict: {}", same_key.display())));
    assert!(!stdout.contains(&format!("conflict: {}", disjoint.display())));
}

#[test]
fn test_corrupt_changeset_is_rejected() {
    let dir = tempdir().unwrap();
    let bad = dir.path().join("bad.changeset");
    fs::write(&bad, [b'T', 0x02, b't', 0x00, 0x12, 0x07]).unwrap();

    let output = run(dir.path(), &["dump", s(&bad)]);
    assert!(!output.status.success());

    let out = dir.path().join("never.changeset");
    let output = run(dir.path(), &["invert", s(&bad), "--out", s(&out)]);
    assert!(!output.status.success());
    assert!(!out.exists());
}

#[test]
fn test_config_file_controls_apply_matching() {
    let dir = tempdir().unwrap();
    let cs = record(
        &dir,
        "src",
        "INSERT INTO t VALUES(1, 'one', 1);",
        "DELETE FROM t WHERE a = 1;",
    );
    let target = database(
        dir.path(),
        "target.db",
        &format!("{SCHEMA}INSERT INTO t VALUES(1, 'one', 99);"),
    );

    let output = run(dir.path(), &["apply", "--db", s(&target), s(&cs)]);
    assert!(!output.status.success());

    let config = dir.path().join("config.toml");
    fs::write(&config, "[apply]\nmatch_non_key_columns = false\n").unwrap();
    let output = run(
        dir.path(),
        &["--config", s(&config), "apply", "--db", s(&target), s(&cs)],
    );
    assert!(
        output.status.success(),
        "apply failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(rows(&target).is_empty());
}

#[test]
fn test_record_requires_sql() {
    let dir = tempdir().unwrap();
    let db = database(dir.path(), "src.db", SCHEMA);
    let out = dir.path().join("out.changeset");
    let output = run(dir.path(), &["record", "--db", s(&db), "--out", s(&out)]);
    assert!(!output.status.success());
    assert!(!out.exists());
}
