// ABOUTME: File and rendering helpers shared by the CLI commands
// ABOUTME: Reads and writes changeset files and converts rows to JSON or text

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlite_session::{Change, ChangeOp, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Read a changeset file into memory
pub fn read_changeset(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read changeset {}", path.display()))
}

/// Write a changeset file
///
/// The bytes go to a temporary file in the destination directory first and
/// are renamed into place, so readers never observe a partial changeset.
pub fn write_changeset(path: &Path, changeset: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    tmp.write_all(changeset)
        .context("Failed to write changeset bytes")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to write changeset {}", path.display()))?;
    Ok(())
}

/// Hex-encoded SHA-256 of a changeset
pub fn digest(changeset: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(changeset);
    format!("{:x}", hasher.finalize())
}

/// Resolve SQL given either inline or as a file path
pub fn load_sql(sql: Option<String>, sql_file: Option<&Path>) -> Result<String> {
    match (sql, sql_file) {
        (Some(sql), _) => Ok(sql),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read SQL file {}", path.display())),
        (None, None) => anyhow::bail!("Either --sql or --sql-file is required"),
    }
}

/// Convert a single SQL value to JSON
///
/// Maps storage classes to JSON types:
/// - INTEGER → number
/// - REAL → number, or a string for NaN and infinities
/// - TEXT → string, or `{"_type": "text", "data": "<base64>"}` when the
///   stored bytes are not UTF-8
/// - BLOB → `{"_type": "blob", "data": "<base64>"}`
/// - NULL → null
pub fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Integer(i) => JsonValue::Number((*i).into()),
        Value::Real(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(f.to_string())),
        Value::Text(t) => match std::str::from_utf8(t) {
            Ok(s) => JsonValue::String(s.to_string()),
            Err(_) => tagged_base64("text", t),
        },
        Value::Blob(b) => tagged_base64("blob", b),
    }
}

fn tagged_base64(kind: &str, bytes: &[u8]) -> JsonValue {
    let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes);
    serde_json::json!({
        "_type": kind,
        "data": encoded
    })
}

/// Convert a record to a JSON object keyed by column index
///
/// Columns the record does not carry are left out, which keeps them apart
/// from columns that carry NULL.
pub fn record_to_json(record: &[Option<Value>]) -> JsonValue {
    let mut obj = serde_json::Map::new();
    for (i, slot) in record.iter().enumerate() {
        if let Some(value) = slot {
            obj.insert(i.to_string(), value_to_json(value));
        }
    }
    JsonValue::Object(obj)
}

/// Convert a decoded row to JSON
pub fn change_to_json(change: &Change) -> JsonValue {
    let mut obj = serde_json::Map::new();
    obj.insert("table".into(), JsonValue::String(change.table.clone()));
    obj.insert("op".into(), JsonValue::String(change.op.as_str().into()));
    if change.op != ChangeOp::Insert {
        obj.insert("old".into(), record_to_json(&change.old));
    }
    if change.op != ChangeOp::Delete {
        obj.insert("new".into(), record_to_json(&change.new));
    }
    JsonValue::Object(obj)
}

/// Render a value the way it would be written as an SQL literal
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => format!("{f:?}"),
        Value::Text(t) => match std::str::from_utf8(t) {
            Ok(s) => sqlite_session::schema::quote_literal(s),
            Err(_) => format!("CAST({} AS TEXT)", hex_literal(t)),
        },
        Value::Blob(b) => hex_literal(b),
    }
}

fn hex_literal(bytes: &[u8]) -> String {
    let hex: String = bytes.iter().map(|byte| format!("{byte:02X}")).collect();
    format!("X'{hex}'")
}

/// Render a record as `[a, -, c]`, with `-` for columns it does not carry
pub fn format_record(record: &[Option<Value>]) -> String {
    let parts: Vec<String> = record
        .iter()
        .map(|slot| slot.as_ref().map_or_else(|| "-".to_string(), format_value))
        .collect();
    format!("[{}]", parts.join(", "))
}
