//! Tunables for sessions, batches and apply.

use serde::Deserialize;

/// Capture settings for a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bucket count of a table's change index on first allocation.
    pub min_buckets: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { min_buckets: 256 }
    }
}

/// Settings for a [`ChangeBatch`](crate::ChangeBatch).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Bucket count of the fingerprint index on first allocation.
    pub min_buckets: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { min_buckets: 512 }
    }
}

/// Options controlling how a changeset is replayed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ApplyOptions {
    /// Target database schema name.
    pub schema: String,
    /// Wrap the apply in `SAVEPOINT changeset_apply`. Turning this off leaves
    /// transaction control to the caller and makes ABORT stop without undo.
    pub use_savepoint: bool,
    /// Require non-key columns to match their old values for DELETE and
    /// UPDATE. When false, rows are matched on primary key only.
    pub match_non_key_columns: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            schema: "main".to_string(),
            use_savepoint: true,
            match_non_key_columns: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        assert_eq!(SessionConfig::default().min_buckets, 256);
        assert_eq!(BatchConfig::default().min_buckets, 512);
        let apply = ApplyOptions::default();
        assert_eq!(apply.schema, "main");
        assert!(apply.use_savepoint);
        assert!(apply.match_non_key_columns);
    }

    #[test]
    fn partial_documents_keep_defaults() {
        let apply: ApplyOptions =
            serde_json::from_str(r#"{"match_non_key_columns": false}"#).unwrap();
        assert_eq!(apply.schema, "main");
        assert!(!apply.match_non_key_columns);

        let session: SessionConfig = serde_json::from_str(r#"{"min_buckets": 16}"#).unwrap();
        assert_eq!(session.min_buckets, 16);
    }
}
