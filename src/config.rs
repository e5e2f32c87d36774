// ABOUTME: TOML configuration for changeset-replicator
// ABOUTME: Loads [session], [batch] and [apply] tables from --config or ~/.changeset-replicator

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use sqlite_session::{ApplyOptions, BatchConfig, SessionConfig};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = ".changeset-replicator";
const CONFIG_FILE: &str = "config.toml";

/// Settings read from the configuration file
///
/// Every table is optional and every missing key keeps its default.
///
/// ```toml
/// [session]
/// min_buckets = 1024
///
/// [batch]
/// min_buckets = 512
///
/// [apply]
/// schema = "main"
/// use_savepoint = true
/// match_non_key_columns = false
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicatorConfig {
    pub session: SessionConfig,
    pub batch: BatchConfig,
    pub apply: ApplyOptions,
}

/// Path of the per-user configuration file
pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("Could not find home directory"))?;
    Ok(home.join(CONFIG_DIR).join(CONFIG_FILE))
}

/// Load configuration
///
/// An explicit path must exist. Without one, the per-user file is read if
/// present and defaults are used otherwise.
pub fn load(explicit: Option<&Path>) -> Result<ReplicatorConfig> {
    if let Some(path) = explicit {
        return load_from_file(path);
    }
    let path = match default_config_path() {
        Ok(path) => path,
        Err(e) => {
            tracing::debug!("Skipping user configuration: {}", e);
            return Ok(ReplicatorConfig::default());
        }
    };
    if !path.exists() {
        return Ok(ReplicatorConfig::default());
    }
    load_from_file(&path)
}

pub fn load_from_file(path: &Path) -> Result<ReplicatorConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config = parse(&contents)
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    tracing::debug!("Loaded configuration from {}", path.display());
    Ok(config)
}

pub fn parse(contents: &str) -> Result<ReplicatorConfig> {
    Ok(toml::from_str(contents)?)
}
