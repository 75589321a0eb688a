use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::repair::ReplacementRule;
use crate::settings::{self, ConfigSource};

pub const CONFIG_FILE: &str = "schoold.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-workspace engine configuration, read from `schoold.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub settings: SettingsConfig,
    pub repair: RepairConfig,
    pub manifest: ManifestConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SettingsConfig {
    pub sources: Vec<ConfigSource>,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            sources: settings::default_sources(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RepairConfig {
    pub rules: Vec<ReplacementRule>,
    /// Table allow-list; absent means every table.
    pub tables: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManifestConfig {
    pub start_url: String,
    pub scope: String,
    pub display: String,
    pub background_color: String,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            start_url: "/".into(),
            scope: "/".into(),
            display: "standalone".into(),
            background_color: "#ffffff".into(),
        }
    }
}

/// Loads `<workspace>/schoold.json`. A missing file is not an error.
pub fn load_workspace_config(workspace: &Path) -> Result<Option<EngineConfig>, ConfigError> {
    let path = workspace.join(CONFIG_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let cfg = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })?;
    Ok(Some(cfg))
}
