//! Project configuration file parsing (.mirsync.toml)

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::skip::SkipPolicy;

/// Config file name, looked up in the working directory
pub const CONFIG_FILE: &str = ".mirsync.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Project configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Root directory on the agent side that mapping destinations are
    /// relative to
    pub agent_root: Option<PathBuf>,

    /// Debounce window in milliseconds
    pub debounce_ms: Option<u64>,

    /// Skip policy (`none`, `dotgit`, `gitignore`)
    pub skip: Option<SkipPolicy>,

    /// Mirrored trees
    #[serde(rename = "mapping")]
    pub mappings: Vec<MappingEntry>,
}

/// One `[[mapping]]` table
#[derive(Debug, Deserialize)]
pub struct MappingEntry {
    /// Local directory to mirror
    pub local: PathBuf,
    /// Destination below the agent root (empty = the agent root itself)
    #[serde(default)]
    pub dest: String,
}

impl MirrorConfig {
    /// Load config from a directory, or default config if the file is absent.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
    }
}
