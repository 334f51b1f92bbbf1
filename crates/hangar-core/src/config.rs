//! Configuration for the artifact store.
//!
//! The storage root is an explicit value handed to the store at construction,
//! so several stores (e.g. one per test) can live side by side.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::STAGING_DIR;

/// Mode applied to every published artifact.
pub const DEFAULT_FILE_MODE: u32 = 0o666;

/// How archives reach the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveMode {
    /// Encode straight into the sink. A failure mid-walk leaves a truncated
    /// archive at the caller.
    #[default]
    Streaming,
    /// Spool the whole archive under `root/tmp` first; the sink only sees
    /// complete archives.
    Buffered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Storage root; jobs live in `root/<uuid>/`.
    pub root: PathBuf,

    /// Whether `delete` is honoured.
    #[serde(default)]
    pub allow_deletion: bool,

    /// Permission bits of published files (unix only).
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,

    #[serde(default)]
    pub archive_mode: ArchiveMode,
}

fn default_file_mode() -> u32 {
    DEFAULT_FILE_MODE
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            allow_deletion: false,
            file_mode: DEFAULT_FILE_MODE,
            archive_mode: ArchiveMode::default(),
        }
    }

    pub fn with_deletion(mut self, allow: bool) -> Self {
        self.allow_deletion = allow;
        self
    }

    pub fn with_archive_mode(mut self, mode: ArchiveMode) -> Self {
        self.archive_mode = mode;
        self
    }

    pub fn with_file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    /// Load config from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }
}
