//! Configuration file parser for ~/.config/riffle/config.toml.
//!
//! The file is optional and every key has a default. Unknown keys are
//! accepted but logged, since they are usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::storage::{StoreOptions, DEFAULT_MAX_DESCRIPTION_CHARS};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration
// ============================================================================

const KNOWN_KEYS: [&str; 6] = [
    "database_path",
    "max_connections",
    "destructive_rebuild",
    "max_description_chars",
    "sync_concurrency",
    "snapshot_buffer",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database file. `None` means `riffle.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// Connection pool size for the database file.
    pub max_connections: u32,

    /// Drop and recreate the store when its schema cannot be migrated.
    /// Loses every stored article, source and folder.
    pub destructive_rebuild: bool,

    /// Descriptions longer than this many characters are clipped by the
    /// `truncate` maintenance command.
    pub max_description_chars: i64,

    /// Sources fetched at once during a sync.
    pub sync_concurrency: usize,

    /// Snapshots a live query may queue before it waits for the reader.
    pub snapshot_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        let store = StoreOptions::default();
        Self {
            database_path: None,
            max_connections: store.max_connections,
            destructive_rebuild: store.destructive_rebuild,
            max_description_chars: DEFAULT_MAX_DESCRIPTION_CHARS,
            sync_concurrency: 10,
            snapshot_buffer: store.snapshot_buffer,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing or empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Zero pool size, concurrency or description limit → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check the size before reading so a huge file is never pulled into memory
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            sync_concurrency = config.sync_concurrency,
            "Loaded configuration"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        if self.sync_concurrency == 0 {
            return Err(ConfigError::Invalid("sync_concurrency must be at least 1".into()));
        }
        if self.max_description_chars <= 0 {
            return Err(ConfigError::Invalid(
                "max_description_chars must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Database location, resolving the default against `config_dir`.
    pub fn database_path(&self, config_dir: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir.join("riffle.db"))
    }

    /// Store open options carried by this config. Migrations are code, not
    /// configuration, so the list starts empty.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            max_connections: self.max_connections,
            destructive_rebuild: self.destructive_rebuild,
            snapshot_buffer: self.snapshot_buffer,
            migrations: Vec::new(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
