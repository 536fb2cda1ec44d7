//! Vault configuration loaded from TOML

use crate::cache::DEFAULT_CACHE_FILE;
use crate::hash::Digest;
use crate::registry::KnownFileRegistry;
use crate::restore::RestoreOptions;
use crate::snapshot::SnapshotConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Default store directory, relative to the working directory
pub const DEFAULT_STORE_DIR: &str = ".chunkvault";

/// Settings shared by the snapshot and restore front ends
///
/// ```toml
/// store_dir = "/var/backups/vault"
///
/// [snapshot]
/// chunk_size = 4096
/// exclude_patterns = ["target", "*.tmp"]
///
/// [restore]
/// fail_on_tamper = true
///
/// [known_files]
/// "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08" = "base-image@2024.1"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Directory holding `chunks/` and, by default, the change cache
    pub store_dir: PathBuf,
    /// Change cache location; defaults to `cache.json` inside the store
    pub cache_file: Option<PathBuf>,
    pub snapshot: SnapshotConfig,
    pub restore: RestoreOptions,
    /// Whole-file SHA-256 (hex) to external reference
    pub known_files: BTreeMap<String, String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            cache_file: None,
            snapshot: SnapshotConfig::default(),
            restore: RestoreOptions::default(),
            known_files: BTreeMap::new(),
        }
    }
}

impl VaultConfig {
    /// Load and validate a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.snapshot.chunk_size == 0 {
            return Err(Error::Config {
                reason: "snapshot.chunk_size must be greater than zero".to_string(),
            });
        }

        if let Some(hash) = self.known_files.keys().find(|h| !Digest::new(h.as_str()).is_well_formed()) {
            return Err(Error::Config {
                reason: format!("known_files key is not a SHA-256 hex digest: {}", hash),
            });
        }

        Ok(())
    }

    /// Resolved change cache path
    pub fn cache_path(&self) -> PathBuf {
        self.cache_file
            .clone()
            .unwrap_or_else(|| self.store_dir.join(DEFAULT_CACHE_FILE))
    }

    pub fn registry(&self) -> KnownFileRegistry {
        self.known_files
            .iter()
            .map(|(hash, known_ref)| (hash.as_str(), known_ref.as_str()))
            .collect()
    }
}
