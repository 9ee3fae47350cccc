//! Filesystem configuration
//!
//! Tunables live in `<fs>/fs-config.json`; every field has a default so a
//! partial (or missing) file is valid. Immutable layout facts live in
//! `<fs>/metadata.json`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{FsError, IoResultExt, Result};

pub const CONFIG_FILE: &str = "fs-config.json";
pub const METADATA_FILE: &str = "metadata.json";
pub const FORMAT: u32 = 1;

/// Cache layer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound for all cached bytes
    pub memory_size: usize,
    /// Share one cache per filesystem UUID across handles in this process
    pub shared: bool,
    pub fulltexts: bool,
    pub deltas: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_size: 16 * 1024 * 1024,
            shared: true,
            fulltexts: true,
            deltas: true,
        }
    }
}

/// Fulltext vs. delta heuristics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltificationConfig {
    pub enabled: bool,
    /// Predecessors walked to find the skip-delta base
    pub max_deltification_walk: u64,
    /// Chains at least this long are terminated with a fulltext
    pub max_chain_length: u32,
    /// Use the delta only if it is at most this share of the fulltext
    pub max_ratio_percent: u32,
}

impl Default for DeltificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_deltification_walk: 1023,
            max_chain_length: 64,
            max_ratio_percent: 75,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub cache: CacheConfig,
    pub deltification: DeltificationConfig,
    pub rep_sharing: bool,
    pub verify_checksums: bool,
    pub max_commit_retries: u32,
    /// Hard bound on delta links followed when reading
    pub max_delta_chain: u32,
    pub compression_level: i32,
    /// Revisions per shard; only consulted when the filesystem is created
    pub shard_size: u64,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            deltification: DeltificationConfig::default(),
            rep_sharing: true,
            verify_checksums: true,
            max_commit_retries: 8,
            max_delta_chain: 1024,
            compression_level: 3,
            shard_size: 1000,
        }
    }
}

impl FsConfig {
    /// Load config from a filesystem directory, falling back to defaults
    pub fn load(fs_path: &Path) -> Result<Self> {
        let config_path = fs_path.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path).with_path(&config_path)?;
        serde_json::from_str(&data)
            .map_err(|e| FsError::corrupt(format!("config {}", config_path.display()), e))
    }

    pub fn save(&self, fs_path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| FsError::Serialization(e.to_string()))?;
        crate::util::write_atomic(&fs_path.join(CONFIG_FILE), data.as_bytes())
    }
}

/// Layout facts fixed at creation time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsMetadata {
    pub uuid: String,
    pub format: u32,
    pub shard_size: u64,
    pub created_at: String,
}

impl FsMetadata {
    pub fn new(shard_size: u64) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            format: FORMAT,
            shard_size: shard_size.max(1),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn load(fs_path: &Path) -> Result<Self> {
        let path = fs_path.join(METADATA_FILE);
        let data = fs::read_to_string(&path).with_path(&path)?;
        let meta: FsMetadata = serde_json::from_str(&data)
            .map_err(|e| FsError::corrupt(format!("metadata {}", path.display()), e))?;
        if meta.format != FORMAT {
            return Err(FsError::Corruption(format!(
                "unsupported filesystem format {} (expected {})",
                meta.format, FORMAT
            )));
        }
        Ok(meta)
    }

    pub fn save(&self, fs_path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| FsError::Serialization(e.to_string()))?;
        crate::util::write_atomic(&fs_path.join(METADATA_FILE), data.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = FsConfig::load(dir.path()).unwrap();
        assert_eq!(config, FsConfig::default());
        assert_eq!(config.deltification.max_ratio_percent, 75);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{ "rep_sharing": false, "cache": { "memory_size": 1024 } }"#,
        )
        .unwrap();
        let config = FsConfig::load(dir.path()).unwrap();
        assert!(!config.rep_sharing);
        assert_eq!(config.cache.memory_size, 1024);
        assert!(config.cache.fulltexts);
        assert_eq!(config.max_commit_retries, 8);
    }

    #[test]
    fn test_config_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut config = FsConfig::default();
        config.shard_size = 4;
        config.cache.shared = false;
        config.save(dir.path()).unwrap();
        assert_eq!(FsConfig::load(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_metadata_rejects_unknown_format() {
        let dir = TempDir::new().unwrap();
        let mut meta = FsMetadata::new(10);
        meta.format = 99;
        meta.save(dir.path()).unwrap();
        assert!(matches!(
            FsMetadata::load(dir.path()),
            Err(FsError::Corruption(_))
        ));
    }
}
