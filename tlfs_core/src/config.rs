//! Engine configuration, read from TOML.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

use crate::MetadataVer;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub dirty_buffer: DirtyBufferConfig,
    pub cache: CacheConfig,
    /// Largest plaintext held by one file block before the file goes indirect.
    pub max_block_size: usize,
    pub max_name_bytes: usize,
    pub flush_period_ms: u64,
    pub background_flushes: bool,
    /// Listen for merged updates from the metadata server.
    pub background_updates: bool,
    pub rekey_with_prompt_wait_ms: u64,
    pub delayed_cancellation_grace_ms: u64,
    /// Layout used for key bundles of newly created folders.
    pub metadata_version: MetadataVer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DirtyBufferConfig {
    /// Writers wait while unsynced bytes would exceed this.
    pub max_buffer_bytes: u64,
    /// Above this many unsynced bytes a flush is forced.
    pub force_sync_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub block_cache_entries: usize,
    pub known_ptr_entries: usize,
    pub md_cache_entries: usize,
    pub key_cache_entries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dirty_buffer: DirtyBufferConfig::default(),
            cache: CacheConfig::default(),
            max_block_size: 512 * 1024,
            max_name_bytes: 255,
            flush_period_ms: 1_000,
            background_flushes: true,
            background_updates: true,
            rekey_with_prompt_wait_ms: 10 * 60 * 1_000,
            delayed_cancellation_grace_ms: 2_000,
            metadata_version: MetadataVer::V2,
        }
    }
}

impl Default for DirtyBufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 64 * 1024 * 1024,
            force_sync_bytes: 32 * 1024 * 1024,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_cache_entries: 5_000,
            known_ptr_entries: 10_000,
            md_cache_entries: 5_000,
            key_cache_entries: 1_000,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        toml::from_str(s).context("invalid engine config")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&s)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn flush_period(&self) -> Duration {
        Duration::from_millis(self.flush_period_ms)
    }

    pub fn rekey_with_prompt_wait(&self) -> Duration {
        Duration::from_millis(self.rekey_with_prompt_wait_ms)
    }

    pub fn delayed_cancellation_grace(&self) -> Duration {
        Duration::from_millis(self.delayed_cancellation_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            max_block_size = 4096
            metadata_version = "v3"

            [dirty_buffer]
            max_buffer_bytes = 1024
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_block_size, 4096);
        assert_eq!(cfg.metadata_version, MetadataVer::V3);
        assert_eq!(cfg.dirty_buffer.max_buffer_bytes, 1024);
        assert_eq!(
            cfg.dirty_buffer.force_sync_bytes,
            DirtyBufferConfig::default().force_sync_bytes
        );
        assert_eq!(cfg.cache, CacheConfig::default());
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tlfs.toml");
        let cfg = EngineConfig {
            background_flushes: false,
            ..Default::default()
        };
        std::fs::write(&path, cfg.to_toml_string().unwrap()).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), cfg);
        assert!(EngineConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
