use std::path::{Path, PathBuf};

use keeper_store::{DEFAULT_CACHE_WORKERS, DEFAULT_SHARD_LEVELS};
use keeper_types::KEY_HEX_LEN;
use serde::{Deserialize, Serialize};

use crate::error::{KeeperError, KeeperResult};

/// Default size of the chunks a streamed payload is read back in.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Configuration of a [`Keeper`](crate::Keeper).
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// root = "/var/lib/keeper"
///
/// [write_cache]
/// workers = 8
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    /// Root directory of the file storage.
    pub root: PathBuf,
    /// One-character directory levels a key is sharded into.
    pub shard_levels: usize,
    /// Chunk size used when digesting a streamed payload.
    pub read_chunk_size: usize,
    /// Front the file storage with a write-back cache when set.
    pub write_cache: Option<CacheConfig>,
    /// Workers persisting buffered streams.
    pub flush_workers: usize,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("keeper-data"),
            shard_levels: DEFAULT_SHARD_LEVELS,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            write_cache: None,
            flush_workers: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub workers: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_CACHE_WORKERS,
        }
    }
}

impl KeeperConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_write_cache(mut self, workers: usize) -> Self {
        self.write_cache = Some(CacheConfig { workers });
        self
    }

    pub fn validate(&self) -> KeeperResult<()> {
        if self.shard_levels >= KEY_HEX_LEN {
            return Err(KeeperError::Config(format!(
                "shard_levels must be below {KEY_HEX_LEN}, got {}",
                self.shard_levels
            )));
        }
        if self.read_chunk_size == 0 {
            return Err(KeeperError::Config("read_chunk_size must be positive".into()));
        }
        if self.flush_workers == 0 {
            return Err(KeeperError::Config("flush_workers must be positive".into()));
        }
        if matches!(self.write_cache, Some(CacheConfig { workers: 0 })) {
            return Err(KeeperError::Config("write_cache.workers must be positive".into()));
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> KeeperResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| KeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> KeeperResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
