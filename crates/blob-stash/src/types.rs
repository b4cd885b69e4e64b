//! Cache types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Opaque, write-once annotation attached to an entry
pub type Tag = Vec<u8>;

pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Lifecycle of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    /// A write is in flight; readers wait
    Busy,
    Ready,
    /// Write failed or the entry was evicted; never reused
    Deleted,
}

/// Snapshot of one cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryInfo {
    pub key: String,
    pub size: u64,
    pub path: PathBuf,
    pub tag: Option<Tag>,
    pub status: EntryStatus,
    pub stored_at: DateTime<Utc>,
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Configuration for a cache instance
#[derive(Debug, Clone)]
pub struct StashConfig {
    pub cache_dir: PathBuf,
    pub max_cache_size: u64,
    pub max_entries: usize,
    /// Block size used by streaming writes
    pub block_size: usize,
}

impl StashConfig {
    pub fn new(cache_dir: impl Into<PathBuf>, max_cache_size: u64, max_entries: usize) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_cache_size,
            max_entries,
            ..Self::default()
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Load configuration from the environment, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cache_dir = std::env::var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let max_cache_size = std::env::var("MAX_CACHE_SIZE")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.max_cache_size);

        let max_entries = std::env::var("MAX_ENTRIES")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(defaults.max_entries);

        let block_size = std::env::var("BLOCK_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(defaults.block_size);

        Self {
            cache_dir,
            max_cache_size,
            max_entries,
            block_size,
        }
    }
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache/stash"),
            max_cache_size: 1024 * 1024 * 1024, // 1GB
            max_entries: 10_000,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}
