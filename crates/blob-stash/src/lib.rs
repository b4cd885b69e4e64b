//! Disk-backed blob cache with LRU eviction and write-once tags
//!
//! [`BlobCache`] keeps one file per entry in a directory, bounded by total
//! bytes and entry count, and evicts the least recently used entries to stay
//! within both. Writers stage content and rename it into place; readers of a
//! key being written wait for the write to finish.
//!
//! [`ChunkCache`] stores logical files as chunks keyed by offset and keeps
//! every chunk of a file agreeing on one common tag.

mod cache;
mod chunk;
mod error;
pub mod naming;
mod recency;
mod types;
mod writer;

pub use cache::{Blob, BlobCache};
pub use chunk::ChunkCache;
pub use error::{Result, StashError};
pub use types::{CacheStats, EntryInfo, EntryStatus, StashConfig, Tag, DEFAULT_BLOCK_SIZE};
