//! On-disk names for cache entries and staging files

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Extension of published entry files; `clear` only touches these
pub const ENTRY_EXTENSION: &str = "cache";
/// Extension of in-progress writes
pub const STAGING_EXTENSION: &str = "staging";

/// Stable hex fingerprint of a cache key (64 chars for SHA256)
pub fn fingerprint(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Final location of the entry for `key`
pub fn entry_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{}.{}", fingerprint(key), ENTRY_EXTENSION))
}

/// Fresh staging location; random so concurrent writers never collide
pub fn staging_path(dir: &Path) -> PathBuf {
    dir.join(format!("{}.{}", uuid::Uuid::new_v4(), STAGING_EXTENSION))
}

pub fn is_entry_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXTENSION)
}

pub fn is_staging_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(STAGING_EXTENSION)
}
