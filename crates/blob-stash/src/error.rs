//! Error types for the blob stash

use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum StashError {
    /// Storage directory is empty, missing or not a directory
    BadDir(PathBuf),
    /// Byte budget (or block size) is zero
    BadSize,
    /// Entry budget is zero
    BadCap,
    NotFound(String),
    ChunkNotFound {
        file: String,
        offset: i64,
    },
    AlreadyTagged(String),
    IncoherentTag(String),
    Untagged(String),
    TooLarge {
        key: String,
        size: u64,
        max: u64,
    },
    InsufficientSpace {
        key: String,
        needed: u64,
    },
    /// The put that owned a write went away before handing over all content
    Abandoned(String),
    File {
        dir: PathBuf,
        key: String,
        source: Box<std::io::Error>,
    },
}

impl StashError {
    /// Wrap a filesystem error with the directory and key it happened for
    pub fn file(dir: impl Into<PathBuf>, key: impl Into<String>, err: std::io::Error) -> Self {
        StashError::File {
            dir: dir.into(),
            key: key.into(),
            source: Box::new(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StashError::NotFound(_))
    }
}

impl fmt::Display for StashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StashError::BadDir(dir) => write!(f, "Invalid cache directory: {:?}", dir),
            StashError::BadSize => write!(f, "Storage size must be greater than zero"),
            StashError::BadCap => write!(f, "Entry capacity must be greater than zero"),
            StashError::NotFound(key) => write!(f, "Not found: {}", key),
            StashError::ChunkNotFound { file, offset } => {
                write!(f, "Chunk not found: {} at offset {}", file, offset)
            }
            StashError::AlreadyTagged(key) => {
                write!(f, "Entry already tagged with a different value: {}", key)
            }
            StashError::IncoherentTag(file) => {
                write!(f, "Tag conflicts with the common tag of {}", file)
            }
            StashError::Untagged(key) => write!(f, "Chunk is not tagged yet: {}", key),
            StashError::TooLarge { key, size, max } => write!(
                f,
                "Entry {} is too large: {} bytes exceeds storage size {}",
                key, size, max
            ),
            StashError::InsufficientSpace { key, needed } => write!(
                f,
                "Not enough space for {}: {} bytes cannot be made available",
                key, needed
            ),
            StashError::Abandoned(key) => write!(f, "Write abandoned before completion: {}", key),
            StashError::File { dir, key, source } => {
                write!(f, "File error in {:?} for {}: {}", dir, key, source)
            }
        }
    }
}

impl std::error::Error for StashError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StashError::File { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StashError>;
