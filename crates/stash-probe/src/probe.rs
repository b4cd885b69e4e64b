//! Chunked ingest and read-back of local files

use crate::error::Result;
use blob_stash::{CacheStats, ChunkCache};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of probing one file
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub file: String,
    pub size: u64,
    pub chunks: usize,
    pub tag: String,
    pub verified: bool,
}

/// Printed once every file has been probed
#[derive(Debug, Serialize)]
pub struct Summary {
    pub files: Vec<FileReport>,
    pub tracked_files: usize,
    pub stats: CacheStats,
}

/// Hex SHA256 of a file's content, used as the common tag of its chunks
pub async fn content_tag(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Stream `path` into the cache in `chunk_size` pieces and commit them
pub async fn ingest_file(
    chunks: &ChunkCache,
    path: &Path,
    chunk_size: u64,
) -> Result<FileReport> {
    let name = path.display().to_string();
    let tag = content_tag(path).await?;
    let size = tokio::fs::metadata(path).await?.len();

    let mut file = File::open(path).await?;
    let mut offset = 0;
    while offset < size {
        let len = chunk_size.min(size - offset);
        let mut piece = (&mut file).take(len);
        chunks.put_reader(&name, offset as i64, &mut piece).await?;
        // an unchanged chunk is not read at all
        offset += len;
        file.seek(SeekFrom::Start(offset)).await?;
    }

    let tagged = chunks.set_untagged_chunks(&name, tag.as_bytes())?;
    let stored = chunks.num_chunks_of(&name)?;
    info!(file = %name, size, chunks = stored, tagged, "Ingested file");

    Ok(FileReport {
        file: name,
        size,
        chunks: stored,
        tag,
        verified: false,
    })
}

/// Read every chunk back in order and compare against the content tag
pub async fn verify_file(chunks: &ChunkCache, report: &FileReport) -> Result<bool> {
    let mut hasher = Sha256::new();
    let mut offset = 0;
    let mut data = Vec::new();
    while offset < report.size {
        let (mut reader, len) = chunks.get(&report.file, offset as i64).await?;
        data.clear();
        reader.read_to_end(&mut data).await?;
        hasher.update(&data);
        debug!(file = %report.file, offset, len, "Read chunk");
        if len == 0 {
            break;
        }
        offset += len;
    }
    Ok(hex::encode(hasher.finalize()) == report.tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use blob_stash::StashConfig;
    use tempfile::tempdir;

    const CONTENT: &[u8] =
        b"The Go gopher is an iconic mascot and one of the most distinctive features.";

    #[tokio::test]
    async fn test_content_tag_is_sha256() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gopher.txt");
        std::fs::write(&path, CONTENT).unwrap();

        let tag = content_tag(&path).await.unwrap();
        assert_eq!(tag, hex::encode(Sha256::digest(CONTENT)));
    }

    #[tokio::test]
    async fn test_ingest_and_verify() {
        let input = tempdir().unwrap();
        let path = input.path().join("gopher.txt");
        std::fs::write(&path, CONTENT).unwrap();

        let stash = tempdir().unwrap();
        let config = StashConfig::new(stash.path(), 4096, 100).with_block_size(8);
        let chunks = ChunkCache::from_config(&config).unwrap();

        let report = ingest_file(&chunks, &path, 16).await.unwrap();
        assert_eq!(report.size, CONTENT.len() as u64);
        assert_eq!(report.chunks, 5);
        assert_eq!(chunks.num_total_chunks(), 5);
        assert_eq!(
            chunks.get_common_tag(&report.file).unwrap(),
            Some(report.tag.clone().into_bytes())
        );

        assert!(verify_file(&chunks, &report).await.unwrap());

        // ingesting the same file again ends in the same state
        let again = ingest_file(&chunks, &path, 16).await.unwrap();
        assert_eq!(again.chunks, 5);
        assert_eq!(chunks.size(), CONTENT.len() as u64);
    }

    #[tokio::test]
    async fn test_verify_fails_after_eviction() {
        let input = tempdir().unwrap();
        let path = input.path().join("gopher.txt");
        std::fs::write(&path, CONTENT).unwrap();

        // room for only two chunks
        let stash = tempdir().unwrap();
        let chunks = ChunkCache::new(stash.path(), 4096, 2).unwrap();

        let report = ingest_file(&chunks, &path, 16).await.unwrap();
        assert_eq!(report.chunks, 2);
        assert!(verify_file(&chunks, &report).await.is_err());
    }
}
