//! Staged writes and atomic publication
//!
//! Content is first written to a staging file in the cache directory and then
//! renamed over the entry's final path. A staging file that is never
//! published is removed when its [`StagedFile`] goes away.
//!
//! These operations run inside the cache's write task, never directly in a
//! caller's future, so every filesystem call completes before its cleanup
//! runs.

use crate::error::{Result, StashError};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// A staging file awaiting publication
#[derive(Debug)]
pub(crate) struct StagedFile {
    path: PathBuf,
    size: u64,
    armed: bool,
}

impl StagedFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            size: 0,
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = ?self.path, error = %e, "Failed to remove staging file");
            }
        }
    }
}

/// An open staging file being filled block by block
pub(crate) struct StagingFile {
    staged: StagedFile,
    file: fs::File,
    dir: PathBuf,
    key: String,
}

impl StagingFile {
    /// Create the staging file at `path`; it is removed again on any failure
    pub async fn create(dir: &Path, key: &str, path: PathBuf) -> Result<Self> {
        let staged = StagedFile::new(path);
        let file = fs::File::create(staged.path())
            .await
            .map_err(|e| StashError::file(dir, key, e))?;
        Ok(Self {
            staged,
            file,
            dir: dir.to_path_buf(),
            key: key.to_string(),
        })
    }

    pub async fn write(&mut self, block: &[u8]) -> Result<()> {
        self.file
            .write_all(block)
            .await
            .map_err(|e| StashError::file(&self.dir, &self.key, e))?;
        self.staged.size += block.len() as u64;
        Ok(())
    }

    /// Flush and sync the content, leaving the file ready to publish
    pub async fn finish(mut self) -> Result<StagedFile> {
        self.file
            .flush()
            .await
            .map_err(|e| StashError::file(&self.dir, &self.key, e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| StashError::file(&self.dir, &self.key, e))?;

        debug!(key = %self.key, size = self.staged.size, "Staged content");
        Ok(self.staged)
    }
}

/// Atomically move a staged file to its final path
pub(crate) async fn publish(
    dir: &Path,
    key: &str,
    mut staged: StagedFile,
    final_path: &Path,
) -> Result<u64> {
    fs::rename(staged.path(), final_path)
        .await
        .map_err(|e| StashError::file(dir, key, e))?;
    staged.armed = false;
    Ok(staged.size())
}

/// Read until `buf` is full or the reader is exhausted
pub(crate) async fn fill_block<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Pool of reusable fixed-size copy buffers
///
/// Buffers travel to the write task by value and come back through
/// [`BufferPool::give`] once their block is on disk.
#[derive(Debug)]
pub(crate) struct BufferPool {
    block_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(block_size: usize, max_idle: usize) -> Self {
        Self {
            block_size,
            max_idle,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// A buffer of exactly one block
    pub fn take(&self) -> Vec<u8> {
        let mut buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.block_size]);
        buf.resize(self.block_size, 0);
        buf
    }

    /// Return a buffer; odd-sized or surplus buffers are dropped
    pub fn give(&self, buf: Vec<u8>) {
        if buf.capacity() < self.block_size || buf.capacity() > 2 * self.block_size {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}
