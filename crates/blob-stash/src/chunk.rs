//! Chunked files on top of [`BlobCache`]
//!
//! A logical file is stored as independent chunks, one cache entry per
//! offset. The chunk layer tracks which offsets it believes are present and
//! the tag all chunks of a file agree on. Eviction in the underlying cache is
//! invisible here, so stale offsets are dropped lazily whenever a lookup
//! misses, or in bulk by [`ChunkCache::shrink`].

use crate::cache::{Blob, BlobCache};
use crate::error::{Result, StashError};
use crate::types::{CacheStats, StashConfig, Tag};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tracing::debug;

/// Cache key of the chunk at `offset` of `file`
fn chunk_key(file: &str, offset: i64) -> String {
    format!("{}#{}", file, offset)
}

struct FileEntry {
    offsets: BTreeSet<i64>,
    common_tag: Option<Tag>,
    /// Number of puts in flight for this file
    pending: Arc<watch::Sender<usize>>,
}

impl FileEntry {
    fn new() -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            offsets: BTreeSet::new(),
            common_tag: None,
            pending: Arc::new(pending),
        }
    }

    fn is_idle(&self) -> bool {
        *self.pending.borrow() == 0
    }
}

type Files = HashMap<String, FileEntry>;

/// Drop a file's bookkeeping once it tracks nothing and no put is running
fn release_if_unused(files: &mut Files, file: &str) {
    if files
        .get(file)
        .is_some_and(|e| e.offsets.is_empty() && e.is_idle())
    {
        files.remove(file);
    }
}

/// Forget an offset whose cache entry is gone
fn forget_offset(files: &mut Files, file: &str, offset: i64) -> bool {
    let removed = files
        .get_mut(file)
        .is_some_and(|e| e.offsets.remove(&offset));
    release_if_unused(files, file);
    removed
}

/// Marks a put in flight for [`ChunkCache::wait_put`] until dropped
struct InFlight<'a> {
    files: &'a Mutex<Files>,
    file: String,
    pending: Arc<watch::Sender<usize>>,
}

impl<'a> InFlight<'a> {
    fn start(files: &'a Mutex<Files>, file: &str) -> Self {
        let mut guard = files.lock();
        let entry = guard.entry(file.to_string()).or_insert_with(FileEntry::new);
        entry.pending.send_modify(|n| *n += 1);
        Self {
            files,
            file: file.to_string(),
            pending: entry.pending.clone(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut files = self.files.lock();
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
        let same_entry = files
            .get(&self.file)
            .is_some_and(|e| Arc::ptr_eq(&e.pending, &self.pending));
        if same_entry {
            release_if_unused(&mut files, &self.file);
        }
    }
}

/// Cache of chunked files sharing one [`BlobCache`]
pub struct ChunkCache {
    store: BlobCache,
    files: Mutex<Files>,
}

impl ChunkCache {
    pub fn new(dir: impl Into<PathBuf>, max_size: u64, max_entries: usize) -> Result<Self> {
        Ok(Self::with_store(BlobCache::new(
            dir,
            max_size,
            max_entries,
        )?))
    }

    pub fn from_config(config: &StashConfig) -> Result<Self> {
        Ok(Self::with_store(BlobCache::from_config(config)?))
    }

    pub fn with_store(store: BlobCache) -> Self {
        Self {
            store,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying blob cache
    pub fn store(&self) -> &BlobCache {
        &self.store
    }

    pub async fn put(&self, file: &str, offset: i64, content: &[u8]) -> Result<()> {
        self.put_with_tag(file, offset, None, content).await
    }

    /// Store one chunk; a tag also settles the file's common tag
    pub async fn put_with_tag(
        &self,
        file: &str,
        offset: i64,
        tag: Option<&[u8]>,
        content: &[u8],
    ) -> Result<()> {
        let _in_flight = InFlight::start(&self.files, file);
        self.store
            .put_with_tag(&chunk_key(file, offset), tag, content)
            .await?;
        self.commit(file, offset, tag)
    }

    pub async fn put_reader<R>(
        &self,
        file: &str,
        offset: i64,
        reader: &mut R,
    ) -> Result<Option<u64>>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        self.put_reader_with_tag(file, offset, None, reader).await
    }

    /// Stream one chunk into the cache, see [`BlobCache::put_reader_with_tag`]
    pub async fn put_reader_with_tag<R>(
        &self,
        file: &str,
        offset: i64,
        tag: Option<&[u8]>,
        reader: &mut R,
    ) -> Result<Option<u64>>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let _in_flight = InFlight::start(&self.files, file);
        let stored = self
            .store
            .put_reader_with_tag(&chunk_key(file, offset), tag, reader)
            .await?;
        self.commit(file, offset, tag)?;
        Ok(stored)
    }

    /// Wait until no put is in flight for `file`
    pub async fn wait_put(&self, file: &str) {
        let mut rx = {
            let files = self.files.lock();
            match files.get(file) {
                Some(entry) => entry.pending.subscribe(),
                None => return,
            }
        };
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Open a committed chunk; untagged chunks are not readable yet
    pub async fn get(&self, file: &str, offset: i64) -> Result<(File, u64)> {
        let blob = self.get_with_tag(file, offset).await?;
        if blob.tag.is_none() {
            return Err(StashError::Untagged(chunk_key(file, offset)));
        }
        Ok((blob.reader, blob.size))
    }

    pub async fn get_with_tag(&self, file: &str, offset: i64) -> Result<Blob> {
        match self.store.get_with_tag(&chunk_key(file, offset)).await {
            Ok(blob) => Ok(blob),
            Err(e) if e.is_not_found() => Err(self.reconcile_miss(file, offset)),
            Err(e) => Err(e),
        }
    }

    pub fn get_tag(&self, file: &str, offset: i64) -> Result<Option<Tag>> {
        let mut files = self.files.lock();
        if !files.contains_key(file) {
            return Err(StashError::NotFound(file.to_string()));
        }
        match self.store.get_tag(&chunk_key(file, offset)) {
            Err(e) if e.is_not_found() => {
                forget_offset(&mut files, file, offset);
                Err(StashError::ChunkNotFound {
                    file: file.to_string(),
                    offset,
                })
            }
            result => result,
        }
    }

    pub fn get_common_tag(&self, file: &str) -> Result<Option<Tag>> {
        let files = self.files.lock();
        files
            .get(file)
            .map(|e| e.common_tag.clone())
            .ok_or_else(|| StashError::NotFound(file.to_string()))
    }

    /// Tag one chunk and purge the chunks of `file` that disagree with it
    pub fn set_tag(&self, file: &str, offset: i64, tag: &[u8]) -> Result<()> {
        let mut files = self.files.lock();
        self.tag_chunk(&mut files, file, offset, tag)
    }

    /// Tag every untagged chunk of `file`, returning how many were tagged
    pub fn set_untagged_chunks(&self, file: &str, tag: &[u8]) -> Result<usize> {
        let mut files = self.files.lock();
        let entry = files
            .get(file)
            .ok_or_else(|| StashError::NotFound(file.to_string()))?;
        if entry.common_tag.as_deref().is_some_and(|t| t != tag) {
            return Err(StashError::IncoherentTag(file.to_string()));
        }

        // Check every chunk before tagging any, so a conflict changes nothing
        let offsets: Vec<i64> = entry.offsets.iter().copied().collect();
        let mut untagged = Vec::new();
        let mut stale = Vec::new();
        let mut coherent = true;
        for offset in offsets {
            match self.store.get_tag(&chunk_key(file, offset)) {
                Ok(None) => untagged.push(offset),
                Ok(Some(current)) => coherent &= current == tag,
                Err(e) if e.is_not_found() => stale.push(offset),
                Err(e) => return Err(e),
            }
        }
        for offset in stale {
            forget_offset(&mut files, file, offset);
        }
        if !coherent {
            return Err(StashError::IncoherentTag(file.to_string()));
        }

        let mut tagged = 0;
        for offset in untagged {
            match self.store.set_tag(&chunk_key(file, offset), tag) {
                Ok(()) => tagged += 1,
                Err(e) if e.is_not_found() => {
                    forget_offset(&mut files, file, offset);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(entry) = files.get_mut(file) {
            entry.common_tag = Some(tag.to_vec());
        }
        debug!(file, tagged, "Tagged untagged chunks");
        Ok(tagged)
    }

    /// Delete every chunk of `file`
    pub fn delete(&self, file: &str) -> Result<()> {
        let mut files = self.files.lock();
        let entry = files
            .get_mut(file)
            .ok_or_else(|| StashError::NotFound(file.to_string()))?;
        let offsets = std::mem::take(&mut entry.offsets);
        release_if_unused(&mut files, file);

        let mut result = Ok(());
        for offset in offsets {
            match self.store.delete(&chunk_key(file, offset)) {
                Err(e) if !e.is_not_found() => result = Err(e),
                _ => {}
            }
        }
        result
    }

    pub fn delete_chunk(&self, file: &str, offset: i64) -> Result<()> {
        let mut files = self.files.lock();
        if !files.contains_key(file) {
            return Err(StashError::NotFound(file.to_string()));
        }
        let chunk_missing = || StashError::ChunkNotFound {
            file: file.to_string(),
            offset,
        };
        if !forget_offset(&mut files, file, offset) {
            return Err(chunk_missing());
        }
        match self.store.delete(&chunk_key(file, offset)) {
            Err(e) if e.is_not_found() => Err(chunk_missing()),
            result => result,
        }
    }

    /// Drop every offset whose cache entry has gone, and files left empty
    pub fn shrink(&self) {
        let mut files = self.files.lock();
        let mut dropped = 0;
        for (file, entry) in files.iter_mut() {
            entry.offsets.retain(|&offset| {
                let present = self.store.get_tag(&chunk_key(file, offset)).is_ok();
                if !present {
                    dropped += 1;
                }
                present
            });
        }
        files.retain(|_, e| !e.offsets.is_empty() || !e.is_idle());
        debug!(dropped, files = files.len(), "Shrunk chunk bookkeeping");
    }

    pub fn num_chunks_of(&self, file: &str) -> Result<usize> {
        let files = self.files.lock();
        files
            .get(file)
            .map(|e| e.offsets.len())
            .ok_or_else(|| StashError::NotFound(file.to_string()))
    }

    /// Number of tracked files
    pub fn num_entries(&self) -> usize {
        self.files.lock().len()
    }

    /// Number of chunks held by the underlying cache
    pub fn num_total_chunks(&self) -> usize {
        self.store.len()
    }

    pub fn size(&self) -> u64 {
        self.store.size()
    }

    /// Chunk keys held by the underlying cache, sorted
    pub fn keys(&self) -> Vec<String> {
        self.store.keys()
    }

    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    pub fn reset_stats(&self) {
        self.store.reset_stats();
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn clear(&self) -> Result<()> {
        let mut files = self.files.lock();
        self.store.clear()?;
        files.clear();
        Ok(())
    }

    /// Record a stored chunk and settle its tag
    fn commit(&self, file: &str, offset: i64, tag: Option<&[u8]>) -> Result<()> {
        let mut files = self.files.lock();
        files
            .entry(file.to_string())
            .or_insert_with(FileEntry::new)
            .offsets
            .insert(offset);
        match tag {
            Some(tag) => self.tag_chunk(&mut files, file, offset, tag),
            None => Ok(()),
        }
    }

    /// Drop a missed offset and pick the error the caller sees
    fn reconcile_miss(&self, file: &str, offset: i64) -> StashError {
        let mut files = self.files.lock();
        if !files.contains_key(file) {
            return StashError::NotFound(file.to_string());
        }
        forget_offset(&mut files, file, offset);
        StashError::ChunkNotFound {
            file: file.to_string(),
            offset,
        }
    }

    /// Tag the chunk at `offset`, make `tag` the file's common tag and
    /// delete every other chunk of the file not carrying it
    fn tag_chunk(&self, files: &mut Files, file: &str, offset: i64, tag: &[u8]) -> Result<()> {
        let chunk_missing = || StashError::ChunkNotFound {
            file: file.to_string(),
            offset,
        };
        let entry = files
            .get(file)
            .ok_or_else(|| StashError::NotFound(file.to_string()))?;
        if !entry.offsets.contains(&offset) {
            return Err(chunk_missing());
        }

        let key = chunk_key(file, offset);
        match self.store.get_tag(&key) {
            Ok(None) => self.store.set_tag(&key, tag)?,
            Ok(Some(current)) if current == tag => {}
            Ok(Some(_)) => return Err(StashError::AlreadyTagged(key)),
            Err(e) if e.is_not_found() => {
                forget_offset(files, file, offset);
                return Err(chunk_missing());
            }
            Err(e) => return Err(e),
        }

        let Some(entry) = files.get_mut(file) else {
            return Ok(());
        };
        entry.common_tag = Some(tag.to_vec());

        let others: Vec<i64> = entry
            .offsets
            .iter()
            .copied()
            .filter(|&o| o != offset)
            .collect();
        for other in others {
            let purged = match self
                .store
                .delete_if(&chunk_key(file, other), |t| t != Some(tag))
            {
                Ok(removed) => removed,
                Err(e) if e.is_not_found() => true,
                Err(e) => return Err(e),
            };
            if purged {
                entry.offsets.remove(&other);
                debug!(file, offset = other, "Purged chunk with a stale tag");
            }
        }
        Ok(())
    }
}
