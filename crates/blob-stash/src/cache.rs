//! Disk-backed blob cache with LRU eviction and write-once tags
//!
//! Every entry owns one file in the cache directory, named after the
//! fingerprint of its key. The in-memory index, recency order and accounting
//! sit behind a single short lock that is never held across an `.await`.
//!
//! A put registers a Busy entry and hands its content, block by block, to a
//! spawned write task. That task stages the blocks, renames the staging file
//! into place and admits the entry, or removes everything it wrote. Dropping
//! the put only marks the entry discarded, so no file is ever created or
//! renamed after its cleanup has run. Readers of a Busy key wait on the
//! entry's status channel until it turns Ready or Deleted.

use crate::error::{Result, StashError};
use crate::naming;
use crate::recency::{Handle, RecencyList};
use crate::types::{CacheStats, EntryInfo, EntryStatus, StashConfig, Tag};
use crate::writer::{self, BufferPool, StagingFile};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MAX_IDLE_BUFFERS: usize = 8;

/// Blocks queued between a put and its write task
const WRITE_QUEUE_DEPTH: usize = 2;

/// A cached blob opened for reading
#[derive(Debug)]
pub struct Blob {
    pub reader: File,
    pub tag: Option<Tag>,
    pub size: u64,
}

struct Slot {
    id: u64,
    key: String,
    path: PathBuf,
    /// Staging file of the write that owns a Busy entry
    staging: PathBuf,
    size: u64,
    tag: Option<Tag>,
    status: EntryStatus,
    stored_at: DateTime<Utc>,
    /// Bytes claimed so far by an in-flight streaming write
    reserved: u64,
    /// Deleted or abandoned while Busy; the write task removes its files
    discarded: bool,
    signal: watch::Sender<EntryStatus>,
}

impl Slot {
    fn info(&self) -> EntryInfo {
        EntryInfo {
            key: self.key.clone(),
            size: self.size,
            path: self.path.clone(),
            tag: self.tag.clone(),
            status: self.status,
            stored_at: self.stored_at,
        }
    }
}

struct State {
    entries: RecencyList<Slot>,
    index: HashMap<String, Handle>,
    /// Sum of sizes of Ready entries
    size: u64,
    /// Number of Ready entries
    count: usize,
    /// Sum of outstanding streaming reservations
    reserved: u64,
    hits: u64,
    misses: u64,
    next_id: u64,
}

impl State {
    fn new() -> Self {
        Self {
            entries: RecencyList::new(),
            index: HashMap::new(),
            size: 0,
            count: 0,
            reserved: 0,
            hits: 0,
            misses: 0,
            next_id: 0,
        }
    }

    /// Handle of a visible entry; discarded in-flight writes are hidden
    fn live(&self, key: &str) -> Option<Handle> {
        let handle = *self.index.get(key)?;
        match self.entries.get(handle) {
            Some(slot) if !slot.discarded => Some(handle),
            _ => None,
        }
    }

    fn live_mut(&mut self, key: &str) -> Option<&mut Slot> {
        let handle = self.live(key)?;
        self.entries.get_mut(handle)
    }

    fn slot(&self, handle: Handle, id: u64) -> Option<&Slot> {
        self.entries.get(handle).filter(|s| s.id == id)
    }

    fn slot_mut(&mut self, handle: Handle, id: u64) -> Option<&mut Slot> {
        self.entries.get_mut(handle).filter(|s| s.id == id)
    }

    fn register(&mut self, key: &str, dir: &Path, tag: Option<&[u8]>) -> Ticket {
        self.next_id += 1;
        let id = self.next_id;
        let path = naming::entry_path(dir, key);
        let staging = naming::staging_path(dir);
        let (signal, _) = watch::channel(EntryStatus::Busy);
        let handle = self.entries.insert(Slot {
            id,
            key: key.to_string(),
            path: path.clone(),
            staging: staging.clone(),
            size: 0,
            tag: tag.map(|t| t.to_vec()),
            status: EntryStatus::Busy,
            stored_at: Utc::now(),
            reserved: 0,
            discarded: false,
            signal,
        });
        self.index.insert(key.to_string(), handle);
        Ticket {
            key: key.to_string(),
            path,
            staging,
            handle,
            id,
        }
    }

    /// Drop an entry from the index and accounting and wake its waiters.
    /// The entry's file is left to the caller.
    fn remove_slot(&mut self, handle: Handle) -> Option<Slot> {
        let mut slot = self.entries.remove(handle)?;
        if self.index.get(&slot.key) == Some(&handle) {
            self.index.remove(&slot.key);
        }
        if slot.status == EntryStatus::Ready {
            self.size = self.size.saturating_sub(slot.size);
            self.count = self.count.saturating_sub(1);
        }
        self.reserved = self.reserved.saturating_sub(slot.reserved);
        slot.status = EntryStatus::Deleted;
        slot.signal.send_replace(EntryStatus::Deleted);
        Some(slot)
    }

    /// Evict the least recently used Ready entry; false when nothing is left
    fn evict_tail(&mut self, dir: &Path) -> Result<bool> {
        let Some(handle) = self.entries.back() else {
            return Ok(false);
        };
        if let Some(slot) = self.entries.get(handle) {
            unlink(&slot.path).map_err(|e| StashError::file(dir, slot.key.clone(), e))?;
        }
        if let Some(slot) = self.remove_slot(handle) {
            debug!(key = %slot.key, size = slot.size, "Evicted least recently used entry");
        }
        Ok(true)
    }
}

/// Identity of one Busy entry and the files its write task may touch
#[derive(Debug, Clone)]
struct Ticket {
    key: String,
    path: PathBuf,
    staging: PathBuf,
    handle: Handle,
    id: u64,
}

enum Block {
    Data(Vec<u8>),
    End,
}

/// Shared by the cache handle and every running write task
struct Inner {
    dir: PathBuf,
    max_size: u64,
    max_entries: usize,
    state: Mutex<State>,
    buffers: BufferPool,
}

impl Inner {
    /// Make room for `size` bytes and one entry, then mark the entry Ready
    fn admit(&self, state: &mut State, ticket: &Ticket, size: u64) -> Result<()> {
        let (discarded, reserved) = match state.slot(ticket.handle, ticket.id) {
            Some(slot) => (slot.discarded, slot.reserved),
            None => return Err(StashError::NotFound(ticket.key.clone())),
        };
        if discarded {
            debug!(key = %ticket.key, "Entry deleted while being written");
            return Err(StashError::NotFound(ticket.key.clone()));
        }

        // The reservation turns into accounted size below
        state.reserved = state.reserved.saturating_sub(reserved);
        if let Some(slot) = state.slot_mut(ticket.handle, ticket.id) {
            slot.reserved = 0;
        }

        if size > self.max_size {
            return Err(StashError::TooLarge {
                key: ticket.key.clone(),
                size,
                max: self.max_size,
            });
        }
        self.make_room(state, &ticket.key, size)?;
        while state.count >= self.max_entries {
            if !state.evict_tail(&self.dir)? {
                return Err(StashError::InsufficientSpace {
                    key: ticket.key.clone(),
                    needed: size,
                });
            }
        }

        if let Some(slot) = state.slot_mut(ticket.handle, ticket.id) {
            slot.size = size;
            slot.status = EntryStatus::Ready;
            slot.stored_at = Utc::now();
            slot.signal.send_replace(EntryStatus::Ready);
        }
        state.size += size;
        state.count += 1;
        state.entries.move_to_front(ticket.handle);
        Ok(())
    }

    /// Claim `n` more bytes for an in-flight streaming write
    fn reserve(&self, ticket: &Ticket, n: u64) -> Result<()> {
        let mut state = self.state.lock();
        let (reserved, discarded) = state
            .slot(ticket.handle, ticket.id)
            .map(|s| (s.reserved, s.discarded))
            .ok_or_else(|| StashError::NotFound(ticket.key.clone()))?;
        if discarded {
            return Err(StashError::NotFound(ticket.key.clone()));
        }

        let total = reserved + n;
        if total > self.max_size {
            return Err(StashError::TooLarge {
                key: ticket.key.clone(),
                size: total,
                max: self.max_size,
            });
        }
        self.make_room(&mut state, &ticket.key, n)?;

        state.reserved += n;
        if let Some(slot) = state.slot_mut(ticket.handle, ticket.id) {
            slot.reserved = total;
        }
        Ok(())
    }

    /// Evict from the tail until `incoming` more bytes fit next to the
    /// Ready entries and every outstanding reservation
    fn make_room(&self, state: &mut State, key: &str, incoming: u64) -> Result<()> {
        while state.size + state.reserved + incoming > self.max_size {
            if !state.evict_tail(&self.dir)? {
                return Err(StashError::InsufficientSpace {
                    key: key.to_string(),
                    needed: incoming,
                });
            }
        }
        Ok(())
    }

    /// Resolve an in-flight entry as Deleted and remove whatever it published
    fn abort(&self, state: &mut State, ticket: &Ticket) {
        if state.slot(ticket.handle, ticket.id).is_none() {
            return;
        }
        if let Err(e) = unlink(&ticket.path) {
            warn!(path = ?ticket.path, error = %e, "Failed to remove aborted entry file");
        }
        state.remove_slot(ticket.handle);
    }

    /// Delete a Ready entry now, or mark an in-flight one for discarding
    fn discard(&self, state: &mut State, handle: Handle) {
        let Some(slot) = state.entries.get_mut(handle) else {
            return;
        };
        if slot.status == EntryStatus::Busy {
            slot.discarded = true;
            return;
        }
        if let Err(e) = unlink(&slot.path) {
            warn!(key = %slot.key, error = %e, "Failed to remove cache file");
        }
        if let Some(slot) = state.remove_slot(handle) {
            debug!(key = %slot.key, "Deleted entry");
        }
    }
}

/// Write task of one put: stage the blocks, publish, admit.
///
/// Every file it creates is its own to remove, so the entry always ends up
/// either Ready or gone along with its files, whatever became of the put.
async fn run_write(
    inner: Arc<Inner>,
    ticket: Ticket,
    mut blocks: mpsc::Receiver<Block>,
) -> Result<u64> {
    let written = stage_blocks(&inner, &ticket, &mut blocks).await;

    let mut state = inner.state.lock();
    let admitted = written.and_then(|size| {
        inner.admit(&mut state, &ticket, size)?;
        Ok(size)
    });
    if admitted.is_err() {
        inner.abort(&mut state, &ticket);
    }
    admitted
}

async fn stage_blocks(
    inner: &Inner,
    ticket: &Ticket,
    blocks: &mut mpsc::Receiver<Block>,
) -> Result<u64> {
    let path = ticket.staging.clone();
    let mut staging = StagingFile::create(&inner.dir, &ticket.key, path).await?;
    loop {
        match blocks.recv().await {
            Some(Block::Data(buf)) => {
                staging.write(&buf).await?;
                inner.buffers.give(buf);
            }
            Some(Block::End) => break,
            None => return Err(StashError::Abandoned(ticket.key.clone())),
        }
    }

    let staged = staging.finish().await?;
    writer::publish(&inner.dir, &ticket.key, staged, &ticket.path).await
}

/// Marks the entry of a put discarded when the put goes away before it has
/// collected its result; the write task then cleans up
struct AbandonGuard {
    inner: Arc<Inner>,
    key: String,
    handle: Handle,
    id: u64,
    armed: bool,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.state.lock();
        if let Some(slot) = state.slot_mut(self.handle, self.id) {
            slot.discarded = true;
            debug!(key = %self.key, "Abandoned put");
        }
    }
}

/// The caller's side of an in-flight put
struct PendingPut {
    ticket: Ticket,
    blocks: mpsc::Sender<Block>,
    task: JoinHandle<Result<u64>>,
    guard: AbandonGuard,
}

impl PendingPut {
    /// Hand a block to the write task; false once the task has stopped
    async fn send(&self, buf: Vec<u8>) -> bool {
        self.blocks.send(Block::Data(buf)).await.is_ok()
    }

    /// Close the content and wait for the entry to be admitted
    async fn finish(self) -> Result<u64> {
        let Self {
            ticket,
            blocks,
            task,
            mut guard,
        } = self;
        // A task that already stopped reports why through its result
        let _ = blocks.send(Block::End).await;
        drop(blocks);

        let result = task.await;
        guard.armed = false;
        result.unwrap_or_else(|_| Err(StashError::Abandoned(ticket.key)))
    }

    /// Stop feeding the write task and wait until it has cleaned up
    async fn abandon(self) {
        let Self {
            blocks,
            task,
            mut guard,
            ..
        } = self;
        drop(blocks);
        let _ = task.await;
        guard.armed = false;
    }
}

/// A disk-backed blob cache bounded by total bytes and entry count
pub struct BlobCache {
    inner: Arc<Inner>,
}

impl BlobCache {
    /// Create a cache over an existing directory, removing stale cache files
    pub fn new(dir: impl Into<PathBuf>, max_size: u64, max_entries: usize) -> Result<Self> {
        Self::from_config(&StashConfig::new(dir, max_size, max_entries))
    }

    pub fn from_config(config: &StashConfig) -> Result<Self> {
        let dir = config.cache_dir.clone();
        if dir.as_os_str().is_empty() || !dir.is_dir() {
            return Err(StashError::BadDir(dir));
        }
        if config.max_cache_size == 0 || config.block_size == 0 {
            return Err(StashError::BadSize);
        }
        if config.max_entries == 0 {
            return Err(StashError::BadCap);
        }

        let removed = sweep_dir(&dir, &HashSet::new())?;
        let inner = Inner {
            dir,
            max_size: config.max_cache_size,
            max_entries: config.max_entries,
            state: Mutex::new(State::new()),
            buffers: BufferPool::new(config.block_size, MAX_IDLE_BUFFERS),
        };
        info!(
            cache_dir = ?inner.dir,
            max_size = inner.max_size,
            max_entries = inner.max_entries,
            removed,
            "Cache initialized"
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn max_size(&self) -> u64 {
        self.inner.max_size
    }

    pub fn max_entries(&self) -> usize {
        self.inner.max_entries
    }

    /// Store a byte slice under `key`
    pub async fn put(&self, key: &str, content: &[u8]) -> Result<()> {
        self.put_with_tag(key, None, content).await
    }

    /// Store a byte slice along with a tag.
    ///
    /// A Ready entry already carrying the same tag is left untouched.
    pub async fn put_with_tag(
        &self,
        key: &str,
        tag: Option<&[u8]>,
        content: &[u8],
    ) -> Result<()> {
        let Some(pending) = self.begin_put(key, tag).await? else {
            return Ok(());
        };

        pending.send(content.to_vec()).await;
        let size = pending.finish().await?;

        debug!(key, size, "Cached blob");
        Ok(())
    }

    /// Stream a reader into the cache under `key`
    pub async fn put_reader<R>(&self, key: &str, reader: &mut R) -> Result<Option<u64>>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        self.put_reader_with_tag(key, None, reader).await
    }

    /// Stream a reader into the cache along with a tag.
    ///
    /// Capacity is claimed block by block while copying. Returns the number of
    /// bytes stored, or `None` when an equally tagged Ready entry was kept.
    pub async fn put_reader_with_tag<R>(
        &self,
        key: &str,
        tag: Option<&[u8]>,
        reader: &mut R,
    ) -> Result<Option<u64>>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let Some(pending) = self.begin_put(key, tag).await? else {
            return Ok(None);
        };

        match self.copy_blocks(&pending, reader).await {
            Ok(()) => {
                let size = pending.finish().await?;
                debug!(key, size, "Cached streamed blob");
                Ok(Some(size))
            }
            Err(e) => {
                pending.abandon().await;
                Err(e)
            }
        }
    }

    /// Open a cached blob for reading
    pub async fn get(&self, key: &str) -> Result<(File, u64)> {
        let blob = self.get_with_tag(key).await?;
        Ok((blob.reader, blob.size))
    }

    /// Open a cached blob along with its tag, waiting out an in-flight write
    pub async fn get_with_tag(&self, key: &str) -> Result<Blob> {
        loop {
            let mut rx = {
                let mut state = self.inner.state.lock();
                let Some(handle) = state.index.get(key).copied() else {
                    state.misses += 1;
                    debug!(key, "Cache miss");
                    return Err(StashError::NotFound(key.to_string()));
                };
                let Some(slot) = state.entries.get(handle) else {
                    state.misses += 1;
                    return Err(StashError::NotFound(key.to_string()));
                };

                if slot.status != EntryStatus::Ready {
                    slot.signal.subscribe()
                } else {
                    let file = std::fs::File::open(&slot.path)
                        .map_err(|e| StashError::file(&self.inner.dir, key, e))?;
                    let blob = Blob {
                        reader: File::from_std(file),
                        tag: slot.tag.clone(),
                        size: slot.size,
                    };
                    state.hits += 1;
                    state.entries.move_to_front(handle);
                    debug!(key, "Cache hit");
                    return Ok(blob);
                }
            };

            let resolved = rx
                .wait_for(|s| *s != EntryStatus::Busy)
                .await
                .map(|s| *s)
                .unwrap_or(EntryStatus::Deleted);

            if resolved == EntryStatus::Deleted {
                self.inner.state.lock().misses += 1;
                debug!(key, "Cache miss after pending write was dropped");
                return Err(StashError::NotFound(key.to_string()));
            }
        }
    }

    /// Tag an entry; tags are write-once
    pub fn set_tag(&self, key: &str, tag: &[u8]) -> Result<()> {
        let mut state = self.inner.state.lock();
        let slot = state
            .live_mut(key)
            .ok_or_else(|| StashError::NotFound(key.to_string()))?;

        match &slot.tag {
            None => {
                slot.tag = Some(tag.to_vec());
                Ok(())
            }
            Some(current) if current.as_slice() == tag => Ok(()),
            Some(_) => Err(StashError::AlreadyTagged(key.to_string())),
        }
    }

    pub fn get_tag(&self, key: &str) -> Result<Option<Tag>> {
        let state = self.inner.state.lock();
        let tag = state
            .live(key)
            .and_then(|h| state.entries.get(h))
            .map(|slot| slot.tag.clone())
            .ok_or_else(|| StashError::NotFound(key.to_string()))?;
        Ok(tag)
    }

    /// Delete `key` only when `remove` holds for its current tag
    pub fn delete_if<F>(&self, key: &str, remove: F) -> Result<bool>
    where
        F: FnOnce(Option<&[u8]>) -> bool,
    {
        let mut state = self.inner.state.lock();
        let handle = state
            .live(key)
            .ok_or_else(|| StashError::NotFound(key.to_string()))?;
        let tag = state.entries.get(handle).and_then(|s| s.tag.as_deref());
        if !remove(tag) {
            return Ok(false);
        }
        self.inner.discard(&mut state, handle);
        Ok(true)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        let handle = state
            .live(key)
            .ok_or_else(|| StashError::NotFound(key.to_string()))?;
        self.inner.discard(&mut state, handle);
        Ok(())
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        CacheStats {
            entries: state.count,
            total_size: state.size,
            hits: state.hits,
            misses: state.misses,
        }
    }

    /// Zero the hit and miss counters
    pub fn reset_stats(&self) {
        let mut state = self.inner.state.lock();
        state.hits = 0;
        state.misses = 0;
    }

    /// Keys of Ready entries, sorted
    pub fn keys(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut keys: Vec<String> = state.entries.iter().map(|(_, s)| s.key.clone()).collect();
        keys.sort();
        keys
    }

    /// Number of Ready entries
    pub fn len(&self) -> usize {
        self.inner.state.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes held by Ready entries
    pub fn size(&self) -> u64 {
        self.inner.state.lock().size
    }

    /// Bytes currently claimed by in-flight streaming writes
    pub fn reserved_size(&self) -> u64 {
        self.inner.state.lock().reserved
    }

    /// Number of write tasks still running, abandoned ones included
    pub fn in_flight(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .entries
            .iter_all()
            .filter(|(_, s)| s.status == EntryStatus::Busy)
            .count()
    }

    /// Snapshot of every visible entry: Ready ones from most to least
    /// recently used, then in-flight ones
    pub fn entries(&self) -> Vec<EntryInfo> {
        let state = self.inner.state.lock();
        let mut entries = Vec::with_capacity(state.entries.len());
        entries.extend(state.entries.iter().map(|(_, s)| s.info()));
        let busy = state
            .entries
            .iter_all()
            .filter(|(_, s)| s.status == EntryStatus::Busy && !s.discarded)
            .map(|(_, s)| s.info());
        entries.extend(busy);
        entries
    }

    /// Drop every entry, reset all counters and delete the cache files
    pub fn clear(&self) -> Result<()> {
        let mut state = self.inner.state.lock();

        let mut writing = HashSet::new();
        let handles: Vec<Handle> = state.entries.iter_all().map(|(h, _)| h).collect();
        for handle in handles {
            let Some(slot) = state.entries.get_mut(handle) else {
                continue;
            };
            if slot.status == EntryStatus::Busy {
                slot.discarded = true;
                writing.insert(slot.staging.clone());
            } else {
                state.remove_slot(handle);
            }
        }
        state.size = 0;
        state.count = 0;
        state.hits = 0;
        state.misses = 0;

        // Swept under the lock so no put registered afterwards can lose its
        // file. Running writes remove their own staging files.
        let removed = sweep_dir(&self.inner.dir, &writing)?;
        info!(cache_dir = ?self.inner.dir, removed, "Cache cleared");
        Ok(())
    }

    /// Register a Busy entry for `key` and start its write task, or return
    /// `None` if an equally tagged Ready entry already exists. Waits out any
    /// write already in flight.
    async fn begin_put(&self, key: &str, tag: Option<&[u8]>) -> Result<Option<PendingPut>> {
        loop {
            let mut rx = {
                let mut state = self.inner.state.lock();
                let current = state.index.get(key).copied();

                match current.and_then(|h| state.entries.get(h).map(|s| (h, s))) {
                    Some((_, slot)) if slot.status == EntryStatus::Busy => slot.signal.subscribe(),
                    Some((_, slot)) if slot.tag.as_deref() == tag => {
                        debug!(key, "Entry unchanged, skipping write");
                        return Ok(None);
                    }
                    previous => {
                        if let Some((handle, slot)) = previous {
                            unlink(&slot.path)
                                .map_err(|e| StashError::file(&self.inner.dir, key, e))?;
                            state.remove_slot(handle);
                        }
                        let ticket = state.register(key, &self.inner.dir, tag);
                        return Ok(Some(self.spawn_write(ticket)));
                    }
                }
            };

            let _ = rx.wait_for(|s| *s != EntryStatus::Busy).await;
        }
    }

    fn spawn_write(&self, ticket: Ticket) -> PendingPut {
        let (blocks, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let task = tokio::spawn(run_write(self.inner.clone(), ticket.clone(), rx));
        let guard = AbandonGuard {
            inner: self.inner.clone(),
            key: ticket.key.clone(),
            handle: ticket.handle,
            id: ticket.id,
            armed: true,
        };
        PendingPut {
            ticket,
            blocks,
            task,
            guard,
        }
    }

    /// Feed `reader` to the write task, claiming capacity for every block
    /// before handing it over
    async fn copy_blocks<R>(&self, pending: &PendingPut, reader: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let ticket = &pending.ticket;
        loop {
            let mut buf = self.inner.buffers.take();
            let n = writer::fill_block(reader, &mut buf)
                .await
                .map_err(|e| StashError::file(self.dir(), &ticket.key, e))?;
            if n == 0 {
                self.inner.buffers.give(buf);
                return Ok(());
            }

            self.inner.reserve(ticket, n as u64)?;
            buf.truncate(n);
            if !pending.send(buf).await {
                return Ok(());
            }
        }
    }
}

/// Remove a file, treating an already missing file as success
fn unlink(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Best-effort removal of managed files other than `keep`; unrelated files
/// are left alone
fn sweep_dir(dir: &Path, keep: &HashSet<PathBuf>) -> Result<usize> {
    let entries = std::fs::read_dir(dir).map_err(|e| StashError::file(dir, "", e))?;
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let managed = naming::is_entry_file(&path) || naming::is_staging_file(&path);
        if !managed || keep.contains(&path) {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = ?path, error = %e, "Failed to remove stale cache file"),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const BLOBS: &[(&str, &[u8])] = &[
        (
            "gopher",
            b"The Go gopher is an iconic mascot and one of the most distinctive features.",
        ),
        (
            "io/ioutil",
            b"Package ioutil implements some I/O utility functions.",
        ),
        (
            "testing.go",
            b"Package testing provides support for automated testing.",
        ),
        ("empty.txt", b""),
        ("hello-world", b"Hello, world!"),
        ("null", &[0]),
    ];

    fn new_cache(max_size: u64, max_entries: usize) -> (TempDir, BlobCache) {
        let dir = tempdir().unwrap();
        let cache = BlobCache::new(dir.path(), max_size, max_entries).unwrap();
        (dir, cache)
    }

    async fn read_all(key: &str, cache: &BlobCache) -> Vec<u8> {
        let (mut reader, size) = cache.get(key).await.unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.unwrap();
        assert_eq!(data.len() as u64, size);
        data
    }

    fn managed_files(dir: &Path) -> usize {
        entry_files(dir) + staging_files(dir)
    }

    fn entry_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .filter(|e| naming::is_entry_file(&e.path()))
            .count()
    }

    fn staging_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .filter(|e| naming::is_staging_file(&e.path()))
            .count()
    }

    fn assert_accounting(cache: &BlobCache) {
        let entries = cache.entries();
        let ready: Vec<_> = entries
            .iter()
            .filter(|e| e.status == EntryStatus::Ready)
            .collect();
        let stats = cache.stats();
        assert_eq!(stats.entries, ready.len());
        assert_eq!(stats.total_size, ready.iter().map(|e| e.size).sum::<u64>());
        assert!(stats.total_size <= cache.max_size());
        assert!(stats.entries <= cache.max_entries());
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..2500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_new_rejects_bad_arguments() {
        let dir = tempdir().unwrap();

        assert!(matches!(
            BlobCache::new("", 2048, 4),
            Err(StashError::BadDir(_))
        ));
        assert!(matches!(
            BlobCache::new(dir.path().join("missing"), 2048, 4),
            Err(StashError::BadDir(_))
        ));
        assert!(matches!(
            BlobCache::new(dir.path(), 0, 0),
            Err(StashError::BadSize)
        ));
        assert!(matches!(
            BlobCache::new(dir.path(), 2048, 0),
            Err(StashError::BadCap)
        ));
        let config = StashConfig::new(dir.path(), 2048, 4).with_block_size(0);
        assert!(matches!(
            BlobCache::from_config(&config),
            Err(StashError::BadSize)
        ));
    }

    #[tokio::test]
    async fn test_new_removes_stale_files_only() {
        let dir = tempdir().unwrap();
        std::fs::write(naming::entry_path(dir.path(), "old"), b"stale").unwrap();
        std::fs::write(naming::staging_path(dir.path()), b"half").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();

        let _cache = BlobCache::new(dir.path(), 2048, 4).unwrap();

        assert_eq!(managed_files(dir.path()), 0);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_put_writes_fingerprinted_files() {
        let (dir, cache) = new_cache(2_048_000, 40);
        for (k, b) in BLOBS {
            cache.put(k, b).await.unwrap();
        }

        for (k, b) in BLOBS {
            let on_disk = std::fs::read(naming::entry_path(dir.path(), k)).unwrap();
            assert_eq!(&on_disk, b);
            assert_eq!(read_all(k, &cache).await, *b);
        }
        assert_eq!(managed_files(dir.path()), BLOBS.len());
        assert_accounting(&cache);
    }

    #[tokio::test]
    async fn test_clear_removes_managed_files() {
        let (dir, cache) = new_cache(2_048_000, 40);
        std::fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();
        for (k, b) in BLOBS {
            cache.put(k, b).await.unwrap();
        }
        assert_eq!(cache.len(), BLOBS.len());
        assert_eq!(managed_files(dir.path()), BLOBS.len());

        cache.clear().unwrap();

        assert_eq!(managed_files(dir.path()), 0);
        assert!(dir.path().join("notes.txt").exists());
        assert!(cache.is_empty());
        assert_eq!(cache.stats(), CacheStats::default());
        assert!(cache.keys().is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_stats() {
        let (_dir, cache) = new_cache(2_048_000, 40);
        for (k, b) in BLOBS {
            cache.put(k, b).await.unwrap();
        }

        assert!(cache.get("missing").await.unwrap_err().is_not_found());
        let stats = cache.stats();
        assert_eq!(stats.entries, BLOBS.len());
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 1);

        cache.get("gopher").await.unwrap();
        cache.get("gopher").await.unwrap();
        assert_eq!(cache.stats().hits, 2);

        for (k, _) in BLOBS {
            cache.delete(k).unwrap();
        }
        assert!(cache.delete("missing").unwrap_err().is_not_found());
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_stats_scenario() {
        let (_dir, cache) = new_cache(2048, 40);
        cache.put("test", b"abcd").await.unwrap();
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 1,
                total_size: 4,
                hits: 0,
                misses: 0
            }
        );

        cache.get("test").await.unwrap();
        assert_eq!(cache.stats().hits, 1);

        assert!(cache.get("missing").await.is_err());
        assert_eq!(cache.stats().misses, 1);

        cache.reset_stats();
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 1,
                total_size: 4,
                hits: 0,
                misses: 0
            }
        );
    }

    #[tokio::test]
    async fn test_size_eviction() {
        let (_dir, cache) = new_cache(10, 40);

        cache.put("a", b"abcdefgh").await.unwrap();
        cache.put("b", b"ij").await.unwrap();
        assert_eq!(cache.keys(), vec!["a", "b"]);

        cache.put("c", b"k").await.unwrap();
        assert_eq!(cache.keys(), vec!["b", "c"]);

        cache.put("d", b"l").await.unwrap();
        assert_eq!(cache.keys(), vec!["b", "c", "d"]);

        cache.put("e", b"m").await.unwrap();
        assert_eq!(cache.keys(), vec!["b", "c", "d", "e"]);

        cache.put("f", b"nopqrstuvw").await.unwrap();
        assert_eq!(cache.keys(), vec!["f"]);
        assert_accounting(&cache);
    }

    #[tokio::test]
    async fn test_cap_eviction() {
        let (_dir, cache) = new_cache(2048, 3);

        cache.put("a", b"abcdefg").await.unwrap();
        cache.put("b", b"hi").await.unwrap();
        assert_eq!(cache.keys(), vec!["a", "b"]);

        cache.put("c", b"k").await.unwrap();
        assert_eq!(cache.keys(), vec!["a", "b", "c"]);

        cache.put("d", b"l").await.unwrap();
        assert_eq!(cache.keys(), vec!["b", "c", "d"]);

        cache.put("e", b"m").await.unwrap();
        assert_eq!(cache.keys(), vec!["c", "d", "e"]);

        cache.put("f", b"nopqrstuv").await.unwrap();
        assert_eq!(cache.keys(), vec!["d", "e", "f"]);
        assert_accounting(&cache);
    }

    #[tokio::test]
    async fn test_get_refreshes_recency() {
        let (_dir, cache) = new_cache(2048, 3);
        cache.put("a", b"1").await.unwrap();
        cache.put("b", b"2").await.unwrap();
        cache.put("c", b"3").await.unwrap();

        cache.get("a").await.unwrap();
        cache.put("d", b"4").await.unwrap();

        assert_eq!(cache.keys(), vec!["a", "c", "d"]);
        let order: Vec<String> = cache.entries().into_iter().map(|e| e.key).collect();
        assert_eq!(order, vec!["d", "a", "c"]);
    }

    #[tokio::test]
    async fn test_too_large_is_never_admitted() {
        let (dir, cache) = new_cache(10, 40);
        cache.put("small", b"abc").await.unwrap();

        let err = cache.put("big", b"0123456789A").await.unwrap_err();
        assert!(matches!(
            err,
            StashError::TooLarge {
                size: 11,
                max: 10,
                ..
            }
        ));

        assert_eq!(cache.keys(), vec!["small"]);
        assert!(cache.get("big").await.is_err());
        assert_eq!(managed_files(dir.path()), 1);
        assert_accounting(&cache);
    }

    #[tokio::test]
    async fn test_same_tag_put_is_noop() {
        let (_dir, cache) = new_cache(2048, 40);
        cache
            .put_with_tag("k", Some(&b"v1"[..]), b"first")
            .await
            .unwrap();
        let stored_at = cache.entries()[0].stored_at;

        cache
            .put_with_tag("k", Some(&b"v1"[..]), b"second")
            .await
            .unwrap();
        assert_eq!(read_all("k", &cache).await, b"first");
        assert_eq!(cache.entries()[0].stored_at, stored_at);

        // a different tag replaces the entry
        cache
            .put_with_tag("k", Some(&b"v2"[..]), b"second")
            .await
            .unwrap();
        let blob = cache.get_with_tag("k").await.unwrap();
        assert_eq!(blob.tag.as_deref(), Some(&b"v2"[..]));
        assert_eq!(blob.size, 6);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 6);
    }

    #[tokio::test]
    async fn test_tags_are_write_once() {
        let (_dir, cache) = new_cache(2048, 40);
        cache.put("k", b"content").await.unwrap();
        assert_eq!(cache.get_tag("k").unwrap(), None);

        cache.set_tag("k", b"T1").unwrap();
        cache.set_tag("k", b"T1").unwrap();
        assert!(matches!(
            cache.set_tag("k", b"T2"),
            Err(StashError::AlreadyTagged(_))
        ));
        assert_eq!(cache.get_tag("k").unwrap(), Some(b"T1".to_vec()));

        assert!(cache.set_tag("missing", b"T1").unwrap_err().is_not_found());
        assert!(cache.get_tag("missing").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_if() {
        let (dir, cache) = new_cache(2048, 40);
        cache
            .put_with_tag("k", Some(&b"keep"[..]), b"content")
            .await
            .unwrap();

        let removed = cache.delete_if("k", |t| t != Some(&b"keep"[..])).unwrap();
        assert!(!removed);
        assert_eq!(cache.keys(), vec!["k"]);

        let removed = cache.delete_if("k", |t| t == Some(&b"keep"[..])).unwrap();
        assert!(removed);
        assert!(cache.keys().is_empty());
        assert_eq!(managed_files(dir.path()), 0);

        assert!(cache.delete_if("k", |_| true).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_streaming_put() {
        let dir = tempdir().unwrap();
        let config = StashConfig::new(dir.path(), 2048, 40).with_block_size(4);
        let cache = BlobCache::from_config(&config).unwrap();

        let content = b"streamed across several blocks";
        let mut reader: &[u8] = content;
        let stored = cache.put_reader("s", &mut reader).await.unwrap();
        assert_eq!(stored, Some(content.len() as u64));
        assert_eq!(read_all("s", &cache).await, content);
        assert_eq!(cache.reserved_size(), 0);
        assert_eq!(cache.size(), content.len() as u64);

        let mut reader: &[u8] = content;
        assert_eq!(cache.put_reader("s", &mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_streaming_put_rejects_oversized_stream_early() {
        let dir = tempdir().unwrap();
        let config = StashConfig::new(dir.path(), 10, 40).with_block_size(4);
        let cache = BlobCache::from_config(&config).unwrap();
        cache.put("keep", b"xy").await.unwrap();

        // an endless stream fails after the first block past the limit
        let mut reader = tokio::io::repeat(b'z');
        let err = cache.put_reader("endless", &mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            StashError::TooLarge {
                size: 12,
                max: 10,
                ..
            }
        ));

        assert_eq!(cache.reserved_size(), 0);
        assert!(cache.get("endless").await.is_err());
        assert_eq!(cache.keys(), vec!["keep"]);
        assert_eq!(managed_files(dir.path()), 1);
        assert_accounting(&cache);
    }

    #[tokio::test]
    async fn test_get_waits_for_busy_entry() {
        let dir = tempdir().unwrap();
        let config = StashConfig::new(dir.path(), 2048, 40).with_block_size(4);
        let cache = Arc::new(BlobCache::from_config(&config).unwrap());
        let (mut tx, mut rx) = tokio::io::duplex(64);

        let writer = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.put_reader("slow", &mut rx).await })
        };
        tx.write_all(b"hello").await.unwrap();
        wait_until(|| {
            cache
                .entries()
                .iter()
                .any(|e| e.status == EntryStatus::Busy)
        })
        .await;

        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                let (mut file, _) = cache.get("slow").await?;
                let mut data = Vec::new();
                file.read_to_end(&mut data).await.unwrap();
                Ok::<_, StashError>(data)
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());
        assert!(cache.keys().is_empty());

        tx.write_all(b" world").await.unwrap();
        drop(tx);

        assert_eq!(writer.await.unwrap().unwrap(), Some(11));
        assert_eq!(reader.await.unwrap().unwrap(), b"hello world");
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_dropped_put_resolves_as_deleted() {
        let dir = tempdir().unwrap();
        let config = StashConfig::new(dir.path(), 2048, 40).with_block_size(4);
        let cache = Arc::new(BlobCache::from_config(&config).unwrap());
        let (mut tx, mut rx) = tokio::io::duplex(64);

        let writer = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.put_reader("slow", &mut rx).await })
        };
        tx.write_all(b"partial").await.unwrap();
        wait_until(|| cache.reserved_size() > 0).await;

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("slow").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        writer.abort();
        assert!(writer.await.unwrap_err().is_cancelled());

        assert!(waiter.await.unwrap().unwrap_err().is_not_found());
        assert!(cache.entries().is_empty());
        assert_eq!(cache.reserved_size(), 0);
        assert_eq!(managed_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_delete_while_busy_discards_write() {
        let dir = tempdir().unwrap();
        let config = StashConfig::new(dir.path(), 2048, 40).with_block_size(4);
        let cache = Arc::new(BlobCache::from_config(&config).unwrap());
        let (mut tx, mut rx) = tokio::io::duplex(64);

        let writer = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.put_reader("slow", &mut rx).await })
        };
        tx.write_all(b"data").await.unwrap();
        wait_until(|| !cache.entries().is_empty()).await;

        cache.delete("slow").unwrap();
        assert!(cache.entries().is_empty());
        assert!(cache.get_tag("slow").unwrap_err().is_not_found());
        assert!(cache.delete("slow").unwrap_err().is_not_found());

        drop(tx);
        assert!(writer.await.unwrap().is_err());
        assert!(cache.get("slow").await.unwrap_err().is_not_found());
        assert_eq!(managed_files(dir.path()), 0);
        assert_accounting(&cache);
    }

    #[tokio::test]
    async fn test_reservations_limit_other_writers() {
        let dir = tempdir().unwrap();
        let config = StashConfig::new(dir.path(), 10, 40).with_block_size(8);
        let cache = Arc::new(BlobCache::from_config(&config).unwrap());
        cache.put("old", b"abc").await.unwrap();
        let (mut tx, mut rx) = tokio::io::duplex(64);

        let writer = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.put_reader("stream", &mut rx).await })
        };
        tx.write_all(b"01234567").await.unwrap();
        wait_until(|| cache.reserved_size() == 8).await;

        // reserving 8 bytes pushed the older entry out
        assert!(cache.keys().is_empty());
        let err = cache.put("other", b"abcde").await.unwrap_err();
        assert!(matches!(err, StashError::InsufficientSpace { .. }));

        drop(tx);
        assert_eq!(writer.await.unwrap().unwrap(), Some(8));
        assert_eq!(cache.keys(), vec!["stream"]);
        assert_eq!(cache.reserved_size(), 0);
        assert_accounting(&cache);
    }

    #[tokio::test]
    async fn test_dropped_puts_leave_no_untracked_files() {
        let (dir, cache) = new_cache(64 * 1024 * 1024, 1000);
        let content = vec![7u8; 64 * 1024];
        let tag = b"tag".to_vec();

        for i in 0..120 {
            let key = format!("key-{}", i % 10);
            let mut put: Pin<Box<dyn Future<Output = Result<()>> + '_>> = if i % 2 == 0 {
                Box::pin(cache.put(&key, &content))
            } else {
                Box::pin(cache.put_with_tag(&key, Some(tag.as_slice()), &content))
            };
            for _ in 0..i % 6 {
                if futures::poll!(put.as_mut()).is_ready() {
                    break;
                }
                tokio::task::yield_now().await;
            }
            drop(put);
        }

        wait_until(|| cache.in_flight() == 0).await;
        assert_eq!(staging_files(dir.path()), 0);
        assert_eq!(entry_files(dir.path()), cache.len());
        assert_eq!(cache.reserved_size(), 0);
        assert_accounting(&cache);
        for key in cache.keys() {
            assert_eq!(read_all(&key, &cache).await, content);
        }

        cache.clear().unwrap();
        assert_eq!(managed_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_clear_keeps_staging_files_of_running_writes() {
        let dir = tempdir().unwrap();
        let config = StashConfig::new(dir.path(), 2048, 40).with_block_size(4);
        let cache = Arc::new(BlobCache::from_config(&config).unwrap());
        let (mut tx, mut rx) = tokio::io::duplex(64);

        let writer = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.put_reader("slow", &mut rx).await })
        };
        tx.write_all(b"data").await.unwrap();
        wait_until(|| staging_files(dir.path()) == 1).await;

        // left behind by nobody
        std::fs::write(naming::staging_path(dir.path()), b"orphan").unwrap();
        assert_eq!(staging_files(dir.path()), 2);

        cache.clear().unwrap();
        assert_eq!(staging_files(dir.path()), 1);
        assert_eq!(cache.in_flight(), 1);

        drop(tx);
        assert!(writer.await.unwrap().unwrap_err().is_not_found());
        assert_eq!(cache.in_flight(), 0);
        assert_eq!(managed_files(dir.path()), 0);
        assert_accounting(&cache);
    }

    #[tokio::test]
    async fn test_concurrent_puts_keep_invariants() {
        let (_dir, cache) = new_cache(64, 5);
        let cache = Arc::new(cache);

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let cache = cache.clone();
                async move {
                    let key = format!("key-{}", i % 12);
                    let content = vec![i as u8; (i % 9) + 1];
                    cache.put(&key, &content).await
                }
            })
            .collect();
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }

        assert_accounting(&cache);
        assert_eq!(cache.keys().len(), cache.len());
        assert_eq!(cache.reserved_size(), 0);
    }
}
