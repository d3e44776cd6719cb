//! Read-through chunk cache.
//!
//! Reads on one file are serialised by a per-file mutex; chunks are served
//! from the [`ChunkStore`] when present and downloaded otherwise. At most
//! one download task is in flight per file: a read that needs a different
//! chunk than the one in flight cancels it (readahead is a hint, never a
//! commitment). Eviction runs opportunistically under a global try-lock.

pub mod download;
pub mod evict;
pub mod stats;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunk::{ChunkLayout, ChunkSpan, ChunkStore, split_file_range};
use crate::config::Config;
use crate::error::{CacheError, CacheResult};
use crate::provider::RemoteProvider;
use crate::types::FileKey;

use download::DownloadJob;
use stats::{CacheStats, StatsSnapshot};

/// Short-lived descriptor of the file a read targets; the cache keeps no
/// reference to it beyond the call.
#[derive(Clone, Debug)]
pub struct ReadDescriptor {
    pub key: FileKey,
    pub size: u64,
    pub download_url: String,
}

#[derive(Clone, Debug)]
pub struct CacheOptions {
    pub layout: ChunkLayout,
    pub max_cache_size: u64,
    /// Distance from the chunk end at which readahead is scheduled.
    pub readahead_trigger_position: u64,
    pub max_concurrent_downloads: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub eviction_interval: Duration,
}

impl CacheOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            layout: ChunkLayout::new(cfg.chunk_size),
            max_cache_size: cfg.max_cache_size,
            readahead_trigger_position: cfg.readahead_trigger_position,
            max_concurrent_downloads: cfg.max_total_concurrent_downloads,
            max_retries: cfg.max_retries,
            retry_base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            eviction_interval: Duration::from_secs(300),
        }
    }
}

struct Inflight {
    id: u64,
    chunk_index: u64,
    token: CancellationToken,
    handle: JoinHandle<CacheResult<()>>,
}

/// Per-file cache state, created on first access after a restart. The slot
/// holds the current background (readahead) download; reader-driven
/// downloads are owned by the reader, which already holds the read mutex.
struct FileState {
    read_lock: Mutex<()>,
    inflight: StdMutex<Option<Inflight>>,
}

impl FileState {
    fn new() -> Self {
        Self {
            read_lock: Mutex::new(()),
            inflight: StdMutex::new(None),
        }
    }
}

pub struct ChunkCache {
    opts: CacheOptions,
    store: Arc<ChunkStore>,
    provider: Arc<dyn RemoteProvider>,
    files: DashMap<FileKey, Arc<FileState>>,
    semaphore: Arc<Semaphore>,
    stats: Arc<CacheStats>,
    inflight_ids: AtomicU64,
    pub(crate) eviction_lock: Mutex<()>,
    pub(crate) last_eviction: StdMutex<Instant>,
}

impl ChunkCache {
    pub fn new(
        store: Arc<ChunkStore>,
        provider: Arc<dyn RemoteProvider>,
        opts: CacheOptions,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(opts.max_concurrent_downloads)),
            opts,
            store,
            provider,
            files: DashMap::new(),
            stats: Arc::new(CacheStats::default()),
            inflight_ids: AtomicU64::new(1),
            eviction_lock: Mutex::new(()),
            last_eviction: StdMutex::new(Instant::now()),
        }
    }

    pub fn layout(&self) -> ChunkLayout {
        self.opts.layout
    }

    pub(crate) fn options(&self) -> &CacheOptions {
        &self.opts
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn statistics(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The chunk index currently being downloaded in the background for
    /// `key`, if any.
    pub fn current_download(&self, key: &FileKey) -> Option<u64> {
        let state = self.files.get(key)?;
        let slot = state.inflight.lock().expect("inflight lock poisoned");
        slot.as_ref().map(|i| i.chunk_index)
    }

    /// True when a reader currently holds the file's read mutex. Used by
    /// eviction to skip files with an active reader.
    pub(crate) fn is_file_busy(&self, key: &FileKey) -> bool {
        match self.files.get(key) {
            Some(state) => state.read_lock.try_lock().is_err(),
            None => false,
        }
    }

    fn file_state(&self, key: &FileKey) -> Arc<FileState> {
        self.files
            .entry(key.clone())
            .or_insert_with(|| Arc::new(FileState::new()))
            .clone()
    }

    /// Read `[offset, offset+len)`, clamped to EOF. Returns exactly
    /// `min(len, size - offset)` bytes.
    pub async fn read(
        &self,
        desc: &ReadDescriptor,
        offset: u64,
        len: u64,
        cancel: &CancellationToken,
    ) -> CacheResult<Vec<u8>> {
        if desc.size == 0 {
            return Ok(Vec::new());
        }
        if len == 0 || offset >= desc.size {
            return Err(CacheError::InvalidRange {
                offset,
                len,
                size: desc.size,
            });
        }
        let len = len.min(desc.size - offset);

        self.maybe_evict().await;

        let state = self.file_state(&desc.key);
        let _guard = tokio::select! {
            guard = state.read_lock.lock() => guard,
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
        };

        let spans = split_file_range(self.opts.layout, offset, len as usize);
        let mut out = vec![0u8; len as usize];
        let mut cursor = 0usize;
        for span in &spans {
            let (chunk, hit) = self
                .ensure_chunk(desc, &state, span.chunk_index, cancel)
                .await?;
            let s = span.offset_in_chunk as usize;
            let e = s + span.len;
            if e > chunk.len() {
                // Chunk shorter than the geometry says: treat as corrupt.
                return Err(CacheError::Fatal(std::io::Error::other(format!(
                    "chunk {} of {} is {} bytes, need {}",
                    span.chunk_index,
                    desc.key,
                    chunk.len(),
                    e
                ))));
            }
            out[cursor..cursor + span.len].copy_from_slice(&chunk[s..e]);
            cursor += span.len;
            if hit {
                self.stats.hits.fetch_add(1, Ordering::SeqCst);
                self.stats
                    .bytes_from_cache
                    .fetch_add(span.len as u64, Ordering::SeqCst);
            } else {
                self.stats.misses.fetch_add(1, Ordering::SeqCst);
                self.stats
                    .bytes_from_remote
                    .fetch_add(span.len as u64, Ordering::SeqCst);
            }
        }

        if let Some(last) = spans.last() {
            self.maybe_schedule_readahead(desc, &state, last);
        }
        Ok(out)
    }

    /// Serve one chunk, downloading it first if absent. Resolves the
    /// preemption rule against any in-flight background download.
    async fn ensure_chunk(
        &self,
        desc: &ReadDescriptor,
        state: &Arc<FileState>,
        chunk_index: u64,
        cancel: &CancellationToken,
    ) -> CacheResult<(Vec<u8>, bool)> {
        match self.store.read(&desc.key, chunk_index).await {
            Ok(data) => {
                self.store.touch(&desc.key, chunk_index).await;
                return Ok((data, true));
            }
            Err(CacheError::NotPresent { .. }) => {}
            Err(e) => return Err(e),
        }

        let prior = state
            .inflight
            .lock()
            .expect("inflight lock poisoned")
            .take();
        if let Some(inflight) = prior {
            if inflight.chunk_index == chunk_index {
                // Same chunk: join the existing task and reuse its result.
                self.join_download(inflight, cancel).await?;
                match self.store.read(&desc.key, chunk_index).await {
                    Ok(data) => return Ok((data, false)),
                    // The joined task was a failed readahead; fetch ourselves.
                    Err(CacheError::NotPresent { .. }) => {}
                    Err(e) => return Err(e),
                }
            } else {
                // Seek: redirect bandwidth to the requested chunk immediately.
                debug!(
                    key = %desc.key,
                    wanted = chunk_index,
                    inflight = inflight.chunk_index,
                    "preempting in-flight download"
                );
                inflight.token.cancel();
                let _ = inflight.handle.await;
            }
        }

        let inflight = self.spawn_download(desc, chunk_index);
        self.join_download(inflight, cancel).await?;
        let data = self.store.read(&desc.key, chunk_index).await?;
        Ok((data, false))
    }

    /// Await a download; cancelling the read cancels the download and reaps
    /// the task before returning.
    async fn join_download(
        &self,
        inflight: Inflight,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        let Inflight {
            mut handle, token, ..
        } = inflight;
        tokio::select! {
            res = &mut handle => match res {
                Ok(inner) => inner,
                Err(join_err) => Err(CacheError::Fatal(std::io::Error::other(join_err.to_string()))),
            },
            _ = cancel.cancelled() => {
                token.cancel();
                let _ = handle.await;
                Err(CacheError::Cancelled)
            }
        }
    }

    fn download_job(&self, desc: &ReadDescriptor, chunk_index: u64) -> DownloadJob {
        DownloadJob {
            provider: self.provider.clone(),
            store: self.store.clone(),
            semaphore: self.semaphore.clone(),
            stats: self.stats.clone(),
            key: desc.key.clone(),
            url: desc.download_url.clone(),
            chunk_index,
            chunk_len: self.opts.layout.chunk_len(desc.size, chunk_index),
            chunk_size: self.opts.layout.chunk_size,
            max_retries: self.opts.max_retries,
            retry_base_delay: self.opts.retry_base_delay,
        }
    }

    /// Spawn a reader-driven download; the caller owns the handle.
    fn spawn_download(&self, desc: &ReadDescriptor, chunk_index: u64) -> Inflight {
        let id = self.inflight_ids.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let job = self.download_job(desc, chunk_index);
        let task_token = token.clone();
        let handle = tokio::spawn(job.run(task_token));
        Inflight {
            id,
            chunk_index,
            token,
            handle,
        }
    }

    /// Schedule readahead of the chunk after `last` when the read ended close
    /// enough to the chunk boundary, nothing is in flight, and the next chunk
    /// is absent.
    fn maybe_schedule_readahead(
        &self,
        desc: &ReadDescriptor,
        state: &Arc<FileState>,
        last: &ChunkSpan,
    ) {
        let end_in_chunk = last.offset_in_chunk + last.len as u64;
        if end_in_chunk <= self.opts.layout.chunk_size - self.opts.readahead_trigger_position {
            return;
        }
        let next = last.chunk_index + 1;
        if next >= self.opts.layout.chunk_count(desc.size) {
            return;
        }

        let mut slot = state.inflight.lock().expect("inflight lock poisoned");
        if slot.is_some() {
            return;
        }
        let id = self.inflight_ids.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let job = self.download_job(desc, next);
        let store = self.store.clone();
        let key = desc.key.clone();
        let task_token = token.clone();
        let task_state = state.clone();
        let handle = tokio::spawn(async move {
            // The chunk may have landed since the check; don't re-fetch.
            let res = if store.has(&key, next).await {
                Ok(())
            } else {
                job.run(task_token).await
            };
            let mut slot = task_state.inflight.lock().expect("inflight lock poisoned");
            if slot.as_ref().is_some_and(|i| i.id == id) {
                *slot = None;
            }
            if let Err(ref e) = res
                && !matches!(e, CacheError::Cancelled)
            {
                warn!("readahead of chunk {next} failed: {e}");
            }
            // Readahead is a hint; its failure is never the read's failure.
            Ok(())
        });
        *slot = Some(Inflight {
            id,
            chunk_index: next,
            token,
            handle,
        });
        self.stats
            .readaheads_scheduled
            .fetch_add(1, Ordering::SeqCst);
    }

    /// Cancel any in-flight download, drop all chunks and the in-memory
    /// state for this file.
    pub async fn invalidate(&self, key: &FileKey) -> CacheResult<()> {
        let state = self.file_state(key);
        let guard = state.read_lock.lock().await;
        let prior = state
            .inflight
            .lock()
            .expect("inflight lock poisoned")
            .take();
        if let Some(inflight) = prior {
            inflight.token.cancel();
            let _ = inflight.handle.await;
        }
        self.store.delete_file(key).await?;
        drop(guard);
        self.files.remove(key);
        Ok(())
    }
}
