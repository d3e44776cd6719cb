//! Cache statistics: monotone counters updated with atomic increments
//! outside any lock.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct CacheStats {
    /// Chunks served from disk.
    pub hits: AtomicU64,
    /// Chunks that required a fetch before being served.
    pub misses: AtomicU64,
    pub bytes_from_cache: AtomicU64,
    pub bytes_from_remote: AtomicU64,
    /// Successfully completed chunk downloads.
    pub chunk_fetches: AtomicU64,
    /// Downloads that exhausted retries or hit a terminal error.
    pub fetch_failures: AtomicU64,
    /// Downloads that ended by cancellation (preemption or caller cancel).
    pub downloads_cancelled: AtomicU64,
    pub readaheads_scheduled: AtomicU64,
    pub evictions: AtomicU64,
    pub evicted_bytes: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub bytes_from_cache: u64,
    pub bytes_from_remote: u64,
    pub chunk_fetches: u64,
    pub fetch_failures: u64,
    pub downloads_cancelled: u64,
    pub readaheads_scheduled: u64,
    pub evictions: u64,
    pub evicted_bytes: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::SeqCst),
            misses: self.misses.load(Ordering::SeqCst),
            bytes_from_cache: self.bytes_from_cache.load(Ordering::SeqCst),
            bytes_from_remote: self.bytes_from_remote.load(Ordering::SeqCst),
            chunk_fetches: self.chunk_fetches.load(Ordering::SeqCst),
            fetch_failures: self.fetch_failures.load(Ordering::SeqCst),
            downloads_cancelled: self.downloads_cancelled.load(Ordering::SeqCst),
            readaheads_scheduled: self.readaheads_scheduled.load(Ordering::SeqCst),
            evictions: self.evictions.load(Ordering::SeqCst),
            evicted_bytes: self.evicted_bytes.load(Ordering::SeqCst),
        }
    }
}
