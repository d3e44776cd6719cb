//! LRU eviction to the low watermark.
//!
//! A single global lock guards the pass; contenders simply skip. Chunks of
//! files with an active reader are skipped; a chunk being written is not
//! observable until its rename, so eviction never sees half a chunk.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{info, warn};

use crate::error::CacheResult;

use super::ChunkCache;

/// Utilisation fraction at which eviction starts.
const HIGH_WATERMARK_PCT: u64 = 90;
/// Utilisation fraction eviction drains down to.
const LOW_WATERMARK_PCT: u64 = 70;

impl ChunkCache {
    fn high_watermark(&self) -> u64 {
        self.options().max_cache_size * HIGH_WATERMARK_PCT / 100
    }

    fn low_watermark(&self) -> u64 {
        self.options().max_cache_size * LOW_WATERMARK_PCT / 100
    }

    /// Trigger the eviction procedure at most once per interval, and
    /// whenever the cache crossed the high watermark. Non-blocking: if
    /// another task holds the eviction lock, skip.
    pub(crate) async fn maybe_evict(&self) {
        let over_high = self.store().total_bytes() >= self.high_watermark();
        let interval_due = {
            let last = self.last_eviction.lock().expect("eviction clock poisoned");
            last.elapsed() >= self.options().eviction_interval
        };
        if !over_high && !interval_due {
            return;
        }

        let Ok(_guard) = self.eviction_lock.try_lock() else {
            return;
        };
        {
            let mut last = self.last_eviction.lock().expect("eviction clock poisoned");
            *last = Instant::now();
        }
        if self.store().total_bytes() < self.high_watermark() {
            return;
        }
        if let Err(e) = self.run_eviction().await {
            warn!("eviction pass failed: {e}");
        }
    }

    /// Delete chunks coldest-first until utilisation is at or below the low
    /// watermark, skipping files that currently have a reader.
    pub(crate) async fn run_eviction(&self) -> CacheResult<()> {
        let low = self.low_watermark();
        let before = self.store().total_bytes();
        let candidates = self.store().enumerate_for_eviction().await?;

        let mut touched = HashSet::new();
        for candidate in candidates {
            if self.store().total_bytes() <= low {
                break;
            }
            if self.is_file_busy(&candidate.key) {
                continue;
            }
            let freed = self.store().delete_candidate(&candidate).await?;
            if freed > 0 {
                self.stats.evictions.fetch_add(1, Ordering::SeqCst);
                self.stats.evicted_bytes.fetch_add(freed, Ordering::SeqCst);
                touched.insert(candidate.key.clone());
            }
        }
        for key in touched {
            self.store().remove_dir_if_empty(&key).await;
        }

        info!(
            before,
            after = self.store().total_bytes(),
            "eviction pass complete"
        );
        Ok(())
    }
}
