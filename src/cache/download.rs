//! One chunk download: bounded by the global semaphore, retried with linear
//! backoff, cancellable at every suspension point, published atomically.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunk::ChunkStore;
use crate::error::{CacheError, CacheResult};
use crate::provider::RemoteProvider;
use crate::types::FileKey;

pub(crate) struct DownloadJob {
    pub provider: Arc<dyn RemoteProvider>,
    pub store: Arc<ChunkStore>,
    pub semaphore: Arc<Semaphore>,
    pub stats: Arc<super::stats::CacheStats>,
    pub key: FileKey,
    pub url: String,
    pub chunk_index: u64,
    /// Exact byte length of this chunk (short for the last chunk).
    pub chunk_len: u64,
    pub chunk_size: u64,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl DownloadJob {
    pub async fn run(self, token: CancellationToken) -> CacheResult<()> {
        let permit = tokio::select! {
            _ = token.cancelled() => return self.cancelled().await,
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return self.cancelled().await,
            },
        };
        let _permit = permit;

        let start = self.chunk_index * self.chunk_size;
        let end_inclusive = start + self.chunk_len - 1;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let fetched = tokio::select! {
                _ = token.cancelled() => return self.cancelled().await,
                res = self.provider.fetch_range(&self.url, start, end_inclusive) => res,
            };
            match fetched {
                Ok(bytes) => {
                    if bytes.len() as u64 != self.chunk_len {
                        self.stats
                            .fetch_failures
                            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        return Err(CacheError::FetchFailed(format!(
                            "chunk {} of {}: expected {} bytes, got {}",
                            self.chunk_index,
                            self.key,
                            self.chunk_len,
                            bytes.len()
                        )));
                    }
                    self.store
                        .write_atomic(&self.key, self.chunk_index, &bytes)
                        .await?;
                    self.stats
                        .chunk_fetches
                        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    debug!(key = %self.key, chunk = self.chunk_index, "chunk downloaded");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt <= self.max_retries => {
                    let delay = self.retry_base_delay * attempt;
                    warn!(
                        key = %self.key,
                        chunk = self.chunk_index,
                        attempt,
                        "retryable fetch error, backing off {delay:?}: {e}"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return self.cancelled().await,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    self.stats
                        .fetch_failures
                        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    return Err(CacheError::from_provider(e));
                }
            }
        }
    }

    async fn cancelled(&self) -> CacheResult<()> {
        self.stats
            .downloads_cancelled
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.store.discard_tmp(&self.key, self.chunk_index).await;
        Err(CacheError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::stats::CacheStats;
    use crate::provider::mock::MockProvider;
    use std::sync::atomic::Ordering;

    fn job(
        provider: Arc<MockProvider>,
        store: Arc<ChunkStore>,
        stats: Arc<CacheStats>,
        url: &str,
    ) -> DownloadJob {
        DownloadJob {
            provider,
            store,
            semaphore: Arc::new(Semaphore::new(2)),
            stats,
            key: FileKey::new("feed", 1),
            url: url.to_string(),
            chunk_index: 0,
            chunk_len: 64,
            chunk_size: 64,
            max_retries: 2,
            retry_base_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_download_retries_then_succeeds() {
        let provider = Arc::new(MockProvider::new());
        let url = provider.seed_file("feed", 1, 256);
        provider.fail_next_fetches(2);
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ChunkStore::new(tmp.path()));
        let stats = Arc::new(CacheStats::default());

        job(provider.clone(), store.clone(), stats.clone(), &url)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert!(store.has(&FileKey::new("feed", 1), 0).await);
        assert_eq!(provider.fetches(), 3);
        assert_eq!(stats.chunk_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(stats.fetch_failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_download_exhausts_retries() {
        let provider = Arc::new(MockProvider::new());
        let url = provider.seed_file("feed", 1, 256);
        provider.fail_next_fetches(10);
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ChunkStore::new(tmp.path()));
        let stats = Arc::new(CacheStats::default());

        let err = job(provider, store.clone(), stats.clone(), &url)
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::FetchFailed(_)));
        assert_eq!(stats.fetch_failures.load(Ordering::SeqCst), 1);
        assert_eq!(store.chunk_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_download_leaves_no_chunk() {
        let provider = Arc::new(MockProvider::new());
        let url = provider.seed_file("feed", 1, 256);
        provider.set_fetch_delay(Duration::from_millis(200));
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ChunkStore::new(tmp.path()));
        let stats = Arc::new(CacheStats::default());

        let token = CancellationToken::new();
        let handle = tokio::spawn(job(provider, store.clone(), stats.clone(), &url).run(token.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::Cancelled));
        assert_eq!(stats.downloads_cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(store.chunk_count(), 0);
        assert_eq!(store.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_gone_url_is_terminal() {
        let provider = Arc::new(MockProvider::new());
        let url = provider.seed_file("feed", 1, 256);
        provider.mark_gone(&url);
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ChunkStore::new(tmp.path()));
        let stats = Arc::new(CacheStats::default());

        let err = job(provider.clone(), store, stats, &url)
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::FetchFailed(_)));
        // A terminal status must not be retried.
        assert_eq!(provider.fetches(), 1);
    }
}
