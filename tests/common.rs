#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use debridfs::cache::{CacheOptions, ChunkCache};
use debridfs::chunk::{ChunkLayout, ChunkStore};
use debridfs::config::Config;
use debridfs::merged::MergedView;
use debridfs::namespace::VirtualNamespace;
use debridfs::persist::ContainerStore;
use debridfs::provider::UnrestrictedLink;
use debridfs::provider::mock::{MockProvider, downloaded_container, pattern_bytes};
use debridfs::reconcile::Reconciler;

pub struct StackOptions {
    pub chunk_size: u64,
    pub max_cache_size: u64,
    pub readahead_trigger: u64,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            chunk_size: 64,
            max_cache_size: 1 << 30,
            readahead_trigger: 0,
        }
    }
}

pub struct Stack {
    pub tmp: TempDir,
    pub provider: Arc<MockProvider>,
    pub store: Arc<ContainerStore>,
    pub cache: Arc<ChunkCache>,
    pub namespace: Arc<VirtualNamespace>,
    pub reconciler: Arc<Reconciler>,
    pub view: Arc<MergedView>,
}

impl Stack {
    pub fn local_dir(&self) -> std::path::PathBuf {
        self.tmp.path().join("local")
    }

    pub fn data_dir(&self) -> std::path::PathBuf {
        self.tmp.path().join("data")
    }

    pub fn cache_dir(&self) -> std::path::PathBuf {
        self.tmp.path().join("cache")
    }
}

pub async fn build_stack(opts: StackOptions) -> Stack {
    let tmp = TempDir::new().unwrap();
    build_stack_in(tmp, opts, Arc::new(MockProvider::new())).await
}

/// Build (or rebuild, for restart tests) a full stack over an existing
/// directory tree and provider.
pub async fn build_stack_in(tmp: TempDir, opts: StackOptions, provider: Arc<MockProvider>) -> Stack {
    let data_dir = tmp.path().join("data");
    let cache_dir = tmp.path().join("cache");
    let local_dir = tmp.path().join("local");
    std::fs::create_dir_all(&local_dir).unwrap();

    let chunk_store = Arc::new(ChunkStore::new(&cache_dir));
    chunk_store.scan().await.unwrap();
    let cache = Arc::new(ChunkCache::new(
        chunk_store,
        provider.clone(),
        CacheOptions {
            layout: ChunkLayout::new(opts.chunk_size),
            max_cache_size: opts.max_cache_size,
            readahead_trigger_position: opts.readahead_trigger,
            max_concurrent_downloads: 4,
            max_retries: 2,
            retry_base_delay: Duration::from_millis(5),
            eviction_interval: Duration::from_secs(3600),
        },
    ));

    let store = Arc::new(ContainerStore::open(&data_dir).await.unwrap());
    store.load().await.unwrap();

    let config: Arc<Config> = Arc::new(
        serde_yaml::from_str(&format!(
            "cache_dir: {}\ndata_dir: {}\nlocal_dir: {}\nchunk_size: {}\nmax_cache_size: {}\n",
            cache_dir.display(),
            data_dir.display(),
            local_dir.display(),
            opts.chunk_size,
            opts.max_cache_size,
        ))
        .unwrap(),
    );

    let namespace = Arc::new(VirtualNamespace::new());
    let reconciler = Reconciler::new(provider.clone(), store.clone(), namespace.clone(), config);
    reconciler.seed_namespace();

    let view = Arc::new(MergedView::new(
        &local_dir,
        namespace.clone(),
        cache.clone(),
        reconciler.clone(),
    ));

    Stack {
        tmp,
        provider,
        store,
        cache,
        namespace,
        reconciler,
        view,
    }
}

pub fn cdn_url(hash: &str, file_id: u64) -> String {
    format!("https://cdn.test/{hash}/{file_id}")
}

/// Register a fully downloaded upstream container whose files serve the
/// deterministic byte pattern.
pub fn seed_downloaded(
    provider: &MockProvider,
    hash: &str,
    name: &str,
    files: &[(u64, &str, usize)],
) {
    let shapes: Vec<(u64, &str, u64)> = files
        .iter()
        .map(|(id, path, size)| (*id, *path, *size as u64))
        .collect();
    let remote = downloaded_container(&format!("host-{hash}"), hash, name, &shapes);
    for ((id, _path, size), link) in files.iter().zip(remote.links.iter()) {
        let url = cdn_url(hash, *id);
        provider.put_content(&url, pattern_bytes(*size));
        provider.put_unrestricted(
            link,
            UnrestrictedLink {
                id: format!("u-{hash}-{id}"),
                filename: format!("file-{id}"),
                size: *size as u64,
                link: link.clone(),
                download: url,
            },
        );
    }
    provider.put_container(remote);
}
