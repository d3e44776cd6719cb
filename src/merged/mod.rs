//! Read/write overlay of a local directory over the virtual namespace.
//!
//! For any canonical path the local side is inspected first; a local entry
//! shadows a virtual entry of the same (case-insensitive) name. Reads of
//! virtual files go through the chunk cache; everything mutating targets the
//! local side when a local counterpart exists and the namespace otherwise.
//! Virtual file bytes are immutable: writing to a pure virtual path fails.

pub mod node_cache;

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{ChunkCache, ReadDescriptor};
use crate::error::{CacheError, FsError, FsResult};
use crate::namespace::{DirEntry, EntryKind, NodeSnapshot, VirtualNamespace, path};
use crate::types::SharedFile;

use node_cache::NodeCache;

/// The mount is told the volume compares names case-insensitively but
/// preserves case.
pub const VOLUME_CASE_SENSITIVE: bool = false;
pub const VOLUME_CASE_PRESERVING: bool = true;

/// Uniform descriptor for every merged node: owner SYSTEM, world
/// read/write/traverse/delete, world denied change-permissions and
/// take-ownership.
pub const SECURITY_DESCRIPTOR_SDDL: &str = "O:SYG:SYD:(A;;FRFWFXSD;;;WD)(D;;WDWO;;;WD)";

/// Brings dormant containers back and refreshes stale links; implemented by
/// the reconciliation side so the view stays decoupled from it.
#[async_trait]
pub trait Restorer: Send + Sync {
    /// Make the container readable again (restore if dormant) and note the
    /// access.
    async fn ensure_active(&self, container_hash: &str) -> FsResult<()>;
    /// Re-resolve the container's download URLs after a stale-link failure.
    async fn refresh_links(&self, container_hash: &str) -> FsResult<()>;
    /// Persist the container's descriptor after a namespace mutation.
    async fn persist_container(&self, container_hash: &str) -> FsResult<()>;
}

/// For setups without a reconciliation side (tests, offline inspection).
pub struct NoopRestorer;

#[async_trait]
impl Restorer for NoopRestorer {
    async fn ensure_active(&self, _container_hash: &str) -> FsResult<()> {
        Ok(())
    }
    async fn refresh_links(&self, _container_hash: &str) -> FsResult<()> {
        Ok(())
    }
    async fn persist_container(&self, _container_hash: &str) -> FsResult<()> {
        Ok(())
    }
}

/// What a canonical path resolves to.
pub enum MergedNode {
    LocalFile { path: PathBuf, size: u64 },
    VirtualFile { file: SharedFile },
    Directory { has_local: bool, has_virtual: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileAttributes {
    pub kind: EntryKind,
    pub size: u64,
}

pub struct MergedView {
    local_root: PathBuf,
    namespace: Arc<VirtualNamespace>,
    cache: Arc<ChunkCache>,
    nodes: Arc<NodeCache>,
    restorer: Arc<dyn Restorer>,
}

impl MergedView {
    pub fn new(
        local_root: impl Into<PathBuf>,
        namespace: Arc<VirtualNamespace>,
        cache: Arc<ChunkCache>,
        restorer: Arc<dyn Restorer>,
    ) -> Self {
        let nodes = NodeCache::new();
        namespace.subscribe(nodes.clone());
        Self {
            local_root: local_root.into(),
            namespace,
            cache,
            nodes,
            restorer,
        }
    }

    fn local_path_for(&self, canonical: &str) -> PathBuf {
        let mut out = self.local_root.clone();
        for segment in path::segments(canonical) {
            out.push(segment);
        }
        out
    }

    pub async fn resolve(&self, raw_path: &str) -> FsResult<MergedNode> {
        let canonical = path::canonicalize(raw_path);
        let local = self.local_path_for(&canonical);
        let local_meta = fs::metadata(&local).await.ok();
        let virtual_node = self.nodes.lookup(&self.namespace, &canonical);

        if let Some(meta) = &local_meta
            && meta.is_file()
        {
            return Ok(MergedNode::LocalFile {
                path: local,
                size: meta.len(),
            });
        }
        let has_local_dir = local_meta.map(|m| m.is_dir()).unwrap_or(false);
        let has_virtual_dir = matches!(virtual_node, Some(NodeSnapshot::Folder { .. }));
        if has_local_dir || has_virtual_dir {
            return Ok(MergedNode::Directory {
                has_local: has_local_dir,
                has_virtual: has_virtual_dir,
            });
        }
        if let Some(NodeSnapshot::File { file, .. }) = virtual_node {
            return Ok(MergedNode::VirtualFile { file });
        }
        Err(FsError::NotFound(canonical))
    }

    pub async fn stat(&self, raw_path: &str) -> FsResult<FileAttributes> {
        match self.resolve(raw_path).await? {
            MergedNode::LocalFile { size, .. } => Ok(FileAttributes {
                kind: EntryKind::File,
                size,
            }),
            MergedNode::VirtualFile { file } => Ok(FileAttributes {
                kind: EntryKind::File,
                size: file.lock().expect("file lock poisoned").size,
            }),
            MergedNode::Directory { .. } => Ok(FileAttributes {
                kind: EntryKind::Folder,
                size: 0,
            }),
        }
    }

    pub async fn exists(&self, raw_path: &str) -> bool {
        self.resolve(raw_path).await.is_ok()
    }

    /// Merged listing: the case-insensitive union of both sides, local
    /// entries shadowing virtual entries of the same name.
    pub async fn list(&self, raw_path: &str) -> FsResult<Vec<DirEntry>> {
        let canonical = path::canonicalize(raw_path);
        let (has_local, has_virtual) = match self.resolve(&canonical).await? {
            MergedNode::Directory {
                has_local,
                has_virtual,
            } => (has_local, has_virtual),
            _ => return Err(FsError::NotADirectory(canonical)),
        };

        let mut out = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        if has_local {
            let mut rd = fs::read_dir(self.local_path_for(&canonical)).await?;
            while let Some(entry) = rd.next_entry().await? {
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                seen.insert(name.to_ascii_lowercase());
                out.push(DirEntry {
                    kind: if meta.is_dir() {
                        EntryKind::Folder
                    } else {
                        EntryKind::File
                    },
                    size: if meta.is_dir() { 0 } else { meta.len() },
                    name,
                });
            }
        }
        if has_virtual
            && let Some(entries) = self.namespace.list(&canonical)
        {
            for entry in entries {
                if seen.contains(&entry.name.to_ascii_lowercase()) {
                    continue;
                }
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Read bytes at `offset`; local files are read directly, virtual files
    /// through the chunk cache (restoring/refreshing upstream state first
    /// when needed).
    pub async fn read(
        &self,
        raw_path: &str,
        offset: u64,
        len: u64,
        cancel: &CancellationToken,
    ) -> FsResult<Vec<u8>> {
        match self.resolve(raw_path).await? {
            MergedNode::LocalFile { path, size } => {
                if offset >= size {
                    return Ok(Vec::new());
                }
                let take = len.min(size - offset) as usize;
                let mut f = fs::File::open(&path).await?;
                f.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; take];
                f.read_exact(&mut buf).await?;
                Ok(buf)
            }
            MergedNode::VirtualFile { file } => {
                self.read_virtual(&file, offset, len, cancel).await
            }
            MergedNode::Directory { .. } => {
                Err(FsError::IsADirectory(path::canonicalize(raw_path)))
            }
        }
    }

    async fn read_virtual(
        &self,
        file: &SharedFile,
        offset: u64,
        len: u64,
        cancel: &CancellationToken,
    ) -> FsResult<Vec<u8>> {
        let hash = {
            let f = file.lock().expect("file lock poisoned");
            if f.deleted_locally {
                return Err(FsError::NotFound(f.local_path.clone()));
            }
            f.container_hash.clone()
        };
        self.restorer.ensure_active(&hash).await?;

        let mut desc = self.descriptor_for(file);
        if desc.download_url.is_empty() {
            self.restorer.refresh_links(&hash).await?;
            desc = self.descriptor_for(file);
            if desc.download_url.is_empty() {
                return Err(FsError::Cache(CacheError::FetchFailed(format!(
                    "no download url for {}",
                    desc.key
                ))));
            }
        }

        match self.cache.read(&desc, offset, len, cancel).await {
            Ok(bytes) => Ok(bytes),
            Err(CacheError::FetchFailed(reason)) => {
                // Stale URL: refresh upstream and retry once.
                debug!(key = %desc.key, "fetch failed ({reason}), refreshing links");
                self.restorer.refresh_links(&hash).await?;
                let desc = self.descriptor_for(file);
                Ok(self.cache.read(&desc, offset, len, cancel).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn descriptor_for(&self, file: &SharedFile) -> ReadDescriptor {
        let f = file.lock().expect("file lock poisoned");
        ReadDescriptor {
            key: f.key(),
            size: f.size,
            download_url: f.download_url.clone().unwrap_or_default(),
        }
    }

    /// Write to a local file. Virtual files are read-only.
    pub async fn write(&self, raw_path: &str, offset: u64, data: &[u8]) -> FsResult<usize> {
        match self.resolve(raw_path).await? {
            MergedNode::LocalFile { path, .. } => {
                let mut f = fs::OpenOptions::new().write(true).open(&path).await?;
                f.seek(SeekFrom::Start(offset)).await?;
                f.write_all(data).await?;
                f.flush().await?;
                Ok(data.len())
            }
            MergedNode::VirtualFile { .. } => {
                Err(FsError::ReadOnly(path::canonicalize(raw_path)))
            }
            MergedNode::Directory { .. } => {
                Err(FsError::IsADirectory(path::canonicalize(raw_path)))
            }
        }
    }

    /// Create an empty local file; creation always lands on the local side.
    pub async fn create_file(&self, raw_path: &str) -> FsResult<()> {
        let canonical = path::canonicalize(raw_path);
        if self.resolve(&canonical).await.is_ok() {
            return Err(FsError::Collision(canonical));
        }
        let local = self.local_path_for(&canonical);
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::File::create(&local).await?;
        Ok(())
    }

    pub async fn mkdir(&self, raw_path: &str) -> FsResult<()> {
        let canonical = path::canonicalize(raw_path);
        match self.resolve(&canonical).await {
            Ok(MergedNode::Directory { .. }) | Ok(MergedNode::LocalFile { .. })
            | Ok(MergedNode::VirtualFile { .. }) => Err(FsError::Collision(canonical)),
            Err(FsError::NotFound(_)) => {
                fs::create_dir_all(self.local_path_for(&canonical)).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a file: the local one when it exists (uncovering any virtual
    /// counterpart), the virtual one otherwise. Virtual deletion drops the
    /// cached chunks and persists the `deleted_locally` flag.
    pub async fn remove_file(&self, raw_path: &str) -> FsResult<()> {
        let canonical = path::canonicalize(raw_path);
        match self.resolve(&canonical).await? {
            MergedNode::LocalFile { path, .. } => {
                fs::remove_file(&path).await?;
                Ok(())
            }
            MergedNode::VirtualFile { file } => {
                let (key, hash) = {
                    let f = file.lock().expect("file lock poisoned");
                    (f.key(), f.container_hash.clone())
                };
                self.namespace.delete_file(&canonical)?;
                self.cache.invalidate(&key).await?;
                self.restorer.persist_container(&hash).await?;
                Ok(())
            }
            MergedNode::Directory { .. } => Err(FsError::IsADirectory(canonical)),
        }
    }

    /// Delete a directory whose merged listing is empty.
    pub async fn remove_dir(&self, raw_path: &str) -> FsResult<()> {
        let canonical = path::canonicalize(raw_path);
        let (has_local, has_virtual) = match self.resolve(&canonical).await? {
            MergedNode::Directory {
                has_local,
                has_virtual,
            } => (has_local, has_virtual),
            _ => return Err(FsError::NotADirectory(canonical)),
        };
        if !self.list(&canonical).await?.is_empty() {
            return Err(FsError::DirectoryNotEmpty(canonical));
        }
        if has_local {
            fs::remove_dir(self.local_path_for(&canonical)).await?;
        }
        if has_virtual {
            self.namespace.delete_folder(&canonical)?;
        }
        Ok(())
    }

    /// Rename: local entries move on disk, virtual entries move in the
    /// namespace (persisting the rewritten paths immediately).
    pub async fn rename(&self, raw_src: &str, raw_dst: &str) -> FsResult<()> {
        let src = path::canonicalize(raw_src);
        let dst = path::canonicalize(raw_dst);
        if self.exists(&dst).await && !path::paths_equal(&src, &dst) {
            return Err(FsError::Collision(dst));
        }
        match self.resolve(&src).await? {
            MergedNode::LocalFile { path, .. } => {
                let target = self.local_path_for(&dst);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::rename(&path, &target).await?;
                Ok(())
            }
            MergedNode::Directory {
                has_local,
                has_virtual,
            } => {
                if has_local {
                    let target = self.local_path_for(&dst);
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent).await?;
                    }
                    fs::rename(self.local_path_for(&src), &target).await?;
                }
                if has_virtual {
                    self.namespace.move_folder(&src, &dst)?;
                    self.persist_subtree(&dst).await?;
                }
                Ok(())
            }
            MergedNode::VirtualFile { file } => {
                let hash = file.lock().expect("file lock poisoned").container_hash.clone();
                self.namespace.move_file(&src, &dst)?;
                self.restorer.persist_container(&hash).await?;
                Ok(())
            }
        }
    }

    async fn persist_subtree(&self, canonical: &str) -> FsResult<()> {
        let mut hashes: HashSet<String> = HashSet::new();
        for (_, file) in self.namespace.files_under(canonical) {
            hashes.insert(file.lock().expect("file lock poisoned").container_hash.clone());
        }
        for hash in hashes {
            self.restorer.persist_container(&hash).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOptions;
    use crate::chunk::{ChunkLayout, ChunkStore};
    use crate::provider::mock::{MockProvider, pattern_bytes};
    use crate::types::ContainerFile;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Fixture {
        _local: tempfile::TempDir,
        _cache_dir: tempfile::TempDir,
        view: MergedView,
        namespace: Arc<VirtualNamespace>,
        provider: Arc<MockProvider>,
    }

    async fn fixture() -> Fixture {
        let local = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockProvider::new());
        let store = Arc::new(ChunkStore::new(cache_dir.path()));
        store.scan().await.unwrap();
        let cache = Arc::new(ChunkCache::new(
            store,
            provider.clone(),
            CacheOptions {
                layout: ChunkLayout::new(64),
                max_cache_size: 1 << 30,
                readahead_trigger_position: 0,
                max_concurrent_downloads: 4,
                max_retries: 1,
                retry_base_delay: Duration::from_millis(1),
                eviction_interval: Duration::from_secs(3600),
            },
        ));
        let namespace = Arc::new(VirtualNamespace::new());
        let view = MergedView::new(
            local.path(),
            namespace.clone(),
            cache,
            Arc::new(NoopRestorer),
        );
        Fixture {
            _local: local,
            _cache_dir: cache_dir,
            view,
            namespace,
            provider,
        }
    }

    fn virtual_file(provider: &MockProvider, hash: &str, id: u64, size: usize) -> SharedFile {
        let url = provider.seed_file(hash, id, size);
        Arc::new(Mutex::new(ContainerFile {
            file_id: id,
            container_hash: hash.into(),
            host_id: format!("host-{id}"),
            size: size as u64,
            restricted_link: format!("https://host.test/r/{id}"),
            download_url: Some(url),
            local_path: String::new(),
            deleted_locally: false,
            media_info: None,
        }))
    }

    #[tokio::test]
    async fn test_local_shadows_virtual_in_listing_and_read() {
        let f = fixture().await;
        // Local side: a.txt and shared/
        std::fs::write(f._local.path().join("a.txt"), b"local contents").unwrap();
        std::fs::create_dir(f._local.path().join("shared")).unwrap();
        // Virtual side: a.txt (different content) and shared/b.txt
        let va = virtual_file(&f.provider, "aaaa", 1, 128);
        f.namespace.add_file("/a.txt", va).unwrap();
        let vb = virtual_file(&f.provider, "aaaa", 2, 100);
        f.namespace.add_file("/shared/b.txt", vb).unwrap();

        let names: Vec<String> = {
            let mut ns: Vec<String> = f
                .view
                .list("/")
                .await
                .unwrap()
                .into_iter()
                .map(|e| e.name)
                .collect();
            ns.sort();
            ns
        };
        assert_eq!(names, vec!["a.txt".to_string(), "shared".to_string()]);

        let cancel = CancellationToken::new();
        let got = f.view.read("/a.txt", 0, 1024, &cancel).await.unwrap();
        assert_eq!(got, b"local contents");

        let got = f.view.read("/shared/b.txt", 0, 100, &cancel).await.unwrap();
        assert_eq!(got, pattern_bytes(100));
    }

    #[tokio::test]
    async fn test_write_to_virtual_path_is_read_only() {
        let f = fixture().await;
        let v = virtual_file(&f.provider, "bbbb", 1, 10);
        f.namespace.add_file("/movie.mkv", v).unwrap();
        let err = f.view.write("/movie.mkv", 0, b"x").await.unwrap_err();
        assert!(matches!(err, FsError::ReadOnly(_)));
    }

    #[tokio::test]
    async fn test_create_and_write_local_file() {
        let f = fixture().await;
        f.view.create_file("/notes/todo.txt").await.unwrap();
        f.view.write("/notes/todo.txt", 0, b"hello").await.unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(
            f.view.read("/notes/todo.txt", 0, 100, &cancel).await.unwrap(),
            b"hello"
        );
        // Creating over an existing merged entry collides.
        assert!(matches!(
            f.view.create_file("/notes/TODO.TXT").await,
            Err(FsError::Collision(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_virtual_file_invalidates_chunks() {
        let f = fixture().await;
        let v = virtual_file(&f.provider, "cccc", 1, 200);
        f.namespace.add_file("/d/x.bin", v.clone()).unwrap();
        let cancel = CancellationToken::new();
        f.view.read("/d/x.bin", 0, 200, &cancel).await.unwrap();
        assert!(f.view.cache.store().chunk_count() > 0);

        f.view.remove_file("/d/x.bin").await.unwrap();
        assert_eq!(f.view.cache.store().chunk_count(), 0);
        assert!(v.lock().unwrap().deleted_locally);
        assert!(matches!(
            f.view.read("/d/x.bin", 0, 1, &cancel).await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_delete_uncovers_virtual() {
        let f = fixture().await;
        std::fs::write(f._local.path().join("a.txt"), b"local").unwrap();
        let v = virtual_file(&f.provider, "dddd", 1, 50);
        f.namespace.add_file("/a.txt", v).unwrap();

        f.view.remove_file("/a.txt").await.unwrap();
        // The virtual counterpart becomes visible again.
        let cancel = CancellationToken::new();
        let got = f.view.read("/a.txt", 0, 50, &cancel).await.unwrap();
        assert_eq!(got, pattern_bytes(50));
    }

    #[tokio::test]
    async fn test_rename_virtual_file_preserves_bytes() {
        let f = fixture().await;
        let v = virtual_file(&f.provider, "eeee", 1, 150);
        f.namespace.add_file("/old.bin", v).unwrap();
        let cancel = CancellationToken::new();
        let before = f.view.read("/old.bin", 0, 150, &cancel).await.unwrap();

        f.view.rename("/old.bin", "/renamed/new.bin").await.unwrap();
        assert!(!f.view.exists("/old.bin").await);
        let after = f.view.read("/renamed/new.bin", 0, 150, &cancel).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_remove_dir_requires_empty_merged_listing() {
        let f = fixture().await;
        std::fs::create_dir(f._local.path().join("mixed")).unwrap();
        let v = virtual_file(&f.provider, "ffff", 1, 10);
        f.namespace.add_file("/mixed/v.bin", v).unwrap();

        assert!(matches!(
            f.view.remove_dir("/mixed").await,
            Err(FsError::DirectoryNotEmpty(_))
        ));
        f.view.remove_file("/mixed/v.bin").await.unwrap();
        f.view.remove_dir("/mixed").await.unwrap();
        assert!(!f.view.exists("/mixed").await);
    }

    #[tokio::test]
    async fn test_stat_reports_kind_and_size() {
        let f = fixture().await;
        let v = virtual_file(&f.provider, "abcd", 1, 321);
        f.namespace.add_file("/v.bin", v).unwrap();
        std::fs::write(f._local.path().join("l.bin"), vec![0u8; 55]).unwrap();

        let vs = f.view.stat("/v.bin").await.unwrap();
        assert_eq!(vs, FileAttributes { kind: EntryKind::File, size: 321 });
        let ls = f.view.stat("/l.bin").await.unwrap();
        assert_eq!(ls, FileAttributes { kind: EntryKind::File, size: 55 });
        let root = f.view.stat("/").await.unwrap();
        assert_eq!(root.kind, EntryKind::Folder);
    }
}
