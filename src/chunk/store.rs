//! On-disk chunk layout and accounting.
//!
//! Layout: `<cache_root>/<container_hash>_<file_id>/<chunk_index:05>.bin`.
//! A chunk file is published by writing `<name>.bin.tmp`, fsyncing and
//! renaming over the final name, so a chunk is either fully present or
//! absent. Size/count accounting lives in atomics, rebuilt by [`ChunkStore::scan`]
//! at startup and adjusted on every successful write or delete.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{CacheError, CacheResult};
use crate::types::FileKey;

const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub file_count: u64,
    pub chunk_count: u64,
    pub total_bytes: u64,
}

/// One chunk file as seen by the eviction pass.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: FileKey,
    pub chunk_index: u64,
    pub path: PathBuf,
    pub last_access: SystemTime,
    pub size: u64,
}

pub struct ChunkStore {
    root: PathBuf,
    total_bytes: AtomicU64,
    chunk_count: AtomicU64,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            total_bytes: AtomicU64::new(0),
            chunk_count: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count.load(Ordering::SeqCst)
    }

    fn dir_for(&self, key: &FileKey) -> PathBuf {
        self.root.join(key.dir_name())
    }

    fn chunk_path(&self, key: &FileKey, index: u64) -> PathBuf {
        self.dir_for(key).join(format!("{index:05}.bin"))
    }

    pub async fn has(&self, key: &FileKey, index: u64) -> bool {
        fs::metadata(self.chunk_path(key, index)).await.is_ok()
    }

    /// Full-chunk read. `NotPresent` when the chunk file is absent.
    pub async fn read(&self, key: &FileKey, index: u64) -> CacheResult<Vec<u8>> {
        match fs::read(self.chunk_path(key, index)).await {
            Ok(buf) => Ok(buf),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CacheError::NotPresent {
                key: key.to_string(),
                index,
            }),
            Err(e) => Err(CacheError::Fatal(e)),
        }
    }

    /// Publish a complete chunk via tmp-write + fsync + rename.
    pub async fn write_atomic(&self, key: &FileKey, index: u64, data: &[u8]) -> CacheResult<()> {
        let final_path = self.chunk_path(key, index);
        let tmp_path = tmp_path_of(&final_path);
        if let Some(dir) = final_path.parent() {
            fs::create_dir_all(dir).await.map_err(CacheError::Fatal)?;
        }

        let write = async {
            let mut f = fs::File::create(&tmp_path).await?;
            f.write_all(data).await?;
            f.sync_all().await?;
            Ok::<_, io::Error>(())
        };
        if let Err(e) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(CacheError::Fatal(e));
        }

        // Replacing an existing chunk must not double-count its bytes.
        let replaced = match fs::metadata(&final_path).await {
            Ok(meta) => Some(meta.len()),
            Err(_) => None,
        };
        if let Err(e) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(CacheError::Fatal(e));
        }

        if let Some(old) = replaced {
            self.total_bytes.fetch_sub(old, Ordering::SeqCst);
        } else {
            self.chunk_count.fetch_add(1, Ordering::SeqCst);
        }
        self.total_bytes.fetch_add(data.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    /// Remove a leftover temp file for a chunk, if any.
    pub async fn discard_tmp(&self, key: &FileKey, index: u64) {
        let tmp = tmp_path_of(&self.chunk_path(key, index));
        let _ = fs::remove_file(tmp).await;
    }

    /// Unlink one chunk; returns the bytes freed (0 when already absent).
    pub async fn delete(&self, key: &FileKey, index: u64) -> CacheResult<u64> {
        self.delete_path(&self.chunk_path(key, index)).await
    }

    async fn delete_path(&self, path: &Path) -> CacheResult<u64> {
        let size = match fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(CacheError::Fatal(e)),
        };
        match fs::remove_file(path).await {
            Ok(()) => {
                self.total_bytes.fetch_sub(size, Ordering::SeqCst);
                self.chunk_count.fetch_sub(1, Ordering::SeqCst);
                Ok(size)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(CacheError::Fatal(e)),
        }
    }

    /// Delete a candidate produced by [`ChunkStore::enumerate_for_eviction`].
    pub async fn delete_candidate(&self, candidate: &EvictionCandidate) -> CacheResult<u64> {
        self.delete_path(&candidate.path).await
    }

    /// Remove a file's whole chunk directory; returns (chunks, bytes) freed.
    pub async fn delete_file(&self, key: &FileKey) -> CacheResult<(u64, u64)> {
        let dir = self.dir_for(key);
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(CacheError::Fatal(e)),
        };
        let mut chunks = 0u64;
        let mut bytes = 0u64;
        while let Some(entry) = read_dir.next_entry().await.map_err(CacheError::Fatal)? {
            let path = entry.path();
            let is_tmp = path
                .to_str()
                .map(|p| p.ends_with(TMP_SUFFIX))
                .unwrap_or(false);
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&path).await.map_err(CacheError::Fatal)?;
            if !is_tmp {
                chunks += 1;
                bytes += size;
            }
        }
        let _ = fs::remove_dir(&dir).await;
        self.total_bytes.fetch_sub(bytes, Ordering::SeqCst);
        self.chunk_count.fetch_sub(chunks, Ordering::SeqCst);
        Ok((chunks, bytes))
    }

    /// Drop a per-file directory if it holds no chunks anymore.
    pub async fn remove_dir_if_empty(&self, key: &FileKey) {
        let _ = fs::remove_dir(self.dir_for(key)).await;
    }

    /// Bump a chunk's recency so eviction keeps hot chunks. Recency is the
    /// file mtime, so this survives restarts.
    pub async fn touch(&self, key: &FileKey, index: u64) {
        let path = self.chunk_path(key, index);
        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(f) = std::fs::File::options().write(true).open(&path) {
                let _ = f.set_modified(SystemTime::now());
            }
        })
        .await;
    }

    /// Startup pass: rebuild accounting from disk and drop `*.tmp` leftovers.
    pub async fn scan(&self) -> CacheResult<ScanReport> {
        fs::create_dir_all(&self.root).await.map_err(CacheError::Fatal)?;

        let mut file_count = 0u64;
        let mut chunk_count = 0u64;
        let mut total_bytes = 0u64;

        let mut top = fs::read_dir(&self.root).await.map_err(CacheError::Fatal)?;
        while let Some(dir_entry) = top.next_entry().await.map_err(CacheError::Fatal)? {
            let dir_path = dir_entry.path();
            if !dir_path.is_dir() {
                continue;
            }
            let Some(name) = dir_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if FileKey::parse_dir_name(name).is_none() {
                continue;
            }
            file_count += 1;

            let mut entries = fs::read_dir(&dir_path).await.map_err(CacheError::Fatal)?;
            while let Some(entry) = entries.next_entry().await.map_err(CacheError::Fatal)? {
                let path = entry.path();
                let Some(fname) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if fname.ends_with(TMP_SUFFIX) {
                    let _ = fs::remove_file(&path).await;
                    continue;
                }
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                chunk_count += 1;
                total_bytes += meta.len();
            }
        }

        self.chunk_count.store(chunk_count, Ordering::SeqCst);
        self.total_bytes.store(total_bytes, Ordering::SeqCst);
        Ok(ScanReport {
            file_count,
            chunk_count,
            total_bytes,
        })
    }

    /// All chunk files ordered by last access ascending (coldest first).
    pub async fn enumerate_for_eviction(&self) -> CacheResult<Vec<EvictionCandidate>> {
        let mut out = Vec::new();
        let mut top = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(CacheError::Fatal(e)),
        };
        while let Some(dir_entry) = top.next_entry().await.map_err(CacheError::Fatal)? {
            let dir_path = dir_entry.path();
            let Some(name) = dir_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(key) = FileKey::parse_dir_name(name) else {
                continue;
            };
            let mut entries = match fs::read_dir(&dir_path).await {
                Ok(rd) => rd,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await.map_err(CacheError::Fatal)? {
                let path = entry.path();
                let Some(fname) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Some(stem) = fname.strip_suffix(".bin") else {
                    continue;
                };
                let Ok(chunk_index) = stem.parse::<u64>() else {
                    continue;
                };
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                let last_access = meta
                    .accessed()
                    .or_else(|_| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH)
                    .max(meta.modified().unwrap_or(SystemTime::UNIX_EPOCH));
                out.push(EvictionCandidate {
                    key: key.clone(),
                    chunk_index,
                    path,
                    last_access,
                    size: meta.len(),
                });
            }
        }
        out.sort_by_key(|c| c.last_access);
        Ok(out)
    }
}

fn tmp_path_of(final_path: &Path) -> PathBuf {
    let mut s = final_path.as_os_str().to_os_string();
    s.push(TMP_SUFFIX);
    PathBuf::from(s)
}
