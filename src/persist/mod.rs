//! Persisted container descriptors.
//!
//! One JSON document per container, `<host_id>.trd`, under `Active/`,
//! `Deleted/` or `Problematic/`. Write-out is whole-file with tmp + rename.
//! The in-memory registry built from these files is the source of truth
//! across restarts.

pub mod watcher;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::types::{Container, ContainerDescriptor, LifecycleState, SharedContainer};

pub const DESCRIPTOR_EXT: &str = "trd";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateDir {
    Active,
    Deleted,
    Problematic,
}

impl StateDir {
    pub const ALL: [StateDir; 3] = [StateDir::Active, StateDir::Deleted, StateDir::Problematic];

    pub fn dir_name(&self) -> &'static str {
        match self {
            StateDir::Active => "Active",
            StateDir::Deleted => "Deleted",
            StateDir::Problematic => "Problematic",
        }
    }

    fn for_lifecycle(state: LifecycleState) -> Self {
        match state {
            // Dormant containers stay under Active/: they are still part of
            // the library, just absent upstream.
            LifecycleState::Active | LifecycleState::Dormant => StateDir::Active,
            LifecycleState::Problematic => StateDir::Problematic,
        }
    }
}

pub struct ContainerStore {
    root: PathBuf,
    containers: RwLock<HashMap<String, SharedContainer>>,
    /// Serialises descriptor writes and cross-directory moves.
    io_lock: tokio::sync::Mutex<()>,
}

impl ContainerStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in StateDir::ALL {
            fs::create_dir_all(root.join(dir.dir_name()))
                .await
                .with_context(|| format!("creating {}", dir.dir_name()))?;
        }
        Ok(Self {
            root,
            containers: RwLock::new(HashMap::new()),
            io_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn active_dir(&self) -> PathBuf {
        self.root.join(StateDir::Active.dir_name())
    }

    fn descriptor_path(&self, dir: StateDir, host_id: &str) -> PathBuf {
        self.root
            .join(dir.dir_name())
            .join(format!("{host_id}.{DESCRIPTOR_EXT}"))
    }

    /// True when a descriptor for `host_id` exists in any state directory.
    pub fn descriptor_exists(&self, host_id: &str) -> bool {
        StateDir::ALL
            .iter()
            .any(|dir| self.descriptor_path(*dir, host_id).exists())
    }

    /// Load Active/ and Problematic/ descriptors into the registry.
    pub async fn load(&self) -> Result<Vec<SharedContainer>> {
        let mut loaded = Vec::new();
        for dir in [StateDir::Active, StateDir::Problematic] {
            let dir_path = self.root.join(dir.dir_name());
            let mut rd = fs::read_dir(&dir_path)
                .await
                .with_context(|| format!("reading {}", dir_path.display()))?;
            while let Some(entry) = rd.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(DESCRIPTOR_EXT) {
                    continue;
                }
                match self.load_one(&path).await {
                    Ok(container) => loaded.push(container),
                    Err(e) => warn!("skipping unreadable descriptor {}: {e:#}", path.display()),
                }
            }
        }
        info!(count = loaded.len(), "loaded persisted containers");
        Ok(loaded)
    }

    async fn load_one(&self, path: &Path) -> Result<SharedContainer> {
        let raw = fs::read(path).await?;
        let desc: ContainerDescriptor = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(self.register(Container::from_descriptor(desc)))
    }

    /// Put a container into the registry, returning the shared handle.
    pub fn register(&self, container: Container) -> SharedContainer {
        let hash = container.hash.clone();
        let shared = Arc::new(Mutex::new(container));
        self.containers
            .write()
            .expect("container registry poisoned")
            .insert(hash, shared.clone());
        shared
    }

    pub fn get(&self, hash: &str) -> Option<SharedContainer> {
        self.containers
            .read()
            .expect("container registry poisoned")
            .get(hash)
            .cloned()
    }

    pub fn get_by_host_id(&self, host_id: &str) -> Option<SharedContainer> {
        self.containers
            .read()
            .expect("container registry poisoned")
            .values()
            .find(|c| c.lock().expect("container lock poisoned").host_id == host_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<SharedContainer> {
        self.containers
            .read()
            .expect("container registry poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn forget(&self, hash: &str) -> Option<SharedContainer> {
        self.containers
            .write()
            .expect("container registry poisoned")
            .remove(hash)
    }

    /// Write the container's descriptor to the directory matching its
    /// lifecycle state, removing any copy left in the other directories.
    pub async fn save(&self, container: &SharedContainer) -> Result<()> {
        let (descriptor, host_id, target) = {
            let c = container.lock().expect("container lock poisoned");
            (
                c.to_descriptor(),
                c.host_id.clone(),
                StateDir::for_lifecycle(c.lifecycle_state),
            )
        };
        let json = serde_json::to_vec_pretty(&descriptor)?;

        let _io = self.io_lock.lock().await;
        let final_path = self.descriptor_path(target, &host_id);
        write_atomic(&final_path, &json).await?;
        for dir in StateDir::ALL {
            if dir != target {
                let _ = fs::remove_file(self.descriptor_path(dir, &host_id)).await;
            }
        }
        Ok(())
    }

    /// Destroy a container: descriptor moves to `Deleted/`, registry entry
    /// dropped. Returns the handle for final cleanup by the caller.
    pub async fn purge(&self, hash: &str) -> Result<Option<SharedContainer>> {
        let Some(container) = self.forget(hash) else {
            return Ok(None);
        };
        let (descriptor, host_id) = {
            let c = container.lock().expect("container lock poisoned");
            (c.to_descriptor(), c.host_id.clone())
        };
        let json = serde_json::to_vec_pretty(&descriptor)?;

        let _io = self.io_lock.lock().await;
        write_atomic(&self.descriptor_path(StateDir::Deleted, &host_id), &json).await?;
        for dir in [StateDir::Active, StateDir::Problematic] {
            let _ = fs::remove_file(self.descriptor_path(dir, &host_id)).await;
        }
        Ok(Some(container))
    }
}

async fn write_atomic(final_path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = final_path.with_extension(format!("{DESCRIPTOR_EXT}.tmp"));
    let mut f = fs::File::create(&tmp).await?;
    f.write_all(data).await?;
    f.sync_all().await?;
    drop(f);
    match fs::rename(&tmp, final_path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}
