//! Background reconciliation against the upstream provider.
//!
//! Independent cooperative loops — upstream poll (with the completion
//! pipeline), stall detection, dormancy — plus the descriptor watcher. Every
//! loop logs-and-continues: one failing container never blocks the others.

pub mod completion;
pub mod dormancy;
pub mod poll;
pub mod stall;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;
use crate::error::{CacheError, FsError, FsResult};
use crate::merged::Restorer;
use crate::namespace::VirtualNamespace;
use crate::persist::ContainerStore;
use crate::provider::RemoteProvider;
use crate::types::LifecycleState;

/// Listing page size for the upstream poll.
const LIST_PAGE_LIMIT: u32 = 50;
/// Per-container ceiling between completion-pipeline runs.
const COMPLETION_CEILING: Duration = Duration::from_secs(300);
/// Interval after which `last_accessed` is persisted again on reads.
const ACCESS_PERSIST_INTERVAL: Duration = Duration::from_secs(60);
/// Dormant verification failures tolerated before the container is marked
/// problematic.
const MAX_VERIFICATION_FAILURES: u32 = 3;

pub struct Reconciler {
    provider: Arc<dyn RemoteProvider>,
    store: Arc<ContainerStore>,
    namespace: Arc<VirtualNamespace>,
    config: Arc<Config>,
    completion_stamps: Mutex<HashMap<String, Instant>>,
    stall_since: Mutex<HashMap<String, Instant>>,
    access_persisted: Mutex<HashMap<String, Instant>>,
}

impl Reconciler {
    pub fn new(
        provider: Arc<dyn RemoteProvider>,
        store: Arc<ContainerStore>,
        namespace: Arc<VirtualNamespace>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            store,
            namespace,
            config,
            completion_stamps: Mutex::new(HashMap::new()),
            stall_since: Mutex::new(HashMap::new()),
            access_persisted: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<ContainerStore> {
        &self.store
    }

    pub fn namespace(&self) -> &Arc<VirtualNamespace> {
        &self.namespace
    }

    pub fn provider(&self) -> &Arc<dyn RemoteProvider> {
        &self.provider
    }

    /// Populate the namespace from the persisted registry after startup.
    pub fn seed_namespace(&self) {
        for container in self.store.all() {
            let files = {
                let c = container.lock().expect("container lock poisoned");
                c.files.clone()
            };
            for file in files {
                let (path, deleted) = {
                    let f = file.lock().expect("file lock poisoned");
                    (f.local_path.clone(), f.deleted_locally)
                };
                if deleted || path.is_empty() {
                    continue;
                }
                if let Err(e) = self.namespace.add_file(&path, file) {
                    warn!("seeding {path}: {e}");
                }
            }
        }
    }

    /// Spawn the periodic loops; the returned handles end when `cancel`
    /// fires.
    pub fn spawn_loops(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let poll = self.clone();
        handles.push(spawn_interval_loop(
            "upstream-poll",
            Duration::from_secs(self.config.poll_interval_seconds),
            cancel.clone(),
            move || {
                let r = poll.clone();
                async move { r.poll_once().await }
            },
        ));

        let stall = self.clone();
        handles.push(spawn_interval_loop(
            "stall-detection",
            Duration::from_secs(self.config.stall_check_interval_minutes * 60),
            cancel.clone(),
            move || {
                let r = stall.clone();
                async move { r.check_stalls_once().await }
            },
        ));

        if self.config.enable_dormant {
            let dormancy = self.clone();
            handles.push(spawn_interval_loop(
                "dormancy",
                Duration::from_secs(self.config.dormancy_interval_hours * 3600),
                cancel.clone(),
                move || {
                    let r = dormancy.clone();
                    async move { r.dormancy_pass().await }
                },
            ));
        }
        handles
    }

    /// Note a read against the container; `last_accessed` is persisted at
    /// most once per minute.
    fn touch_access(&self, hash: &str) -> bool {
        let now = Instant::now();
        let mut persisted = self
            .access_persisted
            .lock()
            .expect("access stamp lock poisoned");
        match persisted.get(hash) {
            Some(at) if now.duration_since(*at) < ACCESS_PERSIST_INTERVAL => false,
            _ => {
                persisted.insert(hash.to_string(), now);
                true
            }
        }
    }
}

#[async_trait]
impl Restorer for Reconciler {
    async fn ensure_active(&self, container_hash: &str) -> FsResult<()> {
        let Some(container) = self.store.get(container_hash) else {
            return Err(FsError::NotFound(container_hash.to_string()));
        };
        let dormant = {
            let mut c = container.lock().expect("container lock poisoned");
            c.last_accessed = Some(Utc::now());
            c.lifecycle_state == LifecycleState::Dormant
        };
        if dormant {
            self.restore(container_hash)
                .await
                .map_err(|e| FsError::Cache(CacheError::FetchFailed(format!("{e:#}"))))?;
        } else if self.touch_access(container_hash) {
            self.store
                .save(&container)
                .await
                .map_err(|e| FsError::Io(std::io::Error::other(format!("{e:#}"))))?;
        }
        Ok(())
    }

    async fn refresh_links(&self, container_hash: &str) -> FsResult<()> {
        self.refresh_container_links(container_hash)
            .await
            .map_err(|e| FsError::Cache(CacheError::FetchFailed(format!("{e:#}"))))
    }

    async fn persist_container(&self, container_hash: &str) -> FsResult<()> {
        let Some(container) = self.store.get(container_hash) else {
            return Err(FsError::NotFound(container_hash.to_string()));
        };
        self.store
            .save(&container)
            .await
            .map_err(|e| FsError::Io(std::io::Error::other(format!("{e:#}"))))
    }
}

fn spawn_interval_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut body: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = body().await {
                warn!("{name}: iteration failed: {e:#}");
            }
        }
    })
}
