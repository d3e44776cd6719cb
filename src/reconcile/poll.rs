//! Upstream poll: status reconciliation and completion triggering.

use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::provider::RemoteContainer;
use crate::types::{Container, LifecycleState, RemoteStatus};

use super::{COMPLETION_CEILING, LIST_PAGE_LIMIT, Reconciler};

impl Reconciler {
    /// One pass over the provider's container listing.
    pub async fn poll_once(&self) -> Result<()> {
        let mut page = 1u32;
        loop {
            let batch = self.provider.list(page, LIST_PAGE_LIMIT, None).await?;
            let done = (batch.len() as u32) < LIST_PAGE_LIMIT;
            for remote in batch {
                let hash = remote.hash.clone();
                if let Err(e) = self.sync_container(remote).await {
                    warn!("syncing container {hash}: {e:#}");
                }
            }
            if done {
                break;
            }
            page += 1;
        }
        Ok(())
    }

    async fn sync_container(&self, remote: RemoteContainer) -> Result<()> {
        let status = RemoteStatus::from_upstream(&remote.status);
        let shared = match self.store.get(&remote.hash) {
            Some(existing) => existing,
            None => {
                info!(hash = remote.hash, name = remote.name, "observed new container upstream");
                let mut container =
                    Container::new(remote.host_id.clone(), remote.hash.clone(), remote.name.clone());
                container.remote_status = status;
                let shared = self.store.register(container);
                self.store.save(&shared).await?;
                shared
            }
        };

        let (changed, needs_completion) = {
            let mut c = shared.lock().expect("container lock poisoned");
            if c.lifecycle_state == LifecycleState::Problematic {
                return Ok(());
            }
            let changed = c.remote_status != status;
            if changed {
                debug!(hash = c.hash, from = %c.remote_status, to = %status, "status change");
                c.remote_status = status;
            }
            // Completion ran but links are still missing: run it again.
            let unresolved = c.files.is_empty()
                || c.files.iter().any(|f| {
                    let f = f.lock().expect("file lock poisoned");
                    !f.deleted_locally && f.download_url.is_none()
                });
            (changed, status == RemoteStatus::Downloaded && unresolved)
        };
        if changed {
            self.store.save(&shared).await?;
        }
        if needs_completion && self.completion_due(&remote.hash) {
            self.run_completion(&shared).await?;
        }
        Ok(())
    }

    /// At most one completion run per container per ceiling window.
    fn completion_due(&self, hash: &str) -> bool {
        let mut stamps = self
            .completion_stamps
            .lock()
            .expect("completion stamp lock poisoned");
        let now = Instant::now();
        match stamps.get(hash) {
            Some(at) if now.duration_since(*at) < COMPLETION_CEILING => false,
            _ => {
                stamps.insert(hash.to_string(), now);
                true
            }
        }
    }
}
