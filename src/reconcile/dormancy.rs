//! Dormancy: age inactive containers out of the provider's slots while
//! keeping their local description, and bring them back on demand.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use crate::types::{LifecycleState, RemoteStatus, SharedContainer};

use super::{MAX_VERIFICATION_FAILURES, Reconciler};

impl Reconciler {
    /// One dormancy pass: verified-but-idle containers are deleted upstream
    /// and flagged dormant, then a bounded batch of dormant containers is
    /// re-verified.
    pub async fn dormancy_pass(&self) -> Result<()> {
        if !self.config.enable_dormant {
            return Ok(());
        }
        let cutoff = Utc::now() - chrono::Duration::hours(self.config.keep_active_hours as i64);

        for shared in self.store.all() {
            let (hash, host_id, candidate) = {
                let c = shared.lock().expect("container lock poisoned");
                let idle_since = c.last_accessed.unwrap_or(c.added_at);
                (
                    c.hash.clone(),
                    c.host_id.clone(),
                    c.lifecycle_state == LifecycleState::Active
                        && c.remote_status == RemoteStatus::Downloaded
                        && idle_since < cutoff,
                )
            };
            if !candidate {
                continue;
            }
            match self.verify_container_links(&shared).await {
                Ok(true) => {
                    if let Err(e) = self.provider.delete(&host_id).await {
                        warn!(hash, "freeing slot for dormant container: {e}");
                        continue;
                    }
                    {
                        let mut c = shared.lock().expect("container lock poisoned");
                        c.lifecycle_state = LifecycleState::Dormant;
                        c.last_verified = Some(Utc::now());
                    }
                    self.store.save(&shared).await?;
                    info!(hash, "container moved to dormant");
                }
                Ok(false) => warn!(hash, "links failed verification, keeping active"),
                Err(e) => warn!(hash, "dormancy verification error: {e:#}"),
            }
        }

        self.verify_dormant_batch().await
    }

    /// Check every live restricted link of the container.
    async fn verify_container_links(&self, shared: &SharedContainer) -> Result<bool> {
        let files = {
            let c = shared.lock().expect("container lock poisoned");
            c.files.clone()
        };
        for file in files {
            let (restricted, deleted) = {
                let f = file.lock().expect("file lock poisoned");
                (f.restricted_link.clone(), f.deleted_locally)
            };
            if deleted {
                continue;
            }
            if restricted.is_empty() || !self.provider.check_link(&restricted).await?.supported {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Re-verify the least recently verified dormant containers by
    /// temporarily re-adding them upstream.
    async fn verify_dormant_batch(&self) -> Result<()> {
        let mut dormant: Vec<SharedContainer> = self
            .store
            .all()
            .into_iter()
            .filter(|c| {
                c.lock().expect("container lock poisoned").lifecycle_state
                    == LifecycleState::Dormant
            })
            .collect();
        dormant.sort_by_key(|c| c.lock().expect("container lock poisoned").last_verified);

        for shared in dormant.into_iter().take(self.config.dormant_verification_batch) {
            let hash = shared.lock().expect("container lock poisoned").hash.clone();
            match self.probe_cached_availability(&hash).await {
                Ok(()) => {
                    let mut c = shared.lock().expect("container lock poisoned");
                    c.last_verified = Some(Utc::now());
                    c.verification_attempts = 0;
                }
                Err(e) => {
                    warn!(hash, "dormant re-verification failed: {e:#}");
                    let mut c = shared.lock().expect("container lock poisoned");
                    c.verification_attempts += 1;
                    if c.verification_attempts >= MAX_VERIFICATION_FAILURES {
                        c.mark_problematic(
                            "dormant content no longer available",
                            Some(format!("{e:#}")),
                        );
                    }
                }
            }
            self.store.save(&shared).await?;
        }
        Ok(())
    }

    /// Temporarily re-add the container and confirm it is instantly
    /// `downloaded`; the slot is freed again regardless of the outcome.
    async fn probe_cached_availability(&self, hash: &str) -> Result<()> {
        let added = self
            .provider
            .add_magnet(&magnet_uri(hash), "default")
            .await
            .context("re-adding for verification")?;
        let outcome = async {
            self.provider.select_files(&added.id, "all").await?;
            let remote = self.provider.info(&added.id).await?;
            if RemoteStatus::from_upstream(&remote.status) != RemoteStatus::Downloaded {
                bail!("content is not instantly available (status {})", remote.status);
            }
            Ok(())
        }
        .await;
        if let Err(e) = self.provider.delete(&added.id).await {
            warn!(hash, "freeing verification slot: {e}");
        }
        outcome
    }

    /// Bring a dormant container back before a read: re-add it upstream,
    /// relink its files and mark it active.
    pub async fn restore(&self, hash: &str) -> Result<()> {
        let shared = self
            .store
            .get(hash)
            .with_context(|| format!("unknown container {hash}"))?;
        if shared.lock().expect("container lock poisoned").lifecycle_state
            != LifecycleState::Dormant
        {
            return Ok(());
        }
        info!(hash, "restoring dormant container");

        let added = self
            .provider
            .add_magnet(&magnet_uri(hash), "default")
            .await
            .context("re-adding dormant container")?;
        self.provider.select_files(&added.id, "all").await?;
        let remote = self.provider.info(&added.id).await?;
        if RemoteStatus::from_upstream(&remote.status) != RemoteStatus::Downloaded {
            let _ = self.provider.delete(&added.id).await;
            bail!("dormant container {hash} is no longer cached upstream");
        }

        {
            let mut c = shared.lock().expect("container lock poisoned");
            c.host_id = added.id.clone();
            c.remote_status = RemoteStatus::Downloaded;
            c.lifecycle_state = LifecycleState::Active;
            c.last_accessed = Some(Utc::now());
        }
        // Remap restricted links to files by member name, then resolve fresh
        // download URLs.
        let selected: Vec<_> = remote.files.iter().filter(|f| f.selected).collect();
        let files = {
            let c = shared.lock().expect("container lock poisoned");
            c.files.clone()
        };
        for (remote_file, link) in selected.iter().zip(remote.links.iter()) {
            let member = basename(&remote_file.path);
            for file in &files {
                let mut f = file.lock().expect("file lock poisoned");
                if basename(&f.local_path).eq_ignore_ascii_case(member) {
                    f.restricted_link = link.clone();
                    break;
                }
            }
        }
        self.store.save(&shared).await?;
        self.refresh_container_links(hash).await?;
        Ok(())
    }
}

fn magnet_uri(hash: &str) -> String {
    format!("magnet:?xt=urn:btih:{hash}")
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
