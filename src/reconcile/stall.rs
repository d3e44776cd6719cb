//! Stall detection for containers the provider is still transferring.

use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{info, warn};

use crate::types::{LifecycleState, RemoteStatus};

use super::Reconciler;

impl Reconciler {
    /// One detection pass: refresh observed speed/seeders for every
    /// transferring container, mark and delete the ones stalled for longer
    /// than the configured window.
    pub async fn check_stalls_once(&self) -> Result<()> {
        let window = Duration::from_secs(self.config.stall_detection_minutes * 60);
        for shared in self.store.all() {
            let (hash, host_id, eligible) = {
                let c = shared.lock().expect("container lock poisoned");
                (
                    c.hash.clone(),
                    c.host_id.clone(),
                    c.lifecycle_state == LifecycleState::Active
                        && c.remote_status.is_transferring(),
                )
            };
            if !eligible {
                self.stall_since
                    .lock()
                    .expect("stall state lock poisoned")
                    .remove(&hash);
                continue;
            }

            let remote = match self.provider.info(&host_id).await {
                Ok(info) => info,
                Err(e) => {
                    warn!(hash, "stall check info failed: {e}");
                    continue;
                }
            };
            let status = RemoteStatus::from_upstream(&remote.status);
            {
                let mut c = shared.lock().expect("container lock poisoned");
                if c.remote_status != status {
                    c.remote_status = status;
                }
            }

            let stalled_now = status == RemoteStatus::Stalled
                || remote.speed < self.config.stall_speed_bytes_per_sec
                || remote.seeders == 0;
            let stalled_for = {
                let mut since = self.stall_since.lock().expect("stall state lock poisoned");
                if stalled_now {
                    let start = *since.entry(hash.clone()).or_insert_with(Instant::now);
                    Some(start.elapsed())
                } else {
                    since.remove(&hash);
                    None
                }
            };

            if let Some(elapsed) = stalled_for
                && elapsed >= window
            {
                info!(
                    hash,
                    speed = remote.speed,
                    seeders = remote.seeders,
                    "transfer stalled, removing upstream"
                );
                {
                    let mut c = shared.lock().expect("container lock poisoned");
                    c.mark_problematic(
                        "stalled",
                        Some(format!(
                            "speed {} B/s, {} seeders after {:?}",
                            remote.speed, remote.seeders, elapsed
                        )),
                    );
                }
                if let Err(e) = self.provider.delete(&host_id).await {
                    warn!(hash, "deleting stalled container upstream: {e}");
                }
                self.store.save(&shared).await?;
                self.stall_since
                    .lock()
                    .expect("stall state lock poisoned")
                    .remove(&hash);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::poll::tests::test_reconciler;
    use crate::provider::RemoteContainer;
    use crate::provider::mock::MockProvider;
    use crate::types::LifecycleState;

    fn transferring(host_id: &str, hash: &str, speed: u64, seeders: u32) -> RemoteContainer {
        RemoteContainer {
            host_id: host_id.into(),
            hash: hash.into(),
            name: "slow one".into(),
            status: "downloading".into(),
            bytes: 1000,
            progress: 10.0,
            speed,
            seeders,
            links: Vec::new(),
            files: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_slow_container_marked_and_deleted() {
        let provider = Arc::new(MockProvider::new());
        provider.put_container(transferring("host-s", "51055105", 10, 5));
        // stall_detection_minutes is 0 in the fixture below, so one
        // observation below the speed threshold is enough.
        let (_tmp, reconciler) = stall_fixture(provider.clone()).await;
        reconciler.poll_once().await.unwrap();
        reconciler.check_stalls_once().await.unwrap();

        let container = reconciler.store().get("51055105").unwrap();
        assert_eq!(
            container.lock().unwrap().lifecycle_state,
            LifecycleState::Problematic
        );
        assert_eq!(provider.deleted_ids(), vec!["host-s".to_string()]);
    }

    #[tokio::test]
    async fn test_healthy_container_untouched() {
        let provider = Arc::new(MockProvider::new());
        provider.put_container(transferring("host-h", "6ea16ea1", 1_000_000, 12));
        let (_tmp, reconciler) = stall_fixture(provider.clone()).await;
        reconciler.poll_once().await.unwrap();
        reconciler.check_stalls_once().await.unwrap();

        let container = reconciler.store().get("6ea16ea1").unwrap();
        assert_eq!(
            container.lock().unwrap().lifecycle_state,
            LifecycleState::Active
        );
        assert!(provider.deleted_ids().is_empty());
    }

    async fn stall_fixture(
        provider: Arc<MockProvider>,
    ) -> (tempfile::TempDir, Arc<crate::reconcile::Reconciler>) {
        let (tmp, base) = test_reconciler(provider).await;
        // Rebuild with a zero-minute stall window.
        let mut cfg = (*base.config).clone();
        cfg.stall_detection_minutes = 0;
        let reconciler = crate::reconcile::Reconciler::new(
            base.provider().clone(),
            base.store().clone(),
            base.namespace().clone(),
            Arc::new(cfg),
        );
        (tmp, reconciler)
    }
}
