//! Completion pipeline: from `downloaded` upstream state to readable files.

use std::sync::Arc;

use anyhow::{Context, Result};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::namespace::path;
use crate::types::{ContainerFile, LifecycleState, SharedContainer};

use super::Reconciler;

impl Reconciler {
    /// Resolve a freshly downloaded container: reject blocked content,
    /// unrestrict every selected file and publish the files into the
    /// namespace. The container turns `problematic` only when nothing in it
    /// is usable.
    pub async fn run_completion(&self, shared: &SharedContainer) -> Result<()> {
        let (host_id, hash, name) = {
            let c = shared.lock().expect("container lock poisoned");
            (c.host_id.clone(), c.hash.clone(), c.name.clone())
        };
        let info = self
            .provider
            .info(&host_id)
            .await
            .with_context(|| format!("refreshing info for {hash}"))?;

        let selected: Vec<_> = info.files.iter().filter(|f| f.selected).collect();

        if let Some(blocked) = selected
            .iter()
            .find_map(|f| self.blocked_extension(&f.path))
        {
            warn!(hash, ext = blocked, "container contains blocked extension");
            {
                let mut c = shared.lock().expect("container lock poisoned");
                c.mark_problematic(
                    "blocked file extension",
                    Some(format!("file set contains {blocked}")),
                );
            }
            self.store.save(shared).await?;
            return Ok(());
        }

        if info.links.len() != selected.len() {
            warn!(
                hash,
                links = info.links.len(),
                files = selected.len(),
                "file/link count mismatch"
            );
            {
                let mut c = shared.lock().expect("container lock poisoned");
                c.mark_problematic(
                    "file/link count mismatch",
                    Some(format!("{} links for {} files", info.links.len(), selected.len())),
                );
            }
            self.store.save(shared).await?;
            return Ok(());
        }

        let mut failures = Vec::new();
        let mut resolved = 0usize;
        for (remote_file, link) in selected.iter().zip(info.links.iter()) {
            match self.provider.unrestrict(link).await {
                Ok(unrestricted) => {
                    resolved += 1;
                    let size = if unrestricted.size > 0 {
                        unrestricted.size
                    } else {
                        remote_file.bytes
                    };
                    let existing = {
                        let c = shared.lock().expect("container lock poisoned");
                        c.files
                            .iter()
                            .find(|f| {
                                f.lock().expect("file lock poisoned").file_id == remote_file.id
                            })
                            .cloned()
                    };
                    match existing {
                        Some(file) => {
                            let mut f = file.lock().expect("file lock poisoned");
                            f.host_id = unrestricted.id;
                            f.restricted_link = link.clone();
                            f.download_url = Some(unrestricted.download);
                            f.size = size;
                        }
                        None => {
                            let file = Arc::new(Mutex::new(ContainerFile {
                                file_id: remote_file.id,
                                container_hash: hash.clone(),
                                host_id: unrestricted.id,
                                size,
                                restricted_link: link.clone(),
                                download_url: Some(unrestricted.download),
                                local_path: String::new(),
                                deleted_locally: false,
                                media_info: None,
                            }));
                            let target = layout_path(&name, &remote_file.path);
                            shared
                                .lock()
                                .expect("container lock poisoned")
                                .files
                                .push(file.clone());
                            if let Err(e) = self.namespace.add_file(&target, file) {
                                warn!("placing {target}: {e}");
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(hash, link, "unrestrict failed: {e}");
                    failures.push(format!("{link}: {e}"));
                }
            }
        }

        {
            let mut c = shared.lock().expect("container lock poisoned");
            if resolved == 0 && !failures.is_empty() {
                c.mark_problematic("all links failed", Some(failures.join("; ")));
            } else {
                c.lifecycle_state = LifecycleState::Active;
                c.problem_reason = None;
                c.problem_details = None;
            }
        }
        self.store.save(shared).await?;
        info!(hash, resolved, failed = failures.len(), "completion pipeline finished");
        Ok(())
    }

    /// Re-resolve every live link of a container (stale URL recovery).
    pub async fn refresh_container_links(&self, hash: &str) -> Result<()> {
        let container = self
            .store
            .get(hash)
            .with_context(|| format!("unknown container {hash}"))?;
        let files = {
            let c = container.lock().expect("container lock poisoned");
            c.files.clone()
        };
        let mut refreshed = 0usize;
        let mut last_error = None;
        for file in files {
            let (restricted, deleted) = {
                let f = file.lock().expect("file lock poisoned");
                (f.restricted_link.clone(), f.deleted_locally)
            };
            if deleted || restricted.is_empty() {
                continue;
            }
            match self.provider.unrestrict(&restricted).await {
                Ok(unrestricted) => {
                    refreshed += 1;
                    let mut f = file.lock().expect("file lock poisoned");
                    f.host_id = unrestricted.id;
                    f.download_url = Some(unrestricted.download);
                    if unrestricted.size > 0 {
                        f.size = unrestricted.size;
                    }
                }
                Err(e) => {
                    warn!(hash, restricted, "link refresh failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        self.store.save(&container).await?;
        if refreshed == 0
            && let Some(e) = last_error
        {
            return Err(e).context("no link could be refreshed");
        }
        Ok(())
    }

    fn blocked_extension(&self, file_path: &str) -> Option<String> {
        let lower = file_path.to_ascii_lowercase();
        self.config
            .blocked_file_extensions
            .iter()
            .find(|ext| lower.ends_with(&ext.to_ascii_lowercase()))
            .cloned()
    }
}

/// Namespace placement for a container member: under a folder named after
/// the container, unless the member path already carries it.
fn layout_path(container_name: &str, member_path: &str) -> String {
    let canonical_member = path::canonicalize(member_path);
    let first_segment = path::segments(&canonical_member).next().unwrap_or("");
    if path::names_equal(first_segment, container_name) {
        canonical_member
    } else {
        format!("/{container_name}{canonical_member}")
    }
}
