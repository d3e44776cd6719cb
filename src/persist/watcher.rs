//! Watches `Active/` for externally removed descriptors.
//!
//! Removing a `.trd` file is the supported way to manage the library from
//! outside the process: the watcher notices, marks the container's files
//! deleted in the namespace and drops the container from the registry.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::namespace::VirtualNamespace;

use super::{ContainerStore, DESCRIPTOR_EXT};

pub fn spawn_descriptor_watcher(
    store: Arc<ContainerStore>,
    namespace: Arc<VirtualNamespace>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let _ = tx.send(event);
        }
        Err(e) => warn!("descriptor watcher error: {e}"),
    })
    .context("creating descriptor watcher")?;
    watcher
        .watch(&store.active_dir(), RecursiveMode::NonRecursive)
        .context("watching Active directory")?;

    let handle = tokio::spawn(async move {
        // Keep the watcher alive for the lifetime of the task.
        let _watcher = watcher;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(ev) => ev,
                    None => break,
                },
            };
            if !matches!(event.kind, EventKind::Remove(_)) {
                continue;
            }
            for path in &event.paths {
                handle_removed(&store, &namespace, path).await;
            }
        }
    });
    Ok(handle)
}

async fn handle_removed(store: &ContainerStore, namespace: &VirtualNamespace, path: &PathBuf) {
    if path.extension().and_then(|e| e.to_str()) != Some(DESCRIPTOR_EXT) {
        return;
    }
    let Some(host_id) = path.file_stem().and_then(|s| s.to_str()) else {
        return;
    };
    // Our own state moves also unlink from Active/; a descriptor that still
    // exists in some state directory was moved, not externally deleted.
    if store.descriptor_exists(host_id) {
        return;
    }
    let Some(container) = store.get_by_host_id(host_id) else {
        return;
    };

    let (hash, file_paths) = {
        let c = container.lock().expect("container lock poisoned");
        let paths: Vec<String> = c
            .files
            .iter()
            .map(|f| f.lock().expect("file lock poisoned"))
            .filter(|f| !f.deleted_locally)
            .map(|f| f.local_path.clone())
            .collect();
        (c.hash.clone(), paths)
    };
    info!(host_id, hash, "descriptor removed externally, dropping container");
    for file_path in file_paths {
        if let Err(e) = namespace.delete_file(&file_path) {
            warn!("removing {file_path} from namespace: {e}");
        }
    }
    store.forget(&hash);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Container, ContainerFile};
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_external_delete_drops_container() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ContainerStore::open(tmp.path()).await.unwrap());
        let namespace = Arc::new(VirtualNamespace::new());

        let mut container = Container::new("host-x", "beefcafe", "Watched");
        let file = Arc::new(Mutex::new(ContainerFile {
            file_id: 1,
            container_hash: "beefcafe".into(),
            host_id: "host-x".into(),
            size: 10,
            restricted_link: String::new(),
            download_url: None,
            local_path: String::new(),
            deleted_locally: false,
            media_info: None,
        }));
        container.files.push(file.clone());
        let shared = store.register(container);
        namespace.add_file("/Watched/a.bin", file.clone()).unwrap();
        store.save(&shared).await.unwrap();

        let cancel = CancellationToken::new();
        let handle =
            spawn_descriptor_watcher(store.clone(), namespace.clone(), cancel.clone()).unwrap();

        // External management: remove the descriptor file directly.
        std::fs::remove_file(tmp.path().join("Active/host-x.trd")).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.get("beefcafe").is_some() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "watcher did not react to descriptor removal"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(!namespace.file_exists("/Watched/a.bin"));
        assert!(file.lock().unwrap().deleted_locally);

        cancel.cancel();
        let _ = handle.await;
    }
}
