//! Merged-view behavior over the full pipeline: upstream poll and
//! completion populate the namespace, the local directory overlays it.

mod common;

use tokio_util::sync::CancellationToken;

use common::{StackOptions, build_stack, seed_downloaded};
use debridfs::error::FsError;
use debridfs::namespace::EntryKind;
use debridfs::provider::mock::pattern_bytes;

#[tokio::test]
async fn local_entries_shadow_virtual_ones() {
    let stack = build_stack(StackOptions::default()).await;
    // Virtual side arrives through the reconciliation pipeline.
    seed_downloaded(
        &stack.provider,
        "feedf00d",
        "shared",
        &[(1, "shared/b.txt", 100), (2, "a.txt", 128)],
    );
    stack.reconciler.poll_once().await.unwrap();
    assert!(stack.namespace.file_exists("/shared/b.txt"));
    assert!(stack.namespace.file_exists("/shared/a.txt"));

    // Local side: a.txt with different content, plus the shared directory.
    std::fs::create_dir_all(stack.local_dir().join("shared")).unwrap();
    std::fs::write(stack.local_dir().join("shared/a.txt"), b"local wins").unwrap();

    let mut names: Vec<(String, EntryKind)> = stack
        .view
        .list("/shared")
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.name, e.kind))
        .collect();
    names.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        names,
        vec![
            ("a.txt".to_string(), EntryKind::File),
            ("b.txt".to_string(), EntryKind::File),
        ]
    );

    let cancel = CancellationToken::new();
    let local = stack.view.read("/shared/a.txt", 0, 100, &cancel).await.unwrap();
    assert_eq!(local, b"local wins");
    let virt = stack.view.read("/shared/b.txt", 0, 100, &cancel).await.unwrap();
    assert_eq!(virt, pattern_bytes(100));
}

#[tokio::test]
async fn rename_preserves_bytes_and_persists() {
    let stack = build_stack(StackOptions::default()).await;
    seed_downloaded(&stack.provider, "abbaabba", "Movie", &[(1, "Movie/m.mkv", 300)]);
    stack.reconciler.poll_once().await.unwrap();

    let cancel = CancellationToken::new();
    let before = stack
        .view
        .read("/Movie/m.mkv", 0, 300, &cancel)
        .await
        .unwrap();

    stack
        .view
        .rename("/Movie", "/Library/Movie (2024)")
        .await
        .unwrap();
    let after = stack
        .view
        .read("/Library/Movie (2024)/m.mkv", 0, 300, &cancel)
        .await
        .unwrap();
    assert_eq!(before, after);
    // Served from cache after the move: same chunks, new path.
    assert!(stack.cache.statistics().hits > 0);

    // The rewritten path was persisted immediately.
    let container = stack.store.get("abbaabba").unwrap();
    let c = container.lock().unwrap();
    assert_eq!(
        c.files[0].lock().unwrap().local_path,
        "/Library/Movie (2024)/m.mkv"
    );
    drop(c);
    let raw = std::fs::read_to_string(stack.data_dir().join("Active/host-abbaabba.trd")).unwrap();
    assert!(raw.contains("/Library/Movie (2024)/m.mkv"));
}

#[tokio::test]
async fn stale_download_url_recovers_via_refresh() {
    let stack = build_stack(StackOptions::default()).await;
    let hash = "57a1e000";
    seed_downloaded(&stack.provider, hash, "Stale", &[(1, "Stale/f.bin", 200)]);
    stack.reconciler.poll_once().await.unwrap();

    // The CDN URL dies; unrestricting the link now yields a replacement.
    let old_url = common::cdn_url(hash, 1);
    let new_url = format!("https://cdn.test/{hash}/1-renewed");
    stack.provider.mark_gone(&old_url);
    stack.provider.put_content(&new_url, pattern_bytes(200));
    let link = format!("https://host.test/restricted/{hash}/1");
    stack.provider.put_unrestricted(
        &link,
        debridfs::provider::UnrestrictedLink {
            id: "u-renewed".into(),
            filename: "f.bin".into(),
            size: 200,
            link: link.clone(),
            download: new_url,
        },
    );

    let cancel = CancellationToken::new();
    let out = stack
        .view
        .read("/Stale/f.bin", 0, 200, &cancel)
        .await
        .unwrap();
    assert_eq!(out, pattern_bytes(200));
    // The refreshed URL is now on record.
    let container = stack.store.get(hash).unwrap();
    let c = container.lock().unwrap();
    assert_eq!(
        c.files[0].lock().unwrap().download_url.as_deref(),
        Some(format!("https://cdn.test/{hash}/1-renewed").as_str())
    );
}

#[tokio::test]
async fn virtual_delete_is_read_only_on_write_paths() {
    let stack = build_stack(StackOptions::default()).await;
    seed_downloaded(&stack.provider, "0ddc0de0", "RO", &[(1, "RO/f.bin", 64)]);
    stack.reconciler.poll_once().await.unwrap();

    assert!(matches!(
        stack.view.write("/RO/f.bin", 0, b"nope").await,
        Err(FsError::ReadOnly(_))
    ));

    // Deleting the virtual file is allowed and drops its chunks.
    let cancel = CancellationToken::new();
    stack.view.read("/RO/f.bin", 0, 64, &cancel).await.unwrap();
    assert!(stack.cache.store().chunk_count() > 0);
    stack.view.remove_file("/RO/f.bin").await.unwrap();
    assert_eq!(stack.cache.store().chunk_count(), 0);
    assert!(matches!(
        stack.view.read("/RO/f.bin", 0, 1, &cancel).await,
        Err(FsError::NotFound(_))
    ));
}
