//! Deterministic in-memory provider for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    AddedContainer, LinkCheck, ProviderError, RemoteContainer, RemoteFileInfo, RemoteProvider,
    UnrestrictedLink,
};

/// Deterministic file content used throughout the test suite.
pub fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[derive(Default)]
pub struct MockProvider {
    containers: Mutex<HashMap<String, RemoteContainer>>,
    content: Mutex<HashMap<String, Vec<u8>>>,
    unrestricted: Mutex<HashMap<String, UnrestrictedLink>>,
    /// Cached-content templates: a magnet add for one of these hashes is
    /// instantly `downloaded` with the template's files and links.
    magnet_templates: Mutex<HashMap<String, RemoteContainer>>,
    gone_urls: Mutex<HashSet<String>>,
    deleted: Mutex<Vec<String>>,
    /// The next N range fetches fail with a transport error.
    fail_fetches: AtomicU32,
    fetch_delay_ms: AtomicU64,
    pub fetch_count: AtomicU64,
    next_id: AtomicU64,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_content(&self, url: &str, data: Vec<u8>) {
        self.content.lock().unwrap().insert(url.to_string(), data);
    }

    pub fn put_container(&self, container: RemoteContainer) {
        self.containers
            .lock()
            .unwrap()
            .insert(container.host_id.clone(), container);
    }

    pub fn put_magnet_template(&self, template: RemoteContainer) {
        self.magnet_templates
            .lock()
            .unwrap()
            .insert(template.hash.clone(), template);
    }

    pub fn put_unrestricted(&self, restricted: &str, link: UnrestrictedLink) {
        self.unrestricted
            .lock()
            .unwrap()
            .insert(restricted.to_string(), link);
    }

    pub fn set_status(&self, host_id: &str, status: &str) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(host_id) {
            c.status = status.to_string();
        }
    }

    pub fn mark_gone(&self, url: &str) {
        self.gone_urls.lock().unwrap().insert(url.to_string());
    }

    pub fn fail_next_fetches(&self, n: u32) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.fetch_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn fetches(&self) -> u64 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Register a single-file container whose download URL serves the
    /// deterministic pattern; returns the fetchable URL.
    pub fn seed_file(&self, hash: &str, file_id: u64, size: usize) -> String {
        let url = format!("https://cdn.test/{hash}/{file_id}");
        self.put_content(&url, pattern_bytes(size));
        url
    }
}

#[async_trait]
impl RemoteProvider for MockProvider {
    async fn list(
        &self,
        page: u32,
        limit: u32,
        _filter: Option<&str>,
    ) -> Result<Vec<RemoteContainer>, ProviderError> {
        let mut all: Vec<RemoteContainer> =
            self.containers.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        let start = (page.saturating_sub(1) as usize) * limit as usize;
        Ok(all.into_iter().skip(start).take(limit as usize).collect())
    }

    async fn info(&self, host_id: &str) -> Result<RemoteContainer, ProviderError> {
        self.containers
            .lock()
            .unwrap()
            .get(host_id)
            .cloned()
            .ok_or(ProviderError::Gone)
    }

    async fn add_torrent(
        &self,
        bytes: &[u8],
        _host: &str,
        _category: Option<&str>,
        _tags: Option<&str>,
    ) -> Result<AddedContainer, ProviderError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock-torrent-{n}");
        self.put_container(RemoteContainer {
            host_id: id.clone(),
            hash: format!("{:040x}", bytes.len() as u64 + n),
            name: format!("torrent-{n}"),
            status: "queued".into(),
            bytes: 0,
            progress: 0.0,
            speed: 0,
            seeders: 1,
            links: Vec::new(),
            files: Vec::new(),
        });
        Ok(AddedContainer { id })
    }

    async fn add_magnet(&self, uri: &str, _host: &str) -> Result<AddedContainer, ProviderError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock-magnet-{n}");
        let hash = uri
            .split("btih:")
            .nth(1)
            .map(|h| {
                h.chars()
                    .take_while(|c| c.is_ascii_alphanumeric())
                    .collect::<String>()
            })
            .unwrap_or_else(|| format!("{n:040x}"));
        if let Some(template) = self.magnet_templates.lock().unwrap().get(&hash).cloned() {
            let mut container = template;
            container.host_id = id.clone();
            self.put_container(container);
            return Ok(AddedContainer { id });
        }
        self.put_container(RemoteContainer {
            host_id: id.clone(),
            hash,
            name: format!("magnet-{n}"),
            status: "magnet_conversion".into(),
            bytes: 0,
            progress: 0.0,
            speed: 0,
            seeders: 0,
            links: Vec::new(),
            files: Vec::new(),
        });
        Ok(AddedContainer { id })
    }

    async fn select_files(&self, host_id: &str, selector: &str) -> Result<(), ProviderError> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(host_id).ok_or(ProviderError::Gone)?;
        if selector == "all" {
            for f in &mut container.files {
                f.selected = true;
            }
        }
        Ok(())
    }

    async fn delete(&self, host_id: &str) -> Result<(), ProviderError> {
        self.containers.lock().unwrap().remove(host_id);
        self.deleted.lock().unwrap().push(host_id.to_string());
        Ok(())
    }

    async fn check_link(&self, url: &str) -> Result<LinkCheck, ProviderError> {
        let supported = !self.gone_urls.lock().unwrap().contains(url);
        Ok(LinkCheck { supported })
    }

    async fn unrestrict(&self, url: &str) -> Result<UnrestrictedLink, ProviderError> {
        if self.gone_urls.lock().unwrap().contains(url) {
            return Err(ProviderError::Gone);
        }
        if let Some(link) = self.unrestricted.lock().unwrap().get(url) {
            return Ok(link.clone());
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(UnrestrictedLink {
            id: format!("unrestricted-{n}"),
            filename: format!("file-{n}.bin"),
            size: 0,
            link: url.to_string(),
            download: format!("https://cdn.test/auto/{n}"),
        })
    }

    async fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end_inclusive: u64,
    ) -> Result<Bytes, ProviderError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        let delay = self.fetch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.gone_urls.lock().unwrap().contains(url) {
            return Err(ProviderError::Gone);
        }
        if self
            .fail_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProviderError::Transport("injected failure".into()));
        }

        let content = self.content.lock().unwrap();
        let data = content
            .get(url)
            .ok_or_else(|| ProviderError::Protocol(format!("no content for {url}")))?;
        let start = start as usize;
        let end = end_inclusive as usize + 1;
        if start >= end || end > data.len() {
            return Err(ProviderError::Protocol(format!(
                "range {start}..{end} beyond {} bytes",
                data.len()
            )));
        }
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }
}

/// Convenience constructor for a downloaded upstream container with one
/// restricted link per file.
pub fn downloaded_container(host_id: &str, hash: &str, name: &str, files: &[(u64, &str, u64)]) -> RemoteContainer {
    RemoteContainer {
        host_id: host_id.to_string(),
        hash: hash.to_string(),
        name: name.to_string(),
        status: "downloaded".into(),
        bytes: files.iter().map(|(_, _, b)| *b).sum(),
        progress: 100.0,
        speed: 0,
        seeders: 0,
        links: files
            .iter()
            .map(|(id, _, _)| format!("https://host.test/restricted/{hash}/{id}"))
            .collect(),
        files: files
            .iter()
            .map(|(id, path, bytes)| RemoteFileInfo {
                id: *id,
                path: path.to_string(),
                bytes: *bytes,
                selected: true,
            })
            .collect(),
    }
}
