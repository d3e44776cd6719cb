//! Debrid REST client.
//!
//! Speaks the Real-Debrid-style API: token-authenticated JSON management
//! endpoints plus plain HTTP range GETs against unrestricted URLs.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::Deserialize;

use super::http::HttpRangeClient;
use super::{
    AddedContainer, LinkCheck, ProviderError, RemoteContainer, RemoteFileInfo, RemoteProvider,
    UnrestrictedLink,
};

pub struct DebridClient {
    api_base: String,
    token: String,
    client: reqwest::Client,
    range_client: HttpRangeClient,
}

#[derive(Deserialize)]
struct TorrentItem {
    id: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    bytes: u64,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    speed: u64,
    #[serde(default)]
    seeders: u32,
    #[serde(default)]
    status: String,
    #[serde(default)]
    links: Vec<String>,
    #[serde(default)]
    files: Vec<TorrentFileItem>,
}

#[derive(Deserialize)]
struct TorrentFileItem {
    id: u64,
    #[serde(default)]
    path: String,
    #[serde(default)]
    bytes: u64,
    #[serde(default)]
    selected: u8,
}

#[derive(Deserialize)]
struct AddedItem {
    id: String,
}

#[derive(Deserialize)]
struct UnrestrictItem {
    id: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    filesize: u64,
    #[serde(default)]
    link: String,
    #[serde(default)]
    download: String,
}

#[derive(Deserialize)]
struct CheckItem {
    #[serde(default)]
    supported: u8,
}

impl From<TorrentItem> for RemoteContainer {
    fn from(item: TorrentItem) -> Self {
        RemoteContainer {
            host_id: item.id,
            hash: item.hash.to_ascii_lowercase(),
            name: item.filename,
            status: item.status,
            bytes: item.bytes,
            progress: item.progress,
            speed: item.speed,
            seeders: item.seeders,
            links: item.links,
            files: item
                .files
                .into_iter()
                .map(|f| RemoteFileInfo {
                    id: f.id,
                    path: f.path,
                    bytes: f.bytes,
                    selected: f.selected == 1,
                })
                .collect(),
        }
    }
}

impl DebridClient {
    pub fn new(
        api_base: impl Into<String>,
        token: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client,
            range_client: HttpRangeClient::new(request_timeout)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    async fn check_response(
        &self,
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = response.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Transport(e.to_string())
            }
        })?;
        match response.status() {
            s if s.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS => Err(ProviderError::RateLimited),
            StatusCode::REQUEST_TIMEOUT => Err(ProviderError::Timeout),
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(ProviderError::Gone),
            other => Err(ProviderError::Http {
                status: other.as_u16(),
                message: other.canonical_reason().unwrap_or("unexpected").to_string(),
            }),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await;
        self.check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(e.to_string()))
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.token)
            .form(form)
            .send()
            .await;
        self.check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl RemoteProvider for DebridClient {
    async fn list(
        &self,
        page: u32,
        limit: u32,
        filter: Option<&str>,
    ) -> Result<Vec<RemoteContainer>, ProviderError> {
        let mut query = vec![("page", page.to_string()), ("limit", limit.to_string())];
        if let Some(filter) = filter {
            query.push(("filter", filter.to_string()));
        }
        let items: Vec<TorrentItem> = self.get_json("/torrents", &query).await?;
        Ok(items.into_iter().map(RemoteContainer::from).collect())
    }

    async fn info(&self, host_id: &str) -> Result<RemoteContainer, ProviderError> {
        let item: TorrentItem = self
            .get_json(&format!("/torrents/info/{host_id}"), &[])
            .await?;
        Ok(item.into())
    }

    async fn add_torrent(
        &self,
        bytes: &[u8],
        host: &str,
        _category: Option<&str>,
        _tags: Option<&str>,
    ) -> Result<AddedContainer, ProviderError> {
        let response = self
            .client
            .put(self.url("/torrents/addTorrent"))
            .bearer_auth(&self.token)
            .query(&[("host", host)])
            .body(bytes.to_vec())
            .send()
            .await;
        let added: AddedItem = self
            .check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;
        Ok(AddedContainer { id: added.id })
    }

    async fn add_magnet(&self, uri: &str, host: &str) -> Result<AddedContainer, ProviderError> {
        let added: AddedItem = self
            .post_form("/torrents/addMagnet", &[("magnet", uri), ("host", host)])
            .await?;
        Ok(AddedContainer { id: added.id })
    }

    async fn select_files(&self, host_id: &str, selector: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(self.url(&format!("/torrents/selectFiles/{host_id}")))
            .bearer_auth(&self.token)
            .form(&[("files", selector)])
            .send()
            .await;
        self.check_response(response).await.map(|_| ())
    }

    async fn delete(&self, host_id: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .delete(self.url(&format!("/torrents/delete/{host_id}")))
            .bearer_auth(&self.token)
            .send()
            .await;
        self.check_response(response).await.map(|_| ())
    }

    async fn check_link(&self, url: &str) -> Result<LinkCheck, ProviderError> {
        let item: CheckItem = self
            .post_form("/unrestrict/check", &[("link", url)])
            .await?;
        Ok(LinkCheck {
            supported: item.supported == 1,
        })
    }

    async fn unrestrict(&self, url: &str) -> Result<UnrestrictedLink, ProviderError> {
        let item: UnrestrictItem = self
            .post_form("/unrestrict/link", &[("link", url)])
            .await?;
        Ok(UnrestrictedLink {
            id: item.id,
            filename: item.filename,
            size: item.filesize,
            link: item.link,
            download: item.download,
        })
    }

    async fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end_inclusive: u64,
    ) -> Result<Bytes, ProviderError> {
        self.range_client.fetch_range(url, start, end_inclusive).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_torrent_item_maps_to_remote_container() {
        let json = r#"{
            "id": "ABCDEF",
            "filename": "Show.S01.1080p",
            "hash": "AA11BB22",
            "bytes": 1000,
            "progress": 100.0,
            "status": "downloaded",
            "links": ["https://host/dl/1"],
            "files": [
                {"id": 1, "path": "/Show.S01.1080p/e01.mkv", "bytes": 1000, "selected": 1},
                {"id": 2, "path": "/Show.S01.1080p/sample.mkv", "bytes": 10, "selected": 0}
            ]
        }"#;
        let item: TorrentItem = serde_json::from_str(json).unwrap();
        let remote: RemoteContainer = item.into();
        assert_eq!(remote.host_id, "ABCDEF");
        assert_eq!(remote.hash, "aa11bb22");
        assert_eq!(remote.files.len(), 2);
        assert!(remote.files[0].selected);
        assert!(!remote.files[1].selected);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let json = r#"{"id": "X", "status": "queued"}"#;
        let item: TorrentItem = serde_json::from_str(json).unwrap();
        let remote: RemoteContainer = item.into();
        assert_eq!(remote.seeders, 0);
        assert!(remote.links.is_empty());
        assert!(remote.files.is_empty());
    }
}
