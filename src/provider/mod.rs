//! Abstract upstream debrid provider.
//!
//! The management wire protocol is opaque to the core; everything goes
//! through [`RemoteProvider`]. The byte transfer itself is plain HTTP range
//! requests, implemented in [`http`].

pub mod debrid;
pub mod http;
pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    /// 401/403; propagated unchanged.
    #[error("unauthorized")]
    Unauthorized,

    /// 429; retryable.
    #[error("rate limited")]
    RateLimited,

    /// 408 or a transport-level timeout; retryable.
    #[error("request timed out")]
    Timeout,

    /// The resource behind a fetchable URL no longer exists; the caller is
    /// expected to refresh the URL upstream and retry.
    #[error("resource gone")]
    Gone,

    #[error("http status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("transport: {0}")]
    Transport(String),

    #[error("cancelled")]
    Cancelled,

    /// Upstream answered with something the client could not interpret.
    #[error("protocol: {0}")]
    Protocol(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited | Self::Timeout | Self::Transport(_) => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Upstream view of one file inside a container.
#[derive(Clone, Debug)]
pub struct RemoteFileInfo {
    pub id: u64,
    pub path: String,
    pub bytes: u64,
    pub selected: bool,
}

/// Upstream view of a container, as returned by `list`/`info`.
#[derive(Clone, Debug)]
pub struct RemoteContainer {
    pub host_id: String,
    pub hash: String,
    pub name: String,
    pub status: String,
    pub bytes: u64,
    pub progress: f64,
    pub speed: u64,
    pub seeders: u32,
    /// Restricted link identifiers, one per selected file once downloaded.
    pub links: Vec<String>,
    pub files: Vec<RemoteFileInfo>,
}

#[derive(Clone, Debug)]
pub struct AddedContainer {
    pub id: String,
}

/// Result of resolving a restricted link to a fetchable URL.
#[derive(Clone, Debug)]
pub struct UnrestrictedLink {
    pub id: String,
    pub filename: String,
    pub size: u64,
    pub link: String,
    pub download: String,
}

#[derive(Clone, Debug)]
pub struct LinkCheck {
    pub supported: bool,
}

#[async_trait]
pub trait RemoteProvider: Send + Sync {
    async fn list(
        &self,
        page: u32,
        limit: u32,
        filter: Option<&str>,
    ) -> Result<Vec<RemoteContainer>, ProviderError>;

    async fn info(&self, host_id: &str) -> Result<RemoteContainer, ProviderError>;

    async fn add_torrent(
        &self,
        bytes: &[u8],
        host: &str,
        category: Option<&str>,
        tags: Option<&str>,
    ) -> Result<AddedContainer, ProviderError>;

    async fn add_magnet(&self, uri: &str, host: &str) -> Result<AddedContainer, ProviderError>;

    async fn select_files(&self, host_id: &str, selector: &str) -> Result<(), ProviderError>;

    async fn delete(&self, host_id: &str) -> Result<(), ProviderError>;

    async fn check_link(&self, url: &str) -> Result<LinkCheck, ProviderError>;

    async fn unrestrict(&self, url: &str) -> Result<UnrestrictedLink, ProviderError>;

    /// Fetch `[start, end_inclusive]` of the resource behind a fetchable URL.
    async fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end_inclusive: u64,
    ) -> Result<Bytes, ProviderError>;
}
