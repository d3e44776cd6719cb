//! Error taxonomy for the cache and the merged filesystem surface.

use std::io;

use thiserror::Error;

use crate::provider::ProviderError;

/// Errors surfaced by the chunk store and chunk cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Negative/overflowing offset or non-positive length, or offset past EOF.
    #[error("invalid range: offset {offset} len {len} for file of {size} bytes")]
    InvalidRange { offset: u64, len: u64, size: u64 },

    /// All retries exhausted, or the upstream answered with a terminal status.
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// Cooperative cancellation; any partial on-disk state has been removed.
    #[error("operation cancelled")]
    Cancelled,

    /// A chunk read was attempted for a chunk that is not on disk.
    #[error("chunk {index} of {key} not present")]
    NotPresent { key: String, index: u64 },

    /// I/O failure that leaves accounting uncertain; the owning file gets
    /// invalidated on recovery.
    #[error("fatal cache I/O: {0}")]
    Fatal(#[from] io::Error),
}

impl CacheError {
    pub fn from_provider(err: ProviderError) -> Self {
        match err {
            ProviderError::Cancelled => CacheError::Cancelled,
            other => CacheError::FetchFailed(other.to_string()),
        }
    }
}

/// Errors surfaced by the namespace and the merged view to the mount.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("read-only: {0}")]
    ReadOnly(String),

    #[error("name collision: {0}")]
    Collision(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;
pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_cancellation_maps_to_cancelled() {
        let err = CacheError::from_provider(ProviderError::Cancelled);
        assert!(matches!(err, CacheError::Cancelled));
    }

    #[test]
    fn provider_terminal_maps_to_fetch_failed() {
        let err = CacheError::from_provider(ProviderError::Gone);
        assert!(matches!(err, CacheError::FetchFailed(_)));
    }
}
