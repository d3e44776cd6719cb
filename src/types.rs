//! Core data model: containers, their files, status/lifecycle enums and the
//! persisted descriptor shapes.
//!
//! Runtime state (`Container`, `ContainerFile`) is interior-mutable so the
//! namespace can rewrite `local_path` on moves while reconciliation loops
//! update statuses. The on-disk descriptor (`ContainerDescriptor`) is a plain
//! serde document; conversion between the two is lossless.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical remote-side status of a container, mapped from the upstream
/// provider's status strings by [`RemoteStatus::from_upstream`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    MagnetConversion,
    WaitingFilesSelection,
    Queued,
    Downloading,
    Stalled,
    Compressing,
    Uploading,
    Downloaded,
    Error,
    MagnetError,
    Virus,
    Dead,
    Missing,
}

impl RemoteStatus {
    /// Fixed mapping from upstream status strings; anything unknown is
    /// `Missing`.
    pub fn from_upstream(raw: &str) -> Self {
        match raw {
            "magnet_conversion" => Self::MagnetConversion,
            "waiting_files_selection" => Self::WaitingFilesSelection,
            "queued" => Self::Queued,
            "downloading" => Self::Downloading,
            "stalledDL" => Self::Stalled,
            "compressing" => Self::Compressing,
            "uploading" => Self::Uploading,
            "downloaded" => Self::Downloaded,
            "error" => Self::Error,
            "magnet_error" => Self::MagnetError,
            "virus" => Self::Virus,
            "dead" => Self::Dead,
            _ => Self::Missing,
        }
    }

    /// A container in one of these states is still being transferred by the
    /// provider and is a candidate for stall detection.
    pub fn is_transferring(&self) -> bool {
        matches!(self, Self::Downloading | Self::Queued | Self::Stalled)
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MagnetConversion => "magnet_conversion",
            Self::WaitingFilesSelection => "waiting_files_selection",
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Stalled => "stalled",
            Self::Compressing => "compressing",
            Self::Uploading => "uploading",
            Self::Downloaded => "downloaded",
            Self::Error => "error",
            Self::MagnetError => "magnet_error",
            Self::Virus => "virus",
            Self::Dead => "dead",
            Self::Missing => "missing",
        };
        f.write_str(s)
    }
}

/// Local lifecycle of a container, orthogonal to the remote status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Present upstream (or believed to be) and readable.
    Active,
    /// Deleted upstream to free a slot but fully described locally; a read
    /// triggers restoration first.
    Dormant,
    /// Unrecoverable failure; kept for inspection, never auto-retried.
    Problematic,
}

/// Identifies one file's chunk directory: `<container_hash>_<file_id>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub container_hash: String,
    pub file_id: u64,
}

impl FileKey {
    pub fn new(container_hash: impl Into<String>, file_id: u64) -> Self {
        Self {
            container_hash: container_hash.into(),
            file_id,
        }
    }

    /// Directory name under the cache root.
    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.container_hash, self.file_id)
    }

    /// Inverse of [`FileKey::dir_name`]; `None` for foreign directories.
    pub fn parse_dir_name(name: &str) -> Option<Self> {
        let (hash, id) = name.rsplit_once('_')?;
        let file_id = id.parse().ok()?;
        if hash.is_empty() {
            return None;
        }
        Some(Self::new(hash, file_id))
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.container_hash, self.file_id)
    }
}

/// A member file of a container.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerFile {
    /// Stable id within the container.
    pub file_id: u64,
    /// Hash of the owning container, kept here so a file alone can derive
    /// its [`FileKey`].
    pub container_hash: String,
    /// Current host-side id of the unrestricted resource.
    pub host_id: String,
    pub size: u64,
    /// Provider-side link identifier, re-resolvable via `unrestrict`.
    pub restricted_link: String,
    /// Short-lived fetchable URL; refreshed on demand.
    pub download_url: Option<String>,
    /// Canonical path under which the file appears in the namespace.
    pub local_path: String,
    #[serde(default)]
    pub deleted_locally: bool,
    /// Opaque probed media metadata, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_info: Option<serde_json::Value>,
}

impl ContainerFile {
    pub fn key(&self) -> FileKey {
        FileKey::new(self.container_hash.clone(), self.file_id)
    }
}

/// Shared handle to a file; the container owns it, the namespace holds
/// lookup references keyed by path.
pub type SharedFile = Arc<Mutex<ContainerFile>>;

/// Runtime state of one container. Lock ordering: never take a container
/// lock while holding one of its file locks.
#[derive(Debug)]
pub struct Container {
    pub host_id: String,
    pub hash: String,
    pub name: String,
    pub added_at: DateTime<Utc>,
    pub remote_status: RemoteStatus,
    pub lifecycle_state: LifecycleState,
    pub tags: Option<String>,
    pub category: Option<String>,
    pub last_accessed: Option<DateTime<Utc>>,
    pub last_verified: Option<DateTime<Utc>>,
    pub problem_reason: Option<String>,
    pub problem_details: Option<String>,
    pub verification_attempts: u32,
    pub files: Vec<SharedFile>,
}

impl Container {
    pub fn new(host_id: impl Into<String>, hash: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            hash: hash.into(),
            name: name.into(),
            added_at: Utc::now(),
            remote_status: RemoteStatus::Queued,
            lifecycle_state: LifecycleState::Active,
            tags: None,
            category: None,
            last_accessed: None,
            last_verified: None,
            problem_reason: None,
            problem_details: None,
            verification_attempts: 0,
            files: Vec::new(),
        }
    }

    /// Sum of member file sizes; stable once the container is `downloaded`.
    pub fn total_size(&self) -> u64 {
        self.files
            .iter()
            .map(|f| f.lock().expect("file lock poisoned").size)
            .sum()
    }

    pub fn mark_problematic(&mut self, reason: impl Into<String>, details: Option<String>) {
        self.lifecycle_state = LifecycleState::Problematic;
        self.problem_reason = Some(reason.into());
        self.problem_details = details;
    }

    pub fn to_descriptor(&self) -> ContainerDescriptor {
        ContainerDescriptor {
            host_id: self.host_id.clone(),
            hash: self.hash.clone(),
            name: self.name.clone(),
            added_at: self.added_at,
            remote_status: self.remote_status,
            lifecycle_state: self.lifecycle_state,
            tags: self.tags.clone(),
            category: self.category.clone(),
            last_accessed: self.last_accessed,
            last_verified: self.last_verified,
            problem_reason: self.problem_reason.clone(),
            problem_details: self.problem_details.clone(),
            verification_attempts: self.verification_attempts,
            files: self
                .files
                .iter()
                .map(|f| f.lock().expect("file lock poisoned").clone())
                .collect(),
        }
    }

    pub fn from_descriptor(desc: ContainerDescriptor) -> Self {
        Self {
            host_id: desc.host_id,
            hash: desc.hash,
            name: desc.name,
            added_at: desc.added_at,
            remote_status: desc.remote_status,
            lifecycle_state: desc.lifecycle_state,
            tags: desc.tags,
            category: desc.category,
            last_accessed: desc.last_accessed,
            last_verified: desc.last_verified,
            problem_reason: desc.problem_reason,
            problem_details: desc.problem_details,
            verification_attempts: desc.verification_attempts,
            files: desc
                .files
                .into_iter()
                .map(|f| Arc::new(Mutex::new(f)))
                .collect(),
        }
    }
}

/// Shared handle to a container.
pub type SharedContainer = Arc<Mutex<Container>>;

/// Whole-file JSON document persisted as `<host_id>.trd`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    pub host_id: String,
    pub hash: String,
    pub name: String,
    pub added_at: DateTime<Utc>,
    pub remote_status: RemoteStatus,
    pub lifecycle_state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_details: Option<String>,
    #[serde(default)]
    pub verification_attempts: u32,
    pub files: Vec<ContainerFile>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_mapping_is_fixed() {
        assert_eq!(
            RemoteStatus::from_upstream("magnet_conversion"),
            RemoteStatus::MagnetConversion
        );
        assert_eq!(RemoteStatus::from_upstream("stalledDL"), RemoteStatus::Stalled);
        assert_eq!(RemoteStatus::from_upstream("downloaded"), RemoteStatus::Downloaded);
        assert_eq!(RemoteStatus::from_upstream("gibberish"), RemoteStatus::Missing);
        assert_eq!(RemoteStatus::from_upstream(""), RemoteStatus::Missing);
    }

    #[test]
    fn file_key_dir_name_round_trip() {
        let key = FileKey::new("abcdef0123456789", 42);
        assert_eq!(key.dir_name(), "abcdef0123456789_42");
        assert_eq!(FileKey::parse_dir_name(&key.dir_name()), Some(key));
        assert_eq!(FileKey::parse_dir_name("noseparator"), None);
        assert_eq!(FileKey::parse_dir_name("_7"), None);
        assert_eq!(FileKey::parse_dir_name("abc_notanumber"), None);
    }

    #[test]
    fn descriptor_round_trip_preserves_files() {
        let mut container = Container::new("host-1", "cafebabe", "My Show S01");
        container.remote_status = RemoteStatus::Downloaded;
        container.files.push(Arc::new(Mutex::new(ContainerFile {
            file_id: 1,
            container_hash: "cafebabe".into(),
            host_id: "host-1".into(),
            size: 1234,
            restricted_link: "https://host/restricted/1".into(),
            download_url: Some("https://cdn/dl/1".into()),
            local_path: "/My Show S01/e01.mkv".into(),
            deleted_locally: false,
            media_info: None,
        })));

        let json = serde_json::to_string(&container.to_descriptor()).unwrap();
        let restored = Container::from_descriptor(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.hash, "cafebabe");
        assert_eq!(restored.remote_status, RemoteStatus::Downloaded);
        assert_eq!(restored.files.len(), 1);
        let file = restored.files[0].lock().unwrap();
        assert_eq!(file.local_path, "/My Show S01/e01.mkv");
        assert_eq!(file.key().dir_name(), "cafebabe_1");
    }

    #[test]
    fn status_serializes_lowercase_snake() {
        let s = serde_json::to_string(&RemoteStatus::WaitingFilesSelection).unwrap();
        assert_eq!(s, "\"waiting_files_selection\"");
        let l = serde_json::to_string(&LifecycleState::Problematic).unwrap();
        assert_eq!(l, "\"problematic\"");
    }
}
