//! qBittorrent-compatible management API.
//!
//! Enough of the WebUI API surface for media automation tools to add, list
//! and delete downloads unchanged. Authentication is a stub: the shim
//! always accepts the login and hands out a fixed session cookie.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Multipart, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::ChunkCache;
use crate::config::Config;
use crate::error::{CacheError, FsError};
use crate::merged::MergedView;
use crate::namespace::EntryKind;
use crate::persist::ContainerStore;
use crate::provider::RemoteProvider;
use crate::reconcile::Reconciler;
use crate::types::{Container, LifecycleState, RemoteStatus, SharedContainer};

/// Version strings reported to clients.
const APP_VERSION: &str = "v4.6.5";
const WEBAPI_VERSION: &str = "2.9.3";
const SESSION_COOKIE: &str = "SID=debridfs; HttpOnly; Path=/";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("unknown torrent: {0}")]
    UnknownTorrent(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("upstream: {0}")]
    Upstream(#[from] crate::provider::ProviderError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("internal: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::UnknownTorrent(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(e) if !e.is_retryable() => StatusCode::BAD_GATEWAY,
            Self::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Fs(e) => match e {
                FsError::NotFound(_) => StatusCode::NOT_FOUND,
                FsError::ReadOnly(_) => StatusCode::FORBIDDEN,
                FsError::Collision(_) | FsError::DirectoryNotEmpty(_) => StatusCode::CONFLICT,
                FsError::NotADirectory(_) | FsError::IsADirectory(_) => StatusCode::BAD_REQUEST,
                FsError::Cache(CacheError::InvalidRange { .. }) => {
                    StatusCode::RANGE_NOT_SATISFIABLE
                }
                FsError::Cache(_) => StatusCode::BAD_GATEWAY,
                FsError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        match &self {
            Self::Internal(msg) => warn!("api internal error: {msg}"),
            other => tracing::debug!("api error response: {other}"),
        }
        (status, self.to_string()).into_response()
    }
}

pub struct ApiState {
    pub provider: Arc<dyn RemoteProvider>,
    pub store: Arc<ContainerStore>,
    pub reconciler: Arc<Reconciler>,
    pub cache: Arc<ChunkCache>,
    pub view: Arc<MergedView>,
    pub config: Arc<Config>,
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v2/app/version", get(app_version))
        .route("/api/v2/app/webapiVersion", get(webapi_version))
        .route("/api/v2/app/preferences", get(preferences))
        .route("/api/v2/auth/login", post(login))
        .route("/api/v2/torrents/info", get(torrents_info))
        .route("/api/v2/torrents/properties", get(torrent_properties))
        .route("/api/v2/torrents/add", post(torrents_add))
        .route("/api/v2/torrents/delete", post(torrents_delete))
        .route("/api/v2/fs/list", get(fs_list))
        .route("/api/v2/fs/stat", get(fs_stat))
        .route("/api/v2/fs/read", get(fs_read))
        .with_state(state)
}

#[derive(Deserialize)]
struct FsPathQuery {
    path: String,
}

#[derive(Serialize)]
struct FsEntry {
    name: String,
    kind: &'static str,
    size: u64,
}

fn kind_str(kind: EntryKind) -> &'static str {
    match kind {
        EntryKind::Folder => "dir",
        EntryKind::File => "file",
    }
}

/// Merged directory listing over HTTP, for tooling and diagnostics.
async fn fs_list(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<FsPathQuery>,
) -> Result<Json<Vec<FsEntry>>, ApiError> {
    let entries = state.view.list(&query.path).await?;
    Ok(Json(
        entries
            .into_iter()
            .map(|e| FsEntry {
                name: e.name,
                kind: kind_str(e.kind),
                size: e.size,
            })
            .collect(),
    ))
}

async fn fs_stat(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<FsPathQuery>,
) -> Result<Json<FsEntry>, ApiError> {
    let attr = state.view.stat(&query.path).await?;
    Ok(Json(FsEntry {
        name: query.path,
        kind: kind_str(attr.kind),
        size: attr.size,
    }))
}

#[derive(Deserialize)]
struct FsReadQuery {
    path: String,
    #[serde(default)]
    offset: u64,
    length: u64,
}

/// Ranged read through the merged view and the chunk cache.
async fn fs_read(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<FsReadQuery>,
) -> Result<Response, ApiError> {
    let cancel = tokio_util::sync::CancellationToken::new();
    let bytes = state
        .view
        .read(&query.path, query.offset, query.length, &cancel)
        .await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

async fn app_version() -> &'static str {
    APP_VERSION
}

async fn webapi_version() -> &'static str {
    WEBAPI_VERSION
}

async fn preferences(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "save_path": state.config.local_dir,
        "max_ratio_enabled": false,
        "queueing_enabled": false,
    }))
}

async fn login() -> Response {
    ([(header::SET_COOKIE, SESSION_COOKIE)], "Ok.").into_response()
}

/// qBittorrent torrent-info row, trimmed to what automation tools read.
#[derive(Serialize, Debug)]
pub struct TorrentInfo {
    pub hash: String,
    pub name: String,
    pub state: String,
    pub progress: f64,
    pub size: u64,
    pub completed: u64,
    pub dlspeed: u64,
    pub num_seeds: u32,
    pub category: String,
    pub tags: String,
    pub save_path: String,
    pub content_path: String,
    pub added_on: i64,
}

/// Map our canonical states onto qBittorrent state strings.
fn qbit_state(status: RemoteStatus, lifecycle: LifecycleState) -> &'static str {
    if lifecycle == LifecycleState::Problematic {
        return "error";
    }
    match status {
        RemoteStatus::MagnetConversion | RemoteStatus::WaitingFilesSelection => "metaDL",
        RemoteStatus::Queued => "queuedDL",
        RemoteStatus::Downloading => "downloading",
        RemoteStatus::Stalled => "stalledDL",
        RemoteStatus::Compressing | RemoteStatus::Uploading => "uploading",
        RemoteStatus::Downloaded => "pausedUP",
        RemoteStatus::Error
        | RemoteStatus::MagnetError
        | RemoteStatus::Virus
        | RemoteStatus::Dead
        | RemoteStatus::Missing => "error",
    }
}

fn torrent_info_row(state: &ApiState, container: &SharedContainer) -> TorrentInfo {
    let c = container.lock().expect("container lock poisoned");
    let size = c.total_size();
    let done = c.remote_status == RemoteStatus::Downloaded;
    let save_path = state.config.local_dir.display().to_string();
    TorrentInfo {
        hash: c.hash.clone(),
        name: c.name.clone(),
        state: qbit_state(c.remote_status, c.lifecycle_state).to_string(),
        progress: if done { 1.0 } else { 0.0 },
        size,
        completed: if done { size } else { 0 },
        dlspeed: 0,
        num_seeds: 0,
        category: c.category.clone().unwrap_or_default(),
        tags: c.tags.clone().unwrap_or_default(),
        content_path: format!("{save_path}/{}", c.name),
        save_path,
        added_on: c.added_at.timestamp(),
    }
}

#[derive(Deserialize, Default)]
struct InfoQuery {
    category: Option<String>,
    hashes: Option<String>,
}

async fn torrents_info(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<InfoQuery>,
) -> Json<Vec<TorrentInfo>> {
    let wanted: Option<Vec<String>> = query
        .hashes
        .as_deref()
        .map(|h| h.split('|').map(|s| s.to_ascii_lowercase()).collect());
    let mut rows: Vec<TorrentInfo> = state
        .store
        .all()
        .iter()
        .filter(|c| {
            let c = c.lock().expect("container lock poisoned");
            if let Some(category) = &query.category
                && c.category.as_deref().unwrap_or("") != category
            {
                return false;
            }
            if let Some(wanted) = &wanted {
                return wanted.contains(&c.hash.to_ascii_lowercase());
            }
            true
        })
        .map(|c| torrent_info_row(&state, c))
        .collect();
    rows.sort_by(|a, b| a.added_on.cmp(&b.added_on).then(a.hash.cmp(&b.hash)));
    Json(rows)
}

#[derive(Deserialize)]
struct HashQuery {
    hash: String,
}

async fn torrent_properties(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HashQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let container = state
        .store
        .get(&query.hash)
        .ok_or_else(|| ApiError::UnknownTorrent(query.hash.clone()))?;
    let c = container.lock().expect("container lock poisoned");
    Ok(Json(serde_json::json!({
        "hash": c.hash,
        "name": c.name,
        "total_size": c.total_size(),
        "piece_size": state.config.chunk_size,
        "addition_date": c.added_at.timestamp(),
        "comment": c.problem_reason.clone().unwrap_or_default(),
        "files_count": c.files.len(),
    })))
}

async fn torrents_add(
    State(state): State<Arc<ApiState>>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut magnets: Vec<String> = Vec::new();
    let mut torrent_files: Vec<Vec<u8>> = Vec::new();
    let mut category = None;
    let mut tags = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        match field.name().unwrap_or_default() {
            "urls" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                magnets.extend(
                    text.lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(String::from),
                );
            }
            "torrents" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                torrent_files.push(bytes.to_vec());
            }
            "category" => {
                category = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.to_string()))?,
                )
            }
            "tags" => {
                tags = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.to_string()))?,
                )
            }
            _ => {}
        }
    }
    if magnets.is_empty() && torrent_files.is_empty() {
        return Err(ApiError::BadRequest("no urls or torrents supplied".into()));
    }

    for magnet in magnets {
        let added = state.provider.add_magnet(&magnet, "default").await?;
        register_added(&state, &added.id, category.clone(), tags.clone()).await?;
    }
    for bytes in torrent_files {
        let added = state
            .provider
            .add_torrent(&bytes, "default", category.as_deref(), tags.as_deref())
            .await?;
        register_added(&state, &added.id, category.clone(), tags.clone()).await?;
    }
    Ok("Ok.".into_response())
}

async fn register_added(
    state: &ApiState,
    host_id: &str,
    category: Option<String>,
    tags: Option<String>,
) -> Result<(), ApiError> {
    if let Err(e) = state.provider.select_files(host_id, "all").await {
        warn!(host_id, "select_files after add: {e}");
    }
    let remote = state.provider.info(host_id).await?;
    let container = match state.store.get(&remote.hash) {
        Some(existing) => existing,
        None => {
            let mut container =
                Container::new(remote.host_id.clone(), remote.hash.clone(), remote.name.clone());
            container.remote_status = RemoteStatus::from_upstream(&remote.status);
            container.category = category;
            container.tags = tags;
            state.store.register(container)
        }
    };
    state
        .store
        .save(&container)
        .await
        .map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    info!(hash = remote.hash, "torrent added via api");
    Ok(())
}

#[derive(Deserialize)]
struct DeleteForm {
    hashes: String,
    #[serde(default, rename = "deleteFiles")]
    delete_files: String,
}

async fn torrents_delete(
    State(state): State<Arc<ApiState>>,
    Form(form): Form<DeleteForm>,
) -> Result<Response, ApiError> {
    let delete_files = form.delete_files.eq_ignore_ascii_case("true");
    for hash in form.hashes.split('|').filter(|h| !h.is_empty()) {
        if let Err(e) = purge_container(&state, hash, delete_files).await {
            warn!(hash, "purge failed: {e}");
        }
    }
    Ok("Ok.".into_response())
}

/// Full purge: upstream delete, chunk invalidation, namespace removal and
/// descriptor move to `Deleted/`.
async fn purge_container(state: &ApiState, hash: &str, delete_files: bool) -> anyhow::Result<()> {
    let Some(container) = state.store.get(hash) else {
        return Ok(());
    };
    let (host_id, files) = {
        let c = container.lock().expect("container lock poisoned");
        (c.host_id.clone(), c.files.clone())
    };
    if let Err(e) = state.provider.delete(&host_id).await {
        warn!(hash, "upstream delete: {e}");
    }
    for file in files {
        let (key, local_path, deleted) = {
            let f = file.lock().expect("file lock poisoned");
            (f.key(), f.local_path.clone(), f.deleted_locally)
        };
        if delete_files {
            let _ = state.cache.invalidate(&key).await;
        }
        if !deleted && !local_path.is_empty() {
            let _ = state.reconciler.namespace().delete_file(&local_path);
        }
    }
    state.store.purge(hash).await?;
    info!(hash, "torrent deleted via api");
    Ok(())
}
