//! API request handlers

use super::models::{
    ActivateRequest, DeleteModelRequest, DownloadAccepted, DownloadRequest, FilesQuery,
    HealthResponse, LocalModelInfo, MessageResponse, PruneResponse, RemoteFileInfo, SearchQuery,
    StatusResponse, mark_recommended,
};
use super::routes::AppState;
use crate::backend::{BackendKind, BackendState};
use crate::error::RouteError;
use crate::gpu::{self, GpuMemory};
use crate::models::{DownloadJob, VramFit};
use crate::router::{AudioFile, AudioUpload};
use axum::{
    Json,
    body::Bytes,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode, Uri},
    response::Response,
};
use serde_json::Value;

/// GET /health - Gateway health check
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /status - Arbitration snapshot
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let arbitration = state.router.coordinator().status().await;
    let gpu = gpu::query().await;

    Json(StatusResponse {
        backend: arbitration.backend,
        model: arbitration.model,
        vram: gpu.name.is_some().then_some(gpu),
        busy: arbitration.busy,
    })
}

/// GET /ui/gpu - GPU name and memory, best-effort
pub async fn gpu_info() -> Json<GpuMemory> {
    Json(gpu::query().await)
}

// ============================================================================
// OpenAI-compatible surface
// ============================================================================

/// GET /v1/models
pub async fn list_models(State(state): State<AppState>) -> Result<Response, RouteError> {
    state.router.list_models().await
}

/// POST /v1/{chat/completions,completions,embeddings,responses,images/generations}
pub async fn inference(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RouteError> {
    state.router.route(uri.path(), &headers, body).await
}

/// POST /v1/audio/transcriptions
pub async fn transcriptions(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, RouteError> {
    let upload = read_audio_upload(multipart).await?;
    state.router.route_audio(false, upload).await
}

/// POST /v1/audio/translations
pub async fn translations(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, RouteError> {
    let upload = read_audio_upload(multipart).await?;
    state.router.route_audio(true, upload).await
}

async fn read_audio_upload(mut multipart: Multipart) -> Result<AudioUpload, RouteError> {
    let invalid = |e: axum::extract::multipart::MultipartError| {
        RouteError::BadRequest(format!("invalid multipart body: {e}"))
    };

    let mut upload = AudioUpload::default();
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let file_name = field.file_name().unwrap_or("audio").to_string();
            let content_type = field.content_type().map(String::from);
            let data = field.bytes().await.map_err(invalid)?;
            upload.file = Some(AudioFile {
                name: file_name,
                content_type,
                data,
            });
        } else {
            let value = field.text().await.map_err(invalid)?;
            upload.fields.push((name, value));
        }
    }
    Ok(upload)
}

// ============================================================================
// Backends
// ============================================================================

/// GET /ui/backends - State of every backend
pub async fn list_backends(State(state): State<AppState>) -> Json<Vec<BackendState>> {
    Json(state.router.coordinator().supervisor().states().await)
}

/// POST /ui/backends/{kind}/activate - Make a backend resident
pub async fn activate_backend(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    body: Bytes,
) -> Result<Json<BackendState>, RouteError> {
    let kind: BackendKind = kind.parse().map_err(RouteError::NotFound)?;
    let request: ActivateRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ActivateRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| RouteError::BadRequest(format!("invalid JSON body: {e}")))?
    };

    tracing::info!(kind = %kind, model = ?request.model, "Manual backend activation");
    let backend = state.router.activate(kind, request.model).await?;
    Ok(Json(backend))
}

/// POST /ui/backends/stop - Release the resident backend
pub async fn stop_backends(
    State(state): State<AppState>,
) -> Result<Json<Vec<BackendState>>, RouteError> {
    let coordinator = state.router.coordinator();
    coordinator
        .deactivate()
        .await
        .map_err(|e| RouteError::ServiceUnavailable(e.to_string()))?;
    Ok(Json(coordinator.supervisor().states().await))
}

// ============================================================================
// Model management
// ============================================================================

/// GET /ui/models/search?q=&limit=&only_gguf=
pub async fn search_models(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Json<Vec<Value>> {
    let q = query.q.trim();
    if q.is_empty() {
        return Json(Vec::new());
    }
    let only_gguf = query.only_gguf != 0;

    match state.hub.search(q, query.limit.clamp(1, 100), only_gguf).await {
        Ok(mut results) => {
            if only_gguf {
                results.retain(|item| item.get("has_gguf") == Some(&Value::Bool(true)));
            }
            Json(results)
        }
        Err(e) => {
            tracing::error!(query = %q, error = %e, "Hub search failed");
            Json(Vec::new())
        }
    }
}

/// GET /ui/models/files?repo= - Model files in a repository, with VRAM fit
pub async fn list_repo_files(
    State(state): State<AppState>,
    Query(query): Query<FilesQuery>,
) -> Result<Json<Vec<RemoteFileInfo>>, RouteError> {
    let repo = query.repo.trim();
    if repo.is_empty() {
        return Err(RouteError::BadRequest("'repo' is required".into()));
    }

    let files = state.hub.list_files(repo).await.map_err(|e| {
        tracing::warn!(repo = %repo, error = %e, "Listing repository files failed");
        RouteError::BadGateway(format!("could not list files for {repo}: {e}"))
    })?;
    let total = gpu::query().await.total_mb();

    let mut files: Vec<RemoteFileInfo> = files
        .into_iter()
        .map(|f| {
            let estimate = f.size.map(|s| state.catalog.estimate(s));
            RemoteFileInfo::new(f, estimate, total)
        })
        .collect();

    mark_recommended(&mut files);
    Ok(Json(files))
}

/// GET /ui/models/local - Local model files
pub async fn list_local_models(
    State(state): State<AppState>,
) -> Result<Json<Vec<LocalModelInfo>>, RouteError> {
    state.catalog.refresh().await?;
    let total = gpu::query().await.total_mb();
    let loaded = state.router.coordinator().status().await.model;

    let models = state
        .catalog
        .list()
        .await
        .into_iter()
        .map(|entry| LocalModelInfo {
            fit: VramFit::classify(Some(entry.estimated_vram_mb), total),
            loaded: loaded.as_deref() == Some(entry.name.as_str()),
            entry,
        })
        .collect();
    Ok(Json(models))
}

/// DELETE /ui/models/local - Remove a local model file
pub async fn delete_local_model(
    State(state): State<AppState>,
    Json(req): Json<DeleteModelRequest>,
) -> Result<Json<MessageResponse>, RouteError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(RouteError::BadRequest("'name' is required".into()));
    }

    let loaded = state.router.coordinator().status().await.model;
    state.catalog.delete(name, loaded.as_deref()).await?;
    Ok(Json(MessageResponse {
        message: format!("deleted {name}"),
    }))
}

/// POST /ui/models/download - Start a download job
pub async fn start_download(
    State(state): State<AppState>,
    Json(req): Json<DownloadRequest>,
) -> Result<(StatusCode, Json<DownloadAccepted>), RouteError> {
    if req.repo.trim().is_empty() || req.file.trim().is_empty() {
        return Err(RouteError::BadRequest("'repo' and 'file' are required".into()));
    }

    let job = state.downloads.submit(&req.repo, &req.file).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DownloadAccepted {
            id: job.id,
            status: job.status,
        }),
    ))
}

/// GET /ui/models/download - All download jobs
pub async fn list_downloads(State(state): State<AppState>) -> Json<Vec<DownloadJob>> {
    Json(state.downloads.list())
}

/// DELETE /ui/models/download - Drop finished jobs
pub async fn prune_downloads(State(state): State<AppState>) -> Json<PruneResponse> {
    Json(PruneResponse {
        pruned: state.downloads.prune(),
    })
}

/// GET /ui/models/download/{id} - Job snapshot
pub async fn download_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DownloadJob>, RouteError> {
    Ok(Json(state.downloads.status(&id)?))
}

/// DELETE /ui/models/download/{id} - Cancel a job
pub async fn cancel_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DownloadJob>, RouteError> {
    Ok(Json(state.downloads.cancel(&id).await?))
}
