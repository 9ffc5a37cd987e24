//! API request and response models

use crate::backend::BackendKind;
use crate::gpu::GpuMemory;
use crate::models::{CatalogEntry, JobStatus, RemoteFile, VramFit};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Arbitration snapshot plus GPU memory
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub backend: Option<BackendKind>,
    pub model: Option<String>,
    /// `None` when no GPU could be queried
    pub vram: Option<GpuMemory>,
    pub busy: bool,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
    #[serde(default)]
    pub only_gguf: u8,
}

fn default_search_limit() -> usize {
    12
}

#[derive(Debug, Deserialize)]
pub struct FilesQuery {
    pub repo: String,
}

/// Remote file annotated with its expected footprint
#[derive(Debug, Serialize)]
pub struct RemoteFileInfo {
    pub name: String,
    pub size: Option<u64>,
    pub estimated_vram_mb: Option<u64>,
    pub fit: VramFit,
    pub recommended: bool,
}

impl RemoteFileInfo {
    pub fn new(
        file: RemoteFile,
        estimated_vram_mb: Option<u64>,
        total_vram_mb: Option<u64>,
    ) -> Self {
        Self {
            name: file.name,
            size: file.size,
            estimated_vram_mb,
            fit: VramFit::classify(estimated_vram_mb, total_vram_mb),
            recommended: false,
        }
    }
}

/// Flag the largest file that fits comfortably
pub fn mark_recommended(files: &mut [RemoteFileInfo]) {
    if let Some(best) = files
        .iter_mut()
        .filter(|f| f.fit == VramFit::Ok)
        .max_by_key(|f| f.size.unwrap_or(0))
    {
        best.recommended = true;
    }
}

/// Local model annotated with its fit on this GPU
#[derive(Debug, Serialize)]
pub struct LocalModelInfo {
    #[serde(flatten)]
    pub entry: CatalogEntry,
    pub fit: VramFit,
    /// Loaded by the resident backend
    pub loaded: bool,
}

#[derive(Debug, Deserialize)]
pub struct DeleteModelRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub file: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadAccepted {
    pub id: String,
    pub status: JobStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PruneResponse {
    pub pruned: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivateRequest {
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}
