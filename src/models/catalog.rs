//! Local model catalog
//!
//! Tracks model files in the models directory. The catalog is read by the
//! router on every request that names a model and written only by
//! `refresh`, completed downloads and deletions.
//!
//! ```text
//! <models_dir>/
//! ├── qwen2.5-7b-instruct-q4_k_m.gguf      text
//! ├── ggml-large-v3.bin                    audio
//! ├── sdxl-turbo.safetensors               image
//! └── qwen2.5-7b-instruct-q4_k_m.gguf.part in-flight download (ignored)
//! ```

use crate::backend::BackendKind;
use crate::error::CatalogError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// File extensions accepted as model files
pub const MODEL_EXTENSIONS: [&str; 4] = ["gguf", "bin", "safetensors", "ckpt"];

/// Suffix used for downloads still in progress
pub const PARTIAL_SUFFIX: &str = ".part";

const MIB: f64 = 1024.0 * 1024.0;

/// Fraction of total VRAM above which a model is considered a tight fit
const TIGHT_FRACTION: f64 = 0.85;

/// One local model file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<BackendKind>,
    pub estimated_vram_mb: u64,
}

/// How a model footprint compares to the GPU's memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VramFit {
    Ok,
    Tight,
    No,
    Unknown,
}

impl VramFit {
    pub fn classify(estimated_mb: Option<u64>, total_mb: Option<u64>) -> Self {
        match (estimated_mb, total_mb) {
            (Some(need), Some(total)) if total > 0 => {
                let need = need as f64;
                let total = total as f64;
                if need <= total * TIGHT_FRACTION {
                    VramFit::Ok
                } else if need <= total {
                    VramFit::Tight
                } else {
                    VramFit::No
                }
            }
            _ => VramFit::Unknown,
        }
    }

    pub fn fits(&self) -> bool {
        matches!(self, VramFit::Ok | VramFit::Tight)
    }
}

/// Reduce a model reference to a bare, safe file name
///
/// Directory components are dropped; only known model extensions pass.
pub fn safe_filename(name: &str) -> Result<String, CatalogError> {
    let file = name
        .trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    if file.is_empty() || file == "." || file == ".." {
        return Err(CatalogError::InvalidName(name.to_string()));
    }
    if !has_model_extension(file) {
        return Err(CatalogError::InvalidName(format!(
            "{name} (expected one of: {})",
            MODEL_EXTENSIONS.join(", ")
        )));
    }
    Ok(file.to_string())
}

pub fn has_model_extension(file: &str) -> bool {
    Path::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            MODEL_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Guess which backend serves a model file from its name
pub fn infer_kind(file: &str) -> Option<BackendKind> {
    let lower = file.to_ascii_lowercase();
    let ext = Path::new(&lower).extension()?.to_str()?.to_string();
    match ext.as_str() {
        _ if lower.contains("whisper") => Some(BackendKind::Audio),
        "gguf" => Some(BackendKind::Text),
        "bin" => Some(BackendKind::Audio),
        "safetensors" | "ckpt" => Some(BackendKind::Image),
        _ => None,
    }
}

/// Estimated VRAM in MiB for a file of `size` bytes
pub fn estimate_vram_mb(size: u64, headroom: f64) -> u64 {
    ((size as f64 * headroom) / MIB).ceil() as u64
}

pub struct ModelCatalog {
    dir: PathBuf,
    headroom: f64,
    entries: RwLock<BTreeMap<String, CatalogEntry>>,
}

impl ModelCatalog {
    pub fn new(dir: impl Into<PathBuf>, headroom: f64) -> Self {
        Self {
            dir: dir.into(),
            headroom,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// VRAM estimate for a file of `size` bytes with this catalog's headroom
    pub fn estimate(&self, size: u64) -> u64 {
        estimate_vram_mb(size, self.headroom)
    }

    fn entry_for(&self, name: &str, size: u64) -> CatalogEntry {
        CatalogEntry {
            name: name.to_string(),
            size,
            kind: infer_kind(name),
            estimated_vram_mb: estimate_vram_mb(size, self.headroom),
        }
    }

    /// Rescan the models directory; returns the number of entries
    pub async fn refresh(&self) -> Result<usize, CatalogError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut scanned = BTreeMap::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let Ok(name) = item.file_name().into_string() else {
                continue;
            };
            if name.ends_with(PARTIAL_SUFFIX) || !has_model_extension(&name) {
                continue;
            }
            let metadata = item.metadata().await?;
            if metadata.is_file() {
                scanned.insert(name.clone(), self.entry_for(&name, metadata.len()));
            }
        }

        let count = scanned.len();
        *self.entries.write().await = scanned;
        tracing::debug!(dir = ?self.dir, models = count, "Model catalog refreshed");
        Ok(count)
    }

    /// Entries sorted case-insensitively by name
    pub async fn list(&self) -> Vec<CatalogEntry> {
        let mut entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        entries.sort_by_key(|e| e.name.to_lowercase());
        entries
    }

    pub async fn get(&self, name: &str) -> Option<CatalogEntry> {
        self.entries.read().await.get(name).cloned()
    }

    /// Look a model up by exact name, or by name without its `.gguf` suffix
    pub async fn resolve(&self, name: &str) -> Option<CatalogEntry> {
        let entries = self.entries.read().await;
        let file = safe_filename(name)
            .ok()
            .unwrap_or_else(|| format!("{}.gguf", name.trim()));
        entries
            .get(&file)
            .or_else(|| entries.get(&format!("{file}.gguf")))
            .cloned()
    }

    /// Absolute destination path for a model name
    pub fn path_for(&self, name: &str) -> Result<PathBuf, CatalogError> {
        Ok(self.dir.join(safe_filename(name)?))
    }

    /// Whether the file is already on disk (fresh stat, not the cached view)
    pub fn exists_on_disk(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Register a file that just landed in the models directory
    pub async fn record_download(&self, name: &str) -> Result<CatalogEntry, CatalogError> {
        let path = self.path_for(name)?;
        let size = tokio::fs::metadata(&path).await?.len();
        let entry = self.entry_for(name, size);
        self.entries
            .write()
            .await
            .insert(name.to_string(), entry.clone());
        tracing::info!(model = %name, size = size, "Model added to catalog");
        Ok(entry)
    }

    /// Remove a local model; `loaded` is the resident backend's model
    pub async fn delete(&self, name: &str, loaded: Option<&str>) -> Result<(), CatalogError> {
        let file = safe_filename(name)?;
        if loaded == Some(file.as_str()) {
            return Err(CatalogError::InUse(file));
        }

        let path = self.dir.join(&file);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.entries.write().await.remove(&file);
                return Err(CatalogError::NotFound(file));
            }
            Err(e) => return Err(e.into()),
        }

        self.entries.write().await.remove(&file);
        tracing::info!(model = %file, "Model deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, bytes: usize) {
        std::fs::write(dir.join(name), vec![0u8; bytes]).unwrap();
    }

    async fn catalog_with_files() -> (ModelCatalog, TempDir) {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "Qwen-7B.gguf", 2048);
        write(dir.path(), "ggml-base.bin", 1024);
        write(dir.path(), "sdxl.safetensors", 512);
        write(dir.path(), "half.gguf.part", 10);
        write(dir.path(), "README.md", 10);
        std::fs::create_dir(dir.path().join("nested.gguf")).unwrap();

        let catalog = ModelCatalog::new(dir.path(), 1.15);
        catalog.refresh().await.unwrap();
        (catalog, dir)
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("model.gguf").unwrap(), "model.gguf");
        assert_eq!(safe_filename("../../etc/model.GGUF").unwrap(), "model.GGUF");
        assert_eq!(safe_filename("org\\repo\\w.bin").unwrap(), "w.bin");
        assert!(safe_filename("..").is_err());
        assert!(safe_filename("dir/").is_err());
        assert!(safe_filename("notes.txt").is_err());
        assert!(safe_filename("").is_err());
    }

    #[test]
    fn test_infer_kind() {
        assert_eq!(infer_kind("qwen.gguf"), Some(BackendKind::Text));
        assert_eq!(infer_kind("whisper-large.gguf"), Some(BackendKind::Audio));
        assert_eq!(infer_kind("ggml-base.bin"), Some(BackendKind::Audio));
        assert_eq!(infer_kind("sd15.ckpt"), Some(BackendKind::Image));
        assert_eq!(infer_kind("notes.txt"), None);
    }

    #[test]
    fn test_vram_fit() {
        assert_eq!(VramFit::classify(Some(8000), Some(10000)), VramFit::Ok);
        assert_eq!(VramFit::classify(Some(9000), Some(10000)), VramFit::Tight);
        assert_eq!(VramFit::classify(Some(12000), Some(10000)), VramFit::No);
        assert_eq!(VramFit::classify(None, Some(10000)), VramFit::Unknown);
        assert_eq!(VramFit::classify(Some(1), None), VramFit::Unknown);
        assert!(VramFit::Tight.fits());
        assert!(!VramFit::No.fits());
    }

    #[test]
    fn test_estimate_vram() {
        // 1 GiB with 15% headroom
        assert_eq!(estimate_vram_mb(1024 * 1024 * 1024, 1.15), 1178);
        assert_eq!(estimate_vram_mb(0, 1.15), 0);
    }

    #[tokio::test]
    async fn test_refresh_skips_partial_and_foreign_files() {
        let (catalog, _dir) = catalog_with_files().await;
        let names: Vec<_> = catalog.list().await.into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["ggml-base.bin", "Qwen-7B.gguf", "sdxl.safetensors"]);

        let entry = catalog.get("Qwen-7B.gguf").await.unwrap();
        assert_eq!(entry.size, 2048);
        assert_eq!(entry.kind, Some(BackendKind::Text));
    }

    #[tokio::test]
    async fn test_resolve_with_and_without_extension() {
        let (catalog, _dir) = catalog_with_files().await;
        assert!(catalog.resolve("Qwen-7B.gguf").await.is_some());
        assert_eq!(catalog.resolve("Qwen-7B").await.unwrap().name, "Qwen-7B.gguf");
        assert!(catalog.resolve("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_record_download() {
        let (catalog, dir) = catalog_with_files().await;
        write(dir.path(), "new.gguf", 4096);
        assert!(catalog.get("new.gguf").await.is_none());

        let entry = catalog.record_download("new.gguf").await.unwrap();
        assert_eq!(entry.size, 4096);
        assert!(catalog.get("new.gguf").await.is_some());
    }

    #[tokio::test]
    async fn test_delete() {
        let (catalog, dir) = catalog_with_files().await;

        let err = catalog.delete("Qwen-7B.gguf", Some("Qwen-7B.gguf")).await.unwrap_err();
        assert!(matches!(err, CatalogError::InUse(_)));
        assert!(dir.path().join("Qwen-7B.gguf").exists());

        catalog.delete("Qwen-7B.gguf", None).await.unwrap();
        assert!(!dir.path().join("Qwen-7B.gguf").exists());
        assert!(catalog.get("Qwen-7B.gguf").await.is_none());

        let err = catalog.delete("Qwen-7B.gguf", None).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));

        let err = catalog.delete("../secret.txt", None).await.unwrap_err();
        assert!(matches!(err, CatalogError::InvalidName(_)));
    }
}
