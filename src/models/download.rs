//! Download Job Manager
//!
//! Each download runs as its own task streaming into `<file>.part` in the
//! models directory and renaming into place once complete. Progress lives in
//! a shared job table; `status` is a plain read of that table.

use crate::error::DownloadError;
use crate::models::catalog::{ModelCatalog, PARTIAL_SUFFIX, safe_filename};
use crate::models::hub::HubClient;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Status of a download job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Downloading => write!(f, "downloading"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// Snapshot of a download job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: String,
    pub repo: String,
    pub file: String,
    pub status: JobStatus,
    pub downloaded_bytes: u64,
    /// Unknown until the transfer starts (and when the server omits it)
    pub total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

struct JobRecord {
    job: DownloadJob,
    /// Local file name the job writes
    target: String,
    abort: Option<AbortHandle>,
    /// Set once the rename has started; no cancel after that
    finalizing: bool,
}

struct ManagerInner {
    jobs: DashMap<String, JobRecord>,
    /// Local file name -> id of the job currently fetching it
    active: DashMap<String, String>,
    catalog: Arc<ModelCatalog>,
    hub: Arc<HubClient>,
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    progress_interval: Duration,
}

#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

impl DownloadManager {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        hub: Arc<HubClient>,
        max_concurrent: usize,
        progress_interval: Duration,
    ) -> anyhow::Result<Self> {
        // No overall timeout: model files run to tens of gigabytes
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            inner: Arc::new(ManagerInner {
                jobs: DashMap::new(),
                active: DashMap::new(),
                catalog,
                hub,
                client,
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
                progress_interval,
            }),
        })
    }

    /// Queue a download of `file` from `repo` into the models directory
    ///
    /// Returns an already-completed job when the file is present, and the
    /// existing job when the same file is already being fetched.
    pub async fn submit(&self, repo: &str, file: &str) -> Result<DownloadJob, DownloadError> {
        let repo = repo.trim().trim_matches('/');
        if repo.is_empty() || repo.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(DownloadError::InvalidFile(format!("invalid repository '{repo}'")));
        }
        let file = file.trim().trim_start_matches('/');
        if file.split('/').any(|part| part == "..") {
            return Err(DownloadError::InvalidFile(file.to_string()));
        }
        let target = safe_filename(file).map_err(|e| DownloadError::InvalidFile(e.to_string()))?;

        if self.inner.catalog.exists_on_disk(&target) {
            return Ok(self.completed_job(repo, file, &target).await);
        }

        let job = match self.inner.active.entry(target.clone()) {
            Entry::Occupied(mut existing) => {
                if let Some(record) = self.inner.jobs.get(existing.get())
                    && !record.job.status.is_terminal()
                {
                    tracing::debug!(
                        job_id = %record.job.id,
                        file = %target,
                        "Download already in progress"
                    );
                    return Ok(record.job.clone());
                }
                // Finished or pruned job whose marker is not cleared yet
                let job = new_job(repo, file, JobStatus::Queued);
                existing.insert(job.id.clone());
                job
            }
            Entry::Vacant(slot) => {
                let job = new_job(repo, file, JobStatus::Queued);
                slot.insert(job.id.clone());
                job
            }
        };

        self.inner.jobs.insert(
            job.id.clone(),
            JobRecord {
                job: job.clone(),
                target: target.clone(),
                abort: None,
                finalizing: false,
            },
        );

        let url = self.inner.hub.resolve_url(repo, file);
        let task = tokio::spawn(run_job(self.inner.clone(), job.id.clone(), url, target.clone()));
        if let Some(mut record) = self.inner.jobs.get_mut(&job.id) {
            record.abort = Some(task.abort_handle());
        }

        tracing::info!(job_id = %job.id, repo = %repo, file = %file, "Download queued");
        Ok(job)
    }

    async fn completed_job(&self, repo: &str, file: &str, target: &str) -> DownloadJob {
        let size = match self.inner.catalog.record_download(target).await {
            Ok(entry) => Some(entry.size),
            Err(e) => {
                tracing::warn!(file = %target, error = %e, "Could not stat existing model");
                None
            }
        };
        let mut job = new_job(repo, file, JobStatus::Completed);
        job.downloaded_bytes = size.unwrap_or(0);
        job.total_bytes = size;
        job.finished_at = Some(Utc::now());

        tracing::info!(
            job_id = %job.id,
            file = %target,
            "Model already present, nothing to download"
        );
        self.inner.jobs.insert(
            job.id.clone(),
            JobRecord {
                job: job.clone(),
                target: target.to_string(),
                abort: None,
                finalizing: false,
            },
        );
        job
    }

    pub fn status(&self, id: &str) -> Result<DownloadJob, DownloadError> {
        self.inner
            .jobs
            .get(id)
            .map(|r| r.job.clone())
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))
    }

    /// All jobs, oldest first
    pub fn list(&self) -> Vec<DownloadJob> {
        let mut jobs: Vec<_> = self.inner.jobs.iter().map(|r| r.job.clone()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Cancel a queued or running job and remove its partial data
    pub async fn cancel(&self, id: &str) -> Result<DownloadJob, DownloadError> {
        let (job, target) = {
            let mut record = self
                .inner
                .jobs
                .get_mut(id)
                .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
            if record.job.status.is_terminal() || record.finalizing {
                return Err(DownloadError::NotCancelable(id.to_string()));
            }
            if let Some(abort) = record.abort.take() {
                abort.abort();
            }
            record.job.status = JobStatus::Canceled;
            record.job.finished_at = Some(Utc::now());
            (record.job.clone(), record.target.clone())
        };

        self.inner.active.remove_if(&target, |_, owner| owner == id);
        remove_partial(&self.inner, &target).await;
        crate::metrics::record_download(JobStatus::Canceled);
        tracing::info!(job_id = %id, file = %target, "Download canceled");
        Ok(job)
    }

    /// Drop finished jobs from the table; returns how many were removed
    pub fn prune(&self) -> usize {
        let before = self.inner.jobs.len();
        self.inner.jobs.retain(|_, r| !r.job.status.is_terminal());
        before - self.inner.jobs.len()
    }

    /// Cancel everything still running
    pub async fn shutdown(&self) {
        let active: Vec<String> = self
            .inner
            .jobs
            .iter()
            .filter(|r| !r.job.status.is_terminal())
            .map(|r| r.key().clone())
            .collect();
        for id in active {
            let _ = self.cancel(&id).await;
        }
    }
}

fn new_job(repo: &str, file: &str, status: JobStatus) -> DownloadJob {
    DownloadJob {
        id: uuid::Uuid::new_v4().to_string(),
        repo: repo.to_string(),
        file: file.to_string(),
        status,
        downloaded_bytes: 0,
        total_bytes: None,
        error: None,
        created_at: Utc::now(),
        finished_at: None,
    }
}

fn partial_path(inner: &ManagerInner, target: &str) -> PathBuf {
    inner
        .catalog
        .dir()
        .join(format!("{target}{PARTIAL_SUFFIX}"))
}

async fn remove_partial(inner: &ManagerInner, target: &str) {
    let path = partial_path(inner, target);
    if let Err(e) = tokio::fs::remove_file(&path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = ?path, error = %e, "Failed to remove partial download");
    }
}

/// Apply `f` to the job unless it was canceled meanwhile
fn update_job<F>(inner: &ManagerInner, id: &str, f: F) -> bool
where
    F: FnOnce(&mut JobRecord),
{
    match inner.jobs.get_mut(id) {
        Some(mut record) if record.job.status != JobStatus::Canceled => {
            f(&mut record);
            true
        }
        _ => false,
    }
}

async fn run_job(inner: Arc<ManagerInner>, id: String, url: String, target: String) {
    let Ok(_permit) = inner.permits.clone().acquire_owned().await else {
        return;
    };

    if !update_job(&inner, &id, |r| r.job.status = JobStatus::Downloading) {
        return;
    }
    tracing::info!(job_id = %id, url = %url, "Download started");

    let outcome = match transfer(&inner, &id, &url, &target).await {
        Ok(()) => finalize(&inner, &id, &target).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => {
            crate::metrics::record_download(JobStatus::Completed);
            tracing::info!(job_id = %id, file = %target, "Download completed");
        }
        Err(e) => {
            remove_partial(&inner, &target).await;
            let message = e.to_string();
            let failed = update_job(&inner, &id, |r| {
                r.job.status = JobStatus::Failed;
                r.job.error = Some(message.clone());
                r.job.finished_at = Some(Utc::now());
            });
            if failed {
                crate::metrics::record_download(JobStatus::Failed);
                tracing::warn!(job_id = %id, file = %target, error = %message, "Download failed");
            }
        }
    }
    inner.active.remove_if(&target, |_, owner| owner == &id);
}

async fn transfer(
    inner: &ManagerInner,
    id: &str,
    url: &str,
    target: &str,
) -> Result<(), DownloadError> {
    let failed = |e: &dyn std::fmt::Display| DownloadError::TransferFailed(e.to_string());

    let response = inner
        .hub
        .authorize(inner.client.get(url))
        .send()
        .await
        .map_err(|e| failed(&e))?
        .error_for_status()
        .map_err(|e| failed(&e))?;

    let total = response.content_length();
    update_job(inner, id, |r| r.job.total_bytes = total);

    let part = partial_path(inner, target);
    let mut file = tokio::fs::File::create(&part)
        .await
        .map_err(|e| failed(&e))?;

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    let mut last_publish = Instant::now();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| failed(&e))?;
        file.write_all(&chunk).await.map_err(|e| failed(&e))?;
        downloaded += chunk.len() as u64;

        if last_publish.elapsed() >= inner.progress_interval {
            update_job(inner, id, |r| r.job.downloaded_bytes = downloaded);
            last_publish = Instant::now();
        }
    }
    file.flush().await.map_err(|e| failed(&e))?;
    drop(file);

    update_job(inner, id, |r| r.job.downloaded_bytes = downloaded);

    if let Some(total) = total
        && downloaded != total
    {
        return Err(DownloadError::TransferFailed(format!(
            "incomplete transfer: {downloaded} of {total} bytes"
        )));
    }
    Ok(())
}

/// Move the finished file into place and publish it
async fn finalize(inner: &ManagerInner, id: &str, target: &str) -> Result<(), DownloadError> {
    let part = partial_path(inner, target);
    let dest = inner
        .catalog
        .path_for(target)
        .map_err(|e| DownloadError::InvalidFile(e.to_string()))?;

    {
        let mut record = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
        if record.job.status == JobStatus::Canceled {
            return Err(DownloadError::TransferFailed("canceled".into()));
        }
        record.finalizing = true;
    }

    // Something else put the file there while we were transferring
    if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
        return Err(DownloadError::AlreadyExists(target.to_string()));
    }
    tokio::fs::rename(&part, &dest)
        .await
        .map_err(|e| DownloadError::TransferFailed(e.to_string()))?;

    inner
        .catalog
        .record_download(target)
        .await
        .map_err(|e| DownloadError::TransferFailed(e.to_string()))?;

    update_job(inner, id, |r| {
        r.job.status = JobStatus::Completed;
        r.job.finished_at = Some(Utc::now());
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        body::Body,
        extract::Path,
        http::{StatusCode, header},
        response::{IntoResponse, Response},
        routing::get,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CHUNK: usize = 64 * 1024;
    const CHUNKS: usize = 8;

    async fn serve_file(
        Path((_org, _name, file)): Path<(String, String, String)>,
        hits: Arc<AtomicUsize>,
    ) -> Response {
        hits.fetch_add(1, Ordering::SeqCst);
        let delay = if file.starts_with("slow") {
            Duration::from_millis(200)
        } else {
            Duration::from_millis(2)
        };
        if file.starts_with("missing") {
            return StatusCode::NOT_FOUND.into_response();
        }

        let stream = futures::stream::unfold(0usize, move |sent| async move {
            if sent == CHUNKS {
                return None;
            }
            tokio::time::sleep(delay).await;
            Some((Ok::<_, std::io::Error>(vec![7u8; CHUNK]), sent + 1))
        });
        Response::builder()
            .header(header::CONTENT_LENGTH, (CHUNK * CHUNKS).to_string())
            .body(Body::from_stream(stream))
            .unwrap()
    }

    struct Harness {
        manager: DownloadManager,
        catalog: Arc<ModelCatalog>,
        hits: Arc<AtomicUsize>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/{org}/{name}/resolve/main/{file}",
            get(move |path: Path<(String, String, String)>| serve_file(path, counter.clone())),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(ModelCatalog::new(dir.path(), 1.15));
        catalog.refresh().await.unwrap();
        let hub = Arc::new(HubClient::new(&format!("http://{addr}"), None).unwrap());
        let manager =
            DownloadManager::new(catalog.clone(), hub, 2, Duration::from_millis(1)).unwrap();

        Harness {
            manager,
            catalog,
            hits,
            _dir: dir,
        }
    }

    async fn wait_terminal(manager: &DownloadManager, id: &str) -> (DownloadJob, Vec<u64>) {
        let mut seen = Vec::new();
        for _ in 0..500 {
            let job = manager.status(id).unwrap();
            seen.push(job.downloaded_bytes);
            if job.status.is_terminal() {
                return (job, seen);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn test_download_completes_into_catalog() {
        let h = harness().await;
        let job = h.manager.submit("org/repo", "model.gguf").await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let (job, progress) = wait_terminal(&h.manager, &job.id).await;
        assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
        assert_eq!(job.downloaded_bytes, (CHUNK * CHUNKS) as u64);
        assert_eq!(job.total_bytes, Some((CHUNK * CHUNKS) as u64));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));

        assert!(h.catalog.get("model.gguf").await.is_some());
        assert!(!h.catalog.dir().join("model.gguf.part").exists());
    }

    #[tokio::test]
    async fn test_existing_file_is_synthetic_completed() {
        let h = harness().await;
        std::fs::write(h.catalog.dir().join("have.gguf"), b"GGUF").unwrap();

        let job = h.manager.submit("org/repo", "have.gguf").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.downloaded_bytes, 4);
        assert_eq!(h.hits.load(Ordering::SeqCst), 0);
        assert_eq!(h.manager.status(&job.id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_submit_returns_active_job() {
        let h = harness().await;
        let first = h.manager.submit("org/repo", "slow.gguf").await.unwrap();
        let second = h.manager.submit("org/repo", "slow.gguf").await.unwrap();
        assert_eq!(first.id, second.id);

        h.manager.cancel(&first.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_removes_partial_data() {
        let h = harness().await;
        let job = h.manager.submit("org/repo", "slow.gguf").await.unwrap();

        // wait until bytes are flowing
        for _ in 0..200 {
            if h.manager.status(&job.id).unwrap().status == JobStatus::Downloading {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let canceled = h.manager.cancel(&job.id).await.unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!h.catalog.dir().join("slow.gguf.part").exists());
        assert!(!h.catalog.dir().join("slow.gguf").exists());
        assert_eq!(h.manager.status(&job.id).unwrap().status, JobStatus::Canceled);

        let err = h.manager.cancel(&job.id).await.unwrap_err();
        assert!(matches!(err, DownloadError::NotCancelable(_)));
    }

    #[tokio::test]
    async fn test_file_appearing_during_transfer_is_kept() {
        let h = harness().await;
        let job = h.manager.submit("org/repo", "slow.gguf").await.unwrap();
        std::fs::write(h.catalog.dir().join("slow.gguf"), b"mine").unwrap();

        let (job, _) = wait_terminal(&h.manager, &job.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("already exists"));
        assert_eq!(std::fs::read(h.catalog.dir().join("slow.gguf")).unwrap(), b"mine");
        assert!(!h.catalog.dir().join("slow.gguf.part").exists());
    }

    #[tokio::test]
    async fn test_http_error_marks_failed() {
        let h = harness().await;
        let job = h.manager.submit("org/repo", "missing.gguf").await.unwrap();

        let (job, _) = wait_terminal(&h.manager, &job.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("404"));
        assert!(h.catalog.get("missing.gguf").await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_references() {
        let h = harness().await;
        assert!(matches!(
            h.manager.submit("org/repo", "notes.txt").await,
            Err(DownloadError::InvalidFile(_))
        ));
        assert!(matches!(
            h.manager.submit("../etc", "a.gguf").await,
            Err(DownloadError::InvalidFile(_))
        ));
        assert!(matches!(
            h.manager.status("nope"),
            Err(DownloadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_prune_keeps_active_jobs() {
        let h = harness().await;
        std::fs::write(h.catalog.dir().join("done.gguf"), b"x").unwrap();
        h.manager.submit("org/repo", "done.gguf").await.unwrap();
        let running = h.manager.submit("org/repo", "slow.gguf").await.unwrap();

        assert_eq!(h.manager.prune(), 1);
        assert_eq!(h.manager.list().len(), 1);
        assert_eq!(h.manager.list()[0].id, running.id);

        h.manager.shutdown().await;
        assert_eq!(h.manager.status(&running.id).unwrap().status, JobStatus::Canceled);
    }
}
