//! GPU memory query
//!
//! Best-effort: reads name and memory figures from nvidia-smi. Machines
//! without an NVIDIA GPU (or without the tool on PATH) report an empty
//! snapshot rather than an error.

use serde::Serialize;
use std::time::Duration;
use tokio::process::Command;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Memory snapshot of the first visible GPU, in MiB
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GpuMemory {
    pub name: Option<String>,
    pub vram_total_mb: u64,
    pub vram_free_mb: u64,
    pub vram_used_mb: u64,
}

impl GpuMemory {
    /// Total VRAM, if a GPU was detected
    pub fn total_mb(&self) -> Option<u64> {
        (self.name.is_some() && self.vram_total_mb > 0).then_some(self.vram_total_mb)
    }
}

/// Query the GPU via nvidia-smi
pub async fn query() -> GpuMemory {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,memory.free,memory.used",
            "--format=csv,noheader,nounits",
        ])
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(QUERY_TIMEOUT, output).await {
        Ok(Ok(output)) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            parse_query(&stdout).unwrap_or_default()
        }
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(stderr = %stderr.trim(), "nvidia-smi failed");
            GpuMemory::default()
        }
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "nvidia-smi not available");
            GpuMemory::default()
        }
        Err(_) => {
            tracing::warn!(timeout = ?QUERY_TIMEOUT, "nvidia-smi timed out");
            GpuMemory::default()
        }
    }
}

/// Parse the first line of `name, total, free, used` CSV output
fn parse_query(stdout: &str) -> Option<GpuMemory> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 4 {
        return None;
    }

    Some(GpuMemory {
        name: Some(parts[0].to_string()),
        vram_total_mb: parts[1].parse().ok()?,
        vram_free_mb: parts[2].parse().ok()?,
        vram_used_mb: parts[3].parse().ok()?,
    })
}
