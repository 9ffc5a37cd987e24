//! Prometheus metrics

use crate::backend::BackendKind;
use crate::models::download::JobStatus;
use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a completed switch attempt (`outcome` is "success" or "failure")
pub fn record_switch(kind: BackendKind, outcome: &str, elapsed: Duration) {
    metrics::counter!("meigahub_switches_total",
        "kind" => kind.as_str(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    metrics::histogram!("meigahub_switch_duration_seconds",
        "kind" => kind.as_str()
    )
    .record(elapsed.as_secs_f64());
}

/// Record a caller giving up on arbitration at its deadline
pub fn record_switch_wait_timeout(kind: BackendKind) {
    metrics::counter!("meigahub_switch_timeouts_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a forwarded inference request by backend status code
pub fn record_forward(kind: BackendKind, status: u16) {
    metrics::counter!("meigahub_forwarded_requests_total",
        "kind" => kind.as_str(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record health check failure
pub fn record_health_check_failure(kind: BackendKind) {
    metrics::counter!("meigahub_health_check_failures_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record an owned backend process exiting on its own
pub fn record_backend_exit(kind: BackendKind) {
    metrics::counter!("meigahub_backend_exits_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a download job reaching a terminal state
pub fn record_download(outcome: JobStatus) {
    metrics::counter!("meigahub_downloads_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// One gauge per kind; 1 for the resident backend, 0 otherwise
pub fn update_resident(resident: Option<BackendKind>) {
    for kind in BackendKind::ALL {
        let value = if resident == Some(kind) { 1.0 } else { 0.0 };
        metrics::gauge!("meigahub_backend_resident", "kind" => kind.as_str()).set(value);
    }
}
