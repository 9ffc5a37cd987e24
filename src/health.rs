//! Backend health probing and residency monitoring

use crate::backend::BackendKind;
use crate::coordinator::SwitchCoordinator;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::interval;

/// Answers whether a backend's health endpoint is up
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, kind: BackendKind, url: &str) -> bool;
}

/// HTTP probe: healthy when the endpoint answers with a status below 500
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, kind: BackendKind, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => {
                let healthy = response.status().as_u16() < 500;
                if !healthy {
                    tracing::debug!(
                        kind = %kind,
                        status = %response.status(),
                        "Health check rejected"
                    );
                }
                healthy
            }
            Err(e) => {
                tracing::trace!(kind = %kind, error = %e, "Health check unreachable");
                false
            }
        }
    }
}

/// Periodic watchdog over the resident backend
///
/// Reaps processes that died on their own and refreshes health timestamps.
/// Never restarts anything; recovery happens on the next request.
pub struct ResidencyMonitor {
    coordinator: SwitchCoordinator,
    check_interval: Duration,
}

impl ResidencyMonitor {
    pub fn new(coordinator: SwitchCoordinator, check_interval_secs: u64) -> Self {
        Self {
            coordinator,
            check_interval: Duration::from_secs(check_interval_secs),
        }
    }

    /// Start monitoring loop
    pub async fn run(self) {
        let mut ticker = interval(self.check_interval);

        tracing::info!(
            interval_secs = self.check_interval.as_secs(),
            "Residency monitoring started"
        );

        loop {
            ticker.tick().await;
            self.check_all().await;
        }
    }

    pub async fn check_all(&self) {
        // A running switch owns every backend; look again next tick
        let Some(_quiet) = self.coordinator.try_quiesce() else {
            tracing::debug!("Switch in progress, skipping residency check");
            return;
        };

        let supervisor = self.coordinator.supervisor();
        for kind in BackendKind::ALL {
            if let Some(status) = supervisor.reap(kind).await {
                tracing::warn!(kind = %kind, exit = %status, "Backend exited unexpectedly");
                crate::metrics::record_backend_exit(kind);
                continue;
            }

            if supervisor.current_state(kind).await.is_ready() {
                if supervisor.health_check(kind).await {
                    self.handle_success(kind);
                } else {
                    self.handle_failure(kind);
                }
            }
        }
        crate::metrics::update_resident(supervisor.resident_kind().await);
    }

    fn handle_success(&self, kind: BackendKind) {
        tracing::trace!(kind = %kind, "Resident backend healthy");
    }

    fn handle_failure(&self, kind: BackendKind) {
        // Busy backends can miss a probe; the state is left alone
        tracing::warn!(kind = %kind, "Resident backend failed health check");
        crate::metrics::record_health_check_failure(kind);
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

#[cfg(test)]
pub mod mocks {
    use super::*;
    use crate::process::mocks::MockProcessManager;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// Healthy while the mock process for the kind is alive
    pub struct MockHealthProbe {
        processes: Arc<MockProcessManager>,
        never_ready: Mutex<HashSet<BackendKind>>,
        external: Mutex<HashSet<BackendKind>>,
    }

    impl MockHealthProbe {
        pub fn new(processes: Arc<MockProcessManager>) -> Self {
            Self {
                processes,
                never_ready: Mutex::new(HashSet::new()),
                external: Mutex::new(HashSet::new()),
            }
        }

        pub fn set_never_ready(&self, kind: BackendKind, never: bool) {
            let mut set = self.never_ready.lock().unwrap();
            if never {
                set.insert(kind);
            } else {
                set.remove(&kind);
            }
        }

        /// Pretend something outside the gateway serves this kind
        pub fn set_external(&self, kind: BackendKind, up: bool) {
            let mut set = self.external.lock().unwrap();
            if up {
                set.insert(kind);
            } else {
                set.remove(&kind);
            }
        }
    }

    #[async_trait]
    impl HealthProbe for MockHealthProbe {
        async fn check(&self, kind: BackendKind, _url: &str) -> bool {
            if self.external.lock().unwrap().contains(&kind) {
                return true;
            }
            self.processes.is_kind_running(kind)
                && !self.never_ready.lock().unwrap().contains(&kind)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendStatus;
    use crate::coordinator::SwitchRequest;
    use crate::supervisor::testing::fixture;
    use axum::{Router, http::StatusCode, routing::get};

    async fn serve(status: StatusCode) -> String {
        let app = Router::new().route("/health", get(move || async move { status }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/health")
    }

    #[tokio::test]
    async fn test_http_probe_status_threshold() {
        let probe = HttpHealthProbe::new().unwrap();

        let ok = serve(StatusCode::OK).await;
        assert!(probe.check(BackendKind::Text, &ok).await);

        // 4xx still means the server is up
        let not_found = serve(StatusCode::NOT_FOUND).await;
        assert!(probe.check(BackendKind::Text, &not_found).await);

        let loading = serve(StatusCode::SERVICE_UNAVAILABLE).await;
        assert!(!probe.check(BackendKind::Text, &loading).await);
    }

    #[tokio::test]
    async fn test_http_probe_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = HttpHealthProbe::new().unwrap();
        assert!(!probe.check(BackendKind::Audio, &format!("http://{addr}/health")).await);
    }

    #[tokio::test]
    async fn test_monitor_reaps_crashed_backend() {
        let fx = fixture();
        let coordinator =
            SwitchCoordinator::new(fx.supervisor.clone(), true, fx.config.switch_timeout());
        coordinator
            .ensure(SwitchRequest::new(BackendKind::Audio, None, fx.config.switch_timeout()))
            .await
            .unwrap();

        fx.processes.crash(BackendKind::Audio, "signal: 9 (SIGKILL)");
        let monitor = ResidencyMonitor::new(coordinator.clone(), 1);
        monitor.check_all().await;

        let state = fx.supervisor.current_state(BackendKind::Audio).await;
        assert_eq!(state.status, BackendStatus::Failed);
        assert!(state.last_error.unwrap().contains("SIGKILL"));
        // never restarted
        assert_eq!(fx.processes.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_monitor_refreshes_health_timestamp() {
        let fx = fixture();
        let coordinator =
            SwitchCoordinator::new(fx.supervisor.clone(), true, fx.config.switch_timeout());
        coordinator
            .ensure(SwitchRequest::new(BackendKind::Image, None, fx.config.switch_timeout()))
            .await
            .unwrap();
        let before = fx.supervisor.current_state(BackendKind::Image).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        ResidencyMonitor::new(coordinator, 1).check_all().await;

        let after = fx.supervisor.current_state(BackendKind::Image).await;
        assert_eq!(after.status, BackendStatus::Ready);
        assert!(after.last_health_check_at > before.last_health_check_at);
    }
}
