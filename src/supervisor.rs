//! Backend Supervisor: owns one external process per backend kind
//!
//! Every `BackendState` transition happens here. Callers serialize access
//! through the switch coordinator; the supervisor itself only guards each
//! slot's state and process handle.

use crate::backend::{BackendKind, BackendState, BackendStatus};
use crate::config::{BackendConfig, GatewayConfig};
use crate::error::{StartError, StopError};
use crate::health::HealthProbe;
use crate::models::catalog::safe_filename;
use crate::process::{ProcessHandle, ProcessManager, SpawnConfig};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// Timing knobs for start/stop sequencing
#[derive(Debug, Clone)]
pub struct SupervisorTiming {
    pub poll_interval: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub stop_command_timeout: Duration,
    pub stop_verify_timeout: Duration,
}

impl SupervisorTiming {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.health_poll_interval_ms),
            start_timeout: config.start_timeout(),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
            stop_command_timeout: Duration::from_secs(config.stop_command_timeout_secs),
            stop_verify_timeout: Duration::from_secs(config.stop_verify_timeout_secs),
        }
    }
}

struct Slot {
    config: BackendConfig,
    state: RwLock<BackendState>,
    handle: Mutex<Option<ProcessHandle>>,
}

pub struct BackendSupervisor {
    slots: [Slot; 3],
    processes: Arc<dyn ProcessManager>,
    probe: Arc<dyn HealthProbe>,
    timing: SupervisorTiming,
    models_dir: PathBuf,
    log_dir: PathBuf,
}

impl BackendSupervisor {
    pub fn new(
        config: &GatewayConfig,
        processes: Arc<dyn ProcessManager>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let slot = |kind: BackendKind| Slot {
            config: config.backend(kind).clone(),
            state: RwLock::new(BackendState::new(kind)),
            handle: Mutex::new(None),
        };

        Self {
            slots: BackendKind::ALL.map(slot),
            processes,
            probe,
            timing: SupervisorTiming::from_config(config),
            models_dir: config.models_dir.clone(),
            log_dir: config.log_dir.clone(),
        }
    }

    fn slot(&self, kind: BackendKind) -> &Slot {
        match kind {
            BackendKind::Text => &self.slots[0],
            BackendKind::Audio => &self.slots[1],
            BackendKind::Image => &self.slots[2],
        }
    }

    pub fn config(&self, kind: BackendKind) -> &BackendConfig {
        &self.slot(kind).config
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Whether a request may choose which model this kind loads
    pub fn accepts_model_choice(&self, kind: BackendKind) -> bool {
        let config = self.config(kind);
        config.dynamic_model && !config.is_external()
    }

    pub async fn current_state(&self, kind: BackendKind) -> BackendState {
        self.slot(kind).state.read().await.clone()
    }

    pub async fn states(&self) -> Vec<BackendState> {
        let mut states = Vec::with_capacity(3);
        for kind in BackendKind::ALL {
            states.push(self.current_state(kind).await);
        }
        states
    }

    /// Kind currently holding the GPU, if any
    pub async fn resident_kind(&self) -> Option<BackendKind> {
        for kind in BackendKind::ALL {
            if self.slot(kind).state.read().await.status.is_resident() {
                return Some(kind);
            }
        }
        None
    }

    async fn update<F>(&self, kind: BackendKind, f: F) -> BackendState
    where
        F: FnOnce(&mut BackendState),
    {
        let mut state = self.slot(kind).state.write().await;
        f(&mut state);
        state.clone()
    }

    async fn fail(&self, kind: BackendKind, error: &str) -> BackendState {
        tracing::warn!(kind = %kind, error = %error, "Backend marked failed");
        self.update(kind, |s| {
            s.status = BackendStatus::Failed;
            s.pid = None;
            s.last_error = Some(error.to_string());
        })
        .await
    }

    /// Probe the health endpoint, recording the time of a successful answer
    pub async fn health_check(&self, kind: BackendKind) -> bool {
        let url = self.config(kind).health_url();
        let healthy = self.probe.check(kind, &url).await;
        if healthy {
            self.update(kind, |s| s.last_health_check_at = Some(Utc::now()))
                .await;
        }
        healthy
    }

    /// Whether the kind can be started: it has a command or already answers
    pub async fn can_launch(&self, kind: BackendKind) -> bool {
        !self.config(kind).is_external() || self.health_check(kind).await
    }

    /// Launch the backend and wait for it to report healthy
    pub async fn start(
        &self,
        kind: BackendKind,
        model: Option<&str>,
    ) -> Result<BackendState, StartError> {
        let slot = self.slot(kind);
        let mut handle_guard = slot.handle.lock().await;

        if handle_guard.is_some() {
            return Err(StartError::Other(format!(
                "{kind} backend still owns a process; stop it first"
            )));
        }

        let label = model
            .map(String::from)
            .or_else(|| slot.config.default_model.clone());

        // Already answering: adopt it instead of spawning a second copy
        let pick_matters = model.is_some() && slot.config.dynamic_model;
        if (slot.config.is_external() || !pick_matters) && self.health_check(kind).await {
            tracing::info!(kind = %kind, model = ?label, "Backend already running externally");
            return Ok(self
                .update(kind, |s| {
                    s.status = BackendStatus::Ready;
                    s.loaded_model = label.clone();
                    s.pid = None;
                    s.external = true;
                    s.started_at = Some(Utc::now());
                    s.last_error = None;
                })
                .await);
        }

        if slot.config.is_external() {
            let message = format!("{kind} backend has no launch command and is not running");
            self.fail(kind, &message).await;
            return Err(StartError::Other(message));
        }

        let argv = match self.command_for(&slot.config, label.as_deref()) {
            Ok(argv) => argv,
            Err(e) => {
                self.fail(kind, &e.to_string()).await;
                return Err(e);
            }
        };

        self.update(kind, |s| {
            s.status = BackendStatus::Starting;
            s.loaded_model = label.clone();
            s.external = false;
            s.started_at = Some(Utc::now());
            s.last_error = None;
        })
        .await;

        let Some(spawn) = SpawnConfig::from_argv(kind, &argv, &self.log_dir) else {
            let message = format!("{kind} backend command is empty");
            self.fail(kind, &message).await;
            return Err(StartError::Other(message));
        };

        let handle = match self.processes.spawn(spawn).await {
            Ok(handle) => handle,
            Err(e) => {
                let message = format!("{e:#}");
                self.fail(kind, &message).await;
                return Err(StartError::ProcessSpawnFailed(message));
            }
        };
        let pid = self.processes.pid(&handle).await;
        self.update(kind, |s| s.pid = pid).await;
        *handle_guard = Some(handle.clone());

        tracing::info!(
            kind = %kind,
            model = ?label,
            pid = ?pid,
            "Waiting for backend to become healthy"
        );

        let deadline = Instant::now() + self.timing.start_timeout;
        loop {
            if let Some(status) = self.processes.exit_status(&handle).await {
                let _ = self.processes.stop(&handle, self.timing.stop_timeout).await;
                *handle_guard = None;
                let message = format!("backend exited during startup ({status})");
                self.fail(kind, &message).await;
                return Err(StartError::Other(message));
            }

            if self.health_check(kind).await {
                let state = self
                    .update(kind, |s| {
                        s.status = BackendStatus::Ready;
                    })
                    .await;
                tracing::info!(kind = %kind, model = ?label, pid = ?pid, "Backend ready");
                return Ok(state);
            }

            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.timing.poll_interval).await;
        }

        // Never leave a half-started process holding GPU memory
        tracing::warn!(kind = %kind, pid = ?pid, "Backend start timed out, killing process");
        match self.processes.stop(&handle, self.timing.stop_timeout).await {
            Ok(()) => *handle_guard = None,
            Err(e) => tracing::error!(kind = %kind, error = %e, "Failed to kill timed out backend"),
        }
        let err = StartError::Timeout(self.timing.start_timeout);
        self.fail(kind, &err.to_string()).await;
        Err(err)
    }

    /// Release the backend; errors mean the GPU may still be occupied
    pub async fn stop(&self, kind: BackendKind) -> Result<BackendState, StopError> {
        let slot = self.slot(kind);
        let mut handle_guard = slot.handle.lock().await;

        let current = slot.state.read().await.clone();
        if current.status == BackendStatus::Stopped && handle_guard.is_none() {
            return Ok(current);
        }

        tracing::info!(kind = %kind, model = ?current.loaded_model, "Stopping backend");
        self.update(kind, |s| s.status = BackendStatus::Stopping).await;

        let owned = handle_guard.is_some();
        let ran_stop_command = !slot.config.stop_command.is_empty()
            && (owned || current.status.is_resident());
        if ran_stop_command {
            self.run_stop_command(kind, &slot.config.stop_command).await;
        }

        if let Some(handle) = handle_guard.as_ref() {
            if let Err(e) = self.processes.stop(handle, self.timing.stop_timeout).await {
                let err = StopError::ProcessUnresponsive(format!("{e:#}"));
                self.fail(kind, &err.to_string()).await;
                return Err(err);
            }
            *handle_guard = None;
        }

        // Only verify what we actually asked to go away
        if (owned || ran_stop_command) && !self.wait_unreachable(kind).await {
            let err = StopError::ProcessUnresponsive(format!(
                "{kind} backend still answers health checks after stop"
            ));
            self.fail(kind, &err.to_string()).await;
            return Err(err);
        }

        let state = self
            .update(kind, |s| {
                s.status = BackendStatus::Stopped;
                s.loaded_model = None;
                s.pid = None;
                s.external = false;
            })
            .await;
        tracing::info!(kind = %kind, "Backend stopped");
        Ok(state)
    }

    /// Detect an owned process that exited on its own and mark the kind failed
    pub async fn reap(&self, kind: BackendKind) -> Option<String> {
        let slot = self.slot(kind);
        let mut handle_guard = slot.handle.lock().await;
        let handle = handle_guard.as_ref()?;
        let status = self.processes.exit_status(handle).await?;

        let _ = self.processes.stop(handle, self.timing.stop_timeout).await;
        *handle_guard = None;
        self.update(kind, |s| s.loaded_model = None).await;
        self.fail(kind, &format!("backend exited: {status}")).await;
        Some(status)
    }

    async fn wait_unreachable(&self, kind: BackendKind) -> bool {
        let url = self.config(kind).health_url();
        let deadline = Instant::now() + self.timing.stop_verify_timeout;
        loop {
            if !self.probe.check(kind, &url).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.timing.poll_interval).await;
        }
    }

    async fn run_stop_command(&self, kind: BackendKind, argv: &[String]) {
        let Some((program, args)) = argv.split_first() else {
            return;
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timing.stop_command_timeout, cmd.status()).await {
            Ok(Ok(status)) if status.success() => {
                tracing::debug!(kind = %kind, "Stop command finished");
            }
            Ok(Ok(status)) => {
                tracing::warn!(kind = %kind, status = %status, "Stop command failed");
            }
            Ok(Err(e)) => {
                tracing::warn!(kind = %kind, error = %e, "Failed to run stop command");
            }
            Err(_) => {
                tracing::warn!(kind = %kind, "Stop command timed out");
            }
        }
    }

    fn command_for(
        &self,
        config: &BackendConfig,
        model: Option<&str>,
    ) -> Result<Vec<String>, StartError> {
        let model_path = match model {
            Some(name) if config.dynamic_model => {
                let file =
                    safe_filename(name).map_err(|e| StartError::Other(e.to_string()))?;
                let path = self.models_dir.join(file);
                if !path.is_file() {
                    return Err(StartError::Other(format!(
                        "model file not found: {}",
                        path.display()
                    )));
                }
                Some(path)
            }
            _ => None,
        };
        Ok(build_argv(config, model_path.as_deref()))
    }
}

/// Insert or replace `<model_arg> <path>` in the launch command
pub fn build_argv(config: &BackendConfig, model_path: Option<&Path>) -> Vec<String> {
    let mut argv = config.command.clone();
    let Some(path) = model_path else {
        return argv;
    };
    let path = path.to_string_lossy().into_owned();

    match argv.iter().position(|a| a == &config.model_arg) {
        Some(idx) if idx + 1 < argv.len() => argv[idx + 1] = path,
        Some(_) => argv.push(path),
        None => {
            argv.push(config.model_arg.clone());
            argv.push(path);
        }
    }
    argv
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::health::mocks::MockHealthProbe;
    use crate::process::mocks::MockProcessManager;

    pub struct Fixture {
        pub supervisor: Arc<BackendSupervisor>,
        pub processes: Arc<MockProcessManager>,
        pub probe: Arc<MockHealthProbe>,
        pub config: GatewayConfig,
        pub dir: tempfile::TempDir,
    }

    pub fn test_config(dir: &Path) -> GatewayConfig {
        let models_dir = dir.join("models");
        std::fs::create_dir_all(&models_dir).unwrap();
        for name in ["qwen-7b.gguf", "llama-3b.gguf"] {
            std::fs::write(models_dir.join(name), b"GGUF").unwrap();
        }

        let mut config = GatewayConfig {
            models_dir,
            log_dir: dir.join("logs"),
            switch_timeout_secs: 5,
            start_timeout_secs: Some(1),
            health_poll_interval_ms: 5,
            stop_verify_timeout_secs: 1,
            ..Default::default()
        };
        config.text.command = vec!["llama-server".into(), "--port".into(), "8080".into()];
        config.text.default_model = Some("qwen-7b.gguf".into());
        config.audio.command = vec!["whisper-server".into()];
        config.audio.default_model = Some("ggml-base.bin".into());
        config.image.command = vec!["sd-server".into()];
        config
    }

    pub fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    pub fn fixture_with(adjust: impl FnOnce(&mut GatewayConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        adjust(&mut config);

        let processes = Arc::new(MockProcessManager::new());
        let probe = Arc::new(MockHealthProbe::new(processes.clone()));
        let supervisor = Arc::new(BackendSupervisor::new(
            &config,
            processes.clone(),
            probe.clone(),
        ));
        Fixture {
            supervisor,
            processes,
            probe,
            config,
            dir,
        }
    }
}
