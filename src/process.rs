//! Backend process lifecycle behind a swappable process manager

use crate::backend::BackendKind;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Configuration for spawning a backend process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub kind: BackendKind,
    pub program: String,
    pub args: Vec<String>,
    pub log_dir: PathBuf,
}

impl SpawnConfig {
    /// Build from a full argv; `None` when the argv is empty
    pub fn from_argv(kind: BackendKind, argv: &[String], log_dir: &Path) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            kind,
            program: program.clone(),
            args: args.to_vec(),
            log_dir: log_dir.to_path_buf(),
        })
    }
}

/// Opaque handle to a spawned process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub(crate) id: String,
}

/// Trait for managing process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Spawn a new backend process
    async fn spawn(&self, config: SpawnConfig) -> Result<ProcessHandle>;

    /// Stop a process gracefully, escalating to SIGKILL after `timeout`
    ///
    /// The handle stays tracked when the process cannot be reaped.
    async fn stop(&self, handle: &ProcessHandle, timeout: Duration) -> Result<()>;

    /// `Some(description)` once the process has exited on its own
    async fn exit_status(&self, handle: &ProcessHandle) -> Option<String>;

    /// Get process ID
    async fn pid(&self, handle: &ProcessHandle) -> Option<u32>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// A spawned child plus the process group it leads
struct Tracked {
    child: Child,
    /// Group id; equal to the leader's pid and still valid after it exits
    pgid: u32,
}

/// Production process manager using tokio::process
pub struct SystemProcessManager {
    processes: Arc<RwLock<HashMap<String, Tracked>>>,
}

impl SystemProcessManager {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for SystemProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Create the log directory, falling back to the temp dir
fn prepare_log_dir(log_dir: &Path) -> Result<PathBuf> {
    match std::fs::create_dir_all(log_dir) {
        Ok(()) => Ok(log_dir.to_path_buf()),
        Err(e) => {
            let fallback = std::env::temp_dir().join("meigahub").join("logs");
            tracing::warn!(
                error = %e,
                attempted_dir = ?log_dir,
                fallback = ?fallback,
                "Failed to create log directory, falling back"
            );
            std::fs::create_dir_all(&fallback)
                .context("Failed to create fallback log directory")?;
            Ok(fallback)
        }
    }
}

/// Signal every member of the group; `false` once the group is empty
#[cfg(unix)]
fn signal_group(pgid: u32, signal: Option<nix::sys::signal::Signal>) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    killpg(Pid::from_raw(pgid as i32), signal).is_ok()
}

/// Reap the leader and wait until the whole group is gone
#[cfg(unix)]
async fn wait_group(child: &mut Child, pgid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let leader_gone = !matches!(child.try_wait(), Ok(None));
        if leader_gone && !signal_group(pgid, None) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[async_trait]
impl ProcessManager for SystemProcessManager {
    async fn spawn(&self, config: SpawnConfig) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args);

        // Own process group so wrapper scripts and their children go down together
        #[cfg(unix)]
        cmd.process_group(0);

        let log_dir = prepare_log_dir(&config.log_dir)?;
        let log_path = log_dir.join(format!("{}.log", config.kind));
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file: {:?}", log_path))?;

        let stdout_file = log_file
            .try_clone()
            .context("Failed to clone log file for stdout")?;
        let stderr_file = log_file
            .try_clone()
            .context("Failed to clone log file for stderr")?;

        let child = cmd
            .stdin(std::process::Stdio::null())
            .stdout(stdout_file)
            .stderr(stderr_file)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", config.program))?;

        let pid = child.id().context("Failed to get PID")?;
        let handle_id = format!("{}_{}", config.kind, pid);

        tracing::info!(
            kind = %config.kind,
            program = %config.program,
            pid = pid,
            log = ?log_path,
            "Backend process spawned"
        );

        self.processes
            .write()
            .await
            .insert(handle_id.clone(), Tracked { child, pgid: pid });

        Ok(ProcessHandle { id: handle_id })
    }

    async fn stop(&self, handle: &ProcessHandle, timeout: Duration) -> Result<()> {
        // Other handles stay usable while this one winds down
        let Some(mut tracked) = self.processes.write().await.remove(&handle.id) else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::Signal;

            let pgid = tracked.pgid;
            // The leader may be gone while its descendants still hold the GPU
            if !signal_group(pgid, Some(Signal::SIGTERM)) {
                let _ = tracked.child.try_wait();
                return Ok(());
            }
            if wait_group(&mut tracked.child, pgid, timeout).await {
                tracing::info!(pgid = pgid, "Process group stopped gracefully");
                return Ok(());
            }

            tracing::warn!(pgid = pgid, "Graceful shutdown timeout, sending SIGKILL");
            signal_group(pgid, Some(Signal::SIGKILL));
        }

        #[cfg(not(unix))]
        {
            let _ = tracked.child.start_kill();
        }

        // SIGKILL cannot be ignored; only an unreapable leader is reported
        match tokio::time::timeout(timeout, tracked.child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => {
                // Keep ownership so a later stop can try again
                self.processes.write().await.insert(handle.id.clone(), tracked);
                anyhow::bail!("process {} did not exit after SIGKILL", handle.id)
            }
        }
    }

    async fn exit_status(&self, handle: &ProcessHandle) -> Option<String> {
        let mut processes = self.processes.write().await;
        let tracked = processes.get_mut(&handle.id)?;
        match tracked.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("wait failed: {e}")),
        }
    }

    async fn pid(&self, handle: &ProcessHandle) -> Option<u32> {
        let processes = self.processes.read().await;
        processes.get(&handle.id).map(|t| t.pgid)
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Process operations observed by the mock, in order
    #[derive(Debug, Clone, PartialEq)]
    pub enum ProcessEvent {
        Spawned { kind: BackendKind, args: Vec<String> },
        Stopped { kind: BackendKind },
    }

    #[derive(Debug)]
    struct MockProcess {
        kind: BackendKind,
        pid: u32,
        exited: Option<String>,
    }

    #[derive(Default)]
    struct MockState {
        next_pid: u32,
        processes: HashMap<String, MockProcess>,
        events: Vec<ProcessEvent>,
        max_running: usize,
        unresponsive: HashSet<BackendKind>,
        fail_spawn: bool,
    }

    impl MockState {
        fn running(&self) -> usize {
            self.processes.values().filter(|p| p.exited.is_none()).count()
        }
    }

    /// Mock process manager for testing
    #[derive(Default)]
    pub struct MockProcessManager {
        state: Mutex<MockState>,
    }

    impl MockProcessManager {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<ProcessEvent> {
            self.state.lock().unwrap().events.clone()
        }

        pub fn spawn_count(&self) -> usize {
            self.events()
                .iter()
                .filter(|e| matches!(e, ProcessEvent::Spawned { .. }))
                .count()
        }

        /// Whether a live (not exited) process exists for the kind
        pub fn is_kind_running(&self, kind: BackendKind) -> bool {
            self.state
                .lock()
                .unwrap()
                .processes
                .values()
                .any(|p| p.kind == kind && p.exited.is_none())
        }

        pub fn running_count(&self) -> usize {
            self.state.lock().unwrap().running()
        }

        /// Highest number of simultaneously live processes ever observed
        pub fn max_running(&self) -> usize {
            self.state.lock().unwrap().max_running
        }

        /// Make `stop` fail for the kind (process ignores signals)
        pub fn set_unresponsive(&self, kind: BackendKind, unresponsive: bool) {
            let mut state = self.state.lock().unwrap();
            if unresponsive {
                state.unresponsive.insert(kind);
            } else {
                state.unresponsive.remove(&kind);
            }
        }

        pub fn set_fail_spawn(&self, fail: bool) {
            self.state.lock().unwrap().fail_spawn = fail;
        }

        /// Simulate the process exiting on its own
        pub fn crash(&self, kind: BackendKind, status: &str) {
            let mut state = self.state.lock().unwrap();
            for process in state.processes.values_mut() {
                if process.kind == kind {
                    process.exited = Some(status.to_string());
                }
            }
        }
    }

    #[async_trait]
    impl ProcessManager for MockProcessManager {
        async fn spawn(&self, config: SpawnConfig) -> Result<ProcessHandle> {
            let mut state = self.state.lock().unwrap();
            if state.fail_spawn {
                anyhow::bail!("No such file or directory: {}", config.program);
            }

            state.next_pid += 1;
            let pid = 1000 + state.next_pid;
            let id = format!("mock_{}_{}", config.kind, pid);

            let mut argv = vec![config.program.clone()];
            argv.extend(config.args.iter().cloned());
            state.events.push(ProcessEvent::Spawned {
                kind: config.kind,
                args: argv,
            });
            state.processes.insert(
                id.clone(),
                MockProcess {
                    kind: config.kind,
                    pid,
                    exited: None,
                },
            );
            state.max_running = state.max_running.max(state.running());

            Ok(ProcessHandle { id })
        }

        async fn stop(&self, handle: &ProcessHandle, _timeout: Duration) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let Some(kind) = state.processes.get(&handle.id).map(|p| p.kind) else {
                return Ok(());
            };
            if state.unresponsive.contains(&kind) {
                anyhow::bail!("process {} ignored SIGKILL", handle.id);
            }
            state.processes.remove(&handle.id);
            state.events.push(ProcessEvent::Stopped { kind });
            Ok(())
        }

        async fn exit_status(&self, handle: &ProcessHandle) -> Option<String> {
            let state = self.state.lock().unwrap();
            state.processes.get(&handle.id).and_then(|p| p.exited.clone())
        }

        async fn pid(&self, handle: &ProcessHandle) -> Option<u32> {
            let state = self.state.lock().unwrap();
            state.processes.get(&handle.id).map(|p| p.pid)
        }
    }
}
