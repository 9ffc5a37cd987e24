//! Switch Coordinator: the single arbitration point for GPU residency
//!
//! At most one switch runs at a time. Each switch executes in its own task
//! so it always runs to completion, even when every caller waiting on it
//! gives up. Callers asking for the same target share one outcome; callers
//! asking for something else wait for it and then try again.
//!
//! Forwarded requests hold a read lease on residency until the backend has
//! answered; a switch takes the write side, so nothing is dispatched to a
//! backend that is being stopped or started.

use crate::backend::{BackendKind, BackendState, BackendStatus};
use crate::error::{StopError, SwitchError};
use crate::supervisor::BackendSupervisor;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, OwnedRwLockReadGuard, RwLock, broadcast};
use tokio::time::Instant;

/// Residency transitions, in the order they happen
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Stopped(BackendKind),
    Ready(BackendKind, Option<String>),
    Failed(BackendKind, String),
}

/// What a caller needs resident, and until when it is willing to wait
#[derive(Debug, Clone)]
pub struct SwitchRequest {
    pub kind: BackendKind,
    /// `None` accepts whatever model the kind has loaded
    pub model: Option<String>,
    pub deadline: Instant,
}

impl SwitchRequest {
    pub fn new(kind: BackendKind, model: Option<String>, timeout: Duration) -> Self {
        Self {
            kind,
            model,
            deadline: Instant::now() + timeout,
        }
    }
}

/// A ready backend plus a lease keeping it resident
///
/// Drop it once the backend has answered.
#[derive(Debug)]
pub struct Residency {
    state: BackendState,
    _lease: OwnedRwLockReadGuard<()>,
}

impl Residency {
    pub fn into_state(self) -> BackendState {
        self.state
    }
}

impl Deref for Residency {
    type Target = BackendState;

    fn deref(&self) -> &BackendState {
        &self.state
    }
}

/// Arbitration snapshot served by `/status`
#[derive(Debug, Clone, Serialize)]
pub struct ArbitrationStatus {
    pub backend: Option<BackendKind>,
    pub model: Option<String>,
    pub busy: bool,
}

type SwitchOutcome = Shared<BoxFuture<'static, Result<BackendState, SwitchError>>>;

struct InFlight {
    kind: BackendKind,
    model: Option<String>,
    outcome: SwitchOutcome,
}

struct Inner {
    supervisor: Arc<BackendSupervisor>,
    auto_switch: bool,
    switch_timeout: Duration,
    arbitration: Mutex<()>,
    residency: Arc<RwLock<()>>,
    inflight: StdMutex<Option<InFlight>>,
    switching: AtomicBool,
    event_tx: broadcast::Sender<BackendEvent>,
}

enum Wait {
    Joined(SwitchOutcome),
    Behind(SwitchOutcome),
}

/// Clears the switching marks however the holder exits
struct SwitchingFlag<'a> {
    inner: &'a Inner,
    owns_inflight: bool,
}

impl<'a> SwitchingFlag<'a> {
    fn raise(inner: &'a Inner, owns_inflight: bool) -> Self {
        inner.switching.store(true, Ordering::Release);
        Self {
            inner,
            owns_inflight,
        }
    }
}

impl Drop for SwitchingFlag<'_> {
    fn drop(&mut self) {
        self.inner.switching.store(false, Ordering::Release);
        if self.owns_inflight {
            self.inner
                .inflight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
        }
    }
}

#[derive(Clone)]
pub struct SwitchCoordinator {
    inner: Arc<Inner>,
}

impl SwitchCoordinator {
    pub fn new(
        supervisor: Arc<BackendSupervisor>,
        auto_switch: bool,
        switch_timeout: Duration,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                supervisor,
                auto_switch,
                switch_timeout,
                arbitration: Mutex::new(()),
                residency: Arc::new(RwLock::new(())),
                inflight: StdMutex::new(None),
                switching: AtomicBool::new(false),
                event_tx,
            }),
        }
    }

    pub fn supervisor(&self) -> &Arc<BackendSupervisor> {
        &self.inner.supervisor
    }

    pub fn switch_timeout(&self) -> Duration {
        self.inner.switch_timeout
    }

    pub fn auto_switch(&self) -> bool {
        self.inner.auto_switch
    }

    /// Subscribe to residency transitions
    pub fn subscribe_events(&self) -> broadcast::Receiver<BackendEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Make the requested backend resident, switching if needed
    pub async fn ensure(&self, request: SwitchRequest) -> Result<Residency, SwitchError> {
        self.arbitrate(request, self.inner.auto_switch).await
    }

    /// Operator-driven switch; allowed even when automatic switching is off
    pub async fn activate(&self, request: SwitchRequest) -> Result<BackendState, SwitchError> {
        self.arbitrate(request, true).await.map(Residency::into_state)
    }

    async fn arbitrate(
        &self,
        request: SwitchRequest,
        may_switch: bool,
    ) -> Result<Residency, SwitchError> {
        let deadline = request.deadline;
        let kind = request.kind;
        match tokio::time::timeout_at(deadline, self.arbitrate_inner(request, may_switch)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(kind = %kind, "Gave up waiting for backend switch");
                crate::metrics::record_switch_wait_timeout(kind);
                Err(SwitchError::Timeout)
            }
        }
    }

    async fn arbitrate_inner(
        &self,
        request: SwitchRequest,
        may_switch: bool,
    ) -> Result<Residency, SwitchError> {
        let kind = request.kind;
        let model = if self.inner.supervisor.accepts_model_choice(kind) {
            request.model
        } else {
            None
        };

        loop {
            if !self.inner.switching.load(Ordering::Acquire) {
                let lease = self.inner.residency.clone().read_owned().await;
                let state = self.inner.supervisor.current_state(kind).await;
                if satisfies(&state, model.as_deref()) {
                    return Ok(Residency {
                        state,
                        _lease: lease,
                    });
                }
            }

            match self.join_or_start(kind, model.clone(), may_switch)? {
                Wait::Joined(outcome) => {
                    // Same target: the shared outcome is ours too
                    outcome.await?;
                }
                Wait::Behind(outcome) => {
                    let _ = outcome.await;
                }
            }
        }
    }

    fn join_or_start(
        &self,
        kind: BackendKind,
        model: Option<String>,
        may_switch: bool,
    ) -> Result<Wait, SwitchError> {
        let mut slot = self
            .inner
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if let Some(inflight) = slot.as_ref() {
            let outcome = inflight.outcome.clone();
            if inflight.kind == kind && inflight.model == model {
                return Ok(Wait::Joined(outcome));
            }
            return Ok(Wait::Behind(outcome));
        }

        if !may_switch {
            return Err(SwitchError::Disabled);
        }

        let this = self.clone();
        let target = model.clone();
        let task = tokio::spawn(async move { this.run_switch(kind, target).await });
        let outcome = async move {
            task.await.unwrap_or_else(|e| {
                Err(SwitchError::StartFailed {
                    cause: format!("switch task aborted: {e}"),
                })
            })
        }
        .boxed()
        .shared();

        // Set before releasing the slot so the fast path stops short-circuiting
        self.inner.switching.store(true, Ordering::Release);
        *slot = Some(InFlight {
            kind,
            model,
            outcome: outcome.clone(),
        });
        Ok(Wait::Joined(outcome))
    }

    async fn run_switch(
        &self,
        kind: BackendKind,
        model: Option<String>,
    ) -> Result<BackendState, SwitchError> {
        let _arbitration = self.inner.arbitration.lock().await;
        let _flag = SwitchingFlag::raise(&self.inner, true);
        let started = std::time::Instant::now();

        let result = {
            let _exclusive = self.inner.residency.write().await;
            self.perform(kind, model.as_deref()).await
        };

        let outcome = match &result {
            Ok(state) => {
                tracing::info!(
                    kind = %kind,
                    model = ?state.loaded_model,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Backend switch complete"
                );
                "success"
            }
            Err(e) => {
                tracing::error!(kind = %kind, model = ?model, error = %e, "Backend switch failed");
                let _ = self
                    .inner
                    .event_tx
                    .send(BackendEvent::Failed(kind, e.to_string()));
                "failure"
            }
        };
        crate::metrics::record_switch(kind, outcome, started.elapsed());
        crate::metrics::update_resident(self.inner.supervisor.resident_kind().await);
        result
    }

    /// Stop whatever is resident, then start the target
    async fn perform(
        &self,
        kind: BackendKind,
        model: Option<&str>,
    ) -> Result<BackendState, SwitchError> {
        let supervisor = &self.inner.supervisor;

        let current = supervisor.current_state(kind).await;
        if satisfies(&current, model) {
            return Ok(current);
        }

        // Do not evict a working backend for one that cannot come up
        if supervisor.config(kind).is_external() && !supervisor.can_launch(kind).await {
            return Err(SwitchError::StartFailed {
                cause: format!("{kind} backend has no launch command and is not running"),
            });
        }

        let resident = supervisor.resident_kind().await;
        tracing::info!(kind = %kind, model = ?model, resident = ?resident, "Switching backend");

        for other in BackendKind::ALL {
            let state = supervisor.current_state(other).await;
            if state.status == BackendStatus::Stopped {
                continue;
            }
            self.stop_one(other).await?;
        }

        let state = supervisor.start(kind, model).await?;
        let _ = self
            .inner
            .event_tx
            .send(BackendEvent::Ready(kind, state.loaded_model.clone()));
        Ok(state)
    }

    async fn stop_one(&self, kind: BackendKind) -> Result<(), StopError> {
        self.inner.supervisor.stop(kind).await?;
        let _ = self.inner.event_tx.send(BackendEvent::Stopped(kind));
        Ok(())
    }

    /// Release every backend
    pub async fn deactivate(&self) -> Result<(), StopError> {
        let _arbitration = self.inner.arbitration.lock().await;
        let _flag = SwitchingFlag::raise(&self.inner, false);
        let _exclusive = self.inner.residency.write().await;

        let mut first_error = None;
        for kind in BackendKind::ALL {
            if self.inner.supervisor.current_state(kind).await.status == BackendStatus::Stopped {
                continue;
            }
            if let Err(e) = self.stop_one(kind).await {
                tracing::error!(kind = %kind, error = %e, "Failed to stop backend");
                first_error.get_or_insert(e);
            }
        }
        crate::metrics::update_resident(None);
        first_error.map_or(Ok(()), Err)
    }

    /// Adopt a backend that is already running outside the gateway
    ///
    /// Only the first answering kind is adopted so residency stays exclusive.
    pub async fn adopt_running(&self) -> Option<BackendState> {
        let _arbitration = self.inner.arbitration.lock().await;
        let _exclusive = self.inner.residency.write().await;
        let supervisor = &self.inner.supervisor;

        for kind in BackendKind::ALL {
            if !supervisor.health_check(kind).await {
                continue;
            }
            match supervisor.start(kind, None).await {
                Ok(state) => {
                    crate::metrics::update_resident(Some(kind));
                    return Some(state);
                }
                Err(e) => {
                    tracing::warn!(kind = %kind, error = %e, "Could not adopt running backend");
                }
            }
        }
        None
    }

    /// Returns the arbitration lock if no switch is running
    pub fn try_quiesce(&self) -> Option<MutexGuard<'_, ()>> {
        self.inner.arbitration.try_lock().ok()
    }

    pub fn is_switching(&self) -> bool {
        self.inner.switching.load(Ordering::Acquire)
    }

    pub async fn status(&self) -> ArbitrationStatus {
        let supervisor = &self.inner.supervisor;
        let resident = supervisor.resident_kind().await;
        let model = match resident {
            Some(kind) => supervisor.current_state(kind).await.loaded_model,
            None => None,
        };
        ArbitrationStatus {
            backend: resident,
            model,
            busy: self.is_switching(),
        }
    }
}

fn satisfies(state: &BackendState, model: Option<&str>) -> bool {
    state.is_ready() && model.is_none_or(|m| state.loaded_model.as_deref() == Some(m))
}
