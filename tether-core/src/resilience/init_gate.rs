//! Backend readiness gate
//!
//! Nothing talks to the backend before the gate reports `Ready`. A run is a
//! network refresh followed by a bounded liveness probe; a failed probe
//! earns one emergency reset of the client and one more probe before the
//! gate settles in `Error`. `Error` is terminal until `reset()`.

use super::classifier::{ErrorClass, ErrorClassifier};
use super::timer::{TimerHandle, TimerSlot};
use crate::backend::BackendHandle;
use crate::config::InitConfig;
use crate::core::{BackendError, EngineError, EngineResult, InitState};
use crate::monitoring::MetricsRegistry;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub type ReadyCallback = Box<dyn FnOnce() + Send>;
pub type ErrorCallback = Box<dyn FnOnce(&str) + Send>;

struct GateInner {
    backend: BackendHandle,
    classifier: ErrorClassifier,
    config: InitConfig,
    metrics: MetricsRegistry,
    state_tx: watch::Sender<InitState>,
    last_error: Mutex<Option<String>>,
    ready_callbacks: Mutex<Vec<ReadyCallback>>,
    error_callbacks: Mutex<Vec<ErrorCallback>>,
    auto_init: TimerSlot,
    runs: AtomicU64,
}

#[derive(Clone)]
pub struct InitializationGate {
    inner: Arc<GateInner>,
}

impl InitializationGate {
    pub fn new(
        backend: BackendHandle,
        classifier: ErrorClassifier,
        config: InitConfig,
        metrics: MetricsRegistry,
    ) -> Self {
        let (state_tx, _) = watch::channel(InitState::Pending);
        metrics.system().init_state.set(state_gauge(InitState::Pending));
        Self {
            inner: Arc::new(GateInner {
                backend,
                classifier,
                config,
                metrics,
                state_tx,
                last_error: Mutex::new(None),
                ready_callbacks: Mutex::new(Vec::new()),
                error_callbacks: Mutex::new(Vec::new()),
                auto_init: TimerSlot::new(),
                runs: AtomicU64::new(0),
            }),
        }
    }

    /// Arm the auto-initialization timer
    pub fn start(&self) {
        let gate = self.clone();
        let delay = self.inner.config.auto_init_delay();
        self.inner.auto_init.arm(TimerHandle::after(delay, move || async move {
            if gate.begin() {
                info!("No explicit initialize() after {:?}, self-initializing", delay);
            }
        }));
    }

    /// Cancel pending timers
    pub fn stop(&self) {
        self.inner.auto_init.cancel();
    }

    /// Start initialization if it has not started, then wait for the outcome
    ///
    /// Concurrent and repeated calls share one run.
    pub async fn initialize(&self) -> EngineResult<()> {
        self.begin();
        self.wait_until_ready().await
    }

    pub fn state(&self) -> InitState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == InitState::Ready
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Completed and in-flight initialization runs
    pub fn runs(&self) -> u64 {
        self.inner.runs.load(Ordering::Relaxed)
    }

    pub fn watch(&self) -> watch::Receiver<InitState> {
        self.inner.state_tx.subscribe()
    }

    /// Suspend until `Ready`; fails once the gate reaches `Error`
    pub async fn wait_until_ready(&self) -> EngineResult<()> {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                InitState::Ready => return Ok(()),
                InitState::Error => {
                    let reason = self
                        .last_error()
                        .unwrap_or_else(|| "initialization failed".to_string());
                    return Err(EngineError::InitFailed(reason));
                }
                InitState::Pending | InitState::Initializing => {}
            }
            rx.changed().await.map_err(|_| EngineError::ShuttingDown)?;
        }
    }

    /// Run `callback` once the gate is ready (immediately if it already is)
    pub fn on_ready(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut callbacks = self.inner.ready_callbacks.lock();
            if self.state() != InitState::Ready {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Run `callback` with the failure reason once the gate errors
    pub fn on_error(&self, callback: impl FnOnce(&str) + Send + 'static) {
        let reason = {
            let mut callbacks = self.inner.error_callbacks.lock();
            if self.state() != InitState::Error {
                callbacks.push(Box::new(callback));
                return;
            }
            self.last_error().unwrap_or_default()
        };
        callback(&reason);
    }

    /// Leave `Ready` or `Error` and run initialization again
    pub fn reset(&self) -> EngineResult<()> {
        let mut from = InitState::Pending;
        let reset = self.inner.state_tx.send_if_modified(|state| {
            from = *state;
            if state.can_reset() {
                *state = InitState::Initializing;
                true
            } else {
                false
            }
        });
        if !reset {
            return Err(EngineError::NotReady(from));
        }

        info!("Init state {} -> {} (reset)", from, InitState::Initializing);
        self.publish_state(InitState::Initializing);
        self.inner.last_error.lock().take();
        self.spawn_run();
        Ok(())
    }

    /// Pending → Initializing; spawns the run. False if already past Pending.
    fn begin(&self) -> bool {
        let started = self.inner.state_tx.send_if_modified(|state| {
            if state.can_advance_to(InitState::Initializing) {
                *state = InitState::Initializing;
                true
            } else {
                false
            }
        });
        if started {
            info!("Init state {} -> {}", InitState::Pending, InitState::Initializing);
            self.publish_state(InitState::Initializing);
            self.spawn_run();
        }
        started
    }

    fn spawn_run(&self) {
        self.inner.runs.fetch_add(1, Ordering::Relaxed);
        let gate = self.clone();
        tokio::spawn(async move {
            let outcome = gate.bring_up().await;
            gate.finish(outcome);
        });
    }

    async fn bring_up(&self) -> Result<(), BackendError> {
        let backend = &self.inner.backend;
        let timeout = self.inner.config.probe_timeout();

        if let Err(e) = backend.refresh_network().await {
            warn!("Network refresh before probe failed: {}", e);
        }

        let err = match backend.probe(timeout).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let class = self.inner.classifier.classify(&err);
        if !matches!(
            class,
            ErrorClass::Transport | ErrorClass::Timeout | ErrorClass::Fatal
        ) {
            return Err(err);
        }

        warn!(class = class.as_str(), "Liveness probe failed ({}), resetting client", err);
        backend.emergency_reset().await?;
        self.inner.metrics.system().client_resets_total.inc();
        backend.probe(timeout).await
    }

    fn finish(&self, outcome: Result<(), BackendError>) {
        let next = match &outcome {
            Ok(()) => InitState::Ready,
            Err(e) => {
                *self.inner.last_error.lock() = Some(e.to_string());
                InitState::Error
            }
        };

        let advanced = self.inner.state_tx.send_if_modified(|state| {
            if state.can_advance_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if !advanced {
            debug!("Initialization outcome {} discarded, state moved on", next);
            return;
        }
        self.publish_state(next);

        match outcome {
            Ok(()) => {
                info!("Init state {} -> {}", InitState::Initializing, next);
                let callbacks: Vec<ReadyCallback> =
                    std::mem::take(&mut *self.inner.ready_callbacks.lock());
                for callback in callbacks {
                    callback();
                }
            }
            Err(e) => {
                error!("Backend initialization failed: {}", e);
                let reason = e.to_string();
                let callbacks: Vec<ErrorCallback> =
                    std::mem::take(&mut *self.inner.error_callbacks.lock());
                for callback in callbacks {
                    callback(&reason);
                }
            }
        }
    }

    fn publish_state(&self, state: InitState) {
        self.inner.metrics.system().init_state.set(state_gauge(state));
    }
}

fn state_gauge(state: InitState) -> i64 {
    match state {
        InitState::Pending => 0,
        InitState::Initializing => 1,
        InitState::Ready => 2,
        InitState::Error => 3,
    }
}
