//! Engine facade
//!
//! Builds every resilience service from one [`EngineConfig`], wires them
//! together and is the only surface applications call: readiness,
//! scheduled operations, offline writes, listeners, connectivity signals
//! and diagnostics.

use super::recovery::{emergency_recovery, RecoveryTargets};
use crate::backend::{
    select_factory, BackendClient, BackendFactory, BackendHandle, KeyValueStore,
    ListenerErrorSink, ListenerSink, Subscription,
};
use crate::config::EngineConfig;
use crate::core::{
    AppState, BackendError, Clock, ConnectivityState, EngineError, EngineResult, InitState,
    Priority, SystemClock,
};
use crate::monitoring::{
    BreakerDiagnostics, DiagnosticsSnapshot, MetricsRegistry, OutboxDiagnostics,
    SchedulerDiagnostics,
};
use crate::resilience::{
    BreakerVerdict, ConnectivityCallback, ConnectivityMonitor, ErrorCircuitBreaker,
    InitializationGate, ListenerHandle, OfflineOutbox, OperationScheduler, OutboxItem,
    ReconnectDeps, ReconnectionController, SubscriptionRegistry, Unsubscribe,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// External collaborators injected at construction
pub struct EngineDeps {
    /// SDK-backed client factory, required in `live` mode
    pub live_factory: Option<Arc<dyn BackendFactory>>,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub initial_connectivity: ConnectivityState,
}

impl EngineDeps {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            live_factory: None,
            store,
            clock: Arc::new(SystemClock),
            initial_connectivity: ConnectivityState::default(),
        }
    }

    pub fn with_live_factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.live_factory = Some(factory);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_connectivity(mut self, state: ConnectivityState) -> Self {
        self.initial_connectivity = state;
        self
    }
}

/// The resilience layer as one service
///
/// Construct once per process, call `start()`, and route every backend
/// interaction through it. `stop()` tears down timers, listeners and the
/// queue.
pub struct ResilienceEngine {
    config: EngineConfig,
    metrics: MetricsRegistry,
    backend: BackendHandle,
    monitor: ConnectivityMonitor,
    gate: InitializationGate,
    breaker: ErrorCircuitBreaker,
    scheduler: OperationScheduler,
    registry: Arc<SubscriptionRegistry>,
    outbox: Arc<OfflineOutbox>,
    controller: ReconnectionController,
    online_probe: Mutex<Option<Unsubscribe>>,
    running: AtomicBool,
}

impl ResilienceEngine {
    /// Build and wire every service. No timers run until `start()`.
    pub fn new(config: EngineConfig, deps: EngineDeps) -> EngineResult<Self> {
        config
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let metrics = MetricsRegistry::new()
            .map_err(|e| EngineError::Config(format!("metrics registry: {}", e)))?;
        let factory = select_factory(config.backend.mode, deps.live_factory)?;
        let backend = BackendHandle::new(factory)?;

        let monitor = ConnectivityMonitor::new(deps.initial_connectivity);
        metrics
            .system()
            .online
            .set(i64::from(deps.initial_connectivity.is_online()));

        let breaker = ErrorCircuitBreaker::new(config.breaker.clone(), metrics.clone());
        let gate = InitializationGate::new(
            backend.clone(),
            breaker.classifier().clone(),
            config.init.clone(),
            metrics.clone(),
        );
        let scheduler = OperationScheduler::new(
            gate.clone(),
            backend.clone(),
            breaker.clone(),
            config.scheduler.clone(),
            metrics.clone(),
        );
        let registry = Arc::new(
            SubscriptionRegistry::new(
                backend.clone(),
                Arc::clone(&deps.clock),
                config.subscriptions.debounce(),
            )
            .with_breaker(breaker.clone()),
        );
        let outbox = Arc::new(OfflineOutbox::new(
            backend.clone(),
            breaker.clone(),
            Arc::clone(&deps.store),
            Arc::clone(&deps.clock),
            config.outbox.clone(),
            metrics.clone(),
        ));
        let controller = ReconnectionController::new(
            ReconnectDeps {
                backend: backend.clone(),
                gate: gate.clone(),
                breaker: breaker.clone(),
                outbox: Arc::clone(&outbox),
                registry: Arc::clone(&registry),
                monitor: monitor.clone(),
                store: deps.store,
                clock: deps.clock,
            },
            config.reconnect.clone(),
            config.init.probe_timeout(),
            metrics.clone(),
        );

        info!(mode = ?config.backend.mode, "Resilience engine created");

        Ok(Self {
            config,
            metrics,
            backend,
            monitor,
            gate,
            breaker,
            scheduler,
            registry,
            outbox,
            controller,
            online_probe: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Arm auto-initialization, reconnection triggers and emergency recovery
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("Engine already started");
            return;
        }

        self.breaker
            .set_recovery_action(emergency_recovery(RecoveryTargets {
                backend: self.backend.clone(),
                scheduler: self.scheduler.clone(),
                gate: self.gate.clone(),
                registry: Arc::clone(&self.registry),
                metrics: self.metrics.clone(),
            }));

        let metrics = self.metrics.clone();
        let online = self.monitor.register_callback(Arc::new(move |state: ConnectivityState| {
            metrics.system().online.set(i64::from(state.is_online()));
        }));
        *self.online_probe.lock() = Some(online);

        self.gate.start();
        self.controller.start();
        info!("Resilience engine started");
    }

    /// Tear everything down; queued operations are rejected with `Flushed`
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.controller.stop();
        self.gate.stop();
        self.scheduler.close();
        self.breaker.stop();
        let listeners = self.registry.unsubscribe_all();
        if let Some(online) = self.online_probe.lock().take() {
            online.unsubscribe();
        }
        info!(listeners, "Resilience engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // ===== Readiness =====

    /// Initialize the backend now instead of waiting for auto-init
    pub async fn initialize(&self) -> EngineResult<()> {
        self.gate.initialize().await
    }

    pub async fn wait_until_ready(&self) -> EngineResult<()> {
        self.gate.wait_until_ready().await
    }

    pub fn is_ready(&self) -> bool {
        self.gate.is_ready()
    }

    pub fn init_state(&self) -> InitState {
        self.gate.state()
    }

    // ===== Operations =====

    /// Run `op` through the scheduler once the backend is ready
    pub fn enqueue<F, Fut, T>(
        &self,
        op: F,
        priority: Priority,
    ) -> impl Future<Output = EngineResult<T>> + Send + 'static
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BackendError>> + Send + 'static,
        T: Send + 'static,
    {
        self.scheduler.enqueue(op, priority)
    }

    /// Current backend client, for use inside enqueued operations
    pub fn client(&self) -> Arc<dyn BackendClient> {
        self.backend.client()
    }

    /// Feed the result of a backend call made outside the scheduler
    pub fn report_error(&self, err: &BackendError) -> BreakerVerdict {
        self.breaker.record_error(err)
    }

    // ===== Reconnection and offline writes =====

    pub async fn manual_reconnect(&self) -> bool {
        self.controller.manual_reconnect().await
    }

    /// Persist a write for delivery; delivered right away when online
    pub fn queue_for_offline_send(
        &self,
        target_id: impl Into<String>,
        payload: Value,
        idempotency_key: Option<String>,
    ) -> EngineResult<OutboxItem> {
        let item = self.outbox.enqueue(target_id, payload, idempotency_key)?;
        if self.monitor.current().is_online() && self.gate.is_ready() {
            let outbox = Arc::clone(&self.outbox);
            tokio::spawn(async move {
                outbox.drain().await;
            });
        }
        Ok(item)
    }

    /// Items as they are accepted by the backend
    pub fn subscribe_deliveries(&self) -> broadcast::Receiver<OutboxItem> {
        self.outbox.subscribe_deliveries()
    }

    // ===== Connectivity =====

    pub fn register_connectivity_callback(&self, callback: ConnectivityCallback) -> Unsubscribe {
        self.monitor.register_callback(callback)
    }

    /// Platform network callback
    pub fn on_network_change(&self, is_connected: bool, is_reachable: Option<bool>) {
        self.monitor.on_network_change(is_connected, is_reachable);
    }

    /// Platform lifecycle callback
    pub fn on_app_state_change(&self, app_state: AppState) {
        self.monitor.on_app_state_change(app_state);
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.monitor.current()
    }

    // ===== Subscriptions =====

    /// Deduplicated live subscription for `key`; waits for readiness first
    ///
    /// `factory` receives the client and the sink the backend must call if
    /// it ends the listener.
    pub async fn subscribe<F, Fut>(&self, key: &str, factory: F) -> EngineResult<Arc<ListenerHandle>>
    where
        F: Fn(Arc<dyn BackendClient>, ListenerErrorSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Subscription, BackendError>> + Send + 'static,
    {
        self.gate.wait_until_ready().await?;
        let result = self.registry.subscribe(key, factory).await;
        self.metrics.system().listeners.set(self.registry.len() as i64);
        result
    }

    /// Live query on `key` delivering snapshots to `sink`
    pub async fn listen(&self, key: &str, sink: ListenerSink) -> EngineResult<Arc<ListenerHandle>> {
        self.gate.wait_until_ready().await?;
        let result = self.registry.listen(key, sink).await;
        self.metrics.system().listeners.set(self.registry.len() as i64);
        result
    }

    /// Live listeners; keys the backend ended are no longer counted
    pub fn listener_count(&self) -> usize {
        let count = self.registry.len();
        self.metrics.system().listeners.set(count as i64);
        count
    }

    pub fn unsubscribe(&self, key: &str) -> bool {
        let removed = self.registry.unsubscribe(key);
        self.metrics.system().listeners.set(self.registry.len() as i64);
        removed
    }

    pub fn unsubscribe_all(&self) -> usize {
        let removed = self.registry.unsubscribe_all();
        self.metrics.system().listeners.set(0);
        removed
    }

    // ===== Diagnostics =====

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            init_state: self.gate.state(),
            last_init_error: self.gate.last_error(),
            connectivity: self.monitor.current(),
            scheduler: SchedulerDiagnostics {
                queue_depth: self.scheduler.queue_depth(),
                active: self.scheduler.active_count(),
                concurrency_limit: self.scheduler.concurrency_limit(),
                in_warm_up: self.scheduler.in_warm_up(),
            },
            breaker: BreakerDiagnostics {
                state: self.breaker.state().as_str(),
                consecutive_errors: self.breaker.consecutive_count(),
                trips: self.breaker.trips(),
                recoveries: self.breaker.recoveries(),
                recovering: self.breaker.is_recovering(),
            },
            reconnect: self.controller.stats(),
            outbox: OutboxDiagnostics {
                queued: self.outbox.len(),
                dead_lettered: self.outbox.dead_letters().len(),
            },
            listeners: self.registry.len(),
            client_generation: self.backend.generation(),
        }
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ===== Component access =====

    pub fn breaker(&self) -> &ErrorCircuitBreaker {
        &self.breaker
    }

    pub fn scheduler(&self) -> &OperationScheduler {
        &self.scheduler
    }

    pub fn gate(&self) -> &InitializationGate {
        &self.gate
    }

    pub fn outbox(&self) -> &OfflineOutbox {
        &self.outbox
    }

    pub fn controller(&self) -> &ReconnectionController {
        &self.controller
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }
}

impl Drop for ResilienceEngine {
    fn drop(&mut self) {
        // The recovery action holds clones of the scheduler and gate
        self.breaker.clear_recovery_action();
        self.controller.stop();
        self.gate.stop();
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::ListenerSink;
    use crate::core::BackendError;
    use crate::testing::mock_engine;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let mock = mock_engine();
        mock.engine.start();
        mock.engine.start();
        assert!(mock.engine.is_running());

        mock.engine.stop();
        mock.engine.stop();
        assert!(!mock.engine.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_listener_is_evicted_when_backend_ends_it() {
        let mock = mock_engine();
        mock.engine.initialize().await.unwrap();

        let handle = mock
            .engine
            .subscribe("presence/7", |client, on_error| async move {
                let sink: ListenerSink = Arc::new(|_| {});
                client.listen("presence/7", sink, on_error).await
            })
            .await
            .unwrap();
        assert!(handle.is_active());
        assert_eq!(mock.engine.listener_count(), 1);

        let revoked = BackendError::PermissionDenied("revoked".into());
        assert!(mock.factory.server().fail_listener("presence/7", revoked));
        assert!(!handle.is_active());
        assert_eq!(mock.engine.listener_count(), 0);
    }
}
