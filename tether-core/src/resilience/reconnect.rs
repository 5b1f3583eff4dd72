//! Reconnection orchestration
//!
//! Reacts to connectivity and lifecycle transitions, decides whether an
//! attempt is worth making, and runs it:
//!
//! ```text
//! trigger ──▶ in flight? ──▶ too soon? ──▶ offline? ──▶ quick budget? ──▶ attempt
//!                 │              │             │              │              │
//!               skip           skip          skip      skip + retry    ok: reset failures
//!                                                      after cooldown  err: backoff timer
//! ```
//!
//! Backoff retries skip the quick budget; the backoff schedule already paces
//! them. A retry that lands while the breaker is stopped is re-armed for the
//! rest of the cool-off.
//!
//! An attempt refreshes the client's network layer, re-probes liveness,
//! recovers a failed readiness gate, replays the outbox and recreates live
//! listeners. A periodic timer catches silently stale sessions; that path
//! probes first and only escalates to a full attempt when the probe fails or
//! the outbox has work.

use super::backoff::BackoffConfig;
use super::circuit_breaker::ErrorCircuitBreaker;
use super::connectivity::ConnectivityMonitor;
use super::init_gate::InitializationGate;
use super::outbox::OfflineOutbox;
use super::rate_limiter::QuickReconnectLimiter;
use super::subscriptions::SubscriptionRegistry;
use super::timer::{TimerHandle, TimerSlot};
use crate::backend::{BackendHandle, KeyValueStore};
use crate::config::ReconnectConfig;
use crate::core::{
    AppState, BackendError, Clock, EngineError, EngineResult, InitState, ReconnectTrigger,
    ReconnectionAttemptRecord,
};
use crate::monitoring::MetricsRegistry;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    Reconnecting,
}

/// Why a trigger did not lead to an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another attempt is running
    InFlight,
    /// An attempt completed too recently
    Throttled,
    /// No network path; the restore transition will trigger again
    Offline,
    /// Quick-reconnect budget spent; a retry is scheduled after the cooldown
    RateLimited(Duration),
    /// Breaker is stopped; automatic attempts wait for the cool-off
    CircuitOpen,
    Stopped,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InFlight => "in_flight",
            Self::Throttled => "throttled",
            Self::Offline => "offline",
            Self::RateLimited(_) => "rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Succeeded,
    /// Periodic check found the session healthy; nothing was torn down
    Healthy,
    Failed { error: String, retry_in: Duration },
    Skipped(SkipReason),
}

impl ReconnectOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Healthy)
    }
}

/// Counters exposed on the diagnostics surface
#[derive(Debug, Clone, Serialize)]
pub struct ReconnectionStats {
    pub state: ControllerState,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub skipped: u64,
    pub consecutive_failures: u32,
    pub quick_reconnects_used: u32,
    pub backoff_pending: bool,
    pub last_attempt: Option<SystemTime>,
}

/// Collaborators the controller drives
pub struct ReconnectDeps {
    pub backend: BackendHandle,
    pub gate: InitializationGate,
    pub breaker: ErrorCircuitBreaker,
    pub outbox: Arc<OfflineOutbox>,
    pub registry: Arc<SubscriptionRegistry>,
    pub monitor: ConnectivityMonitor,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
}

struct ControllerInner {
    deps: ReconnectDeps,
    config: ReconnectConfig,
    probe_timeout: Duration,
    backoff: BackoffConfig,
    limiter: QuickReconnectLimiter,
    metrics: MetricsRegistry,

    in_flight: AtomicBool,
    stopped: AtomicBool,
    last_completed: Mutex<Option<Instant>>,
    consecutive_failures: AtomicU32,

    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
    history: Mutex<VecDeque<ReconnectionAttemptRecord>>,

    backoff_timer: TimerSlot,
    periodic: Mutex<Option<TimerHandle>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the in-flight flag however the trigger exits
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct ReconnectionController {
    inner: Arc<ControllerInner>,
}

impl ReconnectionController {
    pub fn new(
        deps: ReconnectDeps,
        config: ReconnectConfig,
        probe_timeout: Duration,
        metrics: MetricsRegistry,
    ) -> Self {
        let limiter = QuickReconnectLimiter::new(
            config.quick_limit,
            config.quick_cooldown(),
            config.storage_key.clone(),
            Arc::clone(&deps.store),
            Arc::clone(&deps.clock),
        );
        let backoff = BackoffConfig::reconnect(config.backoff_base(), config.backoff_max());

        Self {
            inner: Arc::new(ControllerInner {
                deps,
                config,
                probe_timeout,
                backoff,
                limiter,
                metrics,
                in_flight: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                last_completed: Mutex::new(None),
                consecutive_failures: AtomicU32::new(0),
                attempts: AtomicU64::new(0),
                successes: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                history: Mutex::new(VecDeque::new()),
                backoff_timer: TimerSlot::new(),
                periodic: Mutex::new(None),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Start listening for connectivity transitions and arm the periodic check
    pub fn start(&self) {
        self.inner.stopped.store(false, Ordering::Release);

        let weak = Arc::downgrade(&self.inner);
        let rx = self.inner.deps.monitor.watch();
        let watcher = tokio::spawn(watch_connectivity(weak.clone(), rx));
        if let Some(previous) = self.inner.watcher.lock().replace(watcher) {
            previous.abort();
        }

        let period = self.inner.config.periodic_interval();
        let periodic = TimerHandle::every(period, move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    ReconnectionController { inner }
                        .trigger(ReconnectTrigger::Periodic)
                        .await;
                }
            }
        });
        *self.inner.periodic.lock() = Some(periodic);

        info!(periodic = ?period, "Reconnection controller started");
    }

    /// Cancel every timer and listener; later triggers are skipped
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.backoff_timer.cancel();
        self.inner.periodic.lock().take();
        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.abort();
        }
        info!("Reconnection controller stopped");
    }

    /// Full user-requested reconnection, including the outbox drain
    pub async fn manual_reconnect(&self) -> bool {
        self.trigger(ReconnectTrigger::Manual).await.is_success()
    }

    /// Evaluate `trigger` and run an attempt if nothing rules it out
    pub async fn trigger(&self, trigger: ReconnectTrigger) -> ReconnectOutcome {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::Acquire) {
            return self.skip(trigger, SkipReason::Stopped);
        }
        if inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.skip(trigger, SkipReason::InFlight);
        }
        let _in_flight = InFlightGuard(&inner.in_flight);

        if self.completed_too_recently(trigger) {
            return self.skip(trigger, SkipReason::Throttled);
        }

        if !inner.deps.monitor.current().is_online() {
            return self.skip(trigger, SkipReason::Offline);
        }

        if trigger.is_automatic() && !inner.deps.breaker.is_call_permitted() {
            if trigger == ReconnectTrigger::Backoff {
                // Keep the retry chain alive across the cool-off
                let failures = inner.consecutive_failures.load(Ordering::Acquire);
                let step = inner.backoff.delay_for_attempt(failures.saturating_sub(1));
                let retry_in = inner
                    .deps
                    .breaker
                    .cool_off_remaining()
                    .map_or(step, |remaining| remaining.max(inner.backoff.delay_for_attempt(0)));
                debug!(retry_in = ?retry_in, "Backoff retry deferred until the breaker closes");
                self.arm_backoff(retry_in);
            }
            return self.skip(trigger, SkipReason::CircuitOpen);
        }

        if trigger == ReconnectTrigger::Periodic && self.session_is_healthy().await {
            debug!("Periodic check: session healthy");
            return ReconnectOutcome::Healthy;
        }

        if trigger.uses_quick_budget() {
            if let Err(remaining) = inner.limiter.try_acquire() {
                warn!(
                    trigger = %trigger,
                    retry_in = ?remaining,
                    "Quick-reconnect budget exhausted"
                );
                self.arm_backoff(remaining);
                return self.skip(trigger, SkipReason::RateLimited(remaining));
            }
        }

        if trigger != ReconnectTrigger::Backoff && inner.backoff_timer.cancel() {
            debug!(trigger = %trigger, "Pending backoff retry superseded");
        }

        self.attempt(trigger).await
    }

    async fn attempt(&self, trigger: ReconnectTrigger) -> ReconnectOutcome {
        let inner = &self.inner;
        let started_at = inner.deps.clock.now();
        inner.attempts.fetch_add(1, Ordering::Relaxed);

        if trigger == ReconnectTrigger::Periodic {
            debug!("Reconnecting after failed periodic check");
        } else {
            info!(trigger = %trigger, "Reconnecting");
        }

        let result = self.run_attempt().await;
        *inner.last_completed.lock() = Some(Instant::now());
        let success = result.is_ok();
        self.record(started_at, trigger, success);
        inner
            .metrics
            .reconnect()
            .attempts_total
            .with_label_values(&[trigger.as_str(), if success { "success" } else { "failure" }])
            .inc();

        match result {
            Ok(()) => {
                inner.successes.fetch_add(1, Ordering::Relaxed);
                inner.consecutive_failures.store(0, Ordering::Release);
                inner.metrics.reconnect().consecutive_failures.set(0);
                inner.backoff_timer.cancel();
                info!(trigger = %trigger, "Reconnected");
                ReconnectOutcome::Succeeded
            }
            Err(e) => {
                inner.failures.fetch_add(1, Ordering::Relaxed);
                let failures = inner.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                inner
                    .metrics
                    .reconnect()
                    .consecutive_failures
                    .set(i64::from(failures));

                let retry_in = inner.backoff.delay_for_attempt(failures - 1);
                warn!(
                    trigger = %trigger,
                    failures,
                    retry_in = ?retry_in,
                    "Reconnection failed: {}",
                    e
                );
                self.arm_backoff(retry_in);
                ReconnectOutcome::Failed {
                    error: e.to_string(),
                    retry_in,
                }
            }
        }
    }

    async fn run_attempt(&self) -> EngineResult<()> {
        let deps = &self.inner.deps;

        deps.backend
            .refresh_network()
            .await
            .map_err(|e| self.observe(e))?;
        deps.backend
            .probe(self.inner.probe_timeout)
            .await
            .map_err(|e| self.observe(e))?;
        deps.breaker.record_success();

        if deps.gate.state() == InitState::Error {
            info!("Backend reachable again, re-running initialization");
            deps.gate.reset()?;
            deps.gate.wait_until_ready().await?;
        }

        let drained = deps.outbox.drain().await;
        if drained.interrupted {
            return Err(EngineError::Backend(BackendError::Offline));
        }

        if self.inner.config.resubscribe_on_reconnect && !deps.registry.is_empty() {
            let report = deps.registry.resubscribe_all().await;
            if !report.failed.is_empty() {
                warn!(failed = ?report.failed, "Some listeners were dropped during resubscribe");
            }
        }
        Ok(())
    }

    /// Probe without touching the network layer
    async fn session_is_healthy(&self) -> bool {
        let deps = &self.inner.deps;
        match deps.backend.probe(self.inner.probe_timeout).await {
            Ok(()) => deps.outbox.is_empty(),
            Err(e) => {
                debug!("Periodic probe failed: {}", e);
                self.observe(e);
                false
            }
        }
    }

    fn observe(&self, err: BackendError) -> EngineError {
        self.inner.deps.breaker.record_error(&err);
        EngineError::Backend(err)
    }

    fn completed_too_recently(&self, trigger: ReconnectTrigger) -> bool {
        let gap = match trigger {
            ReconnectTrigger::Manual | ReconnectTrigger::Backoff => return false,
            ReconnectTrigger::Periodic => self.inner.config.periodic_min_gap(),
            ReconnectTrigger::NetworkRestored | ReconnectTrigger::Foreground => {
                self.inner.config.min_interval()
            }
        };
        self.inner
            .last_completed
            .lock()
            .map_or(false, |at| at.elapsed() < gap)
    }

    fn skip(&self, trigger: ReconnectTrigger, reason: SkipReason) -> ReconnectOutcome {
        self.inner.skipped.fetch_add(1, Ordering::Relaxed);
        self.inner
            .metrics
            .reconnect()
            .skipped_total
            .with_label_values(&[reason.as_str()])
            .inc();
        debug!(trigger = %trigger, reason = reason.as_str(), "Reconnection skipped");
        ReconnectOutcome::Skipped(reason)
    }

    fn arm_backoff(&self, delay: Duration) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.backoff_timer.arm(TimerHandle::after(delay, move || async move {
            // Run detached so the attempt can re-arm this slot
            if let Some(inner) = weak.upgrade() {
                spawn_trigger(inner, ReconnectTrigger::Backoff);
            }
        }));
    }

    fn record(&self, timestamp: SystemTime, reason: ReconnectTrigger, success: bool) {
        let mut history = self.inner.history.lock();
        history.push_back(ReconnectionAttemptRecord {
            timestamp,
            reason,
            success,
        });
        while history.len() > self.inner.config.attempt_history.max(1) {
            history.pop_front();
        }
    }

    pub fn state(&self) -> ControllerState {
        if self.inner.in_flight.load(Ordering::Acquire) {
            ControllerState::Reconnecting
        } else {
            ControllerState::Idle
        }
    }

    /// Recent attempts, oldest first
    pub fn history(&self) -> Vec<ReconnectionAttemptRecord> {
        self.inner.history.lock().iter().cloned().collect()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn has_pending_backoff(&self) -> bool {
        self.inner.backoff_timer.is_armed()
    }

    pub fn stats(&self) -> ReconnectionStats {
        let inner = &self.inner;
        ReconnectionStats {
            state: self.state(),
            attempts: inner.attempts.load(Ordering::Relaxed),
            successes: inner.successes.load(Ordering::Relaxed),
            failures: inner.failures.load(Ordering::Relaxed),
            skipped: inner.skipped.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures(),
            quick_reconnects_used: inner.limiter.count(),
            backoff_pending: self.has_pending_backoff(),
            last_attempt: inner.history.lock().back().map(|record| record.timestamp),
        }
    }
}

fn spawn_trigger(inner: Arc<ControllerInner>, trigger: ReconnectTrigger) {
    tokio::spawn(async move {
        ReconnectionController { inner }.trigger(trigger).await;
    });
}

async fn watch_connectivity(
    weak: Weak<ControllerInner>,
    mut rx: tokio::sync::watch::Receiver<crate::core::ConnectivityState>,
) {
    let mut previous = *rx.borrow_and_update();
    let mut backgrounded = previous.app_state == AppState::Background;

    while rx.changed().await.is_ok() {
        let current = *rx.borrow_and_update();
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let controller = ReconnectionController { inner };

        if current.app_state == AppState::Background {
            backgrounded = true;
        }

        let trigger = if !previous.is_online() && current.is_online() {
            Some(ReconnectTrigger::NetworkRestored)
        } else if backgrounded && current.app_state == AppState::Active {
            Some(ReconnectTrigger::Foreground)
        } else {
            None
        };

        if previous.is_online() && !current.is_online() && controller.inner.backoff_timer.cancel()
        {
            debug!("Connectivity lost, pending backoff retry cancelled");
        }
        if current.app_state == AppState::Active {
            backgrounded = false;
        }
        previous = current;

        if let Some(trigger) = trigger {
            controller.trigger(trigger).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::config::{BreakerConfig, InitConfig, OutboxConfig};
    use crate::core::{ConnectivityState, ManualClock};
    use crate::resilience::classifier::ErrorClassifier;
    use crate::testing::{MockBackend, MockBackendFactory};
    use serde_json::json;

    struct Harness {
        controller: ReconnectionController,
        monitor: ConnectivityMonitor,
        gate: InitializationGate,
        outbox: Arc<OfflineOutbox>,
        registry: Arc<SubscriptionRegistry>,
        breaker: ErrorCircuitBreaker,
        factory: MockBackendFactory,
    }

    impl Harness {
        fn client(&self) -> Arc<MockBackend> {
            self.factory.current().unwrap()
        }
    }

    fn test_config() -> ReconnectConfig {
        ReconnectConfig {
            min_interval_ms: 3_000,
            backoff_base_ms: 5_000,
            backoff_max_ms: 60_000,
            periodic_interval_ms: 120_000,
            periodic_min_gap_ms: 30_000,
            quick_limit: 3,
            quick_cooldown_ms: 300_000,
            resubscribe_on_reconnect: true,
            attempt_history: 5,
            storage_key: "test.quick".into(),
        }
    }

    fn harness_with(config: ReconnectConfig) -> Harness {
        let factory = MockBackendFactory::default();
        let backend = BackendHandle::new(Arc::new(factory.clone())).unwrap();
        let metrics = MetricsRegistry::new().unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let breaker = ErrorCircuitBreaker::new(BreakerConfig::default(), metrics.clone());
        let gate = InitializationGate::new(
            backend.clone(),
            ErrorClassifier::default(),
            InitConfig::default(),
            metrics.clone(),
        );
        let outbox = Arc::new(OfflineOutbox::new(
            backend.clone(),
            breaker.clone(),
            Arc::clone(&store),
            Arc::clone(&clock),
            OutboxConfig::default(),
            metrics.clone(),
        ));
        let registry = Arc::new(SubscriptionRegistry::new(
            backend.clone(),
            Arc::clone(&clock),
            Duration::ZERO,
        ));
        let monitor = ConnectivityMonitor::new(ConnectivityState::default());

        let controller = ReconnectionController::new(
            ReconnectDeps {
                backend,
                gate: gate.clone(),
                breaker: breaker.clone(),
                outbox: Arc::clone(&outbox),
                registry: Arc::clone(&registry),
                monitor: monitor.clone(),
                store,
                clock,
            },
            config,
            Duration::from_secs(2),
            metrics,
        );

        Harness {
            controller,
            monitor,
            gate,
            outbox,
            registry,
            breaker,
            factory,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config())
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_refreshes_and_drains() {
        let h = harness();
        h.outbox.enqueue("chat/1", json!({"text": "hi"}), None).unwrap();

        assert!(h.controller.manual_reconnect().await);

        assert_eq!(h.client().network_toggles(), 1);
        assert_eq!(h.client().server().writes_for("chat/1").len(), 1);
        assert!(h.outbox.is_empty());
        let history = h.controller.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert_eq!(history[0].reason, ReconnectTrigger::Manual);
    }

    #[tokio::test(start_paused = true)]
    async fn test_automatic_triggers_are_throttled() {
        let h = harness();

        let first = h.controller.trigger(ReconnectTrigger::Foreground).await;
        assert_eq!(first, ReconnectOutcome::Succeeded);

        let second = h.controller.trigger(ReconnectTrigger::NetworkRestored).await;
        assert_eq!(second, ReconnectOutcome::Skipped(SkipReason::Throttled));

        // Manual requests are never throttled by the interval
        assert!(h.controller.manual_reconnect().await);

        tokio::time::sleep(Duration::from_secs(4)).await;
        let third = h.controller.trigger(ReconnectTrigger::Foreground).await;
        assert_eq!(third, ReconnectOutcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_trigger_is_skipped() {
        let h = harness();
        h.client().set_latency(Duration::from_millis(500));

        let controller = h.controller.clone();
        let running =
            tokio::spawn(async move { controller.trigger(ReconnectTrigger::Manual).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.controller.state(), ControllerState::Reconnecting);

        let overlapping = h.controller.trigger(ReconnectTrigger::Manual).await;
        assert_eq!(overlapping, ReconnectOutcome::Skipped(SkipReason::InFlight));

        assert_eq!(running.await.unwrap(), ReconnectOutcome::Succeeded);
        assert_eq!(h.controller.state(), ControllerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_trigger_is_skipped() {
        let h = harness();
        h.monitor.on_network_change(false, Some(false));

        let outcome = h.controller.trigger(ReconnectTrigger::Manual).await;
        assert_eq!(outcome, ReconnectOutcome::Skipped(SkipReason::Offline));
        assert_eq!(h.client().network_toggles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_schedules_doubling_backoff() {
        let h = harness();
        h.client().set_offline(true);

        let first = h.controller.trigger(ReconnectTrigger::Manual).await;
        assert!(matches!(
            first,
            ReconnectOutcome::Failed { retry_in, .. } if retry_in == Duration::from_secs(5)
        ));
        assert!(h.controller.has_pending_backoff());

        // The scheduled retry fires and fails again
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(h.controller.consecutive_failures(), 2);
        assert_eq!(h.controller.stats().attempts, 2);
        assert!(h.controller.has_pending_backoff());

        h.client().set_offline(false);
        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(h.controller.consecutive_failures(), 0);
        assert!(!h.controller.has_pending_backoff());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_trigger_supersedes_backoff() {
        let h = harness();
        h.client().set_offline(true);
        h.controller.trigger(ReconnectTrigger::Manual).await;
        assert!(h.controller.has_pending_backoff());

        h.client().set_offline(false);
        assert!(h.controller.manual_reconnect().await);
        assert!(!h.controller.has_pending_backoff());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_reconnect_budget() {
        let h = harness_with(ReconnectConfig {
            min_interval_ms: 0,
            ..test_config()
        });

        for _ in 0..3 {
            assert_eq!(
                h.controller.trigger(ReconnectTrigger::Foreground).await,
                ReconnectOutcome::Succeeded
            );
        }

        let limited = h.controller.trigger(ReconnectTrigger::Foreground).await;
        assert!(matches!(
            limited,
            ReconnectOutcome::Skipped(SkipReason::RateLimited(_))
        ));
        assert!(h.controller.has_pending_backoff());

        // Manual requests do not spend the budget
        assert!(h.controller.manual_reconnect().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_check_only_probes_when_healthy() {
        let h = harness();

        let outcome = h.controller.trigger(ReconnectTrigger::Periodic).await;
        assert_eq!(outcome, ReconnectOutcome::Healthy);
        assert_eq!(h.client().network_toggles(), 0);
        assert_eq!(h.client().probes(), 1);
        assert!(h.controller.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_check_escalates_on_failed_probe() {
        let h = harness();
        h.client().fail_next_probe(BackendError::unavailable("stale session"));

        let outcome = h.controller.trigger(ReconnectTrigger::Periodic).await;
        assert_eq!(outcome, ReconnectOutcome::Succeeded);
        assert_eq!(h.client().network_toggles(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_recovers_failed_gate() {
        let h = harness();
        h.client()
            .fail_next_probe(BackendError::PermissionDenied("session revoked".into()));
        assert!(h.gate.initialize().await.is_err());
        assert_eq!(h.gate.state(), InitState::Error);

        assert!(h.controller.manual_reconnect().await);
        assert_eq!(h.gate.state(), InitState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_restore_triggers_reconnect() {
        let h = harness();
        h.controller.start();
        h.monitor.on_network_change(false, None);
        tokio::task::yield_now().await;

        h.monitor.on_network_change(true, None);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let history = h.controller.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, ReconnectTrigger::NetworkRestored);
        h.controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_after_background_triggers_reconnect() {
        let h = harness();
        h.controller.start();
        h.monitor.on_app_state_change(AppState::Background);
        tokio::task::yield_now().await;
        h.monitor.on_app_state_change(AppState::Inactive);
        tokio::task::yield_now().await;
        h.monitor.on_app_state_change(AppState::Active);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let history = h.controller.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, ReconnectTrigger::Foreground);
        h.controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_listeners_recreated_once() {
        let h = harness();
        let sink: crate::backend::ListenerSink = Arc::new(|_| {});
        h.registry.listen("chat/1", sink).await.unwrap();
        assert_eq!(h.client().server().listeners_for("chat/1"), 1);

        assert!(h.controller.manual_reconnect().await);

        assert_eq!(h.client().server().listeners_for("chat/1"), 1);
        assert_eq!(h.client().server().listen_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_bounded() {
        let h = harness();
        for _ in 0..8 {
            h.controller.manual_reconnect().await;
        }
        assert_eq!(h.controller.history().len(), 5);
        assert_eq!(h.controller.stats().attempts, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_controller_skips() {
        let h = harness();
        h.controller.start();
        h.controller.stop();

        let outcome = h.controller.trigger(ReconnectTrigger::Manual).await;
        assert_eq!(outcome, ReconnectOutcome::Skipped(SkipReason::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_outage_backoff_is_capped_and_monotonic() {
        let h = harness();
        h.client().set_offline(true);

        let first = h.controller.trigger(ReconnectTrigger::NetworkRestored).await;
        assert!(matches!(first, ReconnectOutcome::Failed { .. }));

        let started = Instant::now();
        let mut last_failure = Instant::now();
        let mut seen = h.controller.consecutive_failures();
        let mut waits = Vec::new();
        while waits.len() < 8 && started.elapsed() < Duration::from_secs(900) {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let failures = h.controller.consecutive_failures();
            if failures != seen {
                assert_eq!(failures, seen + 1);
                waits.push((last_failure.elapsed().as_millis() + 500) / 1000);
                last_failure = Instant::now();
                seen = failures;
            }
        }

        assert_eq!(waits, vec![5, 10, 20, 40, 60, 60, 60, 60]);
        // Only the restore transition spent the quick budget
        assert_eq!(h.controller.stats().quick_reconnects_used, 1);
        assert!(h.controller.has_pending_backoff());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_retry_waits_out_stopped_breaker() {
        let h = harness();
        let fatal = BackendError::internal("internal", "INTERNAL ASSERTION FAILED: Unexpected state");
        for _ in 0..4 {
            h.breaker.record_error(&fatal);
        }
        assert!(!h.breaker.is_call_permitted());

        h.client().set_offline(true);
        let first = h.controller.trigger(ReconnectTrigger::Manual).await;
        assert!(matches!(first, ReconnectOutcome::Failed { .. }));

        // The retry lands inside the cool-off and is pushed back, not dropped
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(h.controller.consecutive_failures(), 1);
        assert_eq!(h.controller.stats().skipped, 1);
        assert!(h.controller.has_pending_backoff());

        h.client().set_offline(false);
        tokio::time::sleep(Duration::from_secs(125)).await;
        assert!(h.breaker.is_call_permitted());
        assert_eq!(h.controller.consecutive_failures(), 0);
        let last = h.controller.history().pop().unwrap();
        assert_eq!(last.reason, ReconnectTrigger::Backoff);
        assert!(last.success);
    }
}
