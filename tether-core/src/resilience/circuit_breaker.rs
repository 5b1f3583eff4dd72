//! Error circuit breaker for backend-internal failures
//!
//! Counts fatal backend errors (as decided by the `ErrorClassifier`) in a
//! sliding window. Two thresholds:
//!
//! ```text
//! consecutive > trip_threshold    Closed ──▶ Stopped   (reset timer: 2 × window)
//! consecutive > severe_threshold  emergency recovery   (terminate + rebuild client)
//! ```
//!
//! While stopped, matching errors are still counted but do not re-trip.
//! Errors raised while a recovery is running are not processed again.

use super::classifier::{ErrorClass, ErrorClassifier};
use super::timer::{TimerHandle, TimerSlot};
use crate::config::BreakerConfig;
use crate::core::BackendError;
use crate::monitoring::MetricsRegistry;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BreakerState {
    /// Normal operation
    Closed = 0,
    /// Tripped; backend calls are rejected until the cool-off ends
    Stopped = 1,
}

impl From<u8> for BreakerState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Stopped,
            _ => Self::Closed,
        }
    }
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Stopped => "stopped",
        }
    }
}

/// What the breaker did with one recorded error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerVerdict {
    /// Not a fatal error, or arrived during recovery
    Ignored,
    /// Counted, below both thresholds (or already stopped)
    Counted,
    /// This error tripped the breaker
    Tripped,
    /// This error started emergency recovery
    RecoveryStarted,
}

/// Emergency recovery routine installed by the engine
pub type RecoveryAction = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Fatal-error circuit breaker
pub struct ErrorCircuitBreaker {
    config: BreakerConfig,
    classifier: ErrorClassifier,
    metrics: MetricsRegistry,
    state: Arc<AtomicU8>,
    consecutive: Arc<AtomicU32>,
    last_error_at: Arc<Mutex<Option<Instant>>>,
    stopped_at: Arc<Mutex<Option<Instant>>>,
    /// Re-entrancy guard for `record_*`
    handling: Arc<AtomicBool>,
    recovering: Arc<AtomicBool>,
    trips: Arc<AtomicU64>,
    recoveries: Arc<AtomicU64>,
    reset_timer: Arc<TimerSlot>,
    recovery: Arc<Mutex<Option<RecoveryAction>>>,
    /// Runtime used to schedule timers when an error arrives off-runtime
    /// (panic hook on a plain thread)
    runtime: Option<tokio::runtime::Handle>,
}

impl ErrorCircuitBreaker {
    pub fn new(config: BreakerConfig, metrics: MetricsRegistry) -> Self {
        let classifier = ErrorClassifier::new(config.fatal_patterns.clone());
        debug!(
            trip = config.trip_threshold,
            severe = config.severe_threshold,
            window_ms = config.window_ms,
            "Creating error circuit breaker"
        );
        Self {
            config,
            classifier,
            metrics,
            state: Arc::new(AtomicU8::new(BreakerState::Closed as u8)),
            consecutive: Arc::new(AtomicU32::new(0)),
            last_error_at: Arc::new(Mutex::new(None)),
            stopped_at: Arc::new(Mutex::new(None)),
            handling: Arc::new(AtomicBool::new(false)),
            recovering: Arc::new(AtomicBool::new(false)),
            trips: Arc::new(AtomicU64::new(0)),
            recoveries: Arc::new(AtomicU64::new(0)),
            reset_timer: Arc::new(TimerSlot::new()),
            recovery: Arc::new(Mutex::new(None)),
            runtime: tokio::runtime::Handle::try_current().ok(),
        }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Install the emergency recovery routine
    pub fn set_recovery_action(&self, action: RecoveryAction) {
        *self.recovery.lock() = Some(action);
    }

    pub fn clear_recovery_action(&self) {
        self.recovery.lock().take();
    }

    /// Classify and record a backend error
    pub fn record_error(&self, err: &BackendError) -> BreakerVerdict {
        let class = self.classifier.classify(err);
        self.metrics
            .breaker()
            .errors_total
            .with_label_values(&[class.as_str()])
            .inc();
        if class != ErrorClass::Fatal {
            return BreakerVerdict::Ignored;
        }
        self.record_fatal(&err.to_string())
    }

    /// Record a free-form message (panic hook, platform error handler)
    pub fn record_message(&self, message: &str) -> BreakerVerdict {
        if self.classifier.classify_message(message) != ErrorClass::Fatal {
            return BreakerVerdict::Ignored;
        }
        self.metrics
            .breaker()
            .errors_total
            .with_label_values(&[ErrorClass::Fatal.as_str()])
            .inc();
        self.record_fatal(message)
    }

    /// A backend call succeeded; the consecutive counter starts over
    pub fn record_success(&self) {
        if self.consecutive.load(Ordering::Acquire) != 0 {
            self.consecutive.store(0, Ordering::Release);
        }
    }

    fn record_fatal(&self, message: &str) -> BreakerVerdict {
        if self
            .handling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Fatal error raised while handling another, not reprocessed");
            return BreakerVerdict::Ignored;
        }
        let verdict = self.handle_fatal(message);
        self.handling.store(false, Ordering::Release);
        verdict
    }

    fn handle_fatal(&self, message: &str) -> BreakerVerdict {
        if self.recovering.load(Ordering::Acquire) {
            debug!("Fatal error during emergency recovery ignored: {}", message);
            return BreakerVerdict::Ignored;
        }

        self.expire_cool_off();

        let now = Instant::now();
        let count = {
            let mut last = self.last_error_at.lock();
            let window_elapsed = last.map_or(false, |t| now.duration_since(t) > self.config.window());
            *last = Some(now);
            if window_elapsed {
                self.consecutive.store(1, Ordering::Release);
                1
            } else {
                self.consecutive.fetch_add(1, Ordering::AcqRel) + 1
            }
        };

        warn!(
            consecutive = count,
            state = self.state().as_str(),
            "Fatal backend error: {}",
            message
        );

        if count > self.config.severe_threshold {
            return self.start_recovery(count);
        }

        if count > self.config.trip_threshold && self.state() == BreakerState::Closed {
            self.trip(count);
            return BreakerVerdict::Tripped;
        }

        BreakerVerdict::Counted
    }

    fn trip(&self, count: u32) {
        let cool_off = self.config.cool_off();
        error!(
            consecutive = count,
            cool_off = ?cool_off,
            "Circuit breaker TRIPPED - backend calls suspended"
        );
        self.state.store(BreakerState::Stopped as u8, Ordering::Release);
        *self.stopped_at.lock() = Some(Instant::now());
        self.trips.fetch_add(1, Ordering::AcqRel);
        self.metrics.breaker().trips_total.inc();
        self.metrics.breaker().stopped.set(1);
        self.schedule_reset();
    }

    fn schedule_reset(&self) {
        let Some(runtime) = tokio::runtime::Handle::try_current()
            .ok()
            .or_else(|| self.runtime.clone())
        else {
            warn!("No runtime for breaker reset timer, cool-off checked lazily");
            return;
        };
        let _enter = runtime.enter();

        let breaker = self.clone();
        self.reset_timer
            .arm(TimerHandle::after(self.config.cool_off(), move || async move {
                info!("Circuit breaker cool-off elapsed");
                breaker.reset_window();
            }));
    }

    fn start_recovery(&self, count: u32) -> BreakerVerdict {
        let action = self.recovery.lock().clone();
        let Some(action) = action else {
            error!(
                consecutive = count,
                "Severe fatal error threshold exceeded but no recovery action installed"
            );
            self.consecutive.store(0, Ordering::Release);
            return BreakerVerdict::Counted;
        };

        let Some(runtime) = tokio::runtime::Handle::try_current()
            .ok()
            .or_else(|| self.runtime.clone())
        else {
            error!("No runtime available to run emergency recovery");
            return BreakerVerdict::Counted;
        };

        if self
            .recovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return BreakerVerdict::Ignored;
        }

        error!(consecutive = count, "Severe error loop - starting emergency recovery");
        self.consecutive.store(0, Ordering::Release);
        self.recoveries.fetch_add(1, Ordering::AcqRel);
        self.metrics.breaker().recoveries_total.inc();

        let breaker = self.clone();
        runtime.spawn(async move {
            action().await;
            breaker.recovering.store(false, Ordering::Release);
            breaker.reset();
            info!("Emergency recovery finished");
        });

        BreakerVerdict::RecoveryStarted
    }

    /// Reset a stopped breaker whose cool-off has passed without its timer
    fn expire_cool_off(&self) {
        let expired = self
            .stopped_at
            .lock()
            .map_or(false, |t| t.elapsed() >= self.config.cool_off());
        if expired {
            self.reset_window();
        }
    }

    fn reset_window(&self) {
        self.state.store(BreakerState::Closed as u8, Ordering::Release);
        self.consecutive.store(0, Ordering::Release);
        *self.last_error_at.lock() = None;
        *self.stopped_at.lock() = None;
        self.metrics.breaker().stopped.set(0);
    }

    /// Whether backend calls may proceed
    pub fn is_call_permitted(&self) -> bool {
        self.state() == BreakerState::Closed
    }

    pub fn state(&self) -> BreakerState {
        let state: BreakerState = self.state.load(Ordering::Acquire).into();
        if state == BreakerState::Stopped && !self.reset_timer.is_armed() {
            self.expire_cool_off();
            return self.state.load(Ordering::Acquire).into();
        }
        state
    }

    /// Time left before a stopped breaker closes again
    pub fn cool_off_remaining(&self) -> Option<Duration> {
        if self.state() != BreakerState::Stopped {
            return None;
        }
        self.stopped_at
            .lock()
            .map(|t| self.config.cool_off().saturating_sub(t.elapsed()))
    }

    pub fn consecutive_count(&self) -> u32 {
        self.consecutive.load(Ordering::Acquire)
    }

    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Acquire)
    }

    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Acquire)
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    /// Back to Closed with an empty window
    pub fn reset(&self) {
        self.reset_timer.cancel();
        self.reset_window();
        debug!("Circuit breaker reset to CLOSED");
    }

    /// Cancel timers and drop the recovery action (engine shutdown)
    pub fn stop(&self) {
        self.reset_timer.cancel();
        self.clear_recovery_action();
    }
}

impl Clone for ErrorCircuitBreaker {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            classifier: self.classifier.clone(),
            metrics: self.metrics.clone(),
            state: Arc::clone(&self.state),
            consecutive: Arc::clone(&self.consecutive),
            last_error_at: Arc::clone(&self.last_error_at),
            stopped_at: Arc::clone(&self.stopped_at),
            handling: Arc::clone(&self.handling),
            recovering: Arc::clone(&self.recovering),
            trips: Arc::clone(&self.trips),
            recoveries: Arc::clone(&self.recoveries),
            reset_timer: Arc::clone(&self.reset_timer),
            recovery: Arc::clone(&self.recovery),
            runtime: self.runtime.clone(),
        }
    }
}
