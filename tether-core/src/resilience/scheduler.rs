//! Priority operation scheduler
//!
//! Every backend call the application makes goes through `enqueue`. A single
//! drain loop dispatches queued operations once the initialization gate is
//! ready, highest priority first and FIFO within a priority.
//!
//! ```text
//!              warm-up window              steady state
//! limit        1 (spaced dispatches)       steady_concurrency
//! retries      1 refresh+retry for         transport/timeout with
//!              internal/transient errors   bounded backoff
//! ```
//!
//! The scheduler is the only retry owner for the operations it runs;
//! callers must not retry on top of it.

use super::backoff::{BackoffConfig, ExponentialBackoff};
use super::circuit_breaker::ErrorCircuitBreaker;
use super::init_gate::InitializationGate;
use crate::backend::BackendHandle;
use crate::config::SchedulerConfig;
use crate::core::{BackendError, EngineError, EngineResult, Priority};
use crate::monitoring::MetricsRegistry;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Type-erased queued call
trait OperationTask: Send {
    fn run(self: Box<Self>, scheduler: Arc<SchedulerInner>) -> TaskFuture;

    fn reject(self: Box<Self>, err: EngineError);
}

struct TypedTask<F, T> {
    op: F,
    tx: oneshot::Sender<EngineResult<T>>,
}

impl<F, Fut, T> OperationTask for TypedTask<F, T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, BackendError>> + Send + 'static,
    T: Send + 'static,
{
    fn run(self: Box<Self>, scheduler: Arc<SchedulerInner>) -> TaskFuture {
        let TypedTask { op, tx } = *self;
        Box::pin(async move {
            let result = scheduler.execute(&op).await;
            let _ = tx.send(result);
        })
    }

    fn reject(self: Box<Self>, err: EngineError) {
        let _ = self.tx.send(Err(err));
    }
}

struct QueuedOperation {
    id: u64,
    priority: Priority,
    submitted_at: Instant,
    task: Box<dyn OperationTask>,
}

impl PartialEq for QueuedOperation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueuedOperation {}

impl PartialOrd for QueuedOperation {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedOperation {
    // Max-heap: higher priority first, then lower id (earlier submission)
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct SchedulerInner {
    gate: InitializationGate,
    backend: BackendHandle,
    breaker: ErrorCircuitBreaker,
    config: SchedulerConfig,
    metrics: MetricsRegistry,
    started_at: Instant,
    queue: Mutex<BinaryHeap<QueuedOperation>>,
    next_id: AtomicU64,
    active: AtomicUsize,
    slot_freed: Notify,
    draining: AtomicBool,
    closed: AtomicBool,
    in_flight: Mutex<HashMap<u64, AbortHandle>>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    last_dispatch: Mutex<Option<Instant>>,
}

/// Decrements the active count however the operation task ends
struct ActiveGuard {
    scheduler: Arc<SchedulerInner>,
    id: u64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let active = self.scheduler.active.fetch_sub(1, Ordering::AcqRel) - 1;
        self.scheduler.in_flight.lock().remove(&self.id);
        self.scheduler.metrics.scheduler().active.set(active as i64);
        self.scheduler.slot_freed.notify_one();
    }
}

#[derive(Clone)]
pub struct OperationScheduler {
    inner: Arc<SchedulerInner>,
}

impl OperationScheduler {
    pub fn new(
        gate: InitializationGate,
        backend: BackendHandle,
        breaker: ErrorCircuitBreaker,
        config: SchedulerConfig,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                gate,
                backend,
                breaker,
                config,
                metrics,
                started_at: Instant::now(),
                queue: Mutex::new(BinaryHeap::new()),
                next_id: AtomicU64::new(1),
                active: AtomicUsize::new(0),
                slot_freed: Notify::new(),
                draining: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                in_flight: Mutex::new(HashMap::new()),
                drain_task: Mutex::new(None),
                last_dispatch: Mutex::new(None),
            }),
        }
    }

    /// Queue `op` and resolve with its result once it has run
    ///
    /// The operation is queued when `enqueue` is called, not when the
    /// returned future is first polled. `op` may be invoked more than once
    /// when the scheduler retries it.
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
        let submitted = self.inner.submit(op, priority);
        async move {
            match submitted {
                // Sender dropped without a result: the task was aborted
                Ok(rx) => rx.await.unwrap_or(Err(EngineError::Aborted)),
                Err(e) => Err(e),
            }
        }
    }

    /// Reject every still-queued operation with `Flushed`
    pub fn flush(&self) -> usize {
        self.inner.flush()
    }

    /// Abort every executing operation; their callers see `Aborted`
    pub fn abort_in_flight(&self) -> usize {
        let handles: Vec<AbortHandle> = self
            .inner
            .in_flight
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &handles {
            handle.abort();
        }
        if !handles.is_empty() {
            warn!("Aborted {} in-flight operations", handles.len());
        }
        handles.len()
    }

    /// Stop accepting work, reject the queue and stop the drain loop
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(task) = self.inner.drain_task.lock().take() {
            task.abort();
        }
        self.inner.draining.store(false, Ordering::Release);
        self.inner.flush();
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn concurrency_limit(&self) -> usize {
        self.inner.concurrency_limit()
    }

    pub fn in_warm_up(&self) -> bool {
        self.inner.in_warm_up()
    }
}

impl SchedulerInner {
    fn submit<F, Fut, T>(
        self: &Arc<Self>,
        op: F,
        priority: Priority,
    ) -> EngineResult<oneshot::Receiver<EngineResult<T>>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BackendError>> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }

        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut queue = self.queue.lock();
            queue.push(QueuedOperation {
                id,
                priority,
                submitted_at: Instant::now(),
                task: Box::new(TypedTask { op, tx }),
            });
            self.metrics.scheduler().queue_depth.set(queue.len() as i64);
        }
        debug!(id, priority, "Operation queued");

        self.kick();
        Ok(rx)
    }

    fn in_warm_up(&self) -> bool {
        self.started_at.elapsed() < self.config.warm_up()
    }

    fn concurrency_limit(&self) -> usize {
        if self.in_warm_up() {
            1
        } else {
            self.config.steady_concurrency.max(1)
        }
    }

    /// Start the drain loop unless one is already running
    fn kick(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let scheduler = Arc::clone(self);
            let task = tokio::spawn(scheduler.drain_loop());
            *self.drain_task.lock() = Some(task);
        }
    }

    async fn drain_loop(self: Arc<Self>) {
        loop {
            if let Err(e) = self.gate.wait_until_ready().await {
                let reason = e.to_string();
                let rejected = self.reject_queued(|| EngineError::InitFailed(reason.clone()));
                if rejected > 0 {
                    warn!("Rejected {} queued operations: {}", rejected, reason);
                }
                self.draining.store(false, Ordering::Release);
                return;
            }

            while self.active.load(Ordering::Acquire) >= self.concurrency_limit() {
                self.slot_freed.notified().await;
            }

            if self.in_warm_up() {
                let last = *self.last_dispatch.lock();
                if let Some(last) = last {
                    let next = last + self.config.warm_up_spacing();
                    if next > Instant::now() {
                        tokio::time::sleep_until(next).await;
                    }
                }
            }

            let next = {
                let mut queue = self.queue.lock();
                let op = queue.pop();
                self.metrics.scheduler().queue_depth.set(queue.len() as i64);
                op
            };

            match next {
                Some(op) => {
                    *self.last_dispatch.lock() = Some(Instant::now());
                    self.dispatch(op);
                }
                None => {
                    self.draining.store(false, Ordering::Release);
                    // An enqueue may have raced with the store above
                    let pending = !self.queue.lock().is_empty();
                    if !pending
                        || self
                            .draining
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, op: QueuedOperation) {
        if !self.breaker.is_call_permitted() {
            debug!(id = op.id, "Circuit breaker stopped, rejecting operation");
            self.metrics
                .scheduler()
                .completed_total
                .with_label_values(&["rejected"])
                .inc();
            op.task.reject(EngineError::CircuitOpen);
            return;
        }

        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.metrics.scheduler().active.set(active as i64);

        let QueuedOperation {
            id,
            priority,
            submitted_at,
            task,
        } = op;
        debug!(id, priority, active, "Dispatching operation");

        let guard = ActiveGuard {
            scheduler: Arc::clone(self),
            id,
        };
        let scheduler = Arc::clone(self);

        // Register before the task can finish and deregister itself
        let mut in_flight = self.in_flight.lock();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let metrics = scheduler.metrics.clone();
            task.run(scheduler).await;
            metrics
                .scheduler()
                .latency_seconds
                .observe(submitted_at.elapsed().as_secs_f64());
        });
        in_flight.insert(id, handle.abort_handle());
    }

    async fn execute<F, Fut, T>(&self, op: &F) -> EngineResult<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, BackendError>> + Send,
    {
        let classifier = self.breaker.classifier().clone();
        let mut backoff = ExponentialBackoff::with_config(BackoffConfig::transient(
            self.config.retry_base_delay(),
            self.config.max_transient_retries,
        ));
        let mut refreshed = false;

        loop {
            let err = match self.run_once(op).await {
                Ok(value) => {
                    self.breaker.record_success();
                    self.record_completion("ok");
                    return Ok(value);
                }
                Err(e) => e,
            };

            self.breaker.record_error(&err);
            let class = classifier.classify(&err);

            if self.breaker.is_call_permitted() {
                if !refreshed && self.in_warm_up() && classifier.is_internal_or_transient(&err) {
                    refreshed = true;
                    warn!(
                        class = class.as_str(),
                        "Operation failed during warm-up ({}), refreshing connection and retrying once",
                        err
                    );
                    if let Err(refresh_err) = self.backend.refresh_network().await {
                        warn!("Connection refresh failed: {}", refresh_err);
                    }
                    self.metrics.scheduler().retries_total.inc();
                    continue;
                }

                if class.is_retryable() {
                    if let Some(delay) = backoff.next_delay() {
                        debug!(
                            attempt = backoff.attempt_number(),
                            delay = ?delay,
                            "Retrying after {} error: {}",
                            class.as_str(),
                            err
                        );
                        self.metrics.scheduler().retries_total.inc();
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                }
            }

            self.record_completion("error");
            return Err(err.into());
        }
    }

    async fn run_once<F, Fut, T>(&self, op: &F) -> Result<T, BackendError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        match self.config.op_timeout() {
            Some(limit) => tokio::time::timeout(limit, op())
                .await
                .unwrap_or_else(|_| Err(BackendError::Timeout(limit))),
            None => op().await,
        }
    }

    fn record_completion(&self, result: &str) {
        self.metrics
            .scheduler()
            .completed_total
            .with_label_values(&[result])
            .inc();
    }

    fn flush(&self) -> usize {
        let flushed = self.reject_queued(|| EngineError::Flushed);
        if flushed > 0 {
            info!("Flushed {} queued operations", flushed);
        }
        flushed
    }

    fn reject_queued(&self, error: impl Fn() -> EngineError) -> usize {
        let drained = {
            let mut queue = self.queue.lock();
            let drained = std::mem::take(&mut *queue).into_vec();
            self.metrics.scheduler().queue_depth.set(0);
            drained
        };
        let count = drained.len();
        for op in drained {
            op.task.reject(error());
        }
        count
    }
}
