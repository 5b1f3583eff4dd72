//! Deduplicating live-query registry
//!
//! The registry is the only component that opens backend listeners. A key
//! maps to at most one `ListenerHandle`; concurrent `subscribe` calls for the
//! same key all await the same creation and receive the same handle.
//!
//! A handle leaves the registry on `unsubscribe` or when the backend ends
//! its listener with a terminal error; the next `subscribe` for that key
//! opens a fresh listener.

use super::circuit_breaker::ErrorCircuitBreaker;
use crate::backend::{BackendClient, BackendHandle, ListenerErrorSink, ListenerSink, Subscription};
use crate::core::{BackendError, Clock, EngineError, EngineResult};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

type SubscribeFuture = Pin<Box<dyn Future<Output = Result<Subscription, BackendError>> + Send>>;
type ListenerFactory =
    Arc<dyn Fn(Arc<dyn BackendClient>, ListenerErrorSink) -> SubscribeFuture + Send + Sync>;

/// One live-query subscription, shared by every caller of its key
pub struct ListenerHandle {
    key: String,
    created_at: SystemTime,
    generation: AtomicU64,
    subscription: Mutex<Option<Subscription>>,
}

impl ListenerHandle {
    fn new(key: String, created_at: SystemTime, subscription: Subscription) -> Self {
        Self {
            key,
            created_at,
            generation: AtomicU64::new(0),
            subscription: Mutex::new(Some(subscription)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Number of times the underlying listener was recreated
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.subscription
            .lock()
            .as_ref()
            .map_or(false, Subscription::is_active)
    }

    /// Tear down the backend listener. Idempotent.
    pub fn unsubscribe(&self) {
        let subscription = self.subscription.lock().take();
        if let Some(mut subscription) = subscription {
            subscription.unsubscribe();
        }
    }

    fn replace(&self, subscription: Subscription) {
        let previous = self.subscription.lock().replace(subscription);
        drop(previous);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("key", &self.key)
            .field("generation", &self.generation())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Why an entry left the map
#[derive(Debug, Clone)]
enum Closed {
    Unsubscribed,
    Terminated(BackendError),
}

struct Entry {
    handle: OnceCell<Arc<ListenerHandle>>,
    factory: ListenerFactory,
    closed: Mutex<Option<Closed>>,
}

impl Entry {
    fn close(&self, reason: Closed) {
        self.closed.lock().get_or_insert(reason);
        if let Some(handle) = self.handle.get() {
            handle.unsubscribe();
        }
    }
}

/// Outcome of `resubscribe_all`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResubscribeReport {
    pub restored: usize,
    /// Keys whose listener could not be recreated; they were removed
    pub failed: Vec<String>,
}

pub struct SubscriptionRegistry {
    backend: BackendHandle,
    clock: Arc<dyn Clock>,
    debounce: Duration,
    entries: Arc<DashMap<String, Arc<Entry>>>,
    breaker: Option<ErrorCircuitBreaker>,
}

impl SubscriptionRegistry {
    pub fn new(backend: BackendHandle, clock: Arc<dyn Clock>, debounce: Duration) -> Self {
        Self {
            backend,
            clock,
            debounce,
            entries: Arc::new(DashMap::new()),
            breaker: None,
        }
    }

    /// Report terminal listener errors to `breaker`
    pub fn with_breaker(mut self, breaker: ErrorCircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Return the live handle for `key`, creating it with `factory` if needed
    ///
    /// Only the first caller's factory is used; it is kept so the listener
    /// can be recreated after a reconnect. The factory must hand the error
    /// sink it receives to the backend so a terminal error removes the key.
    pub async fn subscribe<F, Fut>(&self, key: &str, factory: F) -> EngineResult<Arc<ListenerHandle>>
    where
        F: Fn(Arc<dyn BackendClient>, ListenerErrorSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Subscription, BackendError>> + Send + 'static,
    {
        let boxed: ListenerFactory = Arc::new(
            move |client: Arc<dyn BackendClient>, on_error: ListenerErrorSink| -> SubscribeFuture {
                Box::pin(factory(client, on_error))
            },
        );
        let mut entry = {
            let slot = self.entries.entry(key.to_string()).or_insert_with(|| {
                Arc::new(Entry {
                    handle: OnceCell::new(),
                    factory: boxed,
                    closed: Mutex::new(None),
                })
            });
            Arc::clone(slot.value())
        };

        loop {
            if let Some(handle) = entry.handle.get() {
                return Ok(Arc::clone(handle));
            }

            let created = entry
                .handle
                .get_or_try_init(|| async {
                    // Let near-simultaneous callers coalesce on this cell
                    tokio::time::sleep(self.debounce).await;
                    let on_error = self.terminal_sink(key, &entry);
                    let subscription = (entry.factory)(self.backend.client(), on_error).await?;
                    debug!(key, "Listener created");
                    Ok::<_, BackendError>(Arc::new(ListenerHandle::new(
                        key.to_string(),
                        self.clock.now(),
                        subscription,
                    )))
                })
                .await;

            let handle = match created {
                Ok(handle) => Arc::clone(handle),
                Err(e) => {
                    warn!(key, error = %e, "Listener creation failed");
                    self.entries
                        .remove_if(key, |_, current| Arc::ptr_eq(current, &entry));
                    return Err(e.into());
                }
            };
            if self.is_current(key, &entry) {
                return Ok(handle);
            }

            let closed = entry.closed.lock().clone();
            match closed {
                Some(Closed::Unsubscribed) => {
                    handle.unsubscribe();
                    return Err(EngineError::SubscriptionCancelled(key.to_string()));
                }
                Some(Closed::Terminated(e)) => {
                    handle.unsubscribe();
                    return Err(e.into());
                }
                None => {}
            }

            // Another caller's failed creation dropped this entry from the map
            match self.entries.entry(key.to_string()) {
                MapEntry::Vacant(slot) => {
                    slot.insert(Arc::clone(&entry));
                    return Ok(handle);
                }
                MapEntry::Occupied(slot) => {
                    let current = Arc::clone(slot.get());
                    drop(slot);
                    if Arc::ptr_eq(&current, &entry) {
                        return Ok(handle);
                    }
                    handle.unsubscribe();
                    entry = current;
                }
            }
        }
    }

    /// Error sink that evicts `entry` when the backend ends its listener
    fn terminal_sink(&self, key: &str, entry: &Arc<Entry>) -> ListenerErrorSink {
        let entries = Arc::clone(&self.entries);
        let breaker = self.breaker.clone();
        let weak: Weak<Entry> = Arc::downgrade(entry);
        let key = key.to_string();
        Arc::new(move |err: BackendError| {
            let Some(entry) = weak.upgrade() else {
                return;
            };
            let removed = entries
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &entry))
                .is_some();
            entry.close(Closed::Terminated(err.clone()));
            warn!(key = %key, removed, error = %err, "Listener ended by the backend");
            if let Some(breaker) = &breaker {
                breaker.record_error(&err);
            }
        })
    }

    /// Subscribe `key` as a backend live query delivering snapshots to `sink`
    pub async fn listen(&self, key: &str, sink: ListenerSink) -> EngineResult<Arc<ListenerHandle>> {
        let query = key.to_string();
        self.subscribe(key, move |client, on_error| {
            let query = query.clone();
            let sink = Arc::clone(&sink);
            async move { client.listen(&query, sink, on_error).await }
        })
        .await
    }

    /// Remove and tear down the handle for `key`
    pub fn unsubscribe(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                entry.close(Closed::Unsubscribed);
                debug!(key, "Listener removed");
                true
            }
            None => false,
        }
    }

    /// Tear down every handle (shutdown, logout)
    pub fn unsubscribe_all(&self) -> usize {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let removed = keys.iter().filter(|key| self.unsubscribe(key)).count();
        if removed > 0 {
            info!("Removed {} listeners", removed);
        }
        removed
    }

    /// Recreate every live listener in place against the current client
    ///
    /// Each old listener is torn down before its replacement is opened so
    /// the backend never sees two listeners for one key.
    pub async fn resubscribe_all(&self) -> ResubscribeReport {
        let live: Vec<(String, Arc<Entry>)> = self
            .entries
            .iter()
            .filter(|e| e.value().handle.initialized())
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut report = ResubscribeReport::default();
        for (key, entry) in live {
            let Some(handle) = entry.handle.get() else {
                continue;
            };
            handle.unsubscribe();

            let on_error = self.terminal_sink(&key, &entry);
            match (entry.factory)(self.backend.client(), on_error).await {
                Ok(subscription) if self.is_current(&key, &entry) => {
                    handle.replace(subscription);
                    report.restored += 1;
                }
                Ok(mut subscription) => subscription.unsubscribe(),
                Err(e) => {
                    warn!(key = %key, error = %e, "Listener could not be recreated, dropping it");
                    self.entries
                        .remove_if(&key, |_, current| Arc::ptr_eq(current, &entry));
                    report.failed.push(key);
                }
            }
        }

        if report.restored > 0 || !report.failed.is_empty() {
            info!(
                restored = report.restored,
                failed = report.failed.len(),
                "Listeners resubscribed"
            );
        }
        report
    }

    pub fn get(&self, key: &str) -> Option<Arc<ListenerHandle>> {
        self.entries
            .get(key)
            .and_then(|entry| entry.handle.get().cloned())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_current(&self, key: &str, entry: &Arc<Entry>) -> bool {
        self.entries
            .get(key)
            .map_or(false, |current| Arc::ptr_eq(current.value(), entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::core::ManualClock;
    use crate::monitoring::MetricsRegistry;
    use crate::testing::MockBackendFactory;

    fn registry() -> (Arc<SubscriptionRegistry>, MockBackendFactory) {
        let (registry, factory, _) = registry_with_breaker();
        (registry, factory)
    }

    fn registry_with_breaker() -> (Arc<SubscriptionRegistry>, MockBackendFactory, ErrorCircuitBreaker) {
        let factory = MockBackendFactory::default();
        let backend = BackendHandle::new(Arc::new(factory.clone())).unwrap();
        let breaker = ErrorCircuitBreaker::new(BreakerConfig::default(), MetricsRegistry::new().unwrap());
        let registry = SubscriptionRegistry::new(
            backend,
            Arc::new(ManualClock::default()),
            Duration::from_millis(100),
        )
        .with_breaker(breaker.clone());
        (Arc::new(registry), factory, breaker)
    }

    fn sink() -> ListenerSink {
        Arc::new(|_| {})
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_subscribe_creates_one_listener() {
        let (registry, factory) = registry();

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.listen("chat/42", sink()).await })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }

        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(factory.server().listen_calls(), 1);
        assert_eq!(factory.server().listeners_for("chat/42"), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_tears_down() {
        let (registry, factory) = registry();
        let handle = registry.listen("chat/1", sink()).await.unwrap();

        assert!(registry.unsubscribe("chat/1"));
        assert!(!registry.unsubscribe("chat/1"));
        assert!(!handle.is_active());
        assert_eq!(factory.server().listeners_for("chat/1"), 0);

        // A fresh subscribe after teardown creates a new listener
        let again = registry.listen("chat/1", sink()).await.unwrap();
        assert!(!Arc::ptr_eq(&handle, &again));
        assert_eq!(factory.server().listeners_for("chat/1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_during_creation_cancels() {
        let (registry, factory) = registry();

        let pending = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.listen("chat/9", sink()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.unsubscribe("chat/9"));

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(EngineError::SubscriptionCancelled(_))));
        assert_eq!(factory.server().active_listeners(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_creation_is_not_cached() {
        let (registry, factory) = registry();
        factory
            .current()
            .unwrap()
            .fail_next_listen(BackendError::PermissionDenied("rules".into()));

        assert!(registry.listen("chat/2", sink()).await.is_err());
        assert!(!registry.contains("chat/2"));

        registry.listen("chat/2", sink()).await.unwrap();
        assert_eq!(factory.server().listeners_for("chat/2"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_keeps_single_listener() {
        let (registry, factory) = registry();
        let handle = registry.listen("chat/3", sink()).await.unwrap();

        let report = registry.resubscribe_all().await;

        assert_eq!(report.restored, 1);
        assert!(report.failed.is_empty());
        assert_eq!(handle.generation(), 1);
        assert!(handle.is_active());
        assert_eq!(factory.server().listeners_for("chat/3"), 1);
        assert_eq!(factory.server().listen_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_all() {
        let (registry, factory) = registry();
        registry.listen("a", sink()).await.unwrap();
        registry.listen("b", sink()).await.unwrap();

        assert_eq!(registry.unsubscribe_all(), 2);
        assert!(registry.is_empty());
        assert_eq!(factory.server().active_listeners(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_survives_failed_first_creation() {
        let (registry, factory) = registry();
        factory
            .current()
            .unwrap()
            .fail_next_listen(BackendError::unavailable("listen dropped"));

        let first = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.listen("chat/5", sink()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.listen("chat/5", sink()).await })
        };

        assert!(matches!(first.await.unwrap(), Err(EngineError::Backend(_))));
        let handle = second.await.unwrap().unwrap();

        assert!(handle.is_active());
        assert!(Arc::ptr_eq(&registry.get("chat/5").unwrap(), &handle));
        assert_eq!(factory.server().listeners_for("chat/5"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_ended_listener_is_evicted() {
        let (registry, factory, breaker) = registry_with_breaker();
        let handle = registry.listen("chat/6", sink()).await.unwrap();

        let fatal = BackendError::internal("internal", "INTERNAL ASSERTION FAILED: Unexpected state");
        assert!(factory.server().fail_listener("chat/6", fatal));

        assert!(!registry.contains("chat/6"));
        assert!(!handle.is_active());
        assert_eq!(breaker.consecutive_count(), 1);

        let fresh = registry.listen("chat/6", sink()).await.unwrap();
        assert!(!Arc::ptr_eq(&handle, &fresh));
        assert!(fresh.is_active());
        assert_eq!(factory.server().listen_calls(), 2);
        assert_eq!(factory.server().listeners_for("chat/6"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_ended_during_creation_reports_error() {
        let (registry, factory) = registry();
        let server = factory.server().clone();

        let result = registry
            .subscribe("chat/7", move |client, on_error| {
                let server = server.clone();
                async move {
                    let subscription = client.listen("chat/7", sink(), on_error).await?;
                    server.fail_listener("chat/7", BackendError::PermissionDenied("rules".into()));
                    Ok::<_, BackendError>(subscription)
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(EngineError::Backend(BackendError::PermissionDenied(_)))
        ));
        assert!(!registry.contains("chat/7"));
        assert_eq!(factory.server().active_listeners(), 0);
    }
}
