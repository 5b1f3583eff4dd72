//! Programmable mock backend
//!
//! Stands in for the managed backend SDK in tests, simulations and the
//! `mock` backend mode. Server-side data (targets, writes, live listeners)
//! lives in a [`MockServer`] shared by every client the factory builds, so
//! it survives an emergency reset just like real remote data would.

use crate::backend::{BackendClient, BackendFactory, ListenerErrorSink, ListenerSink, Subscription};
use crate::core::BackendError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One accepted write, as the server saw it
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub target: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
}

#[derive(Default)]
struct ServerState {
    targets: HashSet<String>,
    writes: Vec<WriteRecord>,
    seen_keys: HashSet<String>,
    /// Open listener per query, keyed to the listen call that opened it
    listeners: HashMap<String, LiveListener>,
    listen_calls: usize,
}

struct LiveListener {
    id: usize,
    sink: ListenerSink,
    on_error: ListenerErrorSink,
}

/// Server-side state shared across client generations
#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    pub fn writes_for(&self, target: &str) -> Vec<Value> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| w.target == target)
            .map(|w| w.payload.clone())
            .collect()
    }

    pub fn has_target(&self, target: &str) -> bool {
        self.state.lock().targets.contains(target)
    }

    pub fn add_target(&self, target: &str) {
        self.state.lock().targets.insert(target.to_string());
    }

    /// Live listeners currently open for `query`
    pub fn listeners_for(&self, query: &str) -> usize {
        usize::from(self.state.lock().listeners.contains_key(query))
    }

    pub fn active_listeners(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Total `listen` calls that reached the server
    pub fn listen_calls(&self) -> usize {
        self.state.lock().listen_calls
    }

    /// Push a snapshot to whoever listens on `query`
    pub fn emit(&self, query: &str, value: Value) -> bool {
        let sink = self
            .state
            .lock()
            .listeners
            .get(query)
            .map(|listener| Arc::clone(&listener.sink));
        match sink {
            Some(sink) => {
                sink(value);
                true
            }
            None => false,
        }
    }

    /// End the listener on `query` from the server side with `error`
    pub fn fail_listener(&self, query: &str, error: BackendError) -> bool {
        let listener = self.state.lock().listeners.remove(query);
        match listener {
            Some(listener) => {
                (listener.on_error)(error);
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct Faults {
    disable: VecDeque<BackendError>,
    probe: VecDeque<BackendError>,
    writes: HashMap<String, VecDeque<BackendError>>,
    listen: VecDeque<BackendError>,
}

/// One client "session" against the mock server
pub struct MockBackend {
    server: MockServer,
    faults: Mutex<Faults>,
    latency: Mutex<Option<Duration>>,
    offline: AtomicBool,
    hang_probes: AtomicBool,
    network_enabled: AtomicBool,
    terminated: AtomicBool,
    network_toggles: AtomicUsize,
    probes: AtomicUsize,
    cache_clears: AtomicUsize,
}

impl MockBackend {
    pub fn new(server: MockServer) -> Self {
        Self {
            server,
            faults: Mutex::new(Faults::default()),
            latency: Mutex::new(None),
            offline: AtomicBool::new(false),
            hang_probes: AtomicBool::new(false),
            network_enabled: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            network_toggles: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            cache_clears: AtomicUsize::new(0),
        }
    }

    pub fn server(&self) -> &MockServer {
        &self.server
    }

    /// Simulate the device losing its network path
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay applied to every call
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn clear_latency(&self) {
        *self.latency.lock() = None;
    }

    /// Make probes never complete (exercises probe timeouts)
    pub fn hang_probes(&self, hang: bool) {
        self.hang_probes.store(hang, Ordering::SeqCst);
    }

    pub fn fail_next_probe(&self, error: BackendError) {
        self.faults.lock().probe.push_back(error);
    }

    pub fn fail_next_disable(&self, error: BackendError) {
        self.faults.lock().disable.push_back(error);
    }

    pub fn fail_next_listen(&self, error: BackendError) {
        self.faults.lock().listen.push_back(error);
    }

    /// Fail the next write to `target` with `error`
    pub fn fail_next_write(&self, target: &str, error: BackendError) {
        self.faults
            .lock()
            .writes
            .entry(target.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn network_toggles(&self) -> usize {
        self.network_toggles.load(Ordering::SeqCst)
    }

    pub fn network_enabled(&self) -> bool {
        self.network_enabled.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn cache_clears(&self) -> usize {
        self.cache_clears.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_usable(&self) -> Result<(), BackendError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(BackendError::Terminated);
        }
        if self.offline.load(Ordering::SeqCst) || !self.network_enabled() {
            return Err(BackendError::Offline);
        }
        Ok(())
    }
}

#[async_trait]
impl BackendClient for MockBackend {
    async fn disable_network(&self) -> Result<(), BackendError> {
        self.simulate_latency().await;
        if let Some(err) = self.faults.lock().disable.pop_front() {
            return Err(err);
        }
        self.network_enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn enable_network(&self) -> Result<(), BackendError> {
        self.simulate_latency().await;
        self.network_enabled.store(true, Ordering::SeqCst);
        self.network_toggles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self) -> Result<(), BackendError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.hang_probes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.simulate_latency().await;
        self.check_usable()?;
        match self.faults.lock().probe.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn terminate(&self) -> Result<(), BackendError> {
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_local_cache(&self) -> Result<(), BackendError> {
        self.cache_clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn target_exists(&self, target: &str) -> Result<bool, BackendError> {
        self.simulate_latency().await;
        self.check_usable()?;
        Ok(self.server.has_target(target))
    }

    async fn create_target(&self, target: &str) -> Result<(), BackendError> {
        self.simulate_latency().await;
        self.check_usable()?;
        self.server.add_target(target);
        Ok(())
    }

    async fn write(
        &self,
        target: &str,
        payload: &Value,
        idempotency_key: Option<&str>,
    ) -> Result<(), BackendError> {
        self.simulate_latency().await;
        self.check_usable()?;

        let injected = self
            .faults
            .lock()
            .writes
            .get_mut(target)
            .and_then(|queue| queue.pop_front());
        if let Some(err) = injected {
            return Err(err);
        }

        let mut state = self.server.state.lock();
        if !state.targets.contains(target) {
            return Err(BackendError::NotFound(target.to_string()));
        }
        if let Some(key) = idempotency_key {
            if !state.seen_keys.insert(key.to_string()) {
                return Ok(());
            }
        }
        state.writes.push(WriteRecord {
            target: target.to_string(),
            payload: payload.clone(),
            idempotency_key: idempotency_key.map(str::to_string),
        });
        Ok(())
    }

    async fn listen(
        &self,
        query: &str,
        sink: ListenerSink,
        on_error: ListenerErrorSink,
    ) -> Result<Subscription, BackendError> {
        self.simulate_latency().await;
        self.check_usable()?;
        if let Some(err) = self.faults.lock().listen.pop_front() {
            return Err(err);
        }

        let id = {
            let mut state = self.server.state.lock();
            state.listen_calls += 1;
            if state.listeners.contains_key(query) {
                return Err(BackendError::internal(
                    "already-exists",
                    format!("duplicate listener for target '{}'", query),
                ));
            }
            let id = state.listen_calls;
            state
                .listeners
                .insert(query.to_string(), LiveListener { id, sink, on_error });
            id
        };

        let server = self.server.clone();
        let query = query.to_string();
        Ok(Subscription::new(move || {
            let mut state = server.state.lock();
            // A listener the server already ended may have been replaced
            if state.listeners.get(&query).map_or(false, |l| l.id == id) {
                state.listeners.remove(&query);
            }
        }))
    }
}

/// Factory producing `MockBackend` clients against one shared server
#[derive(Clone, Default)]
pub struct MockBackendFactory {
    server: MockServer,
    current: Arc<Mutex<Option<Arc<MockBackend>>>>,
    created: Arc<AtomicUsize>,
    create_failures: Arc<Mutex<VecDeque<BackendError>>>,
}

impl MockBackendFactory {
    pub fn server(&self) -> &MockServer {
        &self.server
    }

    /// Most recently created client
    pub fn current(&self) -> Option<Arc<MockBackend>> {
        self.current.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn fail_next_create(&self, error: BackendError) {
        self.create_failures.lock().push_back(error);
    }
}

impl BackendFactory for MockBackendFactory {
    fn create(&self) -> Result<Arc<dyn BackendClient>, BackendError> {
        if let Some(err) = self.create_failures.lock().pop_front() {
            return Err(err);
        }
        let client = Arc::new(MockBackend::new(self.server.clone()));
        *self.current.lock() = Some(Arc::clone(&client));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(client)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
