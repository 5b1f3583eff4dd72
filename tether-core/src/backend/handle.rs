//! Process-wide backend client handle
//!
//! Owns the one live `BackendClient` and serializes everything that toggles
//! its network layer or replaces it. Only the initialization gate and the
//! reconnection controller call `refresh_network`; emergency recovery calls
//! `emergency_reset`.

use super::{BackendClient, BackendFactory};
use crate::core::BackendError;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of a `refresh_network` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// This caller ran the disable/enable sequence
    Toggled,
    /// Another sequence was already running; this caller waited for it
    Coalesced,
}

struct HandleInner {
    factory: Arc<dyn BackendFactory>,
    client: RwLock<Arc<dyn BackendClient>>,
    /// Held for the duration of a toggle or reset sequence
    toggle_lock: Mutex<()>,
    toggle_in_progress: AtomicBool,
    generation: AtomicU64,
}

/// Shared handle to the backend client singleton
#[derive(Clone)]
pub struct BackendHandle {
    inner: Arc<HandleInner>,
}

impl BackendHandle {
    /// Construct the first client from `factory`
    pub fn new(factory: Arc<dyn BackendFactory>) -> Result<Self, BackendError> {
        let client = factory.create()?;
        info!("Backend client created ({})", factory.name());

        Ok(Self {
            inner: Arc::new(HandleInner {
                factory,
                client: RwLock::new(client),
                toggle_lock: Mutex::new(()),
                toggle_in_progress: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        })
    }

    /// Current client. Do not cache across awaits that may span a reset.
    pub fn client(&self) -> Arc<dyn BackendClient> {
        Arc::clone(&self.inner.client.read())
    }

    /// Incremented every time the client is reconstructed
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    pub fn is_toggling(&self) -> bool {
        self.inner.toggle_in_progress.load(Ordering::Acquire)
    }

    /// Cycle the client's network layer off and on
    ///
    /// Overlapping callers do not start a second sequence; they wait for the
    /// running one and report `Coalesced`.
    pub async fn refresh_network(&self) -> Result<ToggleOutcome, BackendError> {
        let _guard = match self.inner.toggle_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Network toggle already in progress, waiting for it");
                let _wait = self.inner.toggle_lock.lock().await;
                return Ok(ToggleOutcome::Coalesced);
            }
        };

        self.inner.toggle_in_progress.store(true, Ordering::Release);
        let client = self.client();

        let result = match client.disable_network().await {
            Ok(()) => client.enable_network().await,
            Err(e) => {
                // Never leave the network disabled on a half-finished toggle
                warn!("disable_network failed: {}", e);
                client.enable_network().await.and(Err(e))
            }
        };

        self.inner.toggle_in_progress.store(false, Ordering::Release);

        match result {
            Ok(()) => {
                debug!("Backend network refreshed");
                Ok(ToggleOutcome::Toggled)
            }
            Err(e) => Err(e),
        }
    }

    /// Run the liveness probe against the current client, bounded by `timeout`
    pub async fn probe(&self, timeout: Duration) -> Result<(), BackendError> {
        let client = self.client();
        match tokio::time::timeout(timeout, client.probe()).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(timeout)),
        }
    }

    /// Terminate the current client, clear its local cache and construct a
    /// replacement from the factory
    pub async fn emergency_reset(&self) -> Result<(), BackendError> {
        let _guard = self.inner.toggle_lock.lock().await;
        self.inner.toggle_in_progress.store(true, Ordering::Release);

        let old = self.client();
        if let Err(e) = old.terminate().await {
            warn!("Terminating backend client failed (continuing reset): {}", e);
        }
        if let Err(e) = old.clear_local_cache().await {
            warn!("Clearing local cache failed (continuing reset): {}", e);
        }

        let result = self.inner.factory.create().map(|fresh| {
            *self.inner.client.write() = fresh;
            let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
            warn!("Backend client reconstructed (generation {})", generation);
        });

        self.inner.toggle_in_progress.store(false, Ordering::Release);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBackend, MockBackendFactory};

    fn handle_with_mock() -> (BackendHandle, MockBackendFactory) {
        let factory = MockBackendFactory::default();
        let handle = BackendHandle::new(Arc::new(factory.clone())).unwrap();
        (handle, factory)
    }

    #[tokio::test]
    async fn test_refresh_network_toggles_off_then_on() {
        let (handle, factory) = handle_with_mock();
        let outcome = handle.refresh_network().await.unwrap();

        assert_eq!(outcome, ToggleOutcome::Toggled);
        let mock: Arc<MockBackend> = factory.current().unwrap();
        assert_eq!(mock.network_toggles(), 1);
        assert!(mock.network_enabled());
        assert!(!handle.is_toggling());
    }

    #[tokio::test]
    async fn test_refresh_network_reenables_after_disable_failure() {
        let (handle, factory) = handle_with_mock();
        let mock = factory.current().unwrap();
        mock.fail_next_disable(BackendError::internal("x", "disable failed"));

        assert!(handle.refresh_network().await.is_err());
        assert!(mock.network_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_refresh_is_coalesced() {
        let (handle, factory) = handle_with_mock();
        let mock = factory.current().unwrap();
        mock.set_latency(Duration::from_millis(100));

        let first = handle.clone();
        let second = handle.clone();
        let (a, b) = tokio::join!(first.refresh_network(), async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            second.refresh_network().await
        });

        assert_eq!(a.unwrap(), ToggleOutcome::Toggled);
        assert_eq!(b.unwrap(), ToggleOutcome::Coalesced);
        assert_eq!(mock.network_toggles(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_times_out() {
        let (handle, factory) = handle_with_mock();
        factory.current().unwrap().hang_probes(true);

        let err = handle.probe(Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(err, BackendError::Timeout(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_emergency_reset_replaces_client() {
        let (handle, factory) = handle_with_mock();
        let before = factory.current().unwrap();

        handle.emergency_reset().await.unwrap();

        assert_eq!(handle.generation(), 1);
        assert!(before.is_terminated());
        assert_eq!(before.cache_clears(), 1);
        let after = factory.current().unwrap();
        assert!(!after.is_terminated());
        assert_eq!(factory.created(), 2);
    }
}
