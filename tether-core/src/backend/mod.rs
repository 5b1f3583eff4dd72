//! Backend capability interface
//!
//! The managed backend SDK is an external collaborator. The engine only sees
//! it through [`BackendClient`]; concrete clients are produced by a
//! [`BackendFactory`] chosen once at construction time (see
//! [`select_factory`]), never swapped per call.

pub mod handle;
pub mod store;

pub use handle::{BackendHandle, ToggleOutcome};
pub use store::{load_json, save_json, FileStore, KeyValueStore, MemoryStore};

use crate::config::BackendMode;
use crate::core::{BackendError, EngineError};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Callback receiving live-query snapshots
pub type ListenerSink = Arc<dyn Fn(Value) + Send + Sync>;

/// Called once when the backend ends a live query on its side (permission
/// revoked, internal error). No snapshots follow.
pub type ListenerErrorSink = Arc<dyn Fn(BackendError) + Send + Sync>;

/// Registration returned by the backend's live-query API
///
/// Tearing down is idempotent; dropping an un-torn-down subscription tears
/// it down as well, so a listener can never outlive its owner.
pub struct Subscription {
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    /// Subscription with nothing to tear down
    pub fn noop() -> Self {
        Self { teardown: None }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }

    pub fn is_active(&self) -> bool {
        self.teardown.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Session to the managed real-time backend
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Take the client's network layer offline
    async fn disable_network(&self) -> Result<(), BackendError>;

    /// Bring the client's network layer back online
    async fn enable_network(&self) -> Result<(), BackendError>;

    /// Minimal point read used purely as a liveness probe
    async fn probe(&self) -> Result<(), BackendError>;

    /// Shut the client down; it is unusable afterwards
    async fn terminate(&self) -> Result<(), BackendError>;

    /// Drop locally cached documents and pending SDK state
    async fn clear_local_cache(&self) -> Result<(), BackendError>;

    async fn target_exists(&self, target: &str) -> Result<bool, BackendError>;

    async fn create_target(&self, target: &str) -> Result<(), BackendError>;

    /// Write `payload` under `target`. The backend deduplicates on
    /// `idempotency_key` when one is supplied.
    async fn write(
        &self,
        target: &str,
        payload: &Value,
        idempotency_key: Option<&str>,
    ) -> Result<(), BackendError>;

    /// Open a live query. Only `SubscriptionRegistry` may call this.
    async fn listen(
        &self,
        query: &str,
        sink: ListenerSink,
        on_error: ListenerErrorSink,
    ) -> Result<Subscription, BackendError>;
}

/// Produces fresh backend clients (initial construction and emergency reset)
pub trait BackendFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn BackendClient>, BackendError>;

    fn name(&self) -> &'static str;
}

/// Pick the client factory for the configured mode
///
/// `Mock` always resolves to the built-in mock backend; `Live` requires the
/// application to supply the SDK-backed factory.
pub fn select_factory(
    mode: BackendMode,
    live: Option<Arc<dyn BackendFactory>>,
) -> Result<Arc<dyn BackendFactory>, EngineError> {
    match mode {
        BackendMode::Mock => Ok(Arc::new(crate::testing::MockBackendFactory::default())),
        BackendMode::Live => live.ok_or_else(|| {
            EngineError::Config("backend mode is 'live' but no live factory was supplied".into())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscription_teardown_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut sub = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(sub.is_active());
        sub.unsubscribe();
        sub.unsubscribe();
        drop(sub);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_drop_tears_down() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        {
            let _sub = Subscription::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_select_factory() {
        let mock = select_factory(BackendMode::Mock, None).unwrap();
        assert_eq!(mock.name(), "mock");

        let err = select_factory(BackendMode::Live, None).err().unwrap();
        assert!(matches!(err, EngineError::Config(_)));

        let live: Arc<dyn BackendFactory> = Arc::new(crate::testing::MockBackendFactory::default());
        assert!(select_factory(BackendMode::Live, Some(live)).is_ok());
    }
}
