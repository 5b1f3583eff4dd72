//! Test helpers: engine builders and async assertions
//!
//! The builders inject a [`MockBackendFactory`] as the engine's client
//! factory so tests can reach the mock server and script faults.

use super::mock_backend::{MockBackend, MockBackendFactory};
use crate::backend::{KeyValueStore, MemoryStore};
use crate::config::{BackendMode, ConfigProfile, EngineConfig};
use crate::core::{Clock, ConnectivityState, ManualClock};
use crate::engine::{EngineDeps, ResilienceEngine};
use std::sync::Arc;
use std::time::Duration;

/// Engine wired to a mock backend, plus handles to its collaborators
pub struct MockEngine {
    pub engine: ResilienceEngine,
    pub factory: MockBackendFactory,
    pub store: Arc<MemoryStore>,
    pub clock: ManualClock,
}

impl MockEngine {
    /// The client currently installed in the engine
    pub fn client(&self) -> Arc<MockBackend> {
        self.factory
            .current()
            .expect("mock factory has produced a client")
    }

    /// Simulate the device losing its network path
    pub fn go_offline(&self) {
        self.client().set_offline(true);
        self.engine.on_network_change(false, Some(false));
    }

    /// Simulate the network path coming back
    pub fn go_online(&self) {
        self.client().set_offline(false);
        self.engine.on_network_change(true, Some(true));
    }
}

/// Small timers that keep the production ordering relationships
pub fn testing_config() -> EngineConfig {
    let mut config = ConfigProfile::testing();
    config.backend.mode = BackendMode::Live;
    config
}

pub fn mock_engine() -> MockEngine {
    mock_engine_with(testing_config())
}

pub fn mock_engine_with(config: EngineConfig) -> MockEngine {
    mock_engine_with_store(config, Arc::new(MemoryStore::new()))
}

/// Build against an existing store, e.g. to simulate a process restart
pub fn mock_engine_with_store(config: EngineConfig, store: Arc<MemoryStore>) -> MockEngine {
    let factory = MockBackendFactory::default();
    let clock = ManualClock::default();
    let deps = EngineDeps::new(Arc::clone(&store) as Arc<dyn KeyValueStore>)
        .with_live_factory(Arc::new(factory.clone()))
        .with_clock(Arc::new(clock.clone()) as Arc<dyn Clock>)
        .with_connectivity(ConnectivityState::default());
    let engine = ResilienceEngine::new(config, deps).expect("valid testing configuration");
    MockEngine {
        engine,
        factory,
        store,
        clock,
    }
}

/// Poll `condition` every 10ms until it holds or `within` elapses
///
/// Meant for paused-clock tests, where the sleeps advance virtual time.
pub async fn wait_for(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::InitState;

    #[tokio::test(start_paused = true)]
    async fn test_mock_engine_initializes() {
        let mock = mock_engine();
        mock.engine.initialize().await.unwrap();

        assert_eq!(mock.engine.init_state(), InitState::Ready);
        assert_eq!(mock.factory.created(), 1);
        assert_eq!(mock.client().probes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out() {
        assert!(!wait_for(Duration::from_millis(50), || false).await);
        assert!(wait_for(Duration::from_millis(50), || true).await);
    }
}
