//! Persisted quick-reconnect limiter
//!
//! Caps automatic reconnections to `limit` per cooldown window so a flapping
//! radio cannot drain the battery. The window survives process restarts.
//!
//! ```text
//! limit = 3, cooldown = 5 min
//!
//! t=0s    acquire  ──▶ ok   (1/3, window opens)
//! t=20s   acquire  ──▶ ok   (2/3)
//! t=40s   acquire  ──▶ ok   (3/3)
//! t=60s   acquire  ──▶ Err(4 min remaining)
//! t=300s  acquire  ──▶ ok   (window reset, 1/3)
//! ```

use crate::backend::{load_json, save_json, KeyValueStore};
use crate::core::Clock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Persisted counter state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickReconnectWindow {
    /// Wall-clock start of the current window (ms since epoch)
    pub window_started_at_ms: u64,
    pub count: u32,
}

pub struct QuickReconnectLimiter {
    limit: u32,
    cooldown: Duration,
    storage_key: String,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    window: Mutex<QuickReconnectWindow>,
    total_allowed: AtomicU64,
    total_rejected: AtomicU64,
}

impl QuickReconnectLimiter {
    /// Create the limiter, restoring any window persisted by a previous run
    pub fn new(
        limit: u32,
        cooldown: Duration,
        storage_key: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let storage_key = storage_key.into();
        let window = match load_json::<QuickReconnectWindow>(store.as_ref(), &storage_key) {
            Ok(Some(window)) => {
                debug!(count = window.count, "Restored quick-reconnect window");
                window
            }
            Ok(None) => QuickReconnectWindow::default(),
            Err(e) => {
                warn!("Discarding unreadable quick-reconnect window: {}", e);
                QuickReconnectWindow::default()
            }
        };

        Self {
            limit,
            cooldown,
            storage_key,
            store,
            clock,
            window: Mutex::new(window),
            total_allowed: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    /// Consume one quick reconnection
    ///
    /// Returns the time left in the cooldown when the budget is spent.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = self.clock.now_millis();
        let mut window = self.window.lock();
        self.expire(&mut window, now);

        if window.count >= self.limit {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(self.remaining_in(&window, now));
        }

        if window.count == 0 {
            window.window_started_at_ms = now;
        }
        window.count += 1;
        self.total_allowed.fetch_add(1, Ordering::Relaxed);
        self.persist(&window);
        Ok(())
    }

    /// Quick reconnections used in the current window
    pub fn count(&self) -> u32 {
        let now = self.clock.now_millis();
        let mut window = self.window.lock();
        self.expire(&mut window, now);
        window.count
    }

    /// Time until the budget refills, zero if not exhausted
    pub fn remaining(&self) -> Duration {
        let now = self.clock.now_millis();
        let mut window = self.window.lock();
        self.expire(&mut window, now);
        if window.count >= self.limit {
            self.remaining_in(&window, now)
        } else {
            Duration::ZERO
        }
    }

    pub fn reset(&self) {
        let mut window = self.window.lock();
        *window = QuickReconnectWindow::default();
        self.persist(&window);
    }

    pub fn total_allowed(&self) -> u64 {
        self.total_allowed.load(Ordering::Relaxed)
    }

    pub fn total_rejected(&self) -> u64 {
        self.total_rejected.load(Ordering::Relaxed)
    }

    fn expire(&self, window: &mut QuickReconnectWindow, now: u64) {
        if window.count == 0 {
            return;
        }
        let elapsed = now.saturating_sub(window.window_started_at_ms);
        if elapsed >= self.cooldown.as_millis() as u64 {
            debug!("Quick-reconnect cooldown elapsed, counter reset");
            *window = QuickReconnectWindow::default();
            self.persist(window);
        }
    }

    fn remaining_in(&self, window: &QuickReconnectWindow, now: u64) -> Duration {
        let elapsed = now.saturating_sub(window.window_started_at_ms);
        self.cooldown
            .saturating_sub(Duration::from_millis(elapsed))
    }

    fn persist(&self, window: &QuickReconnectWindow) {
        if let Err(e) = save_json(self.store.as_ref(), &self.storage_key, window) {
            warn!("Failed to persist quick-reconnect window: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::core::ManualClock;

    const KEY: &str = "test.quick";

    fn limiter(store: &Arc<MemoryStore>, clock: &ManualClock) -> QuickReconnectLimiter {
        QuickReconnectLimiter::new(
            3,
            Duration::from_secs(300),
            KEY,
            Arc::clone(store) as Arc<dyn KeyValueStore>,
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn test_limit_within_window() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::default();
        let limiter = limiter(&store, &clock);

        for _ in 0..3 {
            assert!(limiter.try_acquire().is_ok());
            clock.advance(Duration::from_secs(20));
        }

        let remaining = limiter.try_acquire().unwrap_err();
        assert_eq!(remaining, Duration::from_secs(240));
        assert_eq!(limiter.total_rejected(), 1);
    }

    #[test]
    fn test_counter_resets_after_cooldown() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::default();
        let limiter = limiter(&store, &clock);

        for _ in 0..3 {
            limiter.try_acquire().unwrap();
        }
        assert!(limiter.try_acquire().is_err());

        clock.advance(Duration::from_secs(300));
        assert_eq!(limiter.count(), 0);
        assert!(limiter.try_acquire().is_ok());
        assert_eq!(limiter.count(), 1);
    }

    #[test]
    fn test_window_survives_restart() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::default();

        {
            let first = limiter(&store, &clock);
            first.try_acquire().unwrap();
            first.try_acquire().unwrap();
            first.try_acquire().unwrap();
        }

        let restarted = limiter(&store, &clock);
        assert_eq!(restarted.count(), 3);
        assert!(restarted.try_acquire().is_err());
        assert_eq!(restarted.remaining(), Duration::from_secs(300));
    }

    #[test]
    fn test_corrupt_state_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        store.set(KEY, "not json").unwrap();

        let limiter = limiter(&store, &ManualClock::default());
        assert_eq!(limiter.count(), 0);
        assert!(limiter.try_acquire().is_ok());
    }
}
