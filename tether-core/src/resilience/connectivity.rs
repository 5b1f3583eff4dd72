//! Connectivity and app-lifecycle monitor
//!
//! Platform glue pushes raw reachability and foreground/background signals
//! in; the monitor folds them into one `ConnectivityState` and emits it to
//! every observer whenever it changes. No retries, no backend knowledge.

use crate::core::{AppState, ConnectivityState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::debug;

pub type ConnectivityCallback = Arc<dyn Fn(ConnectivityState) + Send + Sync>;

struct MonitorInner {
    state_tx: watch::Sender<ConnectivityState>,
    observers: Mutex<Vec<(u64, ConnectivityCallback)>>,
    next_id: AtomicU64,
}

/// Handle that removes a registered connectivity callback
#[must_use = "dropping the handle keeps the callback registered"]
pub struct Unsubscribe {
    id: u64,
    monitor: Weak<MonitorInner>,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.monitor.upgrade() {
            inner.observers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (state_tx, _) = watch::channel(initial);
        Self {
            inner: Arc::new(MonitorInner {
                state_tx,
                observers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn current(&self) -> ConnectivityState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver that observes every state change (used by the controller)
    pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state_tx.subscribe()
    }

    /// Platform network callback. `is_reachable = None` means the platform
    /// could not tell; it is treated as reachable.
    pub fn on_network_change(&self, is_connected: bool, is_reachable: Option<bool>) {
        self.apply(|state| {
            state.is_connected = is_connected;
            state.is_reachable = is_reachable;
        });
    }

    /// Platform lifecycle callback
    pub fn on_app_state_change(&self, app_state: AppState) {
        self.apply(|state| state.app_state = app_state);
    }

    pub fn register_callback(&self, callback: ConnectivityCallback) -> Unsubscribe {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.lock().push((id, callback));
        Unsubscribe {
            id,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().len()
    }

    fn apply(&self, update: impl FnOnce(&mut ConnectivityState)) {
        let mut changed = None;
        self.inner.state_tx.send_if_modified(|state| {
            let before = *state;
            update(state);
            if *state != before {
                changed = Some(*state);
                true
            } else {
                false
            }
        });

        let Some(state) = changed else {
            return;
        };

        debug!(
            connected = state.is_connected,
            reachable = ?state.is_reachable,
            app_state = state.app_state.as_str(),
            online = state.is_online(),
            "Connectivity changed"
        );

        // Call outside the lock so observers may (un)register
        let observers: Vec<ConnectivityCallback> = self
            .inner
            .observers
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for observer in observers {
            observer(state);
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_monitor() -> (ConnectivityMonitor, Arc<Mutex<Vec<ConnectivityState>>>, Unsubscribe) {
        let monitor = ConnectivityMonitor::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = monitor.register_callback(Arc::new(move |state| sink.lock().push(state)));
        (monitor, seen, handle)
    }

    #[test]
    fn test_emits_only_on_change() {
        let (monitor, seen, _handle) = recording_monitor();

        monitor.on_network_change(true, None); // same as default
        assert!(seen.lock().is_empty());

        monitor.on_network_change(false, Some(false));
        monitor.on_network_change(false, Some(false));
        assert_eq!(seen.lock().len(), 1);
        assert!(!seen.lock()[0].is_online());
    }

    #[test]
    fn test_unknown_reachability_assumed_connected() {
        let (monitor, seen, _handle) = recording_monitor();
        monitor.on_network_change(false, None);
        monitor.on_network_change(true, None);

        let states = seen.lock();
        assert_eq!(states.len(), 2);
        assert!(states[1].is_online());
        assert_eq!(states[1].is_reachable, None);
    }

    #[test]
    fn test_app_state_changes_are_emitted() {
        let (monitor, seen, _handle) = recording_monitor();
        monitor.on_app_state_change(AppState::Background);
        monitor.on_app_state_change(AppState::Active);

        let states = seen.lock();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].app_state, AppState::Background);
        assert!(states[1].is_foreground());
    }

    #[test]
    fn test_unsubscribe_stops_callbacks() {
        let (monitor, seen, handle) = recording_monitor();
        assert_eq!(monitor.observer_count(), 1);

        handle.unsubscribe();
        assert_eq!(monitor.observer_count(), 0);

        monitor.on_network_change(false, Some(false));
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_watch_receiver_sees_latest_state() {
        let monitor = ConnectivityMonitor::default();
        let mut rx = monitor.watch();

        monitor.on_network_change(false, Some(true));
        rx.changed().await.unwrap();
        assert!(!rx.borrow_and_update().is_connected);
    }
}
