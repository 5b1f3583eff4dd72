//! Cancellable scheduled tasks
//!
//! Backoff retries, debounce windows, auto-initialization, breaker cool-off
//! and periodic checks are all tokio tasks owned by the component that
//! created them. The handle aborts the task on `cancel()` and on drop, so a
//! timer can never fire after its owner is torn down.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Owned handle to a scheduled task
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Run `f` once after `delay`
    pub fn after<F, Fut>(delay: Duration, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f().await;
        });
        Self { task }
    }

    /// Run `f` every `period`, first tick after one full period
    pub fn every<F, Fut>(period: Duration, mut f: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                f().await;
            }
        });
        Self { task }
    }

    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Holds at most one pending timer; arming a new one cancels the previous
#[derive(Debug, Default)]
pub struct TimerSlot {
    slot: Mutex<Option<TimerHandle>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any pending timer with `timer`
    pub fn arm(&self, timer: TimerHandle) {
        let previous = self.slot.lock().replace(timer);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Cancel the pending timer, returning whether one was armed
    pub fn cancel(&self) -> bool {
        match self.slot.lock().take() {
            Some(timer) => {
                let pending = !timer.is_finished();
                timer.cancel();
                pending
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .map_or(false, |timer| !timer.is_finished())
    }
}
