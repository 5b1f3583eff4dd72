//! Durable offline write outbox
//!
//! Writes made while disconnected are appended to a persisted list and
//! replayed by `drain()` once connectivity returns. Replay is FIFO by
//! `enqueued_at`; a failed item stays where it is and blocks later items for
//! the same target until a later drain delivers it. Delivery is
//! at-least-once; callers that need dedup supply an idempotency key.

use super::circuit_breaker::ErrorCircuitBreaker;
use super::classifier::ErrorClass;
use crate::backend::{load_json, save_json, BackendClient, BackendHandle, KeyValueStore};
use crate::config::OutboxConfig;
use crate::core::{BackendError, Clock, EngineResult};
use crate::monitoring::MetricsRegistry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A write waiting for delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: Uuid,
    pub target_id: String,
    pub payload: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub enqueued_at: SystemTime,
    /// True until the backend has accepted the write
    pub is_queued: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Result of one `drain()` pass
#[derive(Debug, Default, Clone)]
pub struct DrainReport {
    /// Items accepted by the backend, `is_queued = false`
    pub delivered: Vec<OutboxItem>,
    /// Items that failed and stay queued
    pub failed: usize,
    pub dead_lettered: usize,
    /// Items still queued after the pass
    pub remaining: usize,
    /// The pass stopped early on a transport error
    pub interrupted: bool,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.interrupted
    }
}

enum Disposition {
    Delivered,
    Retry,
    DeadLetter,
    Interrupt,
}

pub struct OfflineOutbox {
    backend: BackendHandle,
    breaker: ErrorCircuitBreaker,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
    metrics: MetricsRegistry,
    items: Mutex<Vec<OutboxItem>>,
    dead_letters: Mutex<Vec<OutboxItem>>,
    drain_lock: tokio::sync::Mutex<()>,
    delivered_tx: broadcast::Sender<OutboxItem>,
}

impl OfflineOutbox {
    /// Open the outbox, restoring items persisted by a previous run
    pub fn new(
        backend: BackendHandle,
        breaker: ErrorCircuitBreaker,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: OutboxConfig,
        metrics: MetricsRegistry,
    ) -> Self {
        let items = restore(store.as_ref(), &config.storage_key);
        let dead_letters = restore(store.as_ref(), &dead_letter_key(&config.storage_key));
        if !items.is_empty() {
            info!("Restored {} queued outbox items", items.len());
        }
        metrics.outbox().depth.set(items.len() as i64);

        let (delivered_tx, _) = broadcast::channel(64);
        Self {
            backend,
            breaker,
            store,
            clock,
            config,
            metrics,
            items: Mutex::new(items),
            dead_letters: Mutex::new(dead_letters),
            drain_lock: tokio::sync::Mutex::new(()),
            delivered_tx,
        }
    }

    /// Append a write and persist the outbox
    pub fn enqueue(
        &self,
        target_id: impl Into<String>,
        payload: Value,
        idempotency_key: Option<String>,
    ) -> EngineResult<OutboxItem> {
        let item = OutboxItem {
            id: Uuid::new_v4(),
            target_id: target_id.into(),
            payload,
            idempotency_key,
            enqueued_at: self.clock.now(),
            is_queued: true,
            attempts: 0,
            last_error: None,
        };

        let mut items = self.items.lock();
        items.push(item.clone());
        if let Err(e) = save_json(self.store.as_ref(), &self.config.storage_key, &*items) {
            items.pop();
            return Err(e.into());
        }
        self.metrics.outbox().depth.set(items.len() as i64);
        debug!(id = %item.id, target = %item.target_id, "Outbox item queued");
        Ok(item)
    }

    /// Replay queued items in order
    ///
    /// Concurrent calls run one after another; the second pass picks up
    /// whatever the first left behind.
    pub async fn drain(&self) -> DrainReport {
        let _pass = self.drain_lock.lock().await;

        let mut batch = self.items.lock().clone();
        batch.sort_by_key(|item| item.enqueued_at);

        let mut report = DrainReport::default();
        if batch.is_empty() {
            return report;
        }
        info!("Draining {} outbox items", batch.len());

        let client = self.backend.client();
        let mut blocked: HashSet<String> = HashSet::new();

        for item in batch {
            if blocked.contains(&item.target_id) {
                continue;
            }

            let result = deliver(client.as_ref(), &item).await;
            let disposition = self.dispose(&item, &result);

            match disposition {
                Disposition::Delivered => {
                    self.breaker.record_success();
                    let mut delivered = item;
                    delivered.is_queued = false;
                    delivered.attempts += 1;
                    delivered.last_error = None;
                    self.remove(&delivered.id);
                    self.metrics.outbox().delivered_total.inc();
                    let _ = self.delivered_tx.send(delivered.clone());
                    report.delivered.push(delivered);
                }
                Disposition::Retry => {
                    report.failed += 1;
                    blocked.insert(item.target_id.clone());
                }
                Disposition::DeadLetter => {
                    report.dead_lettered += 1;
                }
                Disposition::Interrupt => {
                    report.failed += 1;
                    report.interrupted = true;
                    break;
                }
            }
        }

        report.remaining = self.len();
        self.metrics.outbox().depth.set(report.remaining as i64);
        info!(
            delivered = report.delivered.len(),
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            remaining = report.remaining,
            "Outbox drain finished"
        );
        report
    }

    fn dispose(&self, item: &OutboxItem, result: &Result<(), BackendError>) -> Disposition {
        let err = match result {
            Ok(()) => return Disposition::Delivered,
            Err(e) => e,
        };

        self.breaker.record_error(err);
        let class = self.breaker.classifier().classify(err);
        let attempts = self.record_failure(&item.id, err);

        let exhausted = self.config.max_attempts > 0 && attempts >= self.config.max_attempts;
        if class == ErrorClass::Permission || exhausted {
            error!(
                id = %item.id,
                target = %item.target_id,
                attempts,
                "Outbox item rejected permanently ({}), moving to dead letters",
                err
            );
            self.dead_letter(&item.id);
            self.metrics.outbox().dead_lettered_total.inc();
            return Disposition::DeadLetter;
        }

        self.metrics.outbox().failed_total.inc();
        warn!(
            id = %item.id,
            target = %item.target_id,
            attempts,
            "Outbox delivery failed, item stays queued: {}",
            err
        );
        if class == ErrorClass::Transport {
            Disposition::Interrupt
        } else {
            Disposition::Retry
        }
    }

    /// Subscribe to items as they are delivered
    pub fn subscribe_deliveries(&self) -> broadcast::Receiver<OutboxItem> {
        self.delivered_tx.subscribe()
    }

    /// Snapshot of queued items in delivery order
    pub fn pending(&self) -> Vec<OutboxItem> {
        let mut items = self.items.lock().clone();
        items.sort_by_key(|item| item.enqueued_at);
        items
    }

    pub fn dead_letters(&self) -> Vec<OutboxItem> {
        self.dead_letters.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    fn remove(&self, id: &Uuid) {
        let mut items = self.items.lock();
        items.retain(|item| &item.id != id);
        self.persist(&items);
    }

    fn record_failure(&self, id: &Uuid, err: &BackendError) -> u32 {
        let mut items = self.items.lock();
        let attempts = match items.iter_mut().find(|item| &item.id == id) {
            Some(item) => {
                item.attempts += 1;
                item.last_error = Some(err.to_string());
                item.attempts
            }
            None => 0,
        };
        self.persist(&items);
        attempts
    }

    fn dead_letter(&self, id: &Uuid) {
        let removed = {
            let mut items = self.items.lock();
            let position = items.iter().position(|item| &item.id == id);
            let removed = position.map(|idx| items.remove(idx));
            self.persist(&items);
            removed
        };

        if let Some(item) = removed {
            let mut dead = self.dead_letters.lock();
            dead.push(item);
            let key = dead_letter_key(&self.config.storage_key);
            if let Err(e) = save_json(self.store.as_ref(), &key, &*dead) {
                warn!("Failed to persist outbox dead letters: {}", e);
            }
        }
    }

    fn persist(&self, items: &[OutboxItem]) {
        if let Err(e) = save_json(self.store.as_ref(), &self.config.storage_key, &items) {
            warn!("Failed to persist outbox: {}", e);
        }
    }
}

async fn deliver(client: &dyn BackendClient, item: &OutboxItem) -> Result<(), BackendError> {
    if !client.target_exists(&item.target_id).await? {
        debug!(target = %item.target_id, "Creating missing target before delivery");
        client.create_target(&item.target_id).await?;
    }
    client
        .write(&item.target_id, &item.payload, item.idempotency_key.as_deref())
        .await
}

fn dead_letter_key(storage_key: &str) -> String {
    format!("{}.dead", storage_key)
}

/// Load a persisted item list; an unreadable list is set aside, not dropped
fn restore(store: &dyn KeyValueStore, key: &str) -> Vec<OutboxItem> {
    match load_json::<Vec<OutboxItem>>(store, key) {
        Ok(items) => items.unwrap_or_default(),
        Err(e) => {
            error!("Outbox state under '{}' is unreadable: {}", key, e);
            if let Ok(Some(raw)) = store.get(key) {
                let quarantine = format!("{}.corrupt", key);
                if let Err(e) = store.set(&quarantine, &raw) {
                    warn!("Failed to quarantine unreadable outbox state: {}", e);
                }
            }
            Vec::new()
        }
    }
}
