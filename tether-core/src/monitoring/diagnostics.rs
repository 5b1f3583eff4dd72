//! Operator-facing diagnostics snapshot
//!
//! Plain serialisable data; a diagnostics screen or a debug endpoint renders
//! it as JSON.

use crate::core::{ConnectivityState, InitState};
use crate::resilience::ReconnectionStats;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    pub init_state: InitState,
    pub last_init_error: Option<String>,
    pub connectivity: ConnectivityState,
    pub scheduler: SchedulerDiagnostics,
    pub breaker: BreakerDiagnostics,
    pub reconnect: ReconnectionStats,
    pub outbox: OutboxDiagnostics,
    pub listeners: usize,
    /// Incremented on every emergency client reset
    pub client_generation: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerDiagnostics {
    pub queue_depth: usize,
    pub active: usize,
    pub concurrency_limit: usize,
    pub in_warm_up: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerDiagnostics {
    pub state: &'static str,
    pub consecutive_errors: u32,
    pub trips: u64,
    pub recoveries: u64,
    pub recovering: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboxDiagnostics {
    pub queued: usize,
    pub dead_lettered: usize,
}

impl DiagnosticsSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// One-line summary for periodic log output
    pub fn summary(&self) -> String {
        format!(
            "init={} online={} queue={} active={}/{} breaker={} outbox={} listeners={}",
            self.init_state,
            self.connectivity.is_online(),
            self.scheduler.queue_depth,
            self.scheduler.active,
            self.scheduler.concurrency_limit,
            self.breaker.state,
            self.outbox.queued,
            self.listeners,
        )
    }
}
