//! Shared value types for the resilience engine
//!
//! Everything here is plain data: cheap to copy or clone, serialisable for
//! the diagnostics surface, and free of any backend knowledge.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Application lifecycle state as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    /// In the foreground and receiving input
    Active,
    /// Backgrounded; timers may be suspended by the OS
    Background,
    /// Transitioning (e.g. system overlay shown)
    Inactive,
}

impl AppState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Background => "background",
            Self::Inactive => "inactive",
        }
    }
}

/// Current best-known network/app status
///
/// `is_reachable` is `None` when the platform cannot determine reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub is_connected: bool,
    pub is_reachable: Option<bool>,
    pub app_state: AppState,
}

impl ConnectivityState {
    /// Effective connectivity: unknown reachability counts as reachable
    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_reachable.unwrap_or(true)
    }

    pub fn is_foreground(&self) -> bool {
        self.app_state == AppState::Active
    }
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self {
            is_connected: true,
            is_reachable: None,
            app_state: AppState::Active,
        }
    }
}

/// Backend client readiness
///
/// ```text
/// Pending ──initialize()──▶ Initializing ──▶ Ready
///                                │
///                                └────────▶ Error ──reset()──▶ Initializing
/// ```
///
/// `Ready → Initializing` is only reachable through an explicit `reset()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitState {
    Pending,
    Initializing,
    Ready,
    Error,
}

impl InitState {
    /// Transitions taken by the gate on its own
    pub fn can_advance_to(&self, next: InitState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Initializing)
                | (Self::Initializing, Self::Ready)
                | (Self::Initializing, Self::Error)
        )
    }

    /// Transitions that require an explicit `reset()`
    pub fn can_reset(&self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation priority. Higher values dequeue first.
pub type Priority = i32;

/// Well-known priority levels used by the engine itself
pub mod priority {
    use super::Priority;

    pub const BACKGROUND: Priority = 0;
    pub const NORMAL: Priority = 5;
    pub const USER: Priority = 10;
    pub const CRITICAL: Priority = 20;
}

/// What caused a reconnection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectTrigger {
    /// Connectivity transitioned to connected
    NetworkRestored,
    /// App returned to the foreground
    Foreground,
    /// User or diagnostics request
    Manual,
    /// Long-period staleness check
    Periodic,
    /// Scheduled retry after a failed attempt
    Backoff,
}

impl ReconnectTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkRestored => "network_restored",
            Self::Foreground => "foreground",
            Self::Manual => "manual",
            Self::Periodic => "periodic",
            Self::Backoff => "backoff",
        }
    }

    /// Not requested by the user; held back while the breaker is stopped
    pub fn is_automatic(&self) -> bool {
        !matches!(self, Self::Manual)
    }

    /// Spends the quick-reconnect budget. Backoff retries are paced by the
    /// backoff schedule instead.
    pub fn uses_quick_budget(&self) -> bool {
        matches!(self, Self::NetworkRestored | Self::Foreground | Self::Periodic)
    }
}

impl fmt::Display for ReconnectTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit entry for one reconnection try
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectionAttemptRecord {
    pub timestamp: SystemTime,
    pub reason: ReconnectTrigger,
    pub success: bool,
}
