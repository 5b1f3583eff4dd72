use super::constants::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub init: InitConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which backend client implementation to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// Built-in mock backend (development, tests, simulations)
    Mock,
    /// Application-supplied SDK client
    #[default]
    Live,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub mode: BackendMode,
}

/// Initialization gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitConfig {
    /// Self-initialize this long after start if nobody called `initialize()`
    #[serde(default = "default_auto_init_delay")]
    pub auto_init_delay_ms: u64,

    /// Liveness probe timeout
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

impl InitConfig {
    pub fn auto_init_delay(&self) -> Duration {
        Duration::from_millis(self.auto_init_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Operation scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Warm-up window after construction
    #[serde(default = "default_warm_up")]
    pub warm_up_ms: u64,

    /// Minimum delay between dispatches during warm-up
    #[serde(default = "default_warm_up_spacing")]
    pub warm_up_spacing_ms: u64,

    /// Concurrency limit after warm-up
    #[serde(default = "default_steady_concurrency")]
    pub steady_concurrency: usize,

    /// Retries for transport/timeout failures
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Per-operation timeout, 0 disables
    #[serde(default = "default_op_timeout")]
    pub op_timeout_ms: u64,
}

impl SchedulerConfig {
    pub fn warm_up(&self) -> Duration {
        Duration::from_millis(self.warm_up_ms)
    }

    pub fn warm_up_spacing(&self) -> Duration {
        Duration::from_millis(self.warm_up_spacing_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn op_timeout(&self) -> Option<Duration> {
        (self.op_timeout_ms > 0).then(|| Duration::from_millis(self.op_timeout_ms))
    }
}

/// Error circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_window")]
    pub window_ms: u64,

    /// Stop once consecutive fatal errors exceed this
    #[serde(default = "default_trip_threshold")]
    pub trip_threshold: u32,

    /// Emergency recovery once consecutive fatal errors exceed this
    #[serde(default = "default_severe_threshold")]
    pub severe_threshold: u32,

    /// Message fragments that mark an error as backend-internal/fatal
    #[serde(default = "default_fatal_patterns")]
    pub fatal_patterns: Vec<String>,
}

impl BreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Stopped interval: double the window
    pub fn cool_off(&self) -> Duration {
        self.window() * 2
    }
}

/// Reconnection controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_periodic_interval")]
    pub periodic_interval_ms: u64,

    #[serde(default = "default_periodic_min_gap")]
    pub periodic_min_gap_ms: u64,

    /// Quick reconnections allowed within `quick_cooldown_ms`
    #[serde(default = "default_quick_limit")]
    pub quick_limit: u32,

    #[serde(default = "default_quick_cooldown")]
    pub quick_cooldown_ms: u64,

    /// Recreate live listeners after a successful reconnect
    #[serde(default = "default_true")]
    pub resubscribe_on_reconnect: bool,

    #[serde(default = "default_attempt_history")]
    pub attempt_history: usize,

    #[serde(default = "default_rate_limit_key")]
    pub storage_key: String,
}

impl ReconnectConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_millis(self.periodic_interval_ms)
    }

    pub fn periodic_min_gap(&self) -> Duration {
        Duration::from_millis(self.periodic_min_gap_ms)
    }

    pub fn quick_cooldown(&self) -> Duration {
        Duration::from_millis(self.quick_cooldown_ms)
    }
}

/// Offline outbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    #[serde(default = "default_outbox_key")]
    pub storage_key: String,

    /// Attempts before dead-lettering an item, 0 = never
    #[serde(default = "default_outbox_max_attempts")]
    pub max_attempts: u32,
}

/// Subscription registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
}

impl SubscriptionConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json: bool,
}

// Default value functions
fn default_auto_init_delay() -> u64 {
    AUTO_INIT_DELAY_MS
}

fn default_probe_timeout() -> u64 {
    PROBE_TIMEOUT_MS
}

fn default_warm_up() -> u64 {
    WARM_UP_MS
}

fn default_warm_up_spacing() -> u64 {
    WARM_UP_SPACING_MS
}

fn default_steady_concurrency() -> usize {
    STEADY_CONCURRENCY
}

fn default_max_transient_retries() -> u32 {
    MAX_TRANSIENT_RETRIES
}

fn default_retry_base_delay() -> u64 {
    RETRY_BASE_DELAY_MS
}

fn default_op_timeout() -> u64 {
    OP_TIMEOUT_MS
}

fn default_breaker_window() -> u64 {
    BREAKER_WINDOW_MS
}

fn default_trip_threshold() -> u32 {
    BREAKER_TRIP_THRESHOLD
}

fn default_severe_threshold() -> u32 {
    BREAKER_SEVERE_THRESHOLD
}

fn default_fatal_patterns() -> Vec<String> {
    FATAL_ERROR_PATTERNS.iter().map(|p| p.to_string()).collect()
}

fn default_min_interval() -> u64 {
    RECONNECT_MIN_INTERVAL_MS
}

fn default_backoff_base() -> u64 {
    RECONNECT_BACKOFF_BASE_MS
}

fn default_backoff_max() -> u64 {
    RECONNECT_BACKOFF_MAX_MS
}

fn default_periodic_interval() -> u64 {
    PERIODIC_INTERVAL_MS
}

fn default_periodic_min_gap() -> u64 {
    PERIODIC_MIN_GAP_MS
}

fn default_quick_limit() -> u32 {
    QUICK_RECONNECT_LIMIT
}

fn default_quick_cooldown() -> u64 {
    QUICK_RECONNECT_COOLDOWN_MS
}

fn default_true() -> bool {
    true
}

fn default_attempt_history() -> usize {
    ATTEMPT_HISTORY
}

fn default_rate_limit_key() -> String {
    RATE_LIMIT_STORAGE_KEY.to_string()
}

fn default_outbox_key() -> String {
    OUTBOX_STORAGE_KEY.to_string()
}

fn default_outbox_max_attempts() -> u32 {
    OUTBOX_MAX_ATTEMPTS
}

fn default_debounce() -> u64 {
    SUBSCRIBE_DEBOUNCE_MS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            auto_init_delay_ms: default_auto_init_delay(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            warm_up_ms: default_warm_up(),
            warm_up_spacing_ms: default_warm_up_spacing(),
            steady_concurrency: default_steady_concurrency(),
            max_transient_retries: default_max_transient_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            op_timeout_ms: default_op_timeout(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_ms: default_breaker_window(),
            trip_threshold: default_trip_threshold(),
            severe_threshold: default_severe_threshold(),
            fatal_patterns: default_fatal_patterns(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            periodic_interval_ms: default_periodic_interval(),
            periodic_min_gap_ms: default_periodic_min_gap(),
            quick_limit: default_quick_limit(),
            quick_cooldown_ms: default_quick_cooldown(),
            resubscribe_on_reconnect: true,
            attempt_history: default_attempt_history(),
            storage_key: default_rate_limit_key(),
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            storage_key: default_outbox_key(),
            max_attempts: default_outbox_max_attempts(),
        }
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
