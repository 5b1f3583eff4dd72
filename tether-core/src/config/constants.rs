//! Default tuning values for the resilience engine
//!
//! Every value here can be overridden through `EngineConfig`; these are the
//! production defaults used when a field is absent.

// ===== INITIALIZATION =====

/// Delay before the gate initializes itself if nobody asked
pub const AUTO_INIT_DELAY_MS: u64 = 3_000;

/// Upper bound on a single liveness probe
pub const PROBE_TIMEOUT_MS: u64 = 8_000;

// ===== SCHEDULER =====

/// Warm-up window after construction (concurrency pinned to 1)
pub const WARM_UP_MS: u64 = 10_000;

/// Minimum spacing between dispatches during warm-up
pub const WARM_UP_SPACING_MS: u64 = 250;

/// Concurrency limit once warm-up has elapsed
pub const STEADY_CONCURRENCY: usize = 5;

/// Retries for transport and timeout failures before surfacing
pub const MAX_TRANSIENT_RETRIES: u32 = 2;

/// Base delay between transient retries
pub const RETRY_BASE_DELAY_MS: u64 = 500;

/// Per-operation timeout (0 disables)
pub const OP_TIMEOUT_MS: u64 = 15_000;

// ===== CIRCUIT BREAKER =====

/// Sliding window for consecutive fatal errors
pub const BREAKER_WINDOW_MS: u64 = 60_000;

/// Consecutive fatal errors (exclusive) before the breaker stops
pub const BREAKER_TRIP_THRESHOLD: u32 = 3;

/// Consecutive fatal errors (exclusive) before emergency recovery
pub const BREAKER_SEVERE_THRESHOLD: u32 = 10;

/// Message fragments identifying backend-internal assertion failures
pub const FATAL_ERROR_PATTERNS: &[&str] = &[
    "INTERNAL ASSERTION FAILED",
    "Unexpected state",
];

// ===== RECONNECTION =====

/// Attempts completing within this window suppress new triggers
pub const RECONNECT_MIN_INTERVAL_MS: u64 = 3_000;

pub const RECONNECT_BACKOFF_BASE_MS: u64 = 5_000;

pub const RECONNECT_BACKOFF_MAX_MS: u64 = 60_000;

/// Period of the background staleness check
pub const PERIODIC_INTERVAL_MS: u64 = 120_000;

/// Periodic checks are skipped if any attempt completed this recently
pub const PERIODIC_MIN_GAP_MS: u64 = 30_000;

/// Quick reconnections allowed per cooldown window
pub const QUICK_RECONNECT_LIMIT: u32 = 3;

pub const QUICK_RECONNECT_COOLDOWN_MS: u64 = 300_000;

/// Reconnection attempt records kept for diagnostics
pub const ATTEMPT_HISTORY: usize = 20;

// ===== OUTBOX / SUBSCRIPTIONS =====

pub const OUTBOX_STORAGE_KEY: &str = "tether.outbox";

pub const RATE_LIMIT_STORAGE_KEY: &str = "tether.reconnect.quick";

/// Delivery attempts before an item is dead-lettered (0 = unlimited)
pub const OUTBOX_MAX_ATTEMPTS: u32 = 0;

/// Debounce before creating a new live listener
pub const SUBSCRIBE_DEBOUNCE_MS: u64 = 100;
