//! Connection resilience services
//!
//! Leaves first:
//! - `connectivity`: normalized network/lifecycle signal stream
//! - `subscriptions`: deduplicated live-query listeners
//! - `init_gate`: backend readiness state machine
//! - `scheduler`: priority queue with warm-up concurrency limits
//! - `circuit_breaker`: fatal-error counting and emergency recovery
//! - `reconnect`: reconnection orchestration with backoff and rate limiting
//! - `outbox`: durable offline writes
//!
//! Supporting pieces: `backoff`, `classifier`, `rate_limiter`, `timer`,
//! `panic`.

pub mod backoff;
pub mod circuit_breaker;
pub mod classifier;
pub mod connectivity;
pub mod init_gate;
pub mod outbox;
pub mod panic;
pub mod rate_limiter;
pub mod reconnect;
pub mod scheduler;
pub mod subscriptions;
pub mod timer;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{BreakerState, BreakerVerdict, ErrorCircuitBreaker, RecoveryAction};
pub use classifier::{ErrorClass, ErrorClassifier};
pub use connectivity::{ConnectivityCallback, ConnectivityMonitor, Unsubscribe};
pub use init_gate::InitializationGate;
pub use outbox::{DrainReport, OfflineOutbox, OutboxItem};
pub use panic::install_panic_hook;
pub use rate_limiter::{QuickReconnectLimiter, QuickReconnectWindow};
pub use reconnect::{
    ControllerState, ReconnectDeps, ReconnectOutcome, ReconnectionController, ReconnectionStats,
    SkipReason,
};
pub use scheduler::OperationScheduler;
pub use subscriptions::{ListenerHandle, ResubscribeReport, SubscriptionRegistry};
pub use timer::{TimerHandle, TimerSlot};
