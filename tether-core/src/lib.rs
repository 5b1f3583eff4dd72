//! Tether Core - connection resilience for real-time backend clients
//!
//! Keeps a client's session to a managed real-time backend healthy across
//! network drops, app backgrounding and vendor-internal client errors,
//! without losing offline writes or opening duplicate live queries.
//!
//! ## Architecture
//! - **Capability interface** for the backend SDK, real or mock, chosen at
//!   construction
//! - **Explicit services** with injected clock, store and backend handle;
//!   no process-wide globals
//! - **Cancellable timers** owned by the service that armed them
//! - **Typed error channel**: every backend result is classified at the
//!   scheduler and outbox boundary
//!
//! ## Core Modules
//! - `core`: value types, errors, clock
//! - `backend`: client capability traits, singleton handle, local store
//! - `resilience`: connectivity, gate, scheduler, breaker, reconnection,
//!   outbox, subscriptions
//! - `engine`: `ResilienceEngine`, the wired-up service
//! - `monitoring`: prometheus metrics and diagnostics snapshot
//! - `config`: serde configuration and profiles
//! - `testing`: mock backend and test builders

pub mod backend;
pub mod config;
pub mod core;
pub mod engine;
pub mod monitoring;
pub mod resilience;
pub mod testing;
pub mod utils;

// Re-export core types
pub use crate::core::{
    priority, AppState, BackendError, Clock, ConnectivityState, EngineError, EngineResult,
    InitState, Priority, ReconnectTrigger, ReconnectionAttemptRecord, SystemClock,
};

pub use backend::{BackendClient, BackendFactory, KeyValueStore, Subscription};
pub use config::EngineConfig;
pub use engine::{EngineDeps, ResilienceEngine};
pub use monitoring::{DiagnosticsSnapshot, MetricsRegistry};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::backend::{
        BackendClient, BackendFactory, FileStore, KeyValueStore, ListenerErrorSink, ListenerSink,
        MemoryStore, Subscription,
    };
    pub use crate::config::{ConfigProfile, EngineConfig, ProfileName};
    pub use crate::core::{
        priority, AppState, BackendError, ConnectivityState, EngineError, EngineResult,
        InitState, Priority, ReconnectTrigger,
    };
    pub use crate::engine::{EngineDeps, ResilienceEngine};
    pub use crate::resilience::{ListenerHandle, OutboxItem, ReconnectOutcome};
}
