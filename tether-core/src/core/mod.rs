//! Core value types, errors and the wall-clock abstraction
//!
//! - `ConnectivityState`, `AppState`: normalized platform signals
//! - `InitState`: backend readiness lifecycle
//! - `ReconnectTrigger`, `ReconnectionAttemptRecord`: reconnection audit
//! - `BackendError`, `EngineError`, `StoreError`: error taxonomy
//! - `Clock`: injectable wall clock

pub mod clock;
pub mod errors;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{BackendError, EngineError, EngineResult, StoreError};
pub use types::{
    priority, AppState, ConnectivityState, InitState, Priority, ReconnectTrigger,
    ReconnectionAttemptRecord,
};
