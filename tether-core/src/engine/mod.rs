//! Resilience engine
//!
//! Wires the resilience services together and exposes the
//! application-facing surface:
//! - `service`: `ResilienceEngine`, construction and lifecycle
//! - `recovery`: emergency recovery routine installed on the breaker

mod recovery;
pub mod service;

pub use service::{EngineDeps, ResilienceEngine};
