//! Testing utilities and mocks
//!
//! - `MockBackend` / `MockBackendFactory` / `MockServer`: programmable
//!   backend used by tests, simulations and the `mock` backend mode
//! - Engine builders and async assertions for integration tests

pub mod helpers;
pub mod mock_backend;

pub use helpers::*;
pub use mock_backend::{MockBackend, MockBackendFactory, MockServer, WriteRecord};
