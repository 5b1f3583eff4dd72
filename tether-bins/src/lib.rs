//! Shared setup for the tether binaries

pub mod common;
