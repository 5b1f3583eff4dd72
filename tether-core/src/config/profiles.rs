//! Configuration profiles for different environments
//!
//! Provides pre-configured profiles for:
//! - Development: mock backend, verbose logging, short warm-up
//! - Production: live backend, default tuning, JSON logs
//! - Testing: mock backend, tiny timers so paused-clock tests stay short

use super::types::*;

/// Configuration profile name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileName {
    Development,
    Production,
    Testing,
}

impl ProfileName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Testing => "testing",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Some(Self::Development),
            "prod" | "production" => Some(Self::Production),
            "test" | "testing" => Some(Self::Testing),
            _ => None,
        }
    }
}

/// Configuration profile with environment-specific defaults
pub struct ConfigProfile;

impl ConfigProfile {
    pub fn get(name: ProfileName) -> EngineConfig {
        match name {
            ProfileName::Development => Self::development(),
            ProfileName::Production => Self::production(),
            ProfileName::Testing => Self::testing(),
        }
    }

    /// Create a development configuration
    ///
    /// - Mock backend
    /// - Debug logging
    /// - Shorter warm-up and backoff so flapping is visible quickly
    pub fn development() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.backend.mode = BackendMode::Mock;
        config.scheduler.warm_up_ms = 2_000;
        config.reconnect.backoff_base_ms = 1_000;
        config.reconnect.backoff_max_ms = 10_000;
        config.reconnect.periodic_interval_ms = 30_000;
        config.logging.level = "debug".to_string();
        config
    }

    /// Create a production configuration
    ///
    /// - Live backend (application must supply the factory)
    /// - Default tuning
    /// - JSON logs
    pub fn production() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.backend.mode = BackendMode::Live;
        config.outbox.max_attempts = 50;
        config.logging.json = true;
        config
    }

    /// Create a testing configuration
    ///
    /// Timers are small but keep the same ordering relationships as the
    /// defaults (cool-off > window, severe > trip, backoff max > base).
    pub fn testing() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.backend.mode = BackendMode::Mock;
        config.init.auto_init_delay_ms = 3_000;
        config.init.probe_timeout_ms = 1_000;
        config.scheduler.warm_up_ms = 1_000;
        config.scheduler.warm_up_spacing_ms = 50;
        config.scheduler.steady_concurrency = 4;
        config.scheduler.retry_base_delay_ms = 10;
        config.scheduler.op_timeout_ms = 5_000;
        config.reconnect.min_interval_ms = 100;
        config.reconnect.backoff_base_ms = 500;
        config.reconnect.backoff_max_ms = 4_000;
        config.reconnect.periodic_interval_ms = 60_000;
        config.reconnect.periodic_min_gap_ms = 10_000;
        config.subscriptions.debounce_ms = 20;
        config.logging.level = "debug".to_string();
        config
    }
}
