pub mod constants;
pub mod profiles;
pub mod types;

pub use profiles::{ConfigProfile, ProfileName};
pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

impl EngineConfig {
    /// Load configuration from a JSON file with optional environment overrides
    ///
    /// Recognised overrides: `TETHER_LOG_LEVEL`, `TETHER_LOG_JSON`,
    /// `TETHER_BACKEND_MODE`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_path = path.as_ref();

        let raw = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config {}", config_path.display()))?;

        let mut cfg: EngineConfig =
            serde_json::from_str(&raw).context("Failed to deserialize configuration")?;

        cfg.apply_env_overrides()?;
        cfg.validate()?;

        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var("TETHER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(json) = std::env::var("TETHER_LOG_JSON") {
            self.logging.json = matches!(json.as_str(), "1" | "true" | "yes");
        }
        if let Ok(mode) = std::env::var("TETHER_BACKEND_MODE") {
            self.backend.mode = serde_json::from_value(serde_json::Value::String(mode.clone()))
                .with_context(|| format!("Invalid TETHER_BACKEND_MODE '{}'", mode))?;
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.steady_concurrency == 0 {
            anyhow::bail!("scheduler.steady_concurrency must be at least 1");
        }

        if self.breaker.trip_threshold == 0 {
            anyhow::bail!("breaker.trip_threshold must be positive");
        }

        // Severe must sit strictly above trip or recovery fires on the trip itself
        if self.breaker.severe_threshold <= self.breaker.trip_threshold {
            anyhow::bail!(
                "breaker.severe_threshold ({}) must exceed breaker.trip_threshold ({})",
                self.breaker.severe_threshold,
                self.breaker.trip_threshold
            );
        }

        if self.breaker.window_ms == 0 {
            anyhow::bail!("breaker.window_ms must be positive");
        }

        if self.breaker.fatal_patterns.iter().any(|p| p.is_empty()) {
            anyhow::bail!("breaker.fatal_patterns must not contain empty patterns");
        }

        if self.reconnect.backoff_base_ms == 0 {
            anyhow::bail!("reconnect.backoff_base_ms must be positive");
        }

        if self.reconnect.backoff_max_ms < self.reconnect.backoff_base_ms {
            anyhow::bail!("reconnect.backoff_max_ms cannot be below reconnect.backoff_base_ms");
        }

        if self.reconnect.periodic_interval_ms == 0 {
            anyhow::bail!("reconnect.periodic_interval_ms must be positive");
        }

        if self.init.probe_timeout_ms == 0 {
            anyhow::bail!("init.probe_timeout_ms must be positive");
        }

        if self.outbox.storage_key.is_empty() || self.reconnect.storage_key.is_empty() {
            anyhow::bail!("storage keys must not be empty");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Invalid log level '{}', must be one of: {:?}",
                self.logging.level,
                valid_log_levels
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        assert!(config.validate().is_ok());

        // Severe threshold must be strictly greater than trip threshold
        config.breaker.severe_threshold = config.breaker.trip_threshold;
        assert!(config.validate().is_err());
        config.breaker.severe_threshold = 10;

        config.scheduler.steady_concurrency = 0;
        assert!(config.validate().is_err());
        config.scheduler.steady_concurrency = 5;

        config.reconnect.backoff_max_ms = 1;
        assert!(config.validate().is_err());
        config.reconnect.backoff_max_ms = 60_000;

        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "backend": {{ "mode": "mock" }}, "breaker": {{ "trip_threshold": 2 }} }}"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.backend.mode, BackendMode::Mock);
        assert_eq!(config.breaker.trip_threshold, 2);
        assert_eq!(config.breaker.severe_threshold, constants::BREAKER_SEVERE_THRESHOLD);
        assert_eq!(config.scheduler.steady_concurrency, constants::STEADY_CONCURRENCY);
        assert_eq!(config.breaker.cool_off(), config.breaker.window() * 2);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "breaker": {{ "trip_threshold": 5, "severe_threshold": 4 }} }}"#
        )
        .unwrap();

        assert!(EngineConfig::load(file.path()).is_err());
    }
}
