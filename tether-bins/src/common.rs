//! Common utilities for all binaries
//!
//! Shared initialization, CLI parsing, and setup code.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_core::config::{ConfigProfile, EngineConfig, ProfileName};
use tether_core::utils::init_logger;
use tether_core::DiagnosticsSnapshot;
use tracing::{info, warn};

/// Common CLI arguments for all binaries
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// JSON configuration file (overrides --profile)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Built-in profile: development, production or testing
    #[arg(short, long, default_value = "development")]
    pub profile: String,

    /// Log level (defaults to the configured level)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    pub json_logs: bool,

    /// Persist the outbox under this directory instead of in memory
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

impl CommonArgs {
    /// Resolve the engine configuration from a file or a named profile
    pub fn load_config(&self) -> Result<EngineConfig> {
        if let Some(path) = &self.config {
            return EngineConfig::load(path)
                .with_context(|| format!("loading {}", path.display()));
        }
        let name = ProfileName::from_str(&self.profile)
            .with_context(|| format!("unknown profile '{}'", self.profile))?;
        Ok(ConfigProfile::get(name))
    }
}

/// Initialize tracing/logging, CLI flags taking precedence over the config
pub fn init_logging(args: &CommonArgs, config: &EngineConfig) -> Result<()> {
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logger(level, args.json_logs || config.logging.json)
}

/// Flag flipped by Ctrl+C; long-running loops poll it
pub fn install_shutdown_handler() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        warn!("Received Ctrl+C, initiating graceful shutdown...");
        flag.store(false, Ordering::SeqCst);
    })?;
    Ok(running)
}

/// Print final diagnostics
pub fn print_diagnostics(snapshot: &DiagnosticsSnapshot) -> Result<()> {
    info!("=== Final Diagnostics ===");
    info!("{}", snapshot.summary());
    info!(
        "Reconnects: {} attempts, {} succeeded, {} failed, {} skipped",
        snapshot.reconnect.attempts,
        snapshot.reconnect.successes,
        snapshot.reconnect.failures,
        snapshot.reconnect.skipped
    );
    info!(
        "Breaker: {} trips, {} emergency recoveries, client generation {}",
        snapshot.breaker.trips, snapshot.breaker.recoveries, snapshot.client_generation
    );
    println!("{}", snapshot.to_json()?);
    Ok(())
}
