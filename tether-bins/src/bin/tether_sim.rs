//! Resilience simulator against the mock backend
//!
//! Runs the full engine with a scripted `MockBackend` so the reconnection,
//! outbox and circuit-breaker paths can be watched in the logs:
//!
//! - `offline-send`: queue writes while offline, deliver them on reconnect
//! - `error-storm`: feed fatal backend errors until emergency recovery runs
//! - `flapping`: toggle connectivity and watch throttling and rate limiting

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_bins::common::{init_logging, install_shutdown_handler, print_diagnostics, CommonArgs};
use tether_core::backend::{FileStore, KeyValueStore, ListenerSink, MemoryStore};
use tether_core::config::BackendMode;
use tether_core::resilience::install_panic_hook;
use tether_core::testing::MockBackendFactory;
use tether_core::{BackendError, EngineDeps, ResilienceEngine};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    OfflineSend,
    ErrorStorm,
    Flapping,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive the resilience engine through failure scenarios")]
struct SimArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(short, long, value_enum, default_value = "offline-send")]
    scenario: Scenario,

    /// Writes to queue (offline-send) or errors to raise (error-storm)
    #[arg(short = 'n', long, default_value = "5")]
    count: usize,

    /// Connectivity flips (flapping)
    #[arg(long, default_value = "10")]
    flips: usize,

    /// Pause between scripted steps
    #[arg(long, default_value = "200")]
    step_ms: u64,
}

struct Sim {
    engine: ResilienceEngine,
    factory: MockBackendFactory,
    running: Arc<AtomicBool>,
    step: Duration,
}

impl Sim {
    fn go_offline(&self) {
        if let Some(client) = self.factory.current() {
            client.set_offline(true);
        }
        self.engine.on_network_change(false, Some(false));
    }

    fn go_online(&self) {
        if let Some(client) = self.factory.current() {
            client.set_offline(false);
        }
        self.engine.on_network_change(true, Some(true));
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sleep one step; false once shutdown was requested
    async fn pause(&self) -> bool {
        tokio::time::sleep(self.step).await;
        self.running()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = SimArgs::parse();
    let mut config = args.common.load_config()?;
    init_logging(&args.common, &config)?;

    // The simulator scripts faults, so it always drives its own mock factory
    config.backend.mode = BackendMode::Live;

    info!("=== Tether: resilience simulator ({:?}) ===", args.scenario);

    let store: Arc<dyn KeyValueStore> = match &args.common.state_dir {
        Some(dir) => {
            info!("Persisting outbox under {}", dir.display());
            Arc::new(FileStore::open(dir)?)
        }
        None => Arc::new(MemoryStore::new()),
    };

    let factory = MockBackendFactory::default();
    let deps = EngineDeps::new(store).with_live_factory(Arc::new(factory.clone()));
    let engine = ResilienceEngine::new(config, deps)?;
    install_panic_hook(engine.breaker().clone());

    let sim = Sim {
        engine,
        factory,
        running: install_shutdown_handler()?,
        step: Duration::from_millis(args.step_ms),
    };

    sim.engine.start();
    sim.engine.initialize().await?;
    info!("Backend ready");

    let outcome = match args.scenario {
        Scenario::OfflineSend => offline_send(&sim, args.count).await,
        Scenario::ErrorStorm => error_storm(&sim, args.count).await,
        Scenario::Flapping => flapping(&sim, args.flips).await,
    };

    print_diagnostics(&sim.engine.diagnostics())?;
    sim.engine.stop();
    outcome
}

async fn offline_send(sim: &Sim, count: usize) -> Result<()> {
    let sink: ListenerSink = Arc::new(|snapshot| info!("Snapshot: {}", snapshot));
    sim.engine.listen("chats/demo/messages", sink).await?;

    let mut deliveries = sim.engine.subscribe_deliveries();

    sim.go_offline();
    info!("Offline, queueing {} writes", count);
    for i in 0..count {
        let item = sim.engine.queue_for_offline_send(
            "chats/demo/messages",
            json!({ "seq": i, "text": format!("message {}", i) }),
            Some(format!("demo-{}", i)),
        )?;
        info!(id = %item.id, queued = item.is_queued, "Queued write {}", i);
        if !sim.pause().await {
            return Ok(());
        }
    }

    sim.go_online();
    info!("Back online, waiting for the outbox to drain");

    let mut delivered = 0;
    while delivered < count && sim.running() {
        match tokio::time::timeout(Duration::from_secs(30), deliveries.recv()).await {
            Ok(Ok(item)) => {
                delivered += 1;
                info!(id = %item.id, "Delivered ({}/{})", delivered, count);
            }
            Ok(Err(e)) => bail!("delivery stream closed: {}", e),
            Err(_) => bail!("only {} of {} writes delivered", delivered, count),
        }
    }

    sim.factory
        .server()
        .emit("chats/demo/messages", json!({ "delivered": delivered }));
    Ok(())
}

async fn error_storm(sim: &Sim, count: usize) -> Result<()> {
    let fatal = BackendError::internal("internal", "INTERNAL ASSERTION FAILED: Unexpected state");
    let generation = sim.engine.diagnostics().client_generation;

    for i in 0..count {
        let verdict = sim.engine.report_error(&fatal);
        info!(
            "Fatal error {}: {:?} (breaker {})",
            i + 1,
            verdict,
            sim.engine.breaker().state().as_str()
        );
        if !sim.pause().await {
            return Ok(());
        }
    }

    while sim.engine.breaker().is_recovering() && sim.pause().await {}

    let after = sim.engine.diagnostics().client_generation;
    if after > generation {
        info!("Client rebuilt: generation {} -> {}", generation, after);
    } else {
        warn!("No emergency recovery ran; raise --count above the severe threshold");
    }
    Ok(())
}

async fn flapping(sim: &Sim, flips: usize) -> Result<()> {
    for i in 0..flips {
        if i % 2 == 0 {
            sim.go_offline();
        } else {
            sim.go_online();
        }
        if !sim.pause().await {
            return Ok(());
        }
    }
    sim.go_online();

    // Let any scheduled backoff retry fire
    tokio::time::sleep(sim.step * 4).await;

    let stats = sim.engine.controller().stats();
    info!(
        attempts = stats.attempts,
        skipped = stats.skipped,
        quick_used = stats.quick_reconnects_used,
        "Flapping finished"
    );
    for record in sim.engine.controller().history() {
        info!("  {:?} success={}", record.reason, record.success);
    }
    Ok(())
}
