//! Emergency recovery routine
//!
//! Installed on the circuit breaker and run when consecutive fatal errors
//! pass the severe threshold. Executing operations are aborted and the
//! client is rebuilt; listeners then move onto the new client and the gate
//! runs initialization again.

use crate::backend::BackendHandle;
use crate::monitoring::MetricsRegistry;
use crate::resilience::{
    InitializationGate, OperationScheduler, RecoveryAction, SubscriptionRegistry,
};
use std::sync::Arc;
use tracing::{error, info, warn};

pub(crate) struct RecoveryTargets {
    pub backend: BackendHandle,
    pub scheduler: OperationScheduler,
    pub gate: InitializationGate,
    pub registry: Arc<SubscriptionRegistry>,
    pub metrics: MetricsRegistry,
}

pub(crate) fn emergency_recovery(targets: RecoveryTargets) -> RecoveryAction {
    let targets = Arc::new(targets);
    Arc::new(move || {
        let targets = Arc::clone(&targets);
        Box::pin(async move { run(&targets).await })
    })
}

async fn run(targets: &RecoveryTargets) {
    warn!("Emergency recovery: aborting in-flight operations and rebuilding backend client");

    let aborted = targets.scheduler.abort_in_flight();

    if let Err(e) = targets.backend.emergency_reset().await {
        error!("Emergency client reset failed: {}", e);
        return;
    }
    targets.metrics.system().client_resets_total.inc();

    let listeners = targets.registry.resubscribe_all().await;

    match targets.gate.reset() {
        Ok(()) => {
            if let Err(e) = targets.gate.wait_until_ready().await {
                error!("Backend did not come back after emergency recovery: {}", e);
                return;
            }
        }
        // Still initializing from an earlier run; that run uses the new client
        Err(e) => warn!("Gate not reset during recovery: {}", e),
    }

    info!(
        aborted,
        listeners_restored = listeners.restored,
        listeners_dropped = listeners.failed.len(),
        generation = targets.backend.generation(),
        "Emergency recovery complete"
    );
}
