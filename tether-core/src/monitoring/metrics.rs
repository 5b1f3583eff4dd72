//! Prometheus metrics for the resilience engine
//!
//! Provides metric families for:
//! - Reconnection attempts and outcomes
//! - Circuit breaker trips and emergency recoveries
//! - Scheduler queue depth, concurrency and retries
//! - Outbox delivery and dead letters
//! - Backend readiness and live listeners

use anyhow::{Context, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use tracing::debug;

/// Central registry for all resilience metrics
///
/// Each engine owns its own `Registry`, so isolated engines (tests,
/// simulations) never collide on metric names.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    reconnect: Arc<ReconnectMetrics>,
    breaker: Arc<BreakerMetrics>,
    scheduler: Arc<SchedulerMetrics>,
    outbox: Arc<OutboxMetrics>,
    system: Arc<SystemMetrics>,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metric families
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let reconnect = Arc::new(ReconnectMetrics::new(&registry)?);
        let breaker = Arc::new(BreakerMetrics::new(&registry)?);
        let scheduler = Arc::new(SchedulerMetrics::new(&registry)?);
        let outbox = Arc::new(OutboxMetrics::new(&registry)?);
        let system = Arc::new(SystemMetrics::new(&registry)?);

        debug!("Resilience metrics registry initialized");

        Ok(Self {
            registry,
            reconnect,
            breaker,
            scheduler,
            outbox,
            system,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn reconnect(&self) -> &ReconnectMetrics {
        &self.reconnect
    }

    pub fn breaker(&self) -> &BreakerMetrics {
        &self.breaker
    }

    pub fn scheduler(&self) -> &SchedulerMetrics {
        &self.scheduler
    }

    pub fn outbox(&self) -> &OutboxMetrics {
        &self.outbox
    }

    pub fn system(&self) -> &SystemMetrics {
        &self.system
    }

    /// Render every family in the Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("Failed to encode metrics")?;

        String::from_utf8(buffer).context("Invalid UTF-8 in metrics")
    }
}

/// Reconnection controller metrics
pub struct ReconnectMetrics {
    /// Attempts by trigger and result
    pub attempts_total: IntCounterVec,
    /// Triggers that did not start an attempt, by reason
    pub skipped_total: IntCounterVec,
    /// Consecutive failed attempts
    pub consecutive_failures: IntGauge,
}

impl ReconnectMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let attempts_total = IntCounterVec::new(
            Opts::new("reconnect_attempts_total", "Reconnection attempts")
                .namespace("tether"),
            &["trigger", "result"],
        )?;
        registry.register(Box::new(attempts_total.clone()))?;

        let skipped_total = IntCounterVec::new(
            Opts::new(
                "reconnect_skipped_total",
                "Reconnection triggers that were throttled or skipped",
            )
            .namespace("tether"),
            &["reason"],
        )?;
        registry.register(Box::new(skipped_total.clone()))?;

        let consecutive_failures = IntGauge::new(
            "tether_reconnect_consecutive_failures",
            "Consecutive failed reconnection attempts",
        )?;
        registry.register(Box::new(consecutive_failures.clone()))?;

        Ok(Self {
            attempts_total,
            skipped_total,
            consecutive_failures,
        })
    }
}

/// Error circuit breaker metrics
pub struct BreakerMetrics {
    /// Backend errors seen by the classifier, by class
    pub errors_total: IntCounterVec,
    pub trips_total: IntCounter,
    pub recoveries_total: IntCounter,
    /// 1 while stopped
    pub stopped: IntGauge,
}

impl BreakerMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let errors_total = IntCounterVec::new(
            Opts::new("breaker_errors_total", "Classified backend errors")
                .namespace("tether"),
            &["class"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let trips_total = IntCounter::new("tether_breaker_trips_total", "Circuit breaker trips")?;
        registry.register(Box::new(trips_total.clone()))?;

        let recoveries_total = IntCounter::new(
            "tether_breaker_recoveries_total",
            "Emergency recoveries started by the circuit breaker",
        )?;
        registry.register(Box::new(recoveries_total.clone()))?;

        let stopped = IntGauge::new(
            "tether_breaker_stopped",
            "Circuit breaker state (1 = stopped, 0 = closed)",
        )?;
        registry.register(Box::new(stopped.clone()))?;

        Ok(Self {
            errors_total,
            trips_total,
            recoveries_total,
            stopped,
        })
    }
}

/// Operation scheduler metrics
pub struct SchedulerMetrics {
    pub queue_depth: IntGauge,
    pub active: IntGauge,
    /// Finished operations by result
    pub completed_total: IntCounterVec,
    pub retries_total: IntCounter,
    /// Time from enqueue to completion (seconds)
    pub latency_seconds: Histogram,
}

impl SchedulerMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let queue_depth = IntGauge::new("tether_scheduler_queue_depth", "Queued operations")?;
        registry.register(Box::new(queue_depth.clone()))?;

        let active = IntGauge::new("tether_scheduler_active", "Operations currently executing")?;
        registry.register(Box::new(active.clone()))?;

        let completed_total = IntCounterVec::new(
            Opts::new("scheduler_completed_total", "Finished operations")
                .namespace("tether"),
            &["result"],
        )?;
        registry.register(Box::new(completed_total.clone()))?;

        let retries_total = IntCounter::new(
            "tether_scheduler_retries_total",
            "Operation retries issued by the scheduler",
        )?;
        registry.register(Box::new(retries_total.clone()))?;

        let latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "tether_scheduler_latency_seconds",
                "Enqueue-to-completion latency in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        registry.register(Box::new(latency_seconds.clone()))?;

        Ok(Self {
            queue_depth,
            active,
            completed_total,
            retries_total,
            latency_seconds,
        })
    }
}

/// Offline outbox metrics
pub struct OutboxMetrics {
    pub depth: IntGauge,
    pub delivered_total: IntCounter,
    pub failed_total: IntCounter,
    pub dead_lettered_total: IntCounter,
}

impl OutboxMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let depth = IntGauge::new("tether_outbox_depth", "Items waiting in the outbox")?;
        registry.register(Box::new(depth.clone()))?;

        let delivered_total =
            IntCounter::new("tether_outbox_delivered_total", "Outbox items delivered")?;
        registry.register(Box::new(delivered_total.clone()))?;

        let failed_total = IntCounter::new(
            "tether_outbox_failed_total",
            "Outbox delivery attempts that failed and were re-queued",
        )?;
        registry.register(Box::new(failed_total.clone()))?;

        let dead_lettered_total = IntCounter::new(
            "tether_outbox_dead_lettered_total",
            "Outbox items moved to the dead-letter list",
        )?;
        registry.register(Box::new(dead_lettered_total.clone()))?;

        Ok(Self {
            depth,
            delivered_total,
            failed_total,
            dead_lettered_total,
        })
    }
}

/// Backend session metrics
pub struct SystemMetrics {
    /// Init state (0 = pending, 1 = initializing, 2 = ready, 3 = error)
    pub init_state: IntGauge,
    /// Backend client reconstructions
    pub client_resets_total: IntCounter,
    /// Live listeners held by the subscription registry
    pub listeners: IntGauge,
    /// Connectivity as last reported (1 = online)
    pub online: IntGauge,
}

impl SystemMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let init_state = IntGauge::new(
            "tether_system_init_state",
            "Backend readiness (0 = pending, 1 = initializing, 2 = ready, 3 = error)",
        )?;
        registry.register(Box::new(init_state.clone()))?;

        let client_resets_total = IntCounter::new(
            "tether_system_client_resets_total",
            "Backend client reconstructions",
        )?;
        registry.register(Box::new(client_resets_total.clone()))?;

        let listeners = IntGauge::new("tether_system_listeners", "Live listeners")?;
        registry.register(Box::new(listeners.clone()))?;

        let online = IntGauge::new(
            "tether_system_online",
            "Connectivity status (1 = online, 0 = offline)",
        )?;
        registry.register(Box::new(online.clone()))?;

        Ok(Self {
            init_state,
            client_resets_total,
            listeners,
            online,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry_creation() {
        let registry = MetricsRegistry::new().unwrap();
        assert!(!registry.registry().gather().is_empty());
    }

    #[test]
    fn test_registries_are_isolated() {
        let a = MetricsRegistry::new().unwrap();
        let b = MetricsRegistry::new().unwrap();

        a.breaker().trips_total.inc();
        assert_eq!(a.breaker().trips_total.get(), 1);
        assert_eq!(b.breaker().trips_total.get(), 0);
    }

    #[test]
    fn test_render_contains_families() {
        let registry = MetricsRegistry::new().unwrap();
        registry
            .reconnect()
            .attempts_total
            .with_label_values(&["manual", "success"])
            .inc();
        registry.outbox().depth.set(3);

        let text = registry.render().unwrap();
        assert!(text.contains("tether_reconnect_attempts_total"));
        assert!(text.contains("tether_outbox_depth 3"));
    }
}
