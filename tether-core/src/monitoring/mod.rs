//! Monitoring and observability
//!
//! Prometheus metrics for every resilience service and a serialisable
//! diagnostics snapshot for operator tooling.

pub mod diagnostics;
pub mod metrics;

pub use diagnostics::{
    BreakerDiagnostics, DiagnosticsSnapshot, OutboxDiagnostics, SchedulerDiagnostics,
};
pub use metrics::{
    BreakerMetrics, MetricsRegistry, OutboxMetrics, ReconnectMetrics, SchedulerMetrics,
    SystemMetrics,
};
