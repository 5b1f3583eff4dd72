//! Benchmark: Error Circuit Breaker
//!
//! Every backend result that goes through the scheduler or the outbox is
//! classified and fed to the breaker, so these paths sit on the hot path of
//! each operation.
//!
//! What's Measured:
//! - `is_call_permitted()` in the closed state
//! - `record_success()` with an empty window
//! - `record_error()` for transport errors (classified and ignored)
//! - `record_error()` for fatal errors (counted, window reset between runs)
//! - Classifier pattern matching on long messages

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tether_core::config::BreakerConfig;
use tether_core::resilience::ErrorCircuitBreaker;
use tether_core::{BackendError, MetricsRegistry};

fn breaker() -> ErrorCircuitBreaker {
    let metrics = MetricsRegistry::new().expect("metrics registry");
    ErrorCircuitBreaker::new(BreakerConfig::default(), metrics)
}

fn bench_permitted_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");
    let breaker = breaker();

    group.bench_function("is_call_permitted", |b| {
        b.iter(|| black_box(breaker.is_call_permitted()))
    });

    group.bench_function("record_success", |b| {
        b.iter(|| breaker.record_success())
    });

    group.finish();
}

fn bench_record_error(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker_errors");
    let breaker = breaker();
    let transport = BackendError::Offline;
    let fatal = BackendError::internal("internal", "INTERNAL ASSERTION FAILED: Unexpected state");

    group.bench_function("transport_ignored", |b| {
        b.iter(|| black_box(breaker.record_error(black_box(&transport))))
    });

    // Counted once, then a success clears the window so it never trips
    group.bench_function("fatal_counted", |b| {
        b.iter(|| {
            let verdict = breaker.record_error(black_box(&fatal));
            breaker.record_success();
            black_box(verdict)
        })
    });

    group.finish();
}

fn bench_classifier(c: &mut Criterion) {
    let mut group = c.benchmark_group("error_classifier");
    let breaker = breaker();
    let classifier = breaker.classifier();

    let long_message = format!("{} INTERNAL ASSERTION FAILED", "x".repeat(512));
    let fatal = BackendError::internal("internal", long_message);
    let benign = BackendError::internal("aborted", "x".repeat(512));

    group.bench_function("fatal_long_message", |b| {
        b.iter(|| black_box(classifier.classify(black_box(&fatal))))
    });
    group.bench_function("benign_long_message", |b| {
        b.iter(|| black_box(classifier.classify(black_box(&benign))))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_permitted_check,
    bench_record_error,
    bench_classifier
);
criterion_main!(benches);
