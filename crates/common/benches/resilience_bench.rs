//! Resilience benchmarks
//!
//! Covers backoff computation, breaker guard/record round-trips on the
//! closed and open paths, and the happy path of the resilient client.
//!
//! Run with: `cargo bench --bench resilience_bench -p bulwark-common`

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bulwark_common::resilience::{
    delay_for, CallOutcome, CircuitBreakerConfig, CircuitBreakerRegistry, FixedJitter, MockClock,
    NoopListener, ResilienceSettings, ResilientClient, RetryPolicy, SeededJitter,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Builder as RuntimeBuilder;

// ============================================================================
// Backoff Benchmarks
// ============================================================================

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff_delay_for");

    let plain = RetryPolicy::builder().max_attempts(20).no_jitter().build().unwrap();
    let jittered = RetryPolicy::builder().max_attempts(20).jitter(true).build().unwrap();
    let fixed = FixedJitter(0.5);
    let seeded = SeededJitter::new(42);

    for attempt in [1_u32, 5, 20] {
        group.bench_with_input(BenchmarkId::new("no_jitter", attempt), &attempt, |b, &attempt| {
            b.iter(|| delay_for(black_box(attempt), &plain, &fixed));
        });
        group.bench_with_input(BenchmarkId::new("seeded_jitter", attempt), &attempt, |b, &attempt| {
            b.iter(|| delay_for(black_box(attempt), &jittered, &seeded));
        });
    }

    group.finish();
}

// ============================================================================
// Circuit Breaker Registry Benchmarks
// ============================================================================

fn registry(threshold: u32) -> CircuitBreakerRegistry<MockClock> {
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(threshold)
        .cooldown(Duration::from_secs(60))
        .build()
        .expect("valid circuit breaker config for benchmarks");
    CircuitBreakerRegistry::with_clock(config, MockClock::new())
        .expect("registry should build with benchmark configuration")
        .with_listener(Arc::new(NoopListener))
}

fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker_registry");

    group.bench_function("guard_record_success", |b| {
        let registry = registry(5);
        b.iter(|| {
            let permit = registry.guard(black_box("billing")).expect("closed circuit admits");
            registry.record_outcome(permit, CallOutcome::Success);
        });
    });

    group.bench_function("open_rejection", |b| {
        let registry = registry(1);
        let permit = registry.guard("billing").expect("closed circuit admits");
        registry.record_outcome(permit, CallOutcome::Failure);

        b.iter(|| black_box(registry.guard(black_box("billing")).is_err()));
    });

    group.bench_function("guard_across_many_keys", |b| {
        let registry = registry(5);
        let keys: Vec<String> = (0..64).map(|i| format!("service-{i}")).collect();
        let mut index = 0;
        b.iter(|| {
            let key = &keys[index % keys.len()];
            index += 1;
            let permit = registry.guard(key).expect("closed circuit admits");
            registry.record_outcome(permit, CallOutcome::Success);
        });
    });

    group.bench_function("get_status", |b| {
        let registry = registry(5);
        let permit = registry.guard("billing").expect("closed circuit admits");
        registry.record_outcome(permit, CallOutcome::Failure);
        b.iter(|| black_box(registry.get_status(black_box("billing"))));
    });

    group.finish();
}

// ============================================================================
// Resilient Client Benchmarks
// ============================================================================

fn bench_client(c: &mut Criterion) {
    let runtime = RuntimeBuilder::new_current_thread()
        .enable_time()
        .build()
        .expect("tokio runtime for benchmarks");
    let client = ResilientClient::builder()
        .settings(ResilienceSettings::default())
        .listener(Arc::new(NoopListener))
        .build()
        .expect("default settings are valid");

    let mut group = c.benchmark_group("resilient_client");

    group.bench_function("execute_success", |b| {
        b.to_async(&runtime).iter(|| async {
            let value = client
                .execute("billing", |ctx| async move { Ok::<_, io::Error>(ctx.attempt) })
                .await
                .expect("happy path succeeds");
            black_box(value)
        });
    });

    group.finish();
}

criterion_group!(resilience_benches, bench_backoff, bench_registry, bench_client);
criterion_main!(resilience_benches);
