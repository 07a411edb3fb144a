//! Throughput benchmarks for the Herald hub.
//!
//! These benchmarks measure registry and dispatch cost without any I/O.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use herald_bench::{populated_registry, sample_notification, user_ids};
use herald_core::{Connection, Dispatcher, OverflowPolicy, Registry};
use herald_protocol::UserId;
use herald_transport::ConnectionId;
use std::sync::Arc;

/// Benchmark registry add/remove churn and lookups.
fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    group.bench_function("add_remove", |b| {
        let registry = Registry::new();
        let users = user_ids(1000);
        let mut i = 0usize;
        b.iter(|| {
            let user_id = &users[i % users.len()];
            let id = ConnectionId::new(format!("conn-{i}"));
            i += 1;
            let conn = Arc::new(Connection::new(id.clone(), user_id.clone(), 16));
            registry.add(user_id.clone(), conn);
            registry.remove(black_box(user_id), &id)
        });
    });

    let registry = populated_registry(10_000, 2, 16);
    let users = user_ids(10_000);

    group.bench_function("lookup", |b| {
        let mut i = 0usize;
        b.iter(|| {
            let user_id = &users[i % users.len()];
            i += 1;
            registry.lookup(black_box(user_id))
        });
    });

    group.bench_function("lookup_miss", |b| {
        let missing = UserId::new("nobody");
        b.iter(|| registry.lookup(black_box(&missing)));
    });

    group.bench_function("snapshot", |b| b.iter(|| registry.snapshot()));

    group.finish();
}

/// Benchmark targeted delivery to a user with several devices.
fn bench_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("route_to_user");

    for devices in [1, 4, 16] {
        group.throughput(Throughput::Elements(devices as u64));
        group.bench_with_input(BenchmarkId::from_parameter(devices), &devices, |b, &devices| {
            // Queues stay full, so this measures the steady-state eviction path.
            let registry = populated_registry(100, devices, 64);
            let dispatcher = Dispatcher::new(registry, OverflowPolicy::DropOldest);
            let user_id = UserId::new("user-7");
            let notification = sample_notification("user-7");

            b.iter(|| dispatcher.route_to_user(&user_id, black_box(Arc::clone(&notification))));
        });
    }

    group.finish();
}

/// Benchmark broadcast fan-out.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for users in [10, 100, 1000, 10_000] {
        group.throughput(Throughput::Elements(users as u64));
        group.bench_with_input(BenchmarkId::from_parameter(users), &users, |b, &users| {
            let registry = populated_registry(users, 1, 64);
            let dispatcher = Dispatcher::new(registry, OverflowPolicy::DropNewest);
            let notification = sample_notification("everyone");

            b.iter(|| dispatcher.broadcast(black_box(Arc::clone(&notification))));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_registry, bench_route, bench_fanout);
criterion_main!(benches);
