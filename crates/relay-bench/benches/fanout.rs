//! Local fan-out benchmarks for Relay.
//!
//! These benchmarks measure how fast one node delivers to its own
//! subscribers and tracks presence.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use relay_protocol::PresenceData;
use tenvis_relay_bench::{drain, populate};
use tenvis_relay_core::{ChannelManager, ConnectionHandle, Message};

/// Benchmark publishing to channels of growing size.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for size in [10, 100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let manager = ChannelManager::default();
            let mut inboxes = populate(&manager, "bench", "broadcast", size);

            b.iter(|| {
                let message = Message::new("broadcast", vec![0u8; 64]);
                let delivered = manager.publish("bench", black_box(message), None);
                drain(&mut inboxes);
                delivered
            });
        });
    }

    group.finish();
}

/// Benchmark subscribe and unsubscribe churn.
fn bench_subscriptions(c: &mut Criterion) {
    let mut group = c.benchmark_group("subscriptions");

    group.bench_function("public", |b| {
        let manager = ChannelManager::default();
        let (handle, _inbox) = ConnectionHandle::channel("churn", 16);
        b.iter(|| {
            manager.subscribe("bench", &handle, "chat", None).unwrap();
            manager.unsubscribe("bench", handle.id(), "chat").unwrap();
        });
    });

    group.bench_function("presence_100_members", |b| {
        let manager = ChannelManager::default();
        let mut inboxes = populate(&manager, "bench", "presence-room", 100);
        let (handle, _inbox) = ConnectionHandle::channel("churn", 16);
        b.iter(|| {
            let data = PresenceData {
                user_id: "churner".to_string(),
                user_info: None,
            };
            manager
                .subscribe("bench", &handle, "presence-room", Some(data))
                .unwrap();
            manager.unsubscribe("bench", handle.id(), "presence-room").unwrap();
            drain(&mut inboxes);
        });
    });

    group.finish();
}

/// Benchmark the local member count scan.
fn bench_member_counts(c: &mut Criterion) {
    let mut group = c.benchmark_group("member_counts");

    for channels in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(channels), channels, |b, &channels| {
            let manager = ChannelManager::default();
            let _inboxes: Vec<_> = (0..channels)
                .map(|i| populate(&manager, "bench", &format!("presence-{i}"), 4))
                .collect();

            b.iter(|| manager.local_member_counts("bench", black_box(Some("presence-"))));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fanout, bench_subscriptions, bench_member_counts);
criterion_main!(benches);
