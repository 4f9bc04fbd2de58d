//! Cluster benchmarks for Relay.
//!
//! These benchmarks run several nodes on an in-memory hub, so they measure
//! the replication path without network I/O.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tenvis_relay_bench::{cluster, populate};
use tokio::runtime::Runtime;

/// Benchmark a cluster-wide member count query.
fn bench_member_count_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("member_count_query");
    let runtime = Runtime::new().unwrap();

    for nodes in [2, 4, 8].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(nodes), nodes, |b, &nodes| {
            let managers = runtime.block_on(cluster(nodes, "bench"));
            let _inboxes: Vec<_> = managers
                .iter()
                .map(|manager| populate(manager, "bench", "presence-room", 10))
                .collect();
            let issuer = &managers[0];

            b.iter(|| runtime.block_on(issuer.member_counts("bench", Some("presence-"))));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_member_count_query);
criterion_main!(benches);
