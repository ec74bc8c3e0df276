//! Benchmarks for the placement algorithm and key routing.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shardmesh::cluster::{DistributionMap, DistributionSnapshot, PartitionRouter, StableHashRouter};
use shardmesh::types::NodeId;

fn empty_cluster(node_count: u64, distributed_size: usize) -> DistributionMap {
    let mut map = DistributionMap::new(distributed_size);
    for id in 1..=node_count {
        map.insert(DistributionSnapshot::new(NodeId::new(id), distributed_size))
            .unwrap();
    }
    map
}

fn bench_rebalance(c: &mut Criterion) {
    let mut group = c.benchmark_group("rebalance");
    for (nodes, partitions) in [(4u64, 64usize), (16, 256), (64, 1024)] {
        let map = empty_cluster(nodes, partitions);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{nodes}n_{partitions}p")),
            &map,
            |b, map| b.iter(|| black_box(map.rebalance(3))),
        );
    }
    group.finish();
}

fn bench_routing(c: &mut Criterion) {
    let router = StableHashRouter;
    let keys: Vec<Vec<u8>> = (0u32..1024).map(|i| i.to_be_bytes().to_vec()).collect();
    c.bench_function("route_1024_keys", |b| {
        b.iter(|| {
            for key in &keys {
                black_box(router.select_partition(key, 256));
            }
        })
    });
}

fn bench_snapshot_codec(c: &mut Criterion) {
    let snapshot = DistributionSnapshot::from_roles(
        NodeId::new(7),
        (0..1024).map(|p| p % 3 == 0).collect(),
    );
    let encoded = snapshot.encode();
    c.bench_function("snapshot_encode_1024", |b| {
        b.iter(|| black_box(snapshot.encode()))
    });
    c.bench_function("snapshot_decode_1024", |b| {
        b.iter(|| black_box(DistributionSnapshot::decode(&encoded).unwrap()))
    });
}

criterion_group!(benches, bench_rebalance, bench_routing, bench_snapshot_codec);
criterion_main!(benches);
