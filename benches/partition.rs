//! Partitioning benchmark using criterion.
//!
//! Cost of each strategy on synthetic trees, plus payload extraction and
//! merge for a full round trip without workers.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rendershard::merge::merge_outputs;
use rendershard::partition::{PartitionOutput, PartitionPayload};
use rendershard::{PartitionStrategy, TreePartitioner, synthetic_tree};

fn bench_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition");

    for depth in [4u32, 6] {
        let tree = synthetic_tree(depth, 4);
        let total = tree.estimated_work();
        group.throughput(Throughput::Elements(tree.node_count() as u64));

        for strategy in [
            PartitionStrategy::Depth { level: 2 },
            PartitionStrategy::Size { threshold: total / 16 },
            PartitionStrategy::default(),
            PartitionStrategy::WorkBalanced { target_work: total / 8 },
        ] {
            let partitioner = TreePartitioner::new(strategy).with_target_partitions(8);
            group.bench_function(BenchmarkId::new(strategy.name(), depth), |b| {
                b.iter(|| std::hint::black_box(partitioner.partition(&tree).unwrap()));
            });
        }
    }
    group.finish();
}

fn bench_extract_and_merge(c: &mut Criterion) {
    let tree = synthetic_tree(6, 4);
    let partitions = TreePartitioner::new(PartitionStrategy::default())
        .with_target_partitions(8)
        .partition(&tree)
        .unwrap();

    c.bench_function("extract_merge", |b| {
        b.iter(|| {
            let outputs: Vec<_> = partitions
                .iter()
                .map(|p| {
                    let payload = PartitionPayload::extract(&tree, &partitions, p.id).unwrap();
                    PartitionOutput {
                        partition_id: payload.partition_id,
                        roots: payload.roots,
                    }
                })
                .collect();
            std::hint::black_box(merge_outputs(outputs).unwrap())
        });
    });
}

criterion_group!(benches, bench_strategies, bench_extract_and_merge);
criterion_main!(benches);
