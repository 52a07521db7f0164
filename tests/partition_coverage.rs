use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rendershard::merge::merge_outputs;
use rendershard::partition::{self, PartitionOutput, PartitionPayload, is_exact_cover};
use rendershard::{DependencyGraph, Node, PartitionStrategy, TreePartitioner, synthetic_tree};
use std::collections::HashSet;

const STRATEGIES: [PartitionStrategy; 6] = [
    PartitionStrategy::Depth { level: 1 },
    PartitionStrategy::Depth { level: 3 },
    PartitionStrategy::Size { threshold: 120 },
    PartitionStrategy::Hybrid {
        max_depth: 3,
        min_size: 50,
        max_size: 1000,
    },
    PartitionStrategy::Hybrid {
        max_depth: 2,
        min_size: 10,
        max_size: 150,
    },
    PartitionStrategy::WorkBalanced { target_work: 300 },
];

fn random_tree(rng: &mut StdRng, depth: u32) -> Node {
    if depth == 0 || rng.gen_bool(0.15) {
        return match rng.gen_range(0..3) {
            0 => Node::text(format!("t{}", rng.r#gen::<u16>())),
            1 => Node::element("img").with_prop("src", "x.png"),
            _ => Node::component("Icon"),
        };
    }
    let children = rng.gen_range(1..6);
    let mut node = match rng.gen_range(0..4) {
        0 => Node::component("Card"),
        1 => Node::fragment(Vec::new()),
        _ => Node::element("div").with_prop("class", format!("c{depth}")),
    };
    for _ in 0..children {
        node = node.with_child(random_tree(rng, depth - 1));
    }
    node
}

fn identity_outputs(tree: &Node, partitions: &[rendershard::Partition]) -> Vec<PartitionOutput> {
    partitions
        .iter()
        .map(|p| {
            let payload = PartitionPayload::extract(tree, partitions, p.id).unwrap();
            let bytes = payload.to_bytes().unwrap();
            let decoded = PartitionPayload::from_bytes(&bytes).unwrap();
            PartitionOutput {
                partition_id: decoded.partition_id,
                roots: decoded.roots,
            }
        })
        .collect()
}

#[test]
fn test_every_strategy_covers_synthetic_tree() {
    let tree = synthetic_tree(5, 4);
    assert!(tree.node_count() >= 500);

    for strategy in STRATEGIES {
        let partitions = TreePartitioner::new(strategy)
            .with_target_partitions(4)
            .partition(&tree)
            .unwrap();
        assert!(is_exact_cover(&tree, &partitions), "{strategy:?}");

        let work: u64 = partitions.iter().map(|p| p.estimated_work).sum();
        assert_eq!(work, tree.estimated_work(), "{strategy:?}");

        let merged = merge_outputs(identity_outputs(&tree, &partitions)).unwrap();
        assert_eq!(merged, tree, "{strategy:?}");
    }
}

#[test]
fn test_random_trees_cover_and_merge() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for round in 0..40 {
        let tree = random_tree(&mut rng, 6);
        let target = rng.gen_range(1..9);
        for strategy in STRATEGIES {
            let partitions = TreePartitioner::new(strategy)
                .with_target_partitions(target)
                .partition(&tree)
                .unwrap();
            assert!(is_exact_cover(&tree, &partitions), "round {round} {strategy:?}");

            let ids: HashSet<_> = partitions.iter().map(|p| p.id).collect();
            assert_eq!(ids.len(), partitions.len());

            let merged = merge_outputs(identity_outputs(&tree, &partitions)).unwrap();
            assert_eq!(merged, tree, "round {round} {strategy:?}");
        }
    }
}

#[test]
fn test_dependency_waves_reach_every_partition() {
    let tree = synthetic_tree(4, 4);
    let partitions = TreePartitioner::new(PartitionStrategy::Depth { level: 2 })
        .with_target_partitions(4)
        .partition(&tree)
        .unwrap();
    let graph = DependencyGraph::new(&partitions);
    assert!(graph.cycles().is_empty());
    assert_eq!(graph.topological_order().len(), partitions.len());

    let mut completed = HashSet::new();
    let mut waves = 0;
    while completed.len() < partitions.len() {
        let ready = graph.ready_partitions(&completed);
        assert!(!ready.is_empty(), "stuck after {waves} waves");
        completed.extend(ready);
        waves += 1;
    }
    assert!(waves >= 1);
}

#[test]
fn test_quality_of_balanced_split() {
    let tree = synthetic_tree(5, 4);
    let partitions = TreePartitioner::new(PartitionStrategy::WorkBalanced { target_work: 450 })
        .with_target_partitions(8)
        .partition(&tree)
        .unwrap();
    let quality = partition::analyze(&partitions);
    assert_eq!(quality.total_work, tree.estimated_work());
    assert!(quality.max_work >= quality.min_work);
    assert!(quality.balance_factor >= 1.0);
}
