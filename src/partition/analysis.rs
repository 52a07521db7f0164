//! Partition quality metrics.

use super::Partition;
use serde::Serialize;

/// Balance threshold below which a partitioning counts as well balanced
pub const WELL_BALANCED_FACTOR: f64 = 2.0;

/// Work distribution statistics for a partition set
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionQuality {
    pub total_work: u64,
    pub average_work: f64,
    pub max_work: u64,
    pub min_work: u64,
    pub std_deviation: f64,
    /// `max / min`; infinite when some partition has no work
    pub balance_factor: f64,
    pub is_well_balanced: bool,
    /// `1 / balance_factor`, zero when unbalanced beyond measure
    pub efficiency: f64,
}

/// Analyzes the estimated work of `partitions`.
pub fn analyze(partitions: &[Partition]) -> PartitionQuality {
    let work: Vec<u64> = partitions.iter().map(|p| p.estimated_work).collect();
    analyze_work(&work)
}

/// Analyzes raw per-partition work values.
///
/// An empty set is reported as perfectly balanced.
pub fn analyze_work(work: &[u64]) -> PartitionQuality {
    if work.is_empty() {
        return PartitionQuality {
            total_work: 0,
            average_work: 0.0,
            max_work: 0,
            min_work: 0,
            std_deviation: 0.0,
            balance_factor: 1.0,
            is_well_balanced: true,
            efficiency: 1.0,
        };
    }

    let total_work: u64 = work.iter().sum();
    let count = work.len() as f64;
    let average_work = total_work as f64 / count;
    let max_work = work.iter().copied().max().unwrap_or(0);
    let min_work = work.iter().copied().min().unwrap_or(0);

    let variance = work
        .iter()
        .map(|&w| {
            let diff = w as f64 - average_work;
            diff * diff
        })
        .sum::<f64>()
        / count;

    let balance_factor = if min_work == 0 {
        f64::INFINITY
    } else {
        max_work as f64 / min_work as f64
    };
    let efficiency = if balance_factor.is_finite() {
        1.0 / balance_factor
    } else {
        0.0
    };

    PartitionQuality {
        total_work,
        average_work,
        max_work,
        min_work,
        std_deviation: variance.sqrt(),
        balance_factor,
        is_well_balanced: balance_factor < WELL_BALANCED_FACTOR,
        efficiency,
    }
}
