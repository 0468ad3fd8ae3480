//! Ownership of producer chains feeding several sliced anchors.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use log::debug;

use crate::geometry::OperandRole;
use crate::graph::{Graph, NodeId, TensorId};
use crate::slicing::SlicingStrategy;

/// Cost of absorbing a shared chain into one anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OwnerRank {
    /// MME slice invocations that read the operand.
    fetches: u64,
    /// Distinct windows of the operand.
    distinct: u64,
    complementary_sliced: bool,
    anchor: NodeId,
}

impl OwnerRank {
    fn new(strategy: &SlicingStrategy, role: OperandRole) -> Option<Self> {
        let slicing = strategy.operand_slicing(role)?;
        let complementary = match role {
            OperandRole::A => OperandRole::B,
            _ => OperandRole::A,
        };
        let complementary_sliced = strategy
            .operand_slicing(complementary)
            .is_some_and(|other| other.distinct_slices(strategy) > 1);
        Some(Self {
            fetches: slicing.fetch_count(strategy),
            distinct: slicing.distinct_slices(strategy).max(1),
            complementary_sliced,
            anchor: strategy.geometry.node,
        })
    }
}

impl Ord for OwnerRank {
    fn cmp(&self, other: &Self) -> Ordering {
        // fetches / distinct compared without division.
        let lhs = u128::from(self.fetches) * u128::from(other.distinct);
        let rhs = u128::from(other.fetches) * u128::from(self.distinct);
        lhs.cmp(&rhs)
            .then(self.complementary_sliced.cmp(&other.complementary_sliced))
            .then(self.anchor.cmp(&other.anchor))
    }
}

impl PartialOrd for OwnerRank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// For every operand tensor with a non-MME producer that is read by more than one sliced
/// anchor, the anchor that recomputes it least.
pub fn assign_shared_operands(
    graph: &Graph,
    strategies: &[SlicingStrategy],
) -> BTreeMap<TensorId, NodeId> {
    let mut readers: BTreeMap<TensorId, Vec<OwnerRank>> = BTreeMap::new();
    for strategy in strategies {
        for role in [OperandRole::A, OperandRole::B] {
            let Some(operand) = strategy.geometry.operand(role) else {
                continue;
            };
            if let Some(rank) = OwnerRank::new(strategy, role) {
                readers.entry(operand.tensor).or_default().push(rank);
            }
        }
    }

    let mut owners = BTreeMap::new();
    for (tensor, ranks) in readers {
        if ranks.len() < 2 {
            continue;
        }
        let stitchable = graph
            .producer(tensor)
            .is_some_and(|producer| !graph.node(producer).is_mme());
        if !stitchable {
            continue;
        }
        if let Some(best) = ranks.iter().min() {
            debug!(
                "shared operand `{}` goes to `{}` (recompute {}/{})",
                graph.tensor(tensor).name,
                graph.node(best.anchor).name,
                best.fetches,
                best.distinct
            );
            owners.insert(tensor, best.anchor);
        }
    }
    owners
}
