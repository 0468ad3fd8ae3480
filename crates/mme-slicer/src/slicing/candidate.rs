//! Selection of MME operators that need slicing.

use std::collections::BTreeSet;

use log::debug;

use super::solver::{SlicingSolver, SolverOutcome};
use super::strategy::SlicingStrategy;
use crate::config::SlicerConfig;
use crate::geometry::{MmeGeometry, ShapeSource};
use crate::graph::{Graph, NodeId};

/// Result of scanning a graph for slicing candidates.
#[derive(Debug, Clone, Default)]
pub struct CandidateScan {
    /// Candidates with a fitting strategy, in topological order.
    pub sliced: Vec<SlicingStrategy>,
    pub candidates: usize,
    pub unsliceable: Vec<NodeId>,
}

/// MME operators other than grouped convolutions whose operands are distinct tensors.
pub fn is_candidate_kind(graph: &Graph, node: NodeId) -> bool {
    let entry = graph.node(node);
    let mut seen = BTreeSet::new();
    let distinct = entry
        .inputs
        .iter()
        .chain(entry.outputs.iter())
        .all(|tensor| seen.insert(*tensor));
    entry.is_mme() && distinct && entry.conv_params().map_or(true, |conv| conv.groups <= 1)
}

pub fn scan_candidates(
    graph: &Graph,
    order: &[NodeId],
    solver: &SlicingSolver<'_>,
    config: &SlicerConfig,
) -> CandidateScan {
    let mut scan = CandidateScan::default();
    if solver.budget() == 0 {
        return scan;
    }
    for &node in order {
        if !is_candidate_kind(graph, node) {
            continue;
        }
        let Some(geometry) = MmeGeometry::build(graph, node, ShapeSource::Max, config) else {
            continue;
        };
        let name = &graph.node(node).name;
        match solver.solve(geometry) {
            SolverOutcome::Fits(_) => {}
            SolverOutcome::Sliced(strategy) => {
                scan.candidates += 1;
                debug!(
                    "{name}: sliced into {} slices, chunks {:?}",
                    strategy.total_slices(),
                    strategy.chunks
                );
                scan.sliced.push(strategy);
            }
            SolverOutcome::Unsliceable { reason } => {
                scan.candidates += 1;
                debug!("{name}: left unsliced, {reason}");
                scan.unsliceable.push(node);
            }
        }
    }
    scan
}
