use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, VecDeque};
use std::fmt;

use super::{Graph, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// Some nodes wait on each other; `node` is the lowest-index member left unscheduled.
    Cycle { node: String },
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyError::Cycle { node } => {
                write!(f, "graph contains a cycle through node `{node}`")
            }
        }
    }
}

impl std::error::Error for TopologyError {}

/// Kahn's algorithm over `count` units. `preds[i]` lists the units `i` waits on. Ready units are
/// taken lowest index first, so the order is a pure function of the input. Returns `Err` with
/// the first unit that could not be scheduled.
pub fn kahn_order(count: usize, preds: &[BTreeSet<usize>]) -> Result<Vec<usize>, usize> {
    let mut indegree = vec![0usize; count];
    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (unit, list) in preds.iter().enumerate() {
        for &pred in list {
            indegree[unit] += 1;
            succs[pred].push(unit);
        }
    }
    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, &deg)| deg == 0)
        .map(|(unit, _)| Reverse(unit))
        .collect();
    let mut order = Vec::with_capacity(count);
    while let Some(Reverse(unit)) = ready.pop() {
        order.push(unit);
        for &succ in &succs[unit] {
            indegree[succ] -= 1;
            if indegree[succ] == 0 {
                ready.push(Reverse(succ));
            }
        }
    }
    if order.len() == count {
        return Ok(order);
    }
    let stuck = (0..count).find(|unit| indegree[*unit] > 0).unwrap_or(0);
    Err(stuck)
}

/// Deterministic topological order of all nodes.
pub fn topological_order(graph: &Graph) -> Result<Vec<NodeId>, TopologyError> {
    let preds: Vec<BTreeSet<usize>> = graph
        .nodes()
        .iter()
        .map(|node| {
            node.inputs
                .iter()
                .filter_map(|tensor| graph.producer(*tensor))
                .map(|producer| producer.index())
                .collect()
        })
        .collect();
    kahn_order(preds.len(), &preds)
        .map(|order| order.into_iter().map(NodeId::from_index).collect())
        .map_err(|stuck| TopologyError::Cycle {
            node: graph.node(NodeId::from_index(stuck)).name.clone(),
        })
}

/// Nodes reachable downstream from `starts` (excluded unless re-reached), never expanding
/// through nodes for which `blocked` returns true.
pub fn reachable_from(
    graph: &Graph,
    starts: impl IntoIterator<Item = NodeId>,
    blocked: impl Fn(NodeId) -> bool,
) -> BTreeSet<NodeId> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<NodeId> = starts.into_iter().collect();
    while let Some(node) = queue.pop_front() {
        for &output in &graph.node(node).outputs {
            for &consumer in graph.consumers(output) {
                if seen.insert(consumer) && !blocked(consumer) {
                    queue.push_back(consumer);
                }
            }
        }
    }
    seen
}
