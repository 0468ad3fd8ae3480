//! Program order over untouched nodes and collapsed bundles.

use std::collections::{BTreeMap, BTreeSet};

use crate::bundle::Bundle;
use crate::graph::topology::kahn_order;
use crate::graph::{Graph, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Unit {
    Node(NodeId),
    /// Index into the bundle list.
    Bundle(usize),
}

/// Orders units with Kahn's algorithm, lowest index first, where units are numbered by their
/// first node in `topo`. On a cycle between collapsed bundles returns the index of a bundle to
/// dissolve.
pub(crate) fn order_units(
    graph: &Graph,
    topo: &[NodeId],
    bundles: &[Bundle],
) -> Result<Vec<Unit>, usize> {
    let mut owner: BTreeMap<NodeId, usize> = BTreeMap::new();
    for (index, bundle) in bundles.iter().enumerate() {
        for node in bundle.nodes() {
            owner.insert(node, index);
        }
    }

    let mut units: Vec<Unit> = Vec::new();
    let mut unit_of_node: BTreeMap<NodeId, usize> = BTreeMap::new();
    let mut unit_of_bundle: BTreeMap<usize, usize> = BTreeMap::new();
    for &node in topo {
        let unit = match owner.get(&node) {
            Some(&bundle) => *unit_of_bundle.entry(bundle).or_insert_with(|| {
                units.push(Unit::Bundle(bundle));
                units.len() - 1
            }),
            None => {
                units.push(Unit::Node(node));
                units.len() - 1
            }
        };
        unit_of_node.insert(node, unit);
    }

    let mut preds: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); units.len()];
    for node in graph.nodes() {
        let Some(&unit) = unit_of_node.get(&node.id) else {
            continue;
        };
        for &input in &node.inputs {
            let Some(producer) = graph.producer(input) else {
                continue;
            };
            if let Some(&pred) = unit_of_node.get(&producer) {
                if pred != unit {
                    preds[unit].insert(pred);
                }
            }
        }
    }

    kahn_order(units.len(), &preds)
        .map(|order| order.into_iter().map(|unit| units[unit]).collect())
        .map_err(|stuck| match units[stuck] {
            Unit::Bundle(bundle) => bundle,
            Unit::Node(_) => bundles.len().saturating_sub(1),
        })
}
