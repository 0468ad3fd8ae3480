//! Growing a bundle with its producer and consumer chains.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::{debug, trace};

use super::propagate::{through_consumer, through_producer};
use super::{Bundle, StitchRole};
use crate::config::SlicerConfig;
use crate::geometry::OperandRole;
use crate::graph::topology::reachable_from;
use crate::graph::{Graph, Node, NodeId, TensorId};
use crate::hal::HardwareCaps;
use crate::memory::plan_movement;
use crate::slicing::TensorSlicing;

pub struct BundleExpander<'a> {
    graph: &'a Graph,
    config: &'a SlicerConfig,
    caps: &'a dyn HardwareCaps,
    budget: u64,
    align: u64,
}

impl<'a> BundleExpander<'a> {
    pub fn new(
        graph: &'a Graph,
        config: &'a SlicerConfig,
        caps: &'a dyn HardwareCaps,
        budget: u64,
        align: u64,
    ) -> Self {
        Self {
            graph,
            config,
            caps,
            budget,
            align,
        }
    }

    /// Whether every SRAM-resident buffer of `bundle` fits the budget together.
    pub fn fits(&self, bundle: &Bundle) -> bool {
        match plan_movement(self.graph, bundle, self.config, self.caps) {
            Ok(plan) => {
                plan.working_set(bundle, self.align, self.config.double_buffer) <= self.budget
            }
            Err(_) => false,
        }
    }

    /// Stitches producer chains of A and B, then consumer chains of the output.
    ///
    /// `claimed` holds nodes owned by earlier bundles; `owners` maps shared operand tensors to
    /// the only anchor allowed to absorb their producers.
    pub fn expand(
        &self,
        bundle: &mut Bundle,
        claimed: &BTreeSet<NodeId>,
        owners: &BTreeMap<TensorId, NodeId>,
    ) {
        if !self.config.bundle_expansion {
            return;
        }
        for (role, operand) in [
            (StitchRole::WideProducer, OperandRole::A),
            (StitchRole::NarrowProducer, OperandRole::B),
        ] {
            let Some(tensor) = bundle.operand_tensor(operand) else {
                continue;
            };
            if owners.get(&tensor).is_some_and(|&owner| owner != bundle.anchor) {
                trace!(
                    "bundle {}: producers of `{}` belong to another anchor",
                    bundle.id,
                    self.graph.tensor(tensor).name
                );
                continue;
            }
            self.stitch_producers(bundle, role, tensor, claimed);
        }
        if bundle.strategy.common_sliced() {
            return;
        }
        self.stitch_consumers(bundle, claimed);
    }

    fn stitch_producers(
        &self,
        bundle: &mut Bundle,
        role: StitchRole,
        tensor: TensorId,
        claimed: &BTreeSet<NodeId>,
    ) {
        let mut current = tensor;
        let mut physical = 0;
        while let Some(producer) = self.graph.producer(current) {
            if claimed.contains(&producer) || bundle.contains(producer) {
                break;
            }
            let node = self.graph.node(producer);
            if !node.is_logical() && physical >= self.config.max_chain_length {
                break;
            }
            let Some(output) = bundle.slicing(current).cloned() else {
                break;
            };
            let Some(inputs) = through_producer(self.graph, node, &output) else {
                trace!("bundle {}: `{}` cannot follow the slicing", bundle.id, node.name);
                break;
            };
            let Some(grown) = self.try_stitch(bundle, producer, role, inputs) else {
                break;
            };
            debug!("bundle {}: stitched producer `{}`", bundle.id, node.name);
            *bundle = grown;
            if !node.is_logical() {
                physical += 1;
            }
            let Some(upstream) = main_input(self.graph, node) else {
                break;
            };
            current = upstream;
        }
    }

    fn stitch_consumers(&self, bundle: &mut Bundle, claimed: &BTreeSet<NodeId>) {
        let Some(output) = bundle.output() else {
            return;
        };
        let mut frontier = VecDeque::from([output]);
        let mut physical = 0;
        while let Some(tensor) = frontier.pop_front() {
            for &consumer in self.graph.consumers(tensor) {
                if claimed.contains(&consumer) || bundle.contains(consumer) {
                    continue;
                }
                let node = self.graph.node(consumer);
                if !node.is_logical() && physical >= self.config.max_chain_length {
                    continue;
                }
                let Some(input) = bundle.slicing(tensor).cloned() else {
                    continue;
                };
                let Some(slicings) = through_consumer(self.graph, node, &input) else {
                    trace!("bundle {}: `{}` cannot follow the slicing", bundle.id, node.name);
                    continue;
                };
                let Some(grown) = self.try_stitch(bundle, consumer, StitchRole::Consumer, slicings)
                else {
                    continue;
                };
                debug!("bundle {}: stitched consumer `{}`", bundle.id, node.name);
                *bundle = grown;
                if !node.is_logical() {
                    physical += 1;
                }
                frontier.push_back(node.outputs[0]);
            }
        }
    }

    fn try_stitch(
        &self,
        bundle: &Bundle,
        node: NodeId,
        role: StitchRole,
        slicings: Vec<TensorSlicing>,
    ) -> Option<Bundle> {
        let agrees = slicings.iter().all(|slicing| {
            bundle
                .slicing(slicing.tensor)
                .map_or(true, |existing| existing.bindings == slicing.bindings)
        });
        if !agrees {
            return None;
        }
        let mut grown = bundle.clone();
        grown.push(node, role, slicings);
        if creates_cycle(self.graph, &grown) {
            trace!("bundle {}: `{}` would close a cycle", bundle.id, self.graph.node(node).name);
            return None;
        }
        self.fits(&grown).then_some(grown)
    }
}

/// Input continuing a producer chain: the first data input with the output's shape.
fn main_input(graph: &Graph, node: &Node) -> Option<TensorId> {
    let output = graph.tensor(*node.outputs.first()?).shape.max();
    let mut data = node
        .inputs
        .iter()
        .copied()
        .filter(|&tensor| graph.tensor(tensor).is_data());
    let first = data.clone().next();
    data.find(|&tensor| graph.tensor(tensor).shape.max() == output)
        .or(first)
}

/// Whether a path leaves the bundle and re-enters it.
pub fn creates_cycle(graph: &Graph, bundle: &Bundle) -> bool {
    let members: BTreeSet<NodeId> = bundle.nodes().into_iter().collect();
    let exits: BTreeSet<NodeId> = members
        .iter()
        .flat_map(|&member| graph.node(member).outputs.iter())
        .flat_map(|&tensor| graph.consumers(tensor).iter().copied())
        .filter(|consumer| !members.contains(consumer))
        .collect();
    reachable_from(graph, exits, |node| members.contains(&node))
        .iter()
        .any(|node| members.contains(node))
}
