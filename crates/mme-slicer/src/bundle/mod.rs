//! Bundles: a sliced MME anchor plus the TPC and reshape neighbors that run per slice with it.
//!
//! ```text
//!   wide producer chain ──► A ─┐
//!                              ├─► MME anchor ──► out ──► consumer chain
//!   narrow producer chain ─► B ─┘
//! ```
//!
//! Every tensor touched by a bundle node carries a [`TensorSlicing`] describing how its dims
//! follow the anchor's axes. Adjacent nodes always agree on the slicing of the tensor between
//! them.

pub mod expand;
pub mod propagate;
pub mod shared;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::geometry::OperandRole;
use crate::graph::{NodeId, TensorId};
use crate::slicing::{SlicingStrategy, TensorSlicing};

pub use expand::BundleExpander;
pub use shared::assign_shared_operands;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StitchRole {
    /// Produces (transitively) operand A.
    WideProducer,
    /// Produces (transitively) operand B.
    NarrowProducer,
    /// Consumes (transitively) the anchor output.
    Consumer,
}

impl StitchRole {
    pub fn is_producer(self) -> bool {
        self != StitchRole::Consumer
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StitchedNode {
    pub node: NodeId,
    pub role: StitchRole,
    /// Tensors that entered the bundle with this node.
    pub introduced: Vec<TensorId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub id: u32,
    pub anchor: NodeId,
    pub strategy: SlicingStrategy,
    /// Stitched neighbors in order of addition.
    pub stitched: Vec<StitchedNode>,
    pub tensors: BTreeMap<TensorId, TensorSlicing>,
}

impl Bundle {
    pub fn new(id: u32, strategy: SlicingStrategy) -> Self {
        let tensors = strategy
            .operand_slicings()
            .into_iter()
            .map(|(_, slicing)| (slicing.tensor, slicing))
            .collect();
        Self {
            id,
            anchor: strategy.geometry.node,
            strategy,
            stitched: Vec::new(),
            tensors,
        }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        node == self.anchor || self.stitched.iter().any(|s| s.node == node)
    }

    /// Anchor first, then stitched nodes in order of addition.
    pub fn nodes(&self) -> Vec<NodeId> {
        std::iter::once(self.anchor)
            .chain(self.stitched.iter().map(|s| s.node))
            .collect()
    }

    pub fn operand_tensor(&self, role: OperandRole) -> Option<TensorId> {
        self.strategy.geometry.operand(role).map(|op| op.tensor)
    }

    pub fn output(&self) -> Option<TensorId> {
        self.operand_tensor(OperandRole::Output)
    }

    pub fn slicing(&self, tensor: TensorId) -> Option<&TensorSlicing> {
        self.tensors.get(&tensor)
    }

    pub fn count(&self, role: StitchRole) -> usize {
        self.stitched.iter().filter(|s| s.role == role).count()
    }

    /// Adds `node` together with the slicings of the tensors it brings in. Tensors already
    /// present keep their slicing.
    pub fn push(&mut self, node: NodeId, role: StitchRole, slicings: Vec<TensorSlicing>) {
        let mut introduced = Vec::new();
        for slicing in slicings {
            if !self.tensors.contains_key(&slicing.tensor) {
                introduced.push(slicing.tensor);
                self.tensors.insert(slicing.tensor, slicing);
            }
        }
        self.stitched.push(StitchedNode {
            node,
            role,
            introduced,
        });
    }

    /// Drops the most recently stitched node.
    pub fn pop(&mut self) -> Option<StitchedNode> {
        let last = self.stitched.pop()?;
        for tensor in &last.introduced {
            self.tensors.remove(tensor);
        }
        Some(last)
    }
}
