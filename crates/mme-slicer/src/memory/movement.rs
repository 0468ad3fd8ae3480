//! Spill and fill placement at bundle boundaries.
//!
//! | tensor                                   | movement                          |
//! |------------------------------------------|-----------------------------------|
//! | produced outside, read by the MME        | fill per distinct window          |
//! | produced outside, read only by TPC       | fused fill (TPC reads HBM)        |
//! | produced inside, needed outside          | spill, or fused spill from a TPC  |
//! | produced inside by a reshape             | shares its input's SRAM           |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bundle::Bundle;
use crate::config::SlicerConfig;
use crate::graph::{DType, Graph, NodeKind, TensorId};
use crate::hal::{DataMovement, HardwareCaps};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMovement {
    /// Holds SRAM buffers during the bundle.
    pub resident: bool,
    pub fill: bool,
    /// Read straight from HBM by its TPC readers.
    pub fused_fill: bool,
    pub spill: bool,
    /// Written straight to HBM by its TPC producer.
    pub fused_spill: bool,
    /// Tensor whose SRAM buffers this one reinterprets.
    pub alias_of: Option<TensorId>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MovementError {
    #[error("{movement:?} does not support {dtype} needed by tensor `{tensor}`")]
    Unsupported {
        tensor: String,
        dtype: DType,
        movement: DataMovement,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MovementPlan {
    pub tensors: BTreeMap<TensorId, TensorMovement>,
}

impl MovementPlan {
    pub fn get(&self, tensor: TensorId) -> TensorMovement {
        self.tensors.get(&tensor).copied().unwrap_or_default()
    }

    /// Tensor owning the SRAM buffers used by `tensor`.
    pub fn root(&self, tensor: TensorId) -> TensorId {
        let mut current = tensor;
        while let Some(next) = self.tensors.get(&current).and_then(|m| m.alias_of) {
            current = next;
        }
        current
    }

    /// SRAM bytes needed by every resident buffer of `bundle`.
    pub fn working_set(&self, bundle: &Bundle, align: u64, double_buffer: bool) -> u64 {
        bundle
            .tensors
            .iter()
            .filter(|(tensor, _)| {
                let movement = self.get(**tensor);
                movement.resident && movement.alias_of.is_none()
            })
            .map(|(_, slicing)| slicing.footprint(&bundle.strategy, align, double_buffer))
            .sum()
    }
}

/// Decides fills, spills and SRAM residency for every tensor of `bundle`.
pub fn plan_movement(
    graph: &Graph,
    bundle: &Bundle,
    config: &SlicerConfig,
    caps: &dyn HardwareCaps,
) -> Result<MovementPlan, MovementError> {
    let mut plan = MovementPlan::default();
    for (&tensor, slicing) in &bundle.tensors {
        let entry = graph.tensor(tensor);
        let (inside, outside): (Vec<_>, Vec<_>) = graph
            .consumers(tensor)
            .iter()
            .partition(|&&reader| bundle.contains(reader));
        let needs_hbm = !outside.is_empty() || graph.is_graph_output(tensor);
        let producer = graph.producer(tensor).filter(|&p| bundle.contains(p));

        let mut movement = TensorMovement::default();
        match producer {
            None => {
                let tpc_only = !inside.is_empty()
                    && inside
                        .iter()
                        .all(|&reader| matches!(graph.node(reader).kind, NodeKind::Tpc { .. }));
                if config.eviction_fusion && tpc_only {
                    movement.fused_fill = true;
                } else {
                    movement.resident = true;
                    movement.fill = true;
                }
            }
            Some(node) => match &graph.node(node).kind {
                NodeKind::Reshape => {
                    movement.alias_of = graph.node(node).inputs.first().copied();
                    movement.resident = true;
                    movement.spill = needs_hbm;
                }
                NodeKind::Tpc { .. } if needs_hbm && config.spill_fusion => {
                    movement.fused_spill = true;
                    movement.resident = !inside.is_empty();
                }
                NodeKind::Tpc { .. } | NodeKind::Mme { .. } => {
                    movement.resident = true;
                    movement.spill = needs_hbm;
                }
            },
        }

        // The anchor output moves in its accumulator type.
        let moved = slicing.dtype;
        if (movement.fill || movement.spill) && !caps.supports(DataMovement::Memcpy, moved) {
            return Err(MovementError::Unsupported {
                tensor: entry.name.clone(),
                dtype: moved,
                movement: DataMovement::Memcpy,
            });
        }
        plan.tensors.insert(tensor, movement);
    }
    Ok(plan)
}
