//! Launch-time resolution of a planned strategy against actual shapes.
//!
//! Chunk sizes are fixed at planning time. At launch only extents change: the trailing slice of
//! an axis shrinks and slices past the actual extent are skipped. Every operand bound
//! one-to-one to an axis must launch with that axis's extent.

use serde::{Deserialize, Serialize};

use super::strategy::{SliceWalk, SlicingStrategy};
use crate::config::SlicerConfig;
use crate::error::{Result, SlicerError};
use crate::geometry::{AxisWindow, DimMapping, MmeGeometry, OperandRole, ShapeSource};
use crate::graph::{Graph, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchAxis {
    pub label: String,
    pub chunk: u64,
    pub planned_slices: u64,
    pub extent: u64,
    pub active_slices: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSlice {
    pub coord: Vec<u64>,
    /// `(start, len)` per axis.
    pub ranges: Vec<(u64, u64)>,
    pub operands: Vec<(OperandRole, Vec<AxisWindow>)>,
    /// Window and padding of every convolution spatial axis.
    pub conv: Vec<AxisWindow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchPlan {
    pub anchor: NodeId,
    pub axes: Vec<LaunchAxis>,
    pub slices: Vec<LaunchSlice>,
    pub skipped: u64,
}

/// Resolves `strategy` against the actual shapes recorded in `graph`.
pub fn resolve_launch(graph: &Graph, strategy: &SlicingStrategy) -> Result<LaunchPlan> {
    let anchor = strategy.geometry.node;
    for operand in &strategy.geometry.operands {
        let tensor = graph.tensor(operand.tensor);
        if let Some(actual) = &tensor.actual {
            tensor.shape.check_actual(&tensor.name, actual)?;
        }
    }
    let mut launch =
        MmeGeometry::build(graph, anchor, ShapeSource::Launch, &SlicerConfig::default())
            .filter(|geometry| geometry.axes.len() == strategy.chunks.len())
            .ok_or_else(|| mismatch(graph, strategy, "launch shapes change the slicing axes"))?;
    // Config toggles only set `enabled`; keep the planned flags.
    for (axis, planned) in launch.axes.iter_mut().zip(&strategy.geometry.axes) {
        axis.enabled = planned.enabled;
    }
    check_bindings(graph, strategy, &launch)?;

    let axes: Vec<LaunchAxis> = launch
        .axes
        .iter()
        .enumerate()
        .map(|(axis, entry)| {
            let chunk = strategy.chunks[axis].max(1);
            LaunchAxis {
                label: entry.label.clone(),
                chunk,
                planned_slices: strategy.num_slices(axis),
                extent: entry.extent,
                active_slices: entry.extent.div_ceil(chunk).min(strategy.num_slices(axis)),
            }
        })
        .collect();

    let mut slices = Vec::new();
    let mut skipped = 0;
    for coord in SliceWalk::new(axes.iter().map(|axis| axis.planned_slices).collect()) {
        let ranges: Vec<(u64, u64)> = coord
            .iter()
            .zip(&axes)
            .map(|(&index, axis)| {
                let start = index * axis.chunk;
                (start, axis.chunk.min(axis.extent.saturating_sub(start)))
            })
            .collect();
        if ranges.iter().any(|&(_, len)| len == 0) {
            skipped += 1;
            continue;
        }
        let operands = launch
            .operands
            .iter()
            .map(|op| (op.role, launch.operand_windows(op.role, &ranges).to_vec()))
            .collect();
        slices.push(LaunchSlice {
            conv: launch.conv_windows(&ranges).to_vec(),
            coord,
            ranges,
            operands,
        });
    }
    Ok(LaunchPlan {
        anchor,
        axes,
        slices,
        skipped,
    })
}

fn mismatch(graph: &Graph, strategy: &SlicingStrategy, message: &str) -> SlicerError {
    SlicerError::OperandMismatch {
        node: graph.node(strategy.geometry.node).name.clone(),
        message: message.to_string(),
    }
}

/// Every operand partitioned one-to-one at planning time must keep the driver's launch extent.
fn check_bindings(graph: &Graph, strategy: &SlicingStrategy, launch: &MmeGeometry) -> Result<()> {
    for (planned, axis) in strategy.geometry.axes.iter().zip(&launch.axes) {
        for binding in &planned.bindings {
            if binding.mapping != DimMapping::Identity {
                continue;
            }
            let actual = launch.dim(binding.operand, binding.dim);
            if actual != axis.extent {
                let tensor = launch
                    .operand(binding.operand)
                    .map(|op| graph.tensor(op.tensor).name.as_str())
                    .unwrap_or("?");
                return Err(mismatch(
                    graph,
                    strategy,
                    &format!(
                        "tensor `{tensor}` dim {} launches with {actual}, axis {} with {}",
                        binding.dim, axis.label, axis.extent
                    ),
                ));
            }
        }
    }
    Ok(())
}
