//! Per-slice op sequence of one bundle.
//!
//! Each walk step emits fills for inputs whose window changed, then producer slices upstream
//! first, then the MME slice. When the output window is final the reduction, spills and
//! consumer slices follow. Buffers are addressed by copy `ordinal % buffers` and packed once
//! the sequence is known.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use thiserror::Error;

use super::{Location, OpKind, SliceRef};
use crate::bundle::Bundle;
use crate::config::SlicerConfig;
use crate::geometry::{AxisWindow, OperandRole};
use crate::graph::{Graph, NodeId, NodeKind, TensorId};
use crate::hal::HardwareCaps;
use crate::memory::{
    pack, peak_bytes, plan_movement, AllocationRequest, BufferKey, LiveRange, MovementError,
    MovementPlan, PackingError, Placement,
};
use crate::slicing::{align_up, buffer_count, reduction_root, reduction_tree, ReductionPolicy};

/// Why a bundle could not be emitted as planned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DemotionReason {
    #[error(transparent)]
    Movement(#[from] MovementError),
    #[error(transparent)]
    Packing(#[from] PackingError),
}

pub(crate) struct EmitContext<'a> {
    pub graph: &'a Graph,
    pub config: &'a SlicerConfig,
    pub caps: &'a dyn HardwareCaps,
    pub budget: u64,
    pub align: u64,
    /// Position of every node in the topological order, by node index.
    pub topo_position: &'a [usize],
}

pub(crate) struct BundleOps {
    pub ops: Vec<(String, OpKind)>,
    pub placements: Vec<Placement>,
    pub peak: u64,
    pub movement: MovementPlan,
}

type Windows = SmallVec<[AxisWindow; 5]>;

#[derive(Debug, Default)]
struct Track {
    current: Windows,
    /// Distinct windows seen so far.
    count: u64,
    changed: bool,
}

struct BundleEmitter<'a> {
    ctx: &'a EmitContext<'a>,
    bundle: &'a Bundle,
    plan: &'a MovementPlan,
    producers: Vec<NodeId>,
    consumers: Vec<NodeId>,
    buffers: BTreeMap<TensorId, u64>,
    tracks: BTreeMap<TensorId, Track>,
    ops: Vec<(String, OpKind)>,
}

pub(crate) fn emit_bundle(
    ctx: &EmitContext<'_>,
    bundle: &Bundle,
) -> Result<BundleOps, DemotionReason> {
    let plan = plan_movement(ctx.graph, bundle, ctx.config, ctx.caps)?;
    let mut emitter = BundleEmitter::new(ctx, bundle, &plan);
    emitter.walk();
    let ops = emitter.finish();
    let (ops, placements) = place_buffers(ctx, bundle, &plan, ops)?;
    Ok(BundleOps {
        peak: peak_bytes(&placements),
        ops,
        placements,
        movement: plan,
    })
}

impl<'a> BundleEmitter<'a> {
    fn new(ctx: &'a EmitContext<'a>, bundle: &'a Bundle, plan: &'a MovementPlan) -> Self {
        let by_topo = |mut nodes: Vec<NodeId>| {
            nodes.sort_by_key(|node| ctx.topo_position[node.index()]);
            nodes
        };
        let producers = by_topo(
            bundle
                .stitched
                .iter()
                .filter(|s| s.role.is_producer())
                .map(|s| s.node)
                .collect(),
        );
        let consumers = by_topo(
            bundle
                .stitched
                .iter()
                .filter(|s| !s.role.is_producer())
                .map(|s| s.node)
                .collect(),
        );
        let buffers = bundle
            .tensors
            .iter()
            .map(|(&tensor, slicing)| {
                let distinct = slicing.distinct_slices(&bundle.strategy);
                (tensor, buffer_count(distinct, ctx.config.double_buffer))
            })
            .collect();
        Self {
            ctx,
            bundle,
            plan,
            producers,
            consumers,
            buffers,
            tracks: BTreeMap::new(),
            ops: Vec::new(),
        }
    }

    fn graph(&self) -> &'a Graph {
        self.ctx.graph
    }

    fn advance(&mut self, coord: &[u64]) {
        let bundle = self.bundle;
        for (&tensor, slicing) in &bundle.tensors {
            let windows = slicing.windows(&bundle.strategy, coord);
            let track = self.tracks.entry(tensor).or_default();
            track.changed = track.count == 0 || track.current != windows;
            if track.changed {
                track.count += 1;
                track.current = windows;
            }
        }
    }

    fn changed(&self, tensor: TensorId) -> bool {
        self.tracks.get(&tensor).is_some_and(|track| track.changed)
    }

    fn copy(&self, tensor: TensorId) -> u32 {
        let root = self.plan.root(tensor);
        let buffers = self.buffers.get(&root).copied().unwrap_or(1).max(1);
        let count = self.tracks.get(&tensor).map_or(1, |track| track.count);
        (count.saturating_sub(1) % buffers) as u32
    }

    fn windows(&self, tensor: TensorId) -> &[AxisWindow] {
        self.tracks
            .get(&tensor)
            .map(|track| track.current.as_slice())
            .unwrap_or(&[])
    }

    fn sram_ref(&self, tensor: TensorId) -> SliceRef {
        let dtype = self
            .bundle
            .slicing(tensor)
            .map_or(self.graph().tensor(tensor).dtype, |s| s.dtype);
        let location = Location::Sram {
            address: 0,
            copy: self.copy(tensor),
        };
        SliceRef::new(tensor, dtype, self.windows(tensor), location)
    }

    fn hbm_ref(&self, tensor: TensorId) -> SliceRef {
        let dtype = self.graph().tensor(tensor).dtype;
        SliceRef::new(tensor, dtype, self.windows(tensor), Location::Hbm)
    }

    fn read_ref(&self, tensor: TensorId) -> SliceRef {
        if self.plan.get(tensor).resident {
            self.sram_ref(tensor)
        } else {
            self.hbm_ref(tensor)
        }
    }

    fn slice_name(&self, tensor: TensorId, what: &str) -> String {
        let count = self.tracks.get(&tensor).map_or(0, |t| t.count.saturating_sub(1));
        format!("{what} {}#{count}", self.graph().tensor(tensor).name)
    }

    fn push(&mut self, name: String, op: OpKind) {
        self.ops.push((name, op));
    }

    fn walk(&mut self) {
        let bundle = self.bundle;
        let strategy = &bundle.strategy;
        let Some(output) = bundle.output() else {
            return;
        };
        let Some(out_slicing) = bundle.slicing(output) else {
            return;
        };
        let coords: Vec<Vec<u64>> = strategy.walk().collect();
        for (step, coord) in coords.iter().enumerate() {
            self.advance(coord);

            let fills: Vec<TensorId> = self
                .plan
                .tensors
                .iter()
                .filter(|(tensor, movement)| movement.fill && self.changed(**tensor))
                .map(|(tensor, _)| *tensor)
                .collect();
            for tensor in fills {
                let op = OpKind::Fill {
                    source: self.hbm_ref(tensor),
                    target: self.sram_ref(tensor),
                };
                self.push(self.slice_name(tensor, "fill"), op);
            }

            for producer in self.producers.clone() {
                let out = self.graph().node(producer).outputs[0];
                if self.changed(out) {
                    self.emit_neighbor(producer, coord, step);
                }
            }

            self.emit_mme(coord, step);

            let last_for_window = coords.get(step + 1).map_or(true, |next| {
                out_slicing.windows(strategy, next).as_slice() != self.windows(output)
            });
            match strategy.active_reduction() {
                Some(ReductionPolicy::Staged { .. }) => {
                    self.emit_partial(output, strategy.common_index(coord) as u32);
                    if last_for_window {
                        self.emit_reduction(output, strategy.common_slices() as u32);
                    }
                }
                _ if last_for_window => {
                    if self.plan.get(output).spill {
                        self.emit_spill(output);
                    }
                    for consumer in self.consumers.clone() {
                        self.emit_neighbor(consumer, coord, step);
                    }
                }
                _ => {}
            }
        }
    }

    fn emit_mme(&mut self, coord: &[u64], step: usize) {
        let bundle = self.bundle;
        let strategy = &bundle.strategy;
        let geometry = &strategy.geometry;
        let inputs = OperandRole::inputs(geometry.kind)
            .iter()
            .filter_map(|&role| geometry.operand(role))
            .map(|operand| self.sram_ref(operand.tensor))
            .collect();
        let Some(output) = bundle.output() else {
            return;
        };
        let accumulate = matches!(
            strategy.active_reduction(),
            Some(ReductionPolicy::InPlace { .. })
        ) && strategy.common_index(coord) > 0;
        let op = OpKind::MmeSlice {
            node: geometry.node,
            coord: coord.to_vec(),
            inputs,
            output: self.sram_ref(output),
            conv: geometry.conv_windows(&strategy.ranges(coord)).to_vec(),
            accumulate,
        };
        let name = format!("{}#{step}", self.graph().node(geometry.node).name);
        self.push(name, op);
    }

    fn emit_neighbor(&mut self, node: NodeId, coord: &[u64], step: usize) {
        let entry = self.graph().node(node);
        let out = entry.outputs[0];
        let name = format!("{}#{step}", entry.name);
        let op = match &entry.kind {
            NodeKind::Reshape => OpKind::Reinterpret {
                node,
                coord: coord.to_vec(),
                input: self.sram_ref(entry.inputs[0]),
                output: self.sram_ref(out),
            },
            _ => {
                let inputs = entry
                    .inputs
                    .iter()
                    .filter(|&&tensor| self.graph().tensor(tensor).is_data())
                    .map(|&tensor| self.read_ref(tensor))
                    .collect();
                let movement = self.plan.get(out);
                let mut outputs = Vec::new();
                if movement.resident {
                    outputs.push(self.sram_ref(out));
                }
                if movement.fused_spill {
                    outputs.push(self.hbm_ref(out));
                }
                OpKind::TpcSlice {
                    node,
                    coord: coord.to_vec(),
                    inputs,
                    outputs,
                }
            }
        };
        self.push(name, op);
        if self.plan.get(out).spill {
            self.emit_spill(out);
        }
    }

    fn emit_spill(&mut self, tensor: TensorId) {
        let op = OpKind::Spill {
            source: self.sram_ref(tensor),
            target: self.hbm_ref(tensor),
        };
        self.push(self.slice_name(tensor, "spill"), op);
    }

    fn scratch_ref(&self, tensor: TensorId, partial: u32) -> SliceRef {
        self.sram_ref(tensor).at(Location::Scratch { partial })
    }

    fn emit_partial(&mut self, output: TensorId, partial: u32) {
        let op = OpKind::Spill {
            source: self.sram_ref(output),
            target: self.scratch_ref(output, partial),
        };
        let name = format!("{}.{partial}", self.slice_name(output, "partial"));
        self.push(name, op);
    }

    fn emit_reduction(&mut self, output: TensorId, partials: u32) {
        for step in reduction_tree(partials) {
            let op = OpKind::Reduce {
                lhs: self.scratch_ref(output, step.lhs),
                rhs: self.scratch_ref(output, step.rhs),
                output: self.scratch_ref(output, step.dst),
            };
            let name = format!("{}.{}", self.slice_name(output, "reduce"), step.dst);
            self.push(name, op);
        }
        let op = OpKind::Cast {
            input: self.scratch_ref(output, reduction_root(partials)),
            output: self.hbm_ref(output),
        };
        self.push(self.slice_name(output, "cast"), op);
    }

    fn finish(mut self) -> Vec<(String, OpKind)> {
        let assembled: Vec<(TensorId, u64)> = self
            .plan
            .tensors
            .iter()
            .filter(|(_, movement)| movement.spill || movement.fused_spill)
            .map(|(&tensor, _)| (tensor, self.tracks.get(&tensor).map_or(0, |t| t.count)))
            .collect();
        for (tensor, parts) in assembled {
            let name = format!("concat {}", self.graph().tensor(tensor).name);
            self.push(name, OpKind::Concat { tensor, parts });
        }
        self.ops
    }
}

/// Packs every `(root tensor, copy)` buffer referenced by `ops` and writes the addresses back.
fn place_buffers(
    ctx: &EmitContext<'_>,
    bundle: &Bundle,
    plan: &MovementPlan,
    mut ops: Vec<(String, OpKind)>,
) -> Result<(Vec<(String, OpKind)>, Vec<Placement>), PackingError> {
    let mut live: BTreeMap<BufferKey, LiveRange> = BTreeMap::new();
    for (index, (_, op)) in ops.iter().enumerate() {
        let (reads, writes) = op.accesses();
        for slice in reads.into_iter().chain(writes) {
            if let Location::Sram { copy, .. } = slice.location {
                let key = BufferKey {
                    tensor: plan.root(slice.tensor),
                    copy,
                };
                live.entry(key)
                    .and_modify(|range| range.extend(index))
                    .or_insert(LiveRange::new(index, index));
            }
        }
    }
    let requests: Vec<AllocationRequest> = live
        .iter()
        .map(|(&key, &range)| AllocationRequest {
            key,
            bytes: bundle.slicing(key.tensor).map_or(0, |slicing| {
                align_up(slicing.slice_bytes(&bundle.strategy), ctx.align)
            }),
            live: range,
        })
        .collect();
    let placements = pack(&requests, ctx.align, ctx.budget)?;
    let offsets: BTreeMap<BufferKey, u64> = placements.iter().map(|p| (p.key, p.offset)).collect();
    let base = ctx.caps.sram_base_address();
    for (_, op) in &mut ops {
        for slice in op.refs_mut() {
            if let Location::Sram { address, copy } = &mut slice.location {
                let key = BufferKey {
                    tensor: plan.root(slice.tensor),
                    copy: *copy,
                };
                *address = base + offsets.get(&key).copied().unwrap_or(0);
            }
        }
    }
    Ok((ops, placements))
}
