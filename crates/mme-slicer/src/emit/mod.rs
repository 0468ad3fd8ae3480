//! The emitted artifact: an ordered op list with SRAM addresses and dependencies.
//!
//! ```text
//!   ops[0]  node      conv0                  deps []
//!   ops[1]  fill      x[0..64, .., 0..39]    deps [0]        -> sram 0x7ff0000000 copy 0
//!   ops[2]  mme       conv1 (0,0,0,0,0)      deps [1]
//!   ops[3]  spill     y[.., 0..39]           deps [2]
//!   ...
//!   ops[n]  concat    y (7 parts)            deps [..]
//! ```
//!
//! Untouched operators appear as `node` ops. A bundle contributes its per-slice ops in walk
//! order followed by one `concat` per tensor assembled in HBM.

mod bundle;
pub mod deps;
mod schedule;

use serde::{Deserialize, Serialize};

use crate::bundle::StitchedNode;
use crate::error::Result;
use crate::geometry::AxisWindow;
use crate::graph::{DType, Graph, NodeId, TensorId};
use crate::hashing::Fingerprint;
use crate::memory::TensorMovement;
use crate::pass::PassStats;
use crate::slicing::{resolve_launch, AxisSlicing, LaunchPlan, ReductionPolicy, SlicingStrategy};

pub use bundle::DemotionReason;
pub(crate) use bundle::{emit_bundle, BundleOps, EmitContext};
pub(crate) use schedule::{order_units, Unit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Location {
    Hbm,
    Sram { address: u64, copy: u32 },
    /// Off-chip f32 partial sum `partial` of the referenced window.
    Scratch { partial: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub start: u64,
    pub len: u64,
}

impl Region {
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// A window of a tensor at a location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SliceRef {
    pub tensor: TensorId,
    pub dtype: DType,
    pub region: Vec<Region>,
    pub location: Location,
}

impl SliceRef {
    pub fn new(tensor: TensorId, dtype: DType, windows: &[AxisWindow], location: Location) -> Self {
        Self {
            tensor,
            dtype,
            region: windows
                .iter()
                .map(|w| Region {
                    start: w.start,
                    len: w.len,
                })
                .collect(),
            location,
        }
    }

    pub fn elements(&self) -> u64 {
        self.region.iter().map(|r| r.len).product()
    }

    pub fn bytes(&self) -> u64 {
        self.elements() * self.dtype.size_in_bytes()
    }

    pub fn at(&self, location: Location) -> Self {
        Self {
            location,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpKind {
    /// An operator executed unchanged.
    Node { node: NodeId },
    MmeSlice {
        node: NodeId,
        coord: Vec<u64>,
        /// Operands in role order `A, B[, maskA, maskB]`.
        inputs: Vec<SliceRef>,
        output: SliceRef,
        /// Window and padding per convolution spatial axis (`0 = W`).
        conv: Vec<AxisWindow>,
        /// Add into the existing contents of `output`.
        accumulate: bool,
    },
    TpcSlice {
        node: NodeId,
        coord: Vec<u64>,
        inputs: Vec<SliceRef>,
        outputs: Vec<SliceRef>,
    },
    /// Reshape of an SRAM-resident slice; both refs share the buffer.
    Reinterpret {
        node: NodeId,
        coord: Vec<u64>,
        input: SliceRef,
        output: SliceRef,
    },
    Fill { source: SliceRef, target: SliceRef },
    Spill { source: SliceRef, target: SliceRef },
    Reduce {
        lhs: SliceRef,
        rhs: SliceRef,
        output: SliceRef,
    },
    Cast { input: SliceRef, output: SliceRef },
    /// All windows of `tensor` are in HBM.
    Concat { tensor: TensorId, parts: u64 },
}

impl OpKind {
    pub fn label(&self) -> &'static str {
        match self {
            OpKind::Node { .. } => "node",
            OpKind::MmeSlice { .. } => "mme",
            OpKind::TpcSlice { .. } => "tpc",
            OpKind::Reinterpret { .. } => "reinterpret",
            OpKind::Fill { .. } => "fill",
            OpKind::Spill { .. } => "spill",
            OpKind::Reduce { .. } => "reduce",
            OpKind::Cast { .. } => "cast",
            OpKind::Concat { .. } => "concat",
        }
    }

    /// Slice references read and written by the op.
    pub fn accesses(&self) -> (Vec<&SliceRef>, Vec<&SliceRef>) {
        match self {
            OpKind::Node { .. } | OpKind::Concat { .. } => (Vec::new(), Vec::new()),
            OpKind::MmeSlice {
                inputs,
                output,
                accumulate,
                ..
            } => {
                let mut reads: Vec<&SliceRef> = inputs.iter().collect();
                if *accumulate {
                    reads.push(output);
                }
                (reads, vec![output])
            }
            OpKind::TpcSlice {
                inputs, outputs, ..
            } => (inputs.iter().collect(), outputs.iter().collect()),
            OpKind::Reinterpret { input, output, .. } => (vec![input], vec![output]),
            OpKind::Fill { source, target } | OpKind::Spill { source, target } => {
                (vec![source], vec![target])
            }
            OpKind::Reduce { lhs, rhs, output } => (vec![lhs, rhs], vec![output]),
            OpKind::Cast { input, output } => (vec![input], vec![output]),
        }
    }

    pub(crate) fn refs_mut(&mut self) -> Vec<&mut SliceRef> {
        match self {
            OpKind::Node { .. } | OpKind::Concat { .. } => Vec::new(),
            OpKind::MmeSlice { inputs, output, .. } => {
                inputs.iter_mut().chain(std::iter::once(output)).collect()
            }
            OpKind::TpcSlice {
                inputs, outputs, ..
            } => inputs.iter_mut().chain(outputs.iter_mut()).collect(),
            OpKind::Reinterpret { input, output, .. } => vec![input, output],
            OpKind::Fill { source, target } | OpKind::Spill { source, target } => {
                vec![source, target]
            }
            OpKind::Reduce { lhs, rhs, output } => vec![lhs, rhs, output],
            OpKind::Cast { input, output } => vec![input, output],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmittedOp {
    pub index: usize,
    pub name: String,
    pub bundle: Option<u32>,
    #[serde(flatten)]
    pub kind: OpKind,
    /// Indices of earlier ops that must finish first.
    pub deps: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SramAllocation {
    pub tensor: TensorId,
    pub copy: u32,
    pub address: u64,
    pub bytes: u64,
    /// Program op indices of the first and last access.
    pub first_op: usize,
    pub last_op: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSummary {
    pub id: u32,
    pub anchor: NodeId,
    pub anchor_name: String,
    pub stitched: Vec<StitchedNode>,
    pub axes: Vec<AxisSlicing>,
    pub reduction: Option<ReductionPolicy>,
    pub strategy: SlicingStrategy,
    pub movement: Vec<(TensorId, TensorMovement)>,
    pub allocations: Vec<SramAllocation>,
    /// Highest SRAM byte used, relative to the SRAM base.
    pub peak_bytes: u64,
    pub ops: (usize, usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlicedProgram {
    pub device: String,
    pub sram_budget: u64,
    pub ops: Vec<EmittedOp>,
    pub bundles: Vec<BundleSummary>,
    pub stats: PassStats,
    /// FNV-1a of the program serialized with this field at zero.
    pub fingerprint: u64,
}

impl SlicedProgram {
    pub(crate) fn seal(&mut self) -> Result<()> {
        self.fingerprint = 0;
        let bytes = serde_json::to_vec(self)?;
        let mut hash = Fingerprint::new();
        hash.write_bytes(&bytes);
        self.fingerprint = hash.finish();
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn bundle_of(&self, node: NodeId) -> Option<&BundleSummary> {
        self.bundles
            .iter()
            .find(|bundle| bundle.anchor == node || bundle.stitched.iter().any(|s| s.node == node))
    }

    pub fn count(&self, label: &str) -> usize {
        self.ops.iter().filter(|op| op.kind.label() == label).count()
    }

    /// Actual per-slice extents of every bundle for the launch shapes recorded in `graph`.
    pub fn launch_plans(&self, graph: &Graph) -> Result<Vec<LaunchPlan>> {
        self.bundles
            .iter()
            .map(|bundle| resolve_launch(graph, &bundle.strategy))
            .collect()
    }

    /// One line per bundle plus the pass statistics.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "device {} budget {} bytes, {} ops, fingerprint {:016x}",
            self.device,
            self.sram_budget,
            self.ops.len(),
            self.fingerprint
        )];
        for bundle in &self.bundles {
            let axes: Vec<String> = bundle
                .axes
                .iter()
                .filter(|axis| axis.slices > 1)
                .map(|axis| format!("{}={}x{}", axis.label, axis.slices, axis.chunk))
                .collect();
            lines.push(format!(
                "bundle {} `{}`: {} (+{} stitched), peak {} bytes",
                bundle.id,
                bundle.anchor_name,
                axes.join(" "),
                bundle.stitched.len(),
                bundle.peak_bytes
            ));
        }
        lines.push(format!("{}", self.stats));
        lines.join("\n")
    }
}
