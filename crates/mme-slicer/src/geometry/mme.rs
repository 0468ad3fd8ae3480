//! Operand-dimension roles of MME operators.
//!
//! Every MME kind is described by the same structure: a list of [`SliceAxis`] entries in
//! slicing preference order. An axis is measured on its *driver* dimension and bound to one
//! dimension of each operand it partitions, either one-to-one or through a convolution window.
//!
//! ```text
//!   conv   x=[C,W,H,N]  w=[K,C,S,R]  y=[K,W',H',N]   axes: N  H  W  K  C*
//!   dedx   dy=[K,W',H',N] w=[K,C,S,R] dx=[C,W,H,N]   axes: N  H  W  C  K*
//!   dedw   dy=[K,W',H',N] x=[C,W,H,N] dw=[K,C,S,R]   axes: K  C  N* H* W*
//!   gemm   a=[K,M] b=[N,K] out=[N,M]                 axes: M  N  K*
//!                                                    (* = common / reduced)
//! ```

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::conv::{AxisWindow, ConvAxis};
use crate::config::SlicerConfig;
use crate::error::{Result, SlicerError};
use crate::graph::{
    ConvParams, DType, Dims, GemmParams, Graph, MmeKind, MmeParams, NodeId, NodeKind, TensorId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperandRole {
    A,
    B,
    MaskA,
    MaskB,
    Output,
}

impl OperandRole {
    pub fn inputs(kind: MmeKind) -> &'static [OperandRole] {
        match kind {
            MmeKind::MaskedBatchGemm => &[
                OperandRole::A,
                OperandRole::B,
                OperandRole::MaskA,
                OperandRole::MaskB,
            ],
            _ => &[OperandRole::A, OperandRole::B],
        }
    }

    pub fn is_input(self) -> bool {
        self != OperandRole::Output
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisRole {
    Batch,
    Spatial,
    /// Non-common dim of operand A (rows of the output).
    Wide,
    /// Non-common dim of operand B (output channels).
    Narrow,
    /// Reduced dim; slicing it produces partial sums.
    Common,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DimMapping {
    Identity,
    /// Driver range is an output range; the bound dim is the convolution input.
    Forward { axis: ConvAxis },
    /// Driver range is an input-gradient range; the bound dim is the output gradient.
    Transposed { axis: ConvAxis },
}

impl DimMapping {
    pub fn window(&self, start: u64, len: u64, extent: u64) -> AxisWindow {
        match self {
            DimMapping::Identity => AxisWindow::plain(start, len),
            DimMapping::Forward { axis } => axis.forward_window(start, len, extent),
            DimMapping::Transposed { axis } => axis.transposed_window(start, len, extent),
        }
    }

    pub fn conv_axis(&self) -> Option<&ConvAxis> {
        match self {
            DimMapping::Identity => None,
            DimMapping::Forward { axis } | DimMapping::Transposed { axis } => Some(axis),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisBinding {
    pub operand: OperandRole,
    pub dim: usize,
    pub mapping: DimMapping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceAxis {
    pub role: AxisRole,
    pub label: String,
    pub extent: u64,
    pub driver: OperandRole,
    pub driver_dim: usize,
    /// Spatial index (`0 = W`) for spatial axes of convolutions.
    pub spatial: Option<usize>,
    /// Whether the solver may partition this axis.
    pub enabled: bool,
    pub bindings: SmallVec<[AxisBinding; 5]>,
}

impl SliceAxis {
    pub fn binding(&self, role: OperandRole) -> Option<&AxisBinding> {
        self.bindings.iter().find(|binding| binding.operand == role)
    }

    pub fn is_common(&self) -> bool {
        self.role == AxisRole::Common
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmeOperand {
    pub role: OperandRole,
    pub tensor: TensorId,
    pub dtype: DType,
    pub dims: Dims,
}

/// Which shape the geometry is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeSource {
    /// Declared maximum; used for planning.
    Max,
    /// Actual launch shape when supplied, maximum otherwise.
    Launch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmeGeometry {
    pub node: NodeId,
    pub kind: MmeKind,
    pub operands: Vec<MmeOperand>,
    pub axes: Vec<SliceAxis>,
    /// Convolution parameters per spatial axis, padding resolved against the input extent.
    pub conv_axes: SmallVec<[ConvAxis; 3]>,
}

fn spatial_label(spatial: usize) -> &'static str {
    match spatial {
        0 => "W",
        1 => "H",
        _ => "D",
    }
}

fn bind(operand: OperandRole, dim: usize, mapping: DimMapping) -> AxisBinding {
    AxisBinding {
        operand,
        dim,
        mapping,
    }
}

impl MmeGeometry {
    /// Geometry of `node`, or `None` when it is not an MME operator.
    pub fn build(
        graph: &Graph,
        node: NodeId,
        source: ShapeSource,
        config: &SlicerConfig,
    ) -> Option<Self> {
        let entry = graph.node(node);
        let NodeKind::Mme { kind, params } = &entry.kind else {
            return None;
        };
        let mut operands: Vec<MmeOperand> = OperandRole::inputs(*kind)
            .iter()
            .zip(entry.inputs.iter())
            .map(|(role, tensor)| operand(graph, *role, *tensor, source))
            .collect();
        operands.push(operand(graph, OperandRole::Output, *entry.outputs.first()?, source));
        let mut geometry = MmeGeometry {
            node,
            kind: *kind,
            operands,
            axes: Vec::new(),
            conv_axes: SmallVec::new(),
        };
        match params {
            MmeParams::Conv(conv) => geometry.add_conv_axes(conv, config),
            MmeParams::Gemm(gemm) => geometry.add_gemm_axes(*gemm, config),
        }
        Some(geometry)
    }

    pub fn operand(&self, role: OperandRole) -> Option<&MmeOperand> {
        self.operands.iter().find(|op| op.role == role)
    }

    /// Size of `dim` of `role`; dims past the rank (or missing operands) read as 1.
    pub fn dim(&self, role: OperandRole, dim: usize) -> u64 {
        self.operand(role)
            .and_then(|op| op.dims.get(dim).copied())
            .unwrap_or(1)
    }

    pub fn output_dtype(&self) -> DType {
        self.operand(OperandRole::Output)
            .map(|op| op.dtype)
            .unwrap_or(DType::F32)
    }

    pub fn input_dtype(&self) -> DType {
        self.operand(OperandRole::A)
            .map(|op| op.dtype)
            .unwrap_or(DType::F32)
    }

    /// Number of products summed into one output element.
    pub fn reduced_elements(&self) -> u64 {
        let taps: u64 = match self.kind {
            MmeKind::Conv | MmeKind::Dedx => self.conv_axes.iter().map(|axis| axis.kernel).product(),
            _ => 1,
        };
        let common: u64 = self
            .axes
            .iter()
            .filter(|axis| axis.is_common())
            .map(|axis| axis.extent)
            .product();
        taps * common
    }

    /// Per-dimension windows of `role` when every axis `i` covers `ranges[i] = (start, len)`.
    pub fn operand_windows(
        &self,
        role: OperandRole,
        ranges: &[(u64, u64)],
    ) -> SmallVec<[AxisWindow; 5]> {
        let Some(op) = self.operand(role) else {
            return SmallVec::new();
        };
        let mut windows: SmallVec<[AxisWindow; 5]> =
            op.dims.iter().map(|&dim| AxisWindow::plain(0, dim)).collect();
        for (axis, &(start, len)) in self.axes.iter().zip(ranges) {
            if let Some(binding) = axis.binding(role) {
                windows[binding.dim] = binding.mapping.window(start, len, op.dims[binding.dim]);
            }
        }
        windows
    }

    /// Window (with padding) of every convolution spatial axis for the given axis ranges.
    pub fn conv_windows(&self, ranges: &[(u64, u64)]) -> SmallVec<[AxisWindow; 3]> {
        let mut windows = SmallVec::new();
        for spatial in 0..self.conv_axes.len() {
            let found = self.axes.iter().zip(ranges).find_map(|(axis, &(start, len))| {
                if axis.spatial != Some(spatial) {
                    return None;
                }
                axis.bindings.iter().find_map(|binding| {
                    binding.mapping.conv_axis().map(|_| {
                        let extent = self.dim(binding.operand, binding.dim);
                        binding.mapping.window(start, len, extent)
                    })
                })
            });
            if let Some(window) = found {
                windows.push(window);
            }
        }
        windows
    }

    fn push_axis(
        &mut self,
        role: AxisRole,
        label: &str,
        driver: (OperandRole, usize),
        spatial: Option<usize>,
        enabled: bool,
        bindings: &[AxisBinding],
    ) {
        let extent = self.dim(driver.0, driver.1);
        // A binding only partitions operands whose dim matches the driver; broadcast dims of
        // size 1 stay whole.
        let bindings = bindings
            .iter()
            .filter(|binding| {
                self.operand(binding.operand)
                    .is_some_and(|op| binding.dim < op.dims.len())
            })
            .filter(|binding| match binding.mapping {
                DimMapping::Identity => self.dim(binding.operand, binding.dim) == extent,
                _ => true,
            })
            .copied()
            .collect();
        self.axes.push(SliceAxis {
            role,
            label: label.to_string(),
            extent,
            driver: driver.0,
            driver_dim: driver.1,
            spatial,
            enabled: enabled && extent > 1,
            bindings,
        });
    }

    fn add_conv_axes(&mut self, conv: &ConvParams, config: &SlicerConfig) {
        use DimMapping::Identity;
        use OperandRole::{Output, A, B};

        let r = conv.spatial_rank;
        let batch = r + 1;
        let input_role = match self.kind {
            MmeKind::Conv => A,
            MmeKind::Dedx => Output,
            _ => B,
        };
        self.conv_axes = (0..r)
            .map(|s| conv.axis(s, self.dim(input_role, 1 + s)))
            .collect();
        let spatial_enabled = match self.kind {
            MmeKind::Conv => config.conv_spatial_slicing,
            MmeKind::Dedx => config.dedx_spatial_slicing,
            _ => config.dedw_spatial_slicing,
        };
        let axes = self.conv_axes.clone();
        match self.kind {
            MmeKind::Conv => {
                self.push_axis(
                    AxisRole::Batch,
                    "N",
                    (Output, batch),
                    None,
                    true,
                    &[bind(Output, batch, Identity), bind(A, batch, Identity)],
                );
                for s in (0..r).rev() {
                    let axis = axes[s];
                    self.push_axis(
                        AxisRole::Spatial,
                        spatial_label(s),
                        (Output, 1 + s),
                        Some(s),
                        spatial_enabled && axis.spatially_sliceable(),
                        &[
                            bind(Output, 1 + s, Identity),
                            bind(A, 1 + s, DimMapping::Forward { axis }),
                        ],
                    );
                }
                self.push_axis(
                    AxisRole::Narrow,
                    "K",
                    (Output, 0),
                    None,
                    true,
                    &[bind(Output, 0, Identity), bind(B, 0, Identity)],
                );
                self.push_axis(
                    AxisRole::Common,
                    "C",
                    (A, 0),
                    None,
                    true,
                    &[bind(A, 0, Identity), bind(B, 1, Identity)],
                );
            }
            MmeKind::Dedx => {
                self.push_axis(
                    AxisRole::Batch,
                    "N",
                    (Output, batch),
                    None,
                    true,
                    &[bind(Output, batch, Identity), bind(A, batch, Identity)],
                );
                for s in (0..r).rev() {
                    let axis = axes[s];
                    self.push_axis(
                        AxisRole::Spatial,
                        spatial_label(s),
                        (Output, 1 + s),
                        Some(s),
                        spatial_enabled && axis.spatially_sliceable(),
                        &[
                            bind(Output, 1 + s, Identity),
                            bind(A, 1 + s, DimMapping::Transposed { axis }),
                        ],
                    );
                }
                self.push_axis(
                    AxisRole::Narrow,
                    "C",
                    (Output, 0),
                    None,
                    true,
                    &[bind(Output, 0, Identity), bind(B, 1, Identity)],
                );
                self.push_axis(
                    AxisRole::Common,
                    "K",
                    (A, 0),
                    None,
                    true,
                    &[bind(A, 0, Identity), bind(B, 0, Identity)],
                );
            }
            _ => {
                self.push_axis(
                    AxisRole::Wide,
                    "K",
                    (Output, 0),
                    None,
                    true,
                    &[bind(Output, 0, Identity), bind(A, 0, Identity)],
                );
                self.push_axis(
                    AxisRole::Narrow,
                    "C",
                    (Output, 1),
                    None,
                    true,
                    &[bind(Output, 1, Identity), bind(B, 0, Identity)],
                );
                self.push_axis(
                    AxisRole::Common,
                    "N",
                    (A, batch),
                    None,
                    true,
                    &[bind(A, batch, Identity), bind(B, batch, Identity)],
                );
                for s in (0..r).rev() {
                    let axis = axes[s];
                    self.push_axis(
                        AxisRole::Common,
                        spatial_label(s),
                        (A, 1 + s),
                        Some(s),
                        spatial_enabled && axis.spatially_sliceable(),
                        &[
                            bind(A, 1 + s, Identity),
                            bind(B, 1 + s, DimMapping::Forward { axis }),
                        ],
                    );
                }
            }
        }
    }

    fn add_gemm_axes(&mut self, gemm: GemmParams, config: &SlicerConfig) {
        use DimMapping::Identity;
        use OperandRole::{MaskA, MaskB, Output, A, B};

        let a_k = usize::from(gemm.transpose_a);
        let a_m = 1 - a_k;
        let b_n = usize::from(gemm.transpose_b);
        let b_k = 1 - b_n;
        if self.kind != MmeKind::Gemm {
            let rank = self.operand(Output).map(|op| op.dims.len()).unwrap_or(2);
            for dim in (2..rank).rev() {
                let label = if self.kind == MmeKind::MaskedBatchGemm && dim == 3 {
                    "EB".to_string()
                } else {
                    format!("B{}", dim - 2)
                };
                self.push_axis(
                    AxisRole::Batch,
                    &label,
                    (Output, dim),
                    None,
                    true,
                    &[
                        bind(Output, dim, Identity),
                        bind(A, dim, Identity),
                        bind(B, dim, Identity),
                        bind(MaskA, dim, Identity),
                        bind(MaskB, dim, Identity),
                    ],
                );
            }
        }
        self.push_axis(
            AxisRole::Wide,
            "M",
            (Output, 1),
            None,
            true,
            &[
                bind(Output, 1, Identity),
                bind(A, a_m, Identity),
                bind(MaskA, a_m, Identity),
            ],
        );
        self.push_axis(
            AxisRole::Narrow,
            "N",
            (Output, 0),
            None,
            true,
            &[
                bind(Output, 0, Identity),
                bind(B, b_n, Identity),
                bind(MaskB, b_n, Identity),
            ],
        );
        if self.kind != MmeKind::MaskedBatchGemm {
            self.push_axis(
                AxisRole::Common,
                "K",
                (A, a_k),
                None,
                config.gemm_common_dim_slicing,
                &[bind(A, a_k, Identity), bind(B, b_k, Identity)],
            );
        }
    }
}

fn operand(graph: &Graph, role: OperandRole, tensor: TensorId, source: ShapeSource) -> MmeOperand {
    let entry = graph.tensor(tensor);
    let dims = match source {
        ShapeSource::Max => entry.shape.max(),
        ShapeSource::Launch => entry.launch_dims(),
    };
    MmeOperand {
        role,
        tensor,
        dtype: entry.dtype,
        dims: Dims::from_slice(dims),
    }
}

/// Leading `rank` dims of `dims`; any further dims must be 1.
fn logical<'a>(node: &str, name: &str, dims: &'a [u64], rank: usize) -> Result<&'a [u64]> {
    if dims.len() < rank || dims[rank..].iter().any(|&d| d != 1) {
        return Err(SlicerError::OperandMismatch {
            node: node.to_string(),
            message: format!("operand `{name}` {dims:?} is not a rank-{rank} tensor"),
        });
    }
    Ok(&dims[..rank])
}

fn dim_or_one(dims: &[u64], dim: usize) -> u64 {
    dims.get(dim).copied().unwrap_or(1)
}

/// Checks operand shapes of an MME node at their maximum extents.
pub fn validate_operands(
    graph: &Graph,
    node: &str,
    kind: MmeKind,
    params: &MmeParams,
    inputs: &[TensorId],
    output: TensorId,
) -> Result<()> {
    let mismatch = |message: String| SlicerError::OperandMismatch {
        node: node.to_string(),
        message,
    };
    let tensor = |id: TensorId| graph.tensor(id);
    match params {
        MmeParams::Conv(conv) => {
            let r = conv.spatial_rank;
            let groups = u64::from(conv.groups);
            let (a, b, out) = (tensor(inputs[0]), tensor(inputs[1]), tensor(output));
            let a_dims = logical(node, &a.name, a.shape.max(), r + 2)?;
            let b_dims = logical(node, &b.name, b.shape.max(), r + 2)?;
            let out_dims = logical(node, &out.name, out.shape.max(), r + 2)?;
            // (activation input, weights, activation output) in forward terms.
            let (x, w, y) = match kind {
                MmeKind::Conv => (a_dims, b_dims, out_dims),
                MmeKind::Dedx => (out_dims, b_dims, a_dims),
                _ => (b_dims, out_dims, a_dims),
            };
            if w[1] * groups != x[0] || w[0] != y[0] || w[0] % groups != 0 {
                return Err(mismatch(format!(
                    "channels of x {x:?}, w {w:?}, y {y:?} disagree (groups {groups})"
                )));
            }
            if x[r + 1] != y[r + 1] {
                return Err(mismatch(format!("batch of x {x:?} and y {y:?} disagree")));
            }
            for s in 0..r {
                if w[2 + s] != u64::from(conv.kernel[s]) {
                    return Err(mismatch(format!(
                        "weights {w:?} do not match kernel {:?}",
                        &conv.kernel[..r]
                    )));
                }
                let expected = conv.axis(s, x[1 + s]).output_size(x[1 + s]);
                if y[1 + s] != expected {
                    return Err(mismatch(format!(
                        "spatial dim {s}: output extent {} but input {} yields {expected}",
                        y[1 + s],
                        x[1 + s]
                    )));
                }
            }
        }
        MmeParams::Gemm(gemm) => {
            let a_k = usize::from(gemm.transpose_a);
            let a_m = 1 - a_k;
            let b_n = usize::from(gemm.transpose_b);
            let b_k = 1 - b_n;
            let (a, b, out) = (tensor(inputs[0]), tensor(inputs[1]), tensor(output));
            let (a_dims, b_dims, out_dims) = (a.shape.max(), b.shape.max(), out.shape.max());
            if kind == MmeKind::Gemm {
                logical(node, &a.name, a_dims, 2)?;
                logical(node, &b.name, b_dims, 2)?;
                logical(node, &out.name, out_dims, 2)?;
            } else if a_dims.len() < 2 || b_dims.len() < 2 || out_dims.len() < 3 {
                return Err(mismatch(format!(
                    "batch gemm needs batch dims: a {a_dims:?}, b {b_dims:?}, out {out_dims:?}"
                )));
            }
            let k = dim_or_one(a_dims, a_k);
            if dim_or_one(b_dims, b_k) != k {
                return Err(mismatch(format!(
                    "common dims of a {a_dims:?} and b {b_dims:?} disagree"
                )));
            }
            let m = dim_or_one(a_dims, a_m);
            let n = dim_or_one(b_dims, b_n);
            if out_dims[0] != n || out_dims[1] != m {
                return Err(mismatch(format!(
                    "output {out_dims:?} does not match [{n}, {m}]"
                )));
            }
            let rank = out_dims.len().max(a_dims.len()).max(b_dims.len());
            for dim in 2..rank {
                let (da, db, dout) = (
                    dim_or_one(a_dims, dim),
                    dim_or_one(b_dims, dim),
                    dim_or_one(out_dims, dim),
                );
                let broadcast_ok = (da == db || da == 1 || db == 1) && dout == da.max(db);
                if !broadcast_ok {
                    return Err(mismatch(format!(
                        "batch dim {dim}: a {da}, b {db} cannot produce {dout}"
                    )));
                }
            }
            if kind == MmeKind::MaskedBatchGemm {
                validate_masks(graph, node, *gemm, inputs, output)?;
            }
        }
    }
    Ok(())
}

fn validate_masks(
    graph: &Graph,
    node: &str,
    gemm: GemmParams,
    inputs: &[TensorId],
    output: TensorId,
) -> Result<()> {
    let mismatch = |message: String| SlicerError::OperandMismatch {
        node: node.to_string(),
        message,
    };
    for &id in inputs.iter().chain(std::iter::once(&output)) {
        let entry = graph.tensor(id);
        if entry.shape.is_dynamic() {
            return Err(mismatch(format!(
                "masked batch gemm does not support dynamic shapes (`{}`)",
                entry.name
            )));
        }
        if entry.shape.rank() != 4 {
            return Err(mismatch(format!(
                "masked batch gemm operands are rank 4, `{}` has rank {}",
                entry.name,
                entry.shape.rank()
            )));
        }
    }
    let dims = |id: TensorId| graph.tensor(id).shape.max();
    let (a, b, mask_a, mask_b, out) = (
        dims(inputs[0]),
        dims(inputs[1]),
        dims(inputs[2]),
        dims(inputs[3]),
        dims(output),
    );
    let a_k = usize::from(gemm.transpose_a);
    let b_n = usize::from(gemm.transpose_b);
    if mask_a[a_k] != mask_b[1 - b_n] {
        return Err(mismatch(format!(
            "mask common dims of {mask_a:?} and {mask_b:?} disagree"
        )));
    }
    if mask_a[1 - a_k] != a[1 - a_k] || mask_b[b_n] != b[b_n] {
        return Err(mismatch(format!(
            "masks {mask_a:?}/{mask_b:?} do not match operand non-common dims"
        )));
    }
    for mask in [mask_a, mask_b] {
        if mask[3] != out[3] {
            return Err(mismatch(format!(
                "mask external batch {} differs from output {}",
                mask[3], out[3]
            )));
        }
        if mask[2] != out[2] && mask[2] != 1 {
            return Err(mismatch(format!(
                "mask internal batch {} neither matches {} nor broadcasts",
                mask[2], out[2]
            )));
        }
    }
    Ok(())
}
