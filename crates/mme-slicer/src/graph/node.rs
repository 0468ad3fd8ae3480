use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::params::{ConvParams, GemmParams};
use super::{NodeId, TensorId};

/// Matrix-engine operator families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MmeKind {
    Conv,
    Dedx,
    Dedw,
    Gemm,
    BatchGemm,
    MaskedBatchGemm,
}

impl MmeKind {
    pub fn is_conv_family(self) -> bool {
        matches!(self, MmeKind::Conv | MmeKind::Dedx | MmeKind::Dedw)
    }

    pub fn input_count(self) -> usize {
        match self {
            MmeKind::MaskedBatchGemm => 4,
            _ => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MmeKind::Conv => "conv",
            MmeKind::Dedx => "dedx",
            MmeKind::Dedw => "dedw",
            MmeKind::Gemm => "gemm",
            MmeKind::BatchGemm => "batch_gemm",
            MmeKind::MaskedBatchGemm => "masked_batch_gemm",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum MmeParams {
    Conv(ConvParams),
    Gemm(GemmParams),
}

/// How a vector-engine kernel reads its inputs relative to its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TpcAccess {
    /// Every input has the output's shape; element `i` depends on element `i` only.
    Elementwise,
    /// Inputs have the output's rank; size-1 dims are broadcast.
    Broadcast,
    /// Output equals the input with `axis` reduced to size 1.
    Reduce { axis: usize },
    /// Unknown access pattern; never sliced.
    Opaque,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum NodeKind {
    Mme { kind: MmeKind, params: MmeParams },
    Tpc { kernel: String, access: TpcAccess },
    /// Shape-only reinterpretation of its single input.
    Reshape,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub inputs: SmallVec<[TensorId; 4]>,
    pub outputs: SmallVec<[TensorId; 2]>,
}

impl Node {
    pub fn mme_kind(&self) -> Option<MmeKind> {
        match &self.kind {
            NodeKind::Mme { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn conv_params(&self) -> Option<&ConvParams> {
        match &self.kind {
            NodeKind::Mme {
                params: MmeParams::Conv(params),
                ..
            } => Some(params),
            _ => None,
        }
    }

    pub fn gemm_params(&self) -> Option<GemmParams> {
        match &self.kind {
            NodeKind::Mme {
                params: MmeParams::Gemm(params),
                ..
            } => Some(*params),
            _ => None,
        }
    }

    pub fn is_mme(&self) -> bool {
        matches!(self.kind, NodeKind::Mme { .. })
    }

    pub fn is_logical(&self) -> bool {
        matches!(self.kind, NodeKind::Reshape)
    }

    /// Short kind label, `conv3d`-style for 3D convolution variants.
    pub fn kind_label(&self) -> String {
        match &self.kind {
            NodeKind::Mme { kind, params } => match params {
                MmeParams::Conv(conv) if conv.spatial_rank == 3 => format!("{}3d", kind.as_str()),
                _ => kind.as_str().to_string(),
            },
            NodeKind::Tpc { kernel, .. } => kernel.clone(),
            NodeKind::Reshape => "reshape".to_string(),
        }
    }
}
