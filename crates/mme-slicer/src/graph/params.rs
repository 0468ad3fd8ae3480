//! Fixed-size binary parameter blocks.
//!
//! Convolution blocks are packed little-endian `u32` fields:
//!
//! ```text
//! 2D (48 bytes): kw kh sw sh pad_l pad_r pad_t pad_b dw dh groups padding_type
//! 3D (68 bytes): kw kh kd sw sh sd pad_l pad_r pad_t pad_b pad_f pad_bk dw dh dd groups padding_type
//! ```
//!
//! GEMM-family blocks are two bytes: `transpose_a`, `transpose_b`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SlicerError};
use crate::geometry::conv::ConvAxis;

pub const CONV2D_BLOCK_BYTES: usize = 12 * 4;
pub const CONV3D_BLOCK_BYTES: usize = 17 * 4;
pub const GEMM_BLOCK_BYTES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingType {
    Explicit,
    /// Output spatial size is `ceil(input / stride)`; padding follows from the input size.
    Same,
}

/// Convolution parameters, indexed by spatial axis (`0 = W`, `1 = H`, `2 = D`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvParams {
    pub spatial_rank: usize,
    pub kernel: [u32; 3],
    pub stride: [u32; 3],
    pub dilation: [u32; 3],
    pub pad_before: [u32; 3],
    pub pad_after: [u32; 3],
    pub groups: u32,
    pub padding: PaddingType,
}

impl ConvParams {
    /// 2D parameters; `pads` is `[left, right, top, bottom]`.
    pub fn conv2d(kernel: [u32; 2], stride: [u32; 2], dilation: [u32; 2], pads: [u32; 4]) -> Self {
        Self {
            spatial_rank: 2,
            kernel: [kernel[0], kernel[1], 1],
            stride: [stride[0], stride[1], 1],
            dilation: [dilation[0], dilation[1], 1],
            pad_before: [pads[0], pads[2], 0],
            pad_after: [pads[1], pads[3], 0],
            groups: 1,
            padding: PaddingType::Explicit,
        }
    }

    /// 3D parameters; `pads` is `[left, right, top, bottom, front, back]`.
    pub fn conv3d(kernel: [u32; 3], stride: [u32; 3], dilation: [u32; 3], pads: [u32; 6]) -> Self {
        Self {
            spatial_rank: 3,
            kernel,
            stride,
            dilation,
            pad_before: [pads[0], pads[2], pads[4]],
            pad_after: [pads[1], pads[3], pads[5]],
            groups: 1,
            padding: PaddingType::Explicit,
        }
    }

    pub fn with_same_padding(mut self) -> Self {
        self.padding = PaddingType::Same;
        self
    }

    pub fn with_groups(mut self, groups: u32) -> Self {
        self.groups = groups;
        self
    }

    /// Per-axis parameters with padding taken verbatim from the block.
    pub fn declared_axis(&self, axis: usize) -> ConvAxis {
        ConvAxis {
            kernel: u64::from(self.kernel[axis]),
            stride: u64::from(self.stride[axis]),
            dilation: u64::from(self.dilation[axis]),
            pad_before: u64::from(self.pad_before[axis]),
            pad_after: u64::from(self.pad_after[axis]),
        }
    }

    /// Per-axis parameters resolved against the input extent of that axis.
    pub fn axis(&self, axis: usize, input_extent: u64) -> ConvAxis {
        let declared = self.declared_axis(axis);
        match self.padding {
            PaddingType::Explicit => declared,
            PaddingType::Same => declared.with_same_padding(input_extent),
        }
    }

    pub fn decode(node: &str, block: &[u8]) -> Result<Self> {
        let spatial_rank = match block.len() {
            CONV2D_BLOCK_BYTES => 2,
            CONV3D_BLOCK_BYTES => 3,
            actual => {
                return Err(SlicerError::ParamBlockSize {
                    node: node.to_string(),
                    kind: "convolution",
                    expected: format!("{CONV2D_BLOCK_BYTES} or {CONV3D_BLOCK_BYTES}"),
                    actual,
                })
            }
        };
        let fields: Vec<u32> = block
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        let r = spatial_rank;
        let mut params = ConvParams {
            spatial_rank,
            kernel: [1; 3],
            stride: [1; 3],
            dilation: [1; 3],
            pad_before: [0; 3],
            pad_after: [0; 3],
            groups: fields[5 * r],
            padding: PaddingType::Explicit,
        };
        for axis in 0..r {
            params.kernel[axis] = fields[axis];
            params.stride[axis] = fields[r + axis];
            params.pad_before[axis] = fields[2 * r + 2 * axis];
            params.pad_after[axis] = fields[2 * r + 2 * axis + 1];
            params.dilation[axis] = fields[4 * r + axis];
        }
        params.padding = match fields[5 * r + 1] {
            0 => PaddingType::Explicit,
            1 => PaddingType::Same,
            value => {
                return Err(SlicerError::InvalidParam {
                    node: node.to_string(),
                    field: "padding_type",
                    value,
                })
            }
        };
        params.validate(node)?;
        Ok(params)
    }

    pub fn encode(&self) -> Vec<u8> {
        let r = self.spatial_rank;
        let mut fields = Vec::with_capacity(5 * r + 2);
        fields.extend_from_slice(&self.kernel[..r]);
        fields.extend_from_slice(&self.stride[..r]);
        for axis in 0..r {
            fields.push(self.pad_before[axis]);
            fields.push(self.pad_after[axis]);
        }
        fields.extend_from_slice(&self.dilation[..r]);
        fields.push(self.groups);
        fields.push(match self.padding {
            PaddingType::Explicit => 0,
            PaddingType::Same => 1,
        });
        fields.iter().flat_map(|field| field.to_le_bytes()).collect()
    }

    fn validate(&self, node: &str) -> Result<()> {
        let invalid = |field: &'static str, value: u32| SlicerError::InvalidParam {
            node: node.to_string(),
            field,
            value,
        };
        for axis in 0..self.spatial_rank {
            if self.kernel[axis] == 0 {
                return Err(invalid("kernel", 0));
            }
            if self.stride[axis] == 0 {
                return Err(invalid("stride", 0));
            }
            if self.dilation[axis] == 0 {
                return Err(invalid("dilation", 0));
            }
        }
        if self.groups == 0 {
            return Err(invalid("groups", 0));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GemmParams {
    pub transpose_a: bool,
    pub transpose_b: bool,
}

impl GemmParams {
    pub fn new(transpose_a: bool, transpose_b: bool) -> Self {
        Self {
            transpose_a,
            transpose_b,
        }
    }

    pub fn decode(node: &str, block: &[u8]) -> Result<Self> {
        let [a, b] = block else {
            return Err(SlicerError::ParamBlockSize {
                node: node.to_string(),
                kind: "gemm",
                expected: GEMM_BLOCK_BYTES.to_string(),
                actual: block.len(),
            });
        };
        let flag = |field: &'static str, value: u8| match value {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(SlicerError::InvalidParam {
                node: node.to_string(),
                field,
                value: u32::from(other),
            }),
        };
        Ok(Self {
            transpose_a: flag("transpose_a", *a)?,
            transpose_b: flag("transpose_b", *b)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        vec![u8::from(self.transpose_a), u8::from(self.transpose_b)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv2d_block_layout() {
        let params = ConvParams::conv2d([3, 5], [1, 2], [1, 1], [1, 1, 2, 2]);
        let block = params.encode();
        assert_eq!(block.len(), CONV2D_BLOCK_BYTES);
        let kernel_h = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
        assert_eq!(kernel_h, 5);
        let pad_top = u32::from_le_bytes([block[24], block[25], block[26], block[27]]);
        assert_eq!(pad_top, 2);
        assert_eq!(ConvParams::decode("conv", &block).expect("decode"), params);
    }

    #[test]
    fn conv3d_block_decodes_depth_axis() {
        let params =
            ConvParams::conv3d([3, 3, 2], [1, 1, 2], [1, 1, 1], [1, 1, 1, 1, 0, 1]).with_same_padding();
        let decoded = ConvParams::decode("conv3d", &params.encode()).expect("decode");
        assert_eq!(decoded.spatial_rank, 3);
        assert_eq!(decoded.kernel[2], 2);
        assert_eq!(decoded.pad_after[2], 1);
        assert_eq!(decoded.padding, PaddingType::Same);
    }

    #[test]
    fn wrong_block_size_is_fatal() {
        let err = ConvParams::decode("conv", &[0u8; 40]).expect_err("bad size");
        assert!(matches!(err, SlicerError::ParamBlockSize { actual: 40, .. }));
        let err = GemmParams::decode("gemm", &[0u8; 3]).expect_err("bad size");
        assert!(matches!(err, SlicerError::ParamBlockSize { actual: 3, .. }));
    }

    #[test]
    fn zero_stride_is_rejected() {
        let mut params = ConvParams::conv2d([3, 3], [1, 1], [1, 1], [0; 4]);
        params.stride[1] = 0;
        let err = ConvParams::decode("conv", &params.encode()).expect_err("zero stride");
        assert!(matches!(err, SlicerError::InvalidParam { field: "stride", .. }));
    }
}
