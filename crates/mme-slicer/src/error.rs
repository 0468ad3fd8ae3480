use thiserror::Error;

use crate::graph::topology::TopologyError;
use crate::graph::TensorId;

/// Fatal errors surfaced for structurally invalid input.
///
/// Capacity and stitching failures are never reported here; the pass narrows its plan instead.
#[derive(Debug, Error)]
pub enum SlicerError {
    #[error("node `{node}` ({kind}) expects a parameter block of {expected} bytes, got {actual}")]
    ParamBlockSize {
        node: String,
        kind: &'static str,
        expected: String,
        actual: usize,
    },
    #[error("node `{node}`: parameter `{field}` has invalid value {value}")]
    InvalidParam {
        node: String,
        field: &'static str,
        value: u32,
    },
    #[error("tensor `{tensor}` dim {dim}: minimum {min} exceeds maximum {max}")]
    InvalidShapeRange {
        tensor: String,
        dim: usize,
        min: u64,
        max: u64,
    },
    #[error("tensor `{tensor}`: minimum rank {min_rank} differs from maximum rank {max_rank}")]
    ShapeRankMismatch {
        tensor: String,
        min_rank: usize,
        max_rank: usize,
    },
    #[error("node `{node}` expects {expected_inputs} inputs and {expected_outputs} outputs, got {inputs} and {outputs}")]
    Arity {
        node: String,
        expected_inputs: usize,
        expected_outputs: usize,
        inputs: usize,
        outputs: usize,
    },
    #[error("node `{node}`: {message}")]
    OperandMismatch { node: String, message: String },
    #[error("unknown tensor {0:?}")]
    UnknownTensor(TensorId),
    #[error("unknown tensor name `{0}`")]
    UnknownTensorName(String),
    #[error("tensor `{tensor}` is produced by both `{first}` and `{second}`")]
    MultipleProducers {
        tensor: String,
        first: String,
        second: String,
    },
    #[error("shape tensor `{tensor}` cannot feed node `{node}` as a data operand")]
    ShapeTensorOperand { tensor: String, node: String },
    #[error("actual shape of tensor `{tensor}` has rank {actual}, declared rank is {expected}")]
    ActualRank {
        tensor: String,
        expected: usize,
        actual: usize,
    },
    #[error("actual shape of tensor `{tensor}` dim {dim} is {actual}, outside declared range [{min}, {max}]")]
    ActualShapeOutOfRange {
        tensor: String,
        dim: usize,
        actual: u64,
        min: u64,
        max: u64,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("failed to serialize program: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SlicerError>;
