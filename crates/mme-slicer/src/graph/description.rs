//! JSON graph description consumed by the command-line driver.
//!
//! ```json
//! {
//!   "tensors": [{ "name": "a", "dtype": "bf16", "shape": [64, 128] }],
//!   "nodes": [{ "name": "mm", "op": "mme", "kind": "gemm", "params": [0, 0],
//!               "inputs": ["a", "b"], "outputs": ["c"] }]
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::{DType, Graph, MmeKind, TensorId, TpcAccess};
use crate::error::{Result, SlicerError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDescription {
    pub tensors: Vec<TensorDescription>,
    pub nodes: Vec<NodeDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorDescription {
    pub name: String,
    pub dtype: DType,
    /// Maximum shape.
    pub shape: Vec<u64>,
    /// Minimum shape of a dynamic tensor.
    #[serde(default)]
    pub min_shape: Option<Vec<u64>>,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub shape_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescription {
    pub name: String,
    #[serde(flatten)]
    pub op: OpDescription,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpDescription {
    Mme { kind: MmeKind, params: Vec<u8> },
    Tpc { kernel: String, access: TpcAccess },
    Reshape,
}

impl GraphDescription {
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read graph description {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse graph description {}", path.display()))
    }

    pub fn build(&self) -> Result<Graph> {
        let mut graph = Graph::new();
        let mut ids: HashMap<&str, TensorId> = HashMap::new();
        for tensor in &self.tensors {
            let min = tensor.min_shape.as_deref().unwrap_or(&tensor.shape);
            let id = if tensor.shape_only {
                graph.add_shape_tensor(&tensor.name, min, &tensor.shape)?
            } else {
                graph.add_dynamic_tensor(&tensor.name, tensor.dtype, min, &tensor.shape)?
            };
            if tensor.persistent {
                graph.set_persistent(id, true)?;
            }
            ids.insert(tensor.name.as_str(), id);
        }
        let lookup = |names: &[String]| -> Result<Vec<TensorId>> {
            names
                .iter()
                .map(|name| {
                    ids.get(name.as_str())
                        .copied()
                        .ok_or_else(|| SlicerError::UnknownTensorName(name.clone()))
                })
                .collect()
        };
        for node in &self.nodes {
            let inputs = lookup(&node.inputs)?;
            let outputs = lookup(&node.outputs)?;
            match &node.op {
                OpDescription::Mme { kind, params } => {
                    let [output] = outputs.as_slice() else {
                        return Err(SlicerError::Arity {
                            node: node.name.clone(),
                            expected_inputs: kind.input_count(),
                            expected_outputs: 1,
                            inputs: inputs.len(),
                            outputs: outputs.len(),
                        });
                    };
                    graph.add_mme(&node.name, *kind, params, &inputs, *output)?;
                }
                OpDescription::Tpc { kernel, access } => {
                    graph.add_tpc(&node.name, kernel, *access, &inputs, &outputs)?;
                }
                OpDescription::Reshape => {
                    let ([input], [output]) = (inputs.as_slice(), outputs.as_slice()) else {
                        return Err(SlicerError::Arity {
                            node: node.name.clone(),
                            expected_inputs: 1,
                            expected_outputs: 1,
                            inputs: inputs.len(),
                            outputs: outputs.len(),
                        });
                    };
                    graph.add_reshape(&node.name, *input, *output)?;
                }
            }
        }
        Ok(graph)
    }
}
