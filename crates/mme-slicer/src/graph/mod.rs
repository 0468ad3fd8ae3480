//! Operator graph arena.
//!
//! Nodes and tensors live in flat vectors addressed by [`NodeId`] / [`TensorId`]. Producer and
//! consumer links are kept per tensor, so bundles only ever hold index sets and never borrow
//! into the graph across planning steps.
//!
//! ```text
//!   tensors: [ t0 ][ t1 ][ t2 ] ...      producers[t] -> Option<NodeId>
//!   nodes:   [ n0 ][ n1 ] ...            consumers[t] -> [NodeId]
//! ```

pub mod description;
pub mod dtype;
pub mod node;
pub mod params;
pub mod shape;
pub mod tensor;
pub mod topology;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{Result, SlicerError};
use crate::geometry::mme::validate_operands;

pub use dtype::DType;
pub use node::{MmeKind, MmeParams, Node, NodeKind, TpcAccess};
pub use params::{ConvParams, GemmParams, PaddingType};
pub use shape::{Dims, TensorShape};
pub use tensor::{Tensor, TensorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl TensorId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        NodeId(index as u32)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    tensors: Vec<Tensor>,
    nodes: Vec<Node>,
    producers: Vec<Option<NodeId>>,
    consumers: Vec<SmallVec<[NodeId; 4]>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tensor(&mut self, name: &str, dtype: DType, dims: &[u64]) -> TensorId {
        self.push_tensor(name, dtype, TensorShape::fixed(dims), TensorKind::Data)
    }

    pub fn add_dynamic_tensor(
        &mut self,
        name: &str,
        dtype: DType,
        min: &[u64],
        max: &[u64],
    ) -> Result<TensorId> {
        let shape = TensorShape::ranged(min, max);
        shape.validate(name)?;
        Ok(self.push_tensor(name, dtype, shape, TensorKind::Data))
    }

    /// Payload-free carrier of a dynamic shape.
    pub fn add_shape_tensor(&mut self, name: &str, min: &[u64], max: &[u64]) -> Result<TensorId> {
        let shape = TensorShape::ranged(min, max);
        shape.validate(name)?;
        Ok(self.push_tensor(name, DType::U32, shape, TensorKind::Shape))
    }

    fn push_tensor(
        &mut self,
        name: &str,
        dtype: DType,
        shape: TensorShape,
        kind: TensorKind,
    ) -> TensorId {
        let id = TensorId(self.tensors.len() as u32);
        self.tensors.push(Tensor {
            id,
            name: name.to_string(),
            dtype,
            shape,
            kind,
            persistent: false,
            actual: None,
        });
        self.producers.push(None);
        self.consumers.push(SmallVec::new());
        id
    }

    pub fn set_persistent(&mut self, tensor: TensorId, persistent: bool) -> Result<()> {
        self.check_tensor(tensor)?;
        self.tensors[tensor.index()].persistent = persistent;
        Ok(())
    }

    /// Records the launch-time shape of `tensor`; it must lie inside the declared range.
    pub fn set_actual_shape(&mut self, tensor: TensorId, dims: &[u64]) -> Result<()> {
        self.check_tensor(tensor)?;
        let entry = &mut self.tensors[tensor.index()];
        entry.shape.check_actual(&entry.name, dims)?;
        entry.actual = Some(Dims::from_slice(dims));
        Ok(())
    }

    /// Adds an MME operator. `block` is the raw parameter block of `kind`; trailing inputs past
    /// the operand count must be shape tensors.
    pub fn add_mme(
        &mut self,
        name: &str,
        kind: MmeKind,
        block: &[u8],
        inputs: &[TensorId],
        output: TensorId,
    ) -> Result<NodeId> {
        let params = if kind.is_conv_family() {
            MmeParams::Conv(ConvParams::decode(name, block)?)
        } else {
            MmeParams::Gemm(GemmParams::decode(name, block)?)
        };
        let operands = kind.input_count();
        if inputs.len() < operands {
            return Err(SlicerError::Arity {
                node: name.to_string(),
                expected_inputs: operands,
                expected_outputs: 1,
                inputs: inputs.len(),
                outputs: 1,
            });
        }
        for &tensor in inputs.iter().chain(std::iter::once(&output)) {
            self.check_tensor(tensor)?;
        }
        for (position, &tensor) in inputs.iter().enumerate() {
            let is_data = self.tensor(tensor).is_data();
            if is_data != (position < operands) {
                return Err(SlicerError::ShapeTensorOperand {
                    tensor: self.tensor(tensor).name.clone(),
                    node: name.to_string(),
                });
            }
        }
        validate_operands(self, name, kind, &params, &inputs[..operands], output)?;
        self.insert_node(name, NodeKind::Mme { kind, params }, inputs, &[output])
    }

    pub fn add_tpc(
        &mut self,
        name: &str,
        kernel: &str,
        access: TpcAccess,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> Result<NodeId> {
        for &tensor in inputs.iter().chain(outputs) {
            self.check_tensor(tensor)?;
        }
        if outputs.is_empty() {
            return Err(SlicerError::Arity {
                node: name.to_string(),
                expected_inputs: inputs.len(),
                expected_outputs: 1,
                inputs: inputs.len(),
                outputs: 0,
            });
        }
        self.validate_access(name, access, inputs, outputs)?;
        let kind = NodeKind::Tpc {
            kernel: kernel.to_string(),
            access,
        };
        self.insert_node(name, kind, inputs, outputs)
    }

    pub fn add_reshape(&mut self, name: &str, input: TensorId, output: TensorId) -> Result<NodeId> {
        self.check_tensor(input)?;
        self.check_tensor(output)?;
        let (from, to) = (self.tensor(input), self.tensor(output));
        if from.shape.max_elements() != to.shape.max_elements() || from.dtype != to.dtype {
            return Err(SlicerError::OperandMismatch {
                node: name.to_string(),
                message: format!(
                    "reshape {:?} {} -> {:?} {} changes the element count or type",
                    from.shape.max(),
                    from.dtype,
                    to.shape.max(),
                    to.dtype
                ),
            });
        }
        self.insert_node(name, NodeKind::Reshape, &[input], &[output])
    }

    fn validate_access(
        &self,
        name: &str,
        access: TpcAccess,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> Result<()> {
        let mismatch = |message: String| SlicerError::OperandMismatch {
            node: name.to_string(),
            message,
        };
        let out = self.tensor(outputs[0]).shape.max();
        let data_inputs = inputs.iter().map(|t| self.tensor(*t)).filter(|t| t.is_data());
        match access {
            TpcAccess::Elementwise => {
                for input in data_inputs {
                    if input.shape.max() != out {
                        return Err(mismatch(format!(
                            "elementwise input `{}` {:?} differs from output {:?}",
                            input.name,
                            input.shape.max(),
                            out
                        )));
                    }
                }
            }
            TpcAccess::Broadcast => {
                for input in data_inputs {
                    let dims = input.shape.max();
                    let compatible = dims.len() == out.len()
                        && dims.iter().zip(out).all(|(d, o)| d == o || *d == 1);
                    if !compatible {
                        return Err(mismatch(format!(
                            "broadcast input `{}` {:?} does not broadcast to {:?}",
                            input.name, dims, out
                        )));
                    }
                }
            }
            TpcAccess::Reduce { axis } => {
                for input in data_inputs {
                    let dims = input.shape.max();
                    let compatible = axis < dims.len()
                        && dims.len() == out.len()
                        && dims
                            .iter()
                            .zip(out)
                            .enumerate()
                            .all(|(d, (i, o))| if d == axis { *o == 1 } else { i == o });
                    if !compatible {
                        return Err(mismatch(format!(
                            "reduce over axis {axis} maps {:?} to {:?}",
                            dims, out
                        )));
                    }
                }
            }
            TpcAccess::Opaque => {}
        }
        Ok(())
    }

    fn insert_node(
        &mut self,
        name: &str,
        kind: NodeKind,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> Result<NodeId> {
        let id = NodeId(self.nodes.len() as u32);
        for &output in outputs {
            if let Some(existing) = self.producers[output.index()] {
                return Err(SlicerError::MultipleProducers {
                    tensor: self.tensor(output).name.clone(),
                    first: self.node(existing).name.clone(),
                    second: name.to_string(),
                });
            }
        }
        for &output in outputs {
            self.producers[output.index()] = Some(id);
        }
        for &input in inputs {
            let consumers = &mut self.consumers[input.index()];
            if !consumers.contains(&id) {
                consumers.push(id);
            }
        }
        self.nodes.push(Node {
            id,
            name: name.to_string(),
            kind,
            inputs: SmallVec::from_slice(inputs),
            outputs: SmallVec::from_slice(outputs),
        });
        Ok(id)
    }

    fn check_tensor(&self, tensor: TensorId) -> Result<()> {
        if tensor.index() < self.tensors.len() {
            Ok(())
        } else {
            Err(SlicerError::UnknownTensor(tensor))
        }
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id.index()]
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn tensor_by_name(&self, name: &str) -> Option<TensorId> {
        self.tensors.iter().find(|t| t.name == name).map(|t| t.id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.name == name).map(|n| n.id)
    }

    pub fn producer(&self, tensor: TensorId) -> Option<NodeId> {
        self.producers[tensor.index()]
    }

    pub fn consumers(&self, tensor: TensorId) -> &[NodeId] {
        &self.consumers[tensor.index()]
    }

    /// Data tensors that must end up in off-chip memory after the graph runs.
    pub fn is_graph_output(&self, tensor: TensorId) -> bool {
        let entry = self.tensor(tensor);
        entry.is_data() && (entry.persistent || self.consumers(tensor).is_empty())
    }
}
