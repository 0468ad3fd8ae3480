use serde::{Deserialize, Serialize};

use super::dtype::DType;
use super::shape::{Dims, TensorShape};
use super::TensorId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorKind {
    Data,
    /// Pure shape carrier for dynamic shapes; it has no payload.
    Shape,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tensor {
    pub id: TensorId,
    pub name: String,
    pub dtype: DType,
    pub shape: TensorShape,
    pub kind: TensorKind,
    /// Externally visible: must end in off-chip memory at a stable address.
    pub persistent: bool,
    /// Launch-time shape, when known.
    pub actual: Option<Dims>,
}

impl Tensor {
    pub fn is_data(&self) -> bool {
        self.kind == TensorKind::Data
    }

    /// Actual dims when supplied, otherwise the declared maximum.
    pub fn launch_dims(&self) -> &[u64] {
        self.actual.as_deref().unwrap_or_else(|| self.shape.max())
    }
}
