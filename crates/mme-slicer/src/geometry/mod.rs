//! Shape arithmetic shared by the solver, the expander and the launch-time adapter.

pub mod conv;
pub mod mme;

pub use conv::{AxisWindow, ConvAxis};
pub use mme::{
    AxisBinding, AxisRole, DimMapping, MmeGeometry, MmeOperand, OperandRole, ShapeSource, SliceAxis,
};
