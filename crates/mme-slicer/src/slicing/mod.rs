//! Per-operator slicing decisions.

pub mod candidate;
pub mod dynamic;
pub mod operand;
pub mod reduction;
pub mod solver;
pub mod strategy;

pub use candidate::{is_candidate_kind, scan_candidates, CandidateScan};
pub use dynamic::{resolve_launch, LaunchAxis, LaunchPlan, LaunchSlice};
pub use operand::{align_up, buffer_count, DimBinding, DimBindings, TensorSlicing};
pub use reduction::{reduction_root, reduction_tree, ReduceStep, ReductionPolicy};
pub use solver::{SlicingSolver, SolverOutcome};
pub use strategy::{AxisSlicing, SliceWalk, SlicingStrategy};
