//! SRAM residency of bundle tensors: data movement at the bundle boundary and buffer packing.

pub mod allocator;
pub mod movement;

pub use allocator::{
    pack, peak_bytes, AllocationRequest, BufferKey, LiveRange, PackingError, Placement,
};
pub use movement::{plan_movement, MovementError, MovementPlan, TensorMovement};
