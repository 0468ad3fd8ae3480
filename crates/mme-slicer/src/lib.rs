//! SRAM-capacity-aware slicing and bundling of matrix-engine (MME) operators.
//!
//! The pass walks an operator [`Graph`], picks MME operators whose working set does not fit
//! on-chip SRAM, partitions them into slices that do, stitches neighbouring vector-engine (TPC)
//! kernels into the per-slice pipeline and emits a [`SlicedProgram`] annotated with SRAM
//! offsets.
//!
//! ```text
//!   Graph ──► candidates ──► SlicingSolver ──► bundle expansion ──► allocator ──► SlicedProgram
//!                                 ▲                                    │
//!                                 └──── reduction policy / dynamic ────┘
//! ```

pub mod bundle;
pub mod config;
pub mod emit;
mod env;
pub mod error;
pub mod geometry;
pub mod graph;
pub mod hal;
pub mod hashing;
pub mod memory;
pub mod pass;
pub mod slicing;

pub use config::SlicerConfig;
pub use emit::SlicedProgram;
pub use error::{Result, SlicerError};
pub use graph::{DType, Graph, NodeId, TensorId};
pub use hal::{DeviceCaps, HardwareCaps};
pub use pass::{PassStats, SramSlicingPass};
