//! rvv-runtime library
//!
//! Execution-context runtime for a RISC-V vector (RVV) accelerator engine:
//! saving and restoring vector state across owners, decoding vector
//! instructions and their dependencies, and driving vector memory
//! transfers through DMA staging buffers.
//!
//! The hardware is reached only through two collaborator traits,
//! [`device::RegisterIo`] and [`device::DmaAllocator`];
//! [`device::SimulatedDevice`] implements both for tests and bring-up.

pub mod config;
pub mod decode;
pub mod device;
pub mod error;
pub mod state;
pub mod vmem;
pub mod vrf;

pub use device::{VectorCapability, VectorDevice};
pub use error::{VectorError, VectorResult};
