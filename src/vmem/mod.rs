//! Vector memory operations (loads and stores through a DMA staging buffer).
//!
//! | Mode | Element `i` in memory | Staging offset |
//! |------|-----------------------|----------------|
//! | unit-stride | `base + i*size` | `i*size` |
//! | strided | `base + i*stride` | `i*stride` |
//! | indexed | `base + indices[i]` | `i*size` |
//! | segment | field `f` at `base + i*size + f*fb` | `f*elements*fb + i*fb` |
//!
//! (`fb` is `size / fields`.)
//!
//! # Example
//!
//! ```
//! use rvv_runtime::device::{SimulatedDevice, VectorCapability};
//! use rvv_runtime::vmem::{Direction, MemoryPort, VectorMemoryOp};
//!
//! let sim = SimulatedDevice::new(VectorCapability::new(1024, 64, 4).unwrap());
//! sim.write_memory(0x1000, &[1, 2, 3, 4, 5, 6, 7, 8]);
//!
//! let mut op = VectorMemoryOp::unit_stride(Direction::Load, 0x1000, 2, 4);
//! let report = op.execute(&MemoryPort::new(&sim, &sim, sim.capability())).unwrap();
//! assert_eq!(report.bytes, 8);
//! assert_eq!(op.payload(), &[1, 2, 3, 4, 5, 6, 7, 8]);
//! ```

mod execute;
mod op;

pub use execute::{CancelToken, MemoryPort, PollConfig, TransferReport};
pub use op::{AddressingMode, Direction, Layout, VectorMemoryOp};
