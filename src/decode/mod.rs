//! Instruction decoding and dependency checks.
//!
//! # Module Organization
//!
//! | Module | Contents |
//! |--------|----------|
//! | `decoder` | `InstructionDecoder`, `InstructionDescriptor`, operand validation |
//! | `hazards` | `conflicts`, detailed `Hazard` listing, `HazardStats` |

pub mod decoder;
pub mod hazards;

pub use decoder::{
    classify, decode, ArithCategory, ArithOp, InstructionDecoder, InstructionDescriptor, InstructionKind,
    InstructionType, MemAccessMode,
};
pub use hazards::{conflict_pairs, conflicts, hazards, stall_cycles, Hazard, HazardStats, HazardType};
