//! Dependency checks between two decoded vector instructions.
//!
//! `a` is the earlier instruction in program order and `b` the later one:
//! - **RAW** (Read After Write): `b` reads a register `a` writes
//! - **WAW** (Write After Write): both write the same register
//! - **WAR** (Write After Read): `b` writes a register `a` reads
//!
//! Three conservative kinds sit on top of the register hazards: anything
//! that changes VL orders against everything, a masked instruction orders
//! against any write of v0, and two memory accesses never reorder.
//!
//! Example:
//! ```text
//! vmul.vv v5, v2, v1    ; v5 ready after 5 cycles
//! vadd.vv v3, v4, v5    ; RAW on v5, stalls until the multiply completes
//! ```
//!
//! The checks are advisory. Serializing conflicting instructions is up to
//! whoever issues them.

use smallvec::SmallVec;

use super::decoder::InstructionDescriptor;
use crate::device::capability::VMASK_REG;

/// Type of dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HazardType {
    /// Read After Write.
    Raw,
    /// Write After Write.
    Waw,
    /// Write After Read.
    War,
    /// One side changes VL or VTYPE.
    VectorLength,
    /// One side is masked and the other writes v0.
    Mask,
    /// Both access memory.
    Memory,
}

/// A single dependency between two instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hazard {
    pub hazard_type: HazardType,
    /// Register involved, if the hazard is register-based.
    pub register: Option<u8>,
    /// Cycles the later instruction waits for the earlier one.
    pub stall_cycles: u8,
}

impl Hazard {
    fn new(hazard_type: HazardType, register: Option<u8>, stall_cycles: u8) -> Self {
        Self { hazard_type, register, stall_cycles }
    }
}

/// List every dependency of `b` on `a`.
pub fn hazards(a: &InstructionDescriptor, b: &InstructionDescriptor) -> SmallVec<[Hazard; 4]> {
    let mut found = SmallVec::new();
    let wait = a.latency;

    if a.modifies_vl || b.modifies_vl {
        found.push(Hazard::new(HazardType::VectorLength, None, wait));
    }

    if a.vd == b.vd {
        found.push(Hazard::new(HazardType::Waw, Some(a.vd), wait));
    }

    if a.vd == b.vs1 || a.vd == b.vs2 {
        found.push(Hazard::new(HazardType::Raw, Some(a.vd), wait));
    }

    // Reads happen at issue, so a WAR never stalls an in-order pipeline
    if b.vd == a.vs1 || b.vd == a.vs2 {
        found.push(Hazard::new(HazardType::War, Some(b.vd), 0));
    }

    if (a.uses_mask || b.uses_mask) && (a.vd == VMASK_REG || b.vd == VMASK_REG) {
        found.push(Hazard::new(HazardType::Mask, Some(VMASK_REG), wait));
    }

    if a.memory_access && b.memory_access {
        found.push(Hazard::new(HazardType::Memory, None, wait));
    }

    found
}

/// True when `a` and `b` must not be reordered or overlapped.
pub fn conflicts(a: &InstructionDescriptor, b: &InstructionDescriptor) -> bool {
    !hazards(a, b).is_empty()
}

/// Cycles `b` must wait after `a` issues.
pub fn stall_cycles(a: &InstructionDescriptor, b: &InstructionDescriptor) -> u8 {
    hazards(a, b).iter().map(|h| h.stall_cycles).max().unwrap_or(0)
}

/// All conflicting `(earlier, later)` index pairs in a window.
pub fn conflict_pairs(window: &[InstructionDescriptor]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (i, a) in window.iter().enumerate() {
        for (j, b) in window.iter().enumerate().skip(i + 1) {
            if conflicts(a, b) {
                pairs.push((i, j));
            }
        }
    }
    pairs
}

/// Hazard counts accumulated by a scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HazardStats {
    pub raw_hazards: u64,
    pub waw_hazards: u64,
    pub war_hazards: u64,
    pub vl_hazards: u64,
    pub mask_hazards: u64,
    pub memory_hazards: u64,
    /// Pairs examined.
    pub pairs_checked: u64,
    /// Pairs with at least one hazard.
    pub conflicting_pairs: u64,
    pub total_stall_cycles: u64,
}

impl HazardStats {
    /// Record the outcome of checking one pair.
    pub fn record(&mut self, found: &[Hazard]) {
        self.pairs_checked += 1;
        if !found.is_empty() {
            self.conflicting_pairs += 1;
        }

        for hazard in found {
            match hazard.hazard_type {
                HazardType::Raw => self.raw_hazards += 1,
                HazardType::Waw => self.waw_hazards += 1,
                HazardType::War => self.war_hazards += 1,
                HazardType::VectorLength => self.vl_hazards += 1,
                HazardType::Mask => self.mask_hazards += 1,
                HazardType::Memory => self.memory_hazards += 1,
            }
        }
        // Hazards of one pair overlap in time
        self.total_stall_cycles += found.iter().map(|h| h.stall_cycles as u64).max().unwrap_or(0);
    }

    /// Check a pair and record the result.
    pub fn check(&mut self, a: &InstructionDescriptor, b: &InstructionDescriptor) -> bool {
        let found = hazards(a, b);
        self.record(&found);
        !found.is_empty()
    }

    /// Merge another stats instance into this one.
    pub fn merge(&mut self, other: &HazardStats) {
        self.raw_hazards += other.raw_hazards;
        self.waw_hazards += other.waw_hazards;
        self.war_hazards += other.war_hazards;
        self.vl_hazards += other.vl_hazards;
        self.mask_hazards += other.mask_hazards;
        self.memory_hazards += other.memory_hazards;
        self.pairs_checked += other.pairs_checked;
        self.conflicting_pairs += other.conflicting_pairs;
        self.total_stall_cycles += other.total_stall_cycles;
    }
}
