//! Register map of the vector unit and an offset decoder.
//!
//! # Layout
//!
//! ```text
//! 0x0000_0000  global block      FEATURES, RVV_CONFIG
//! 0x0010_0000  VPU block         memory-op programming, status, VRF bind
//! 0x0020_0000  CSR window        one 64-bit slot per CSR number (csr * 8)
//! 0x0100_0000  lane windows      one window per lane, 33 register slots each
//! ```
//!
//! Each lane window holds the lane's slice of v0..v31 followed by a shadow
//! slot for the saved mask register. A slot is `lane_bytes` wide; windows are
//! padded to a 4 KiB boundary.

use std::fmt;

/// Device feature register.
pub const FEATURES: u64 = 0x0010;

/// Feature bit: a vector unit is fitted.
pub const FEATURE_RVV: u32 = 1 << 2;

/// Packed vector capability register (see `VectorCapability::from_config_register`).
pub const RVV_CONFIG: u64 = 0x0020;

/// Base of the vector processing unit register block.
pub const VPU_BASE: u64 = 0x0010_0000;

/// Context id currently bound to the live register window (64-bit).
///
/// The CSR window and the lane windows show the bank of the bound context.
pub const VRF_BIND: u64 = VPU_BASE + 0x208;

/// Vector memory-operation programming registers (offsets from [`VPU_BASE`]).
///
/// Every addressing mode has its own 0x40-byte block with the same layout:
///
/// ```text
/// +0x00  BASE   (64)  device memory address of element 0
/// +0x08  AUX    (64)  stride / index-array DMA address / field count
/// +0x10  COUNT  (32)  element count
/// +0x14  SIZE   (32)  element size in bytes
/// +0x18  DMA    (64)  staging buffer device address
/// +0x20  CTRL   (32)  bit 0 load, bits [5:4] mode
/// +0x24  START  (32)  write 1 to kick off
/// ```
pub mod memop {
    pub const UNIT_BLOCK: u64 = 0x100;
    pub const STRIDED_BLOCK: u64 = 0x140;
    pub const INDEXED_BLOCK: u64 = 0x180;
    pub const SEGMENT_BLOCK: u64 = 0x1C0;

    pub const BLOCK_SIZE: u64 = 0x40;

    pub const BASE: u64 = 0x00;
    pub const AUX: u64 = 0x08;
    pub const COUNT: u64 = 0x10;
    pub const SIZE: u64 = 0x14;
    pub const DMA: u64 = 0x18;
    pub const CTRL: u64 = 0x20;
    pub const START: u64 = 0x24;

    /// Completion status shared by all modes.
    pub const STATUS: u64 = 0x200;

    pub const STATUS_DONE: u32 = 1 << 0;
    pub const STATUS_ERROR: u32 = 1 << 1;

    /// Control bit 0: 1 = load (memory to register file).
    pub const CTRL_LOAD: u32 = 1 << 0;
    /// Control bits [5:4]: addressing mode.
    pub const CTRL_MODE_SHIFT: u32 = 4;
    pub const CTRL_MODE_MASK: u32 = 0x3 << CTRL_MODE_SHIFT;

    pub const START_BIT: u32 = 1;

    /// Block base for a mode code (0 unit, 1 strided, 2 indexed, 3 segment).
    pub fn block(mode_code: u32) -> u64 {
        UNIT_BLOCK + (mode_code as u64 & 0x3) * BLOCK_SIZE
    }
}

/// RVV CSR numbers.
pub mod csr {
    pub const VSTART: u16 = 0x008;
    pub const VXSAT: u16 = 0x009;
    pub const VXRM: u16 = 0x00A;
    pub const VCSR: u16 = 0x00F;
    pub const VL: u16 = 0xC20;
    pub const VTYPE: u16 = 0xC21;
    pub const VLENB: u16 = 0xC22;

    /// All CSRs in save order.
    pub const ALL: [u16; 7] = [VSTART, VXSAT, VXRM, VCSR, VL, VTYPE, VLENB];

    pub fn name(csr: u16) -> &'static str {
        match csr {
            VSTART => "vstart",
            VXSAT => "vxsat",
            VXRM => "vxrm",
            VCSR => "vcsr",
            VL => "vl",
            VTYPE => "vtype",
            VLENB => "vlenb",
            _ => "unknown",
        }
    }
}

/// Base of the CSR window.
pub const CSR_WINDOW_BASE: u64 = 0x0020_0000;

/// End (exclusive) of the CSR window: 4096 CSR numbers, 8 bytes each.
pub const CSR_WINDOW_END: u64 = CSR_WINDOW_BASE + 0x1000 * 8;

/// Base of lane window 0.
pub const LANE_WINDOW_BASE: u64 = 0x0100_0000;

/// Lane windows are padded to this alignment.
pub const LANE_WINDOW_ALIGN: u64 = 0x1000;

/// Register slots per lane window (v0..v31 plus the mask shadow).
pub const LANE_SLOTS: u64 = 33;

/// Slot index of the mask shadow within a lane window.
pub const MASK_SLOT: usize = 32;

/// Offset of a CSR's 64-bit slot.
#[inline]
pub fn csr_offset(csr: u16) -> u64 {
    CSR_WINDOW_BASE + (csr as u64) * 8
}

/// Distance between consecutive lane windows for a given slot width.
#[inline]
pub fn lane_window_stride(lane_bytes: usize) -> u64 {
    let raw = LANE_SLOTS * lane_bytes as u64;
    (raw + LANE_WINDOW_ALIGN - 1) & !(LANE_WINDOW_ALIGN - 1)
}

/// Base offset of a lane window.
#[inline]
pub fn lane_window_base(lane: usize, lane_bytes: usize) -> u64 {
    LANE_WINDOW_BASE + lane as u64 * lane_window_stride(lane_bytes)
}

/// Region of the register space an offset falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterRegion {
    /// Global identification registers.
    Global,
    /// Memory-operation block; carries the offset relative to [`VPU_BASE`].
    MemOp(u64),
    /// VRF bind register.
    VrfBind,
    /// A CSR slot; carries the CSR number.
    Csr(u16),
    /// Lane window storage; carries the offset relative to lane window 0.
    Lane(u64),
    /// Nothing decodes here.
    Unknown,
}

impl RegisterRegion {
    /// Classify an offset.
    pub fn from_offset(offset: u64) -> Self {
        match offset {
            FEATURES | RVV_CONFIG => RegisterRegion::Global,
            o if (VRF_BIND..VRF_BIND + 8).contains(&o) => RegisterRegion::VrfBind,
            o if (VPU_BASE + memop::UNIT_BLOCK..VPU_BASE + memop::STATUS + 4).contains(&o) => {
                RegisterRegion::MemOp(o - VPU_BASE)
            }
            o if (CSR_WINDOW_BASE..CSR_WINDOW_END).contains(&o) => {
                RegisterRegion::Csr(((o - CSR_WINDOW_BASE) / 8) as u16)
            }
            o if o >= LANE_WINDOW_BASE => RegisterRegion::Lane(o - LANE_WINDOW_BASE),
            _ => RegisterRegion::Unknown,
        }
    }
}

impl fmt::Display for RegisterRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterRegion::Global => write!(f, "global"),
            RegisterRegion::MemOp(off) => write!(f, "memop+0x{:03X}", off),
            RegisterRegion::VrfBind => write!(f, "vrf-bind"),
            RegisterRegion::Csr(n) => write!(f, "csr {} (0x{:03X})", csr::name(*n), n),
            RegisterRegion::Lane(off) => write!(f, "lane+0x{:X}", off),
            RegisterRegion::Unknown => write!(f, "unmapped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csr_offsets() {
        assert_eq!(csr_offset(csr::VSTART), CSR_WINDOW_BASE + 0x40);
        assert_eq!(csr_offset(csr::VLENB), CSR_WINDOW_BASE + 0xC22 * 8);
        assert!(csr_offset(csr::VLENB) < CSR_WINDOW_END);
    }

    #[test]
    fn test_region_decode() {
        assert_eq!(RegisterRegion::from_offset(RVV_CONFIG), RegisterRegion::Global);
        assert_eq!(RegisterRegion::from_offset(VRF_BIND), RegisterRegion::VrfBind);
        // Both halves of the 64-bit bind register
        assert_eq!(RegisterRegion::from_offset(VRF_BIND + 4), RegisterRegion::VrfBind);
        assert_eq!(RegisterRegion::from_offset(VRF_BIND + 8), RegisterRegion::Unknown);
        assert_eq!(
            RegisterRegion::from_offset(VPU_BASE + memop::STRIDED_BLOCK + memop::AUX),
            RegisterRegion::MemOp(memop::STRIDED_BLOCK + memop::AUX)
        );
        assert_eq!(memop::block(3), memop::SEGMENT_BLOCK);
        assert_eq!(
            RegisterRegion::from_offset(csr_offset(csr::VTYPE)),
            RegisterRegion::Csr(csr::VTYPE)
        );
        // Upper half of a 64-bit CSR slot still maps to the same CSR
        assert_eq!(
            RegisterRegion::from_offset(csr_offset(csr::VL) + 4),
            RegisterRegion::Csr(csr::VL)
        );
        assert_eq!(RegisterRegion::from_offset(0x4000), RegisterRegion::Unknown);
    }

    #[test]
    fn test_lane_window_stride() {
        // 33 slots of 32 bytes fit in one page
        assert_eq!(lane_window_stride(32), 0x1000);
        // 33 * 128 = 4224 rounds up to two pages
        assert_eq!(lane_window_stride(128), 0x2000);
        assert_eq!(lane_window_base(2, 128), LANE_WINDOW_BASE + 0x4000);
    }

    #[test]
    fn test_display() {
        let r = RegisterRegion::from_offset(csr_offset(csr::VL));
        assert_eq!(r.to_string(), "csr vl (0xC20)");
    }
}
