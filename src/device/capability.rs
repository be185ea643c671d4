//! Hardware capability descriptor of the vector unit.
//!
//! The descriptor is discovered once at bring-up, validated, and then shared
//! read-only (as `Arc<VectorCapability>`) with every other component.
//!
//! # Capability Register
//!
//! ```text
//! [3:0]   VLEN multiple    vlen  = 1024 * (n + 1)
//! [6:4]   ELEN code        elen  = 8 << n
//! [11:8]  lane code        lanes = 1 << n
//! [16]    floating point
//! [17]    fixed point
//! [18]    segment load/store
//! [19]    OS/MMU support
//! ```

use std::fmt;

use bitflags::bitflags;

use super::io::RegisterIo;
use super::registers;
use crate::error::{VectorError, VectorResult};

/// Number of architectural vector registers.
pub const NUM_VREGS: usize = 32;

/// Register used as the mask source for masked instructions.
pub const VMASK_REG: u8 = 0;

pub const MIN_VLEN: u32 = 128;
pub const MAX_VLEN: u32 = 65536;
pub const MAX_ELEN: u32 = 64;
pub const MAX_LANES: u32 = 16;

/// Register banks per lane.
pub const DEFAULT_VRF_BANKS: u32 = 8;

/// Multiplier latency per element width (EW8, EW16, EW32, EW64).
pub const DEFAULT_MULTIPLIER_LATENCY: [u8; 4] = [0, 1, 1, 1];

/// FPU latency per operation class (comp, div/sqrt, conv, non-comp, dot-product).
pub const DEFAULT_FPU_LATENCY: [u8; 5] = [5, 3, 2, 1, 0];

bitflags! {
    /// Optional vector features advertised by the hardware.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct VectorFeatures: u32 {
        const FLOATING_POINT = 1 << 16;
        const FIXED_POINT = 1 << 17;
        const SEGMENT = 1 << 18;
        const OS_SUPPORT = 1 << 19;
    }
}

impl Default for VectorFeatures {
    fn default() -> Self {
        VectorFeatures::empty()
    }
}

/// Immutable description of the fitted vector unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorCapability {
    pub vlen_bits: u32,
    pub elen_bits: u32,
    pub num_lanes: u32,
    /// `vlen_bits / 8`.
    pub vlenb: u32,
    pub features: VectorFeatures,
    pub multiplier_latency: [u8; 4],
    pub fpu_latency: [u8; 5],
    pub vrf_bytes_per_lane: u32,
    pub vrf_banks_per_lane: u32,
}

impl VectorCapability {
    /// Build and validate a capability from its three primary parameters.
    pub fn new(vlen_bits: u32, elen_bits: u32, num_lanes: u32) -> VectorResult<Self> {
        Self::with_features(vlen_bits, elen_bits, num_lanes, VectorFeatures::empty())
    }

    /// Like [`new`](Self::new) with an explicit feature set.
    pub fn with_features(
        vlen_bits: u32,
        elen_bits: u32,
        num_lanes: u32,
        features: VectorFeatures,
    ) -> VectorResult<Self> {
        let cap = Self::unchecked(vlen_bits, elen_bits, num_lanes, features);
        cap.validate()?;
        Ok(cap)
    }

    fn unchecked(vlen_bits: u32, elen_bits: u32, num_lanes: u32, features: VectorFeatures) -> Self {
        let vrf_bytes_per_lane = if num_lanes == 0 {
            0
        } else {
            ((vlen_bits as u64 * NUM_VREGS as u64) / num_lanes as u64 / 8) as u32
        };

        Self {
            vlen_bits,
            elen_bits,
            num_lanes,
            vlenb: vlen_bits / 8,
            features,
            multiplier_latency: DEFAULT_MULTIPLIER_LATENCY,
            fpu_latency: DEFAULT_FPU_LATENCY,
            vrf_bytes_per_lane,
            vrf_banks_per_lane: DEFAULT_VRF_BANKS,
        }
    }

    /// Decode the packed capability register.
    pub fn from_config_register(reg: u32) -> VectorResult<Self> {
        let vlen = 1024 * ((reg & 0xF) + 1);
        let elen = 8 << ((reg >> 4) & 0x7);
        let lanes = 1 << ((reg >> 8) & 0xF);
        let features = VectorFeatures::from_bits_truncate(reg);

        let cap = Self::unchecked(vlen, elen, lanes, features);
        log::debug!("Capability register 0x{:08X} decodes to {}", reg, cap);
        cap.validate()?;
        Ok(cap)
    }

    /// Encode back into the packed register form, if representable.
    ///
    /// Only VLENs that are multiples of 1024 and power-of-two ELEN/lane
    /// counts have an encoding.
    pub fn config_register(&self) -> Option<u32> {
        if self.vlen_bits < 1024 || self.vlen_bits % 1024 != 0 || self.vlen_bits / 1024 > 16 {
            return None;
        }
        if !self.elen_bits.is_power_of_two() || self.elen_bits < 8 || !self.num_lanes.is_power_of_two() {
            return None;
        }

        let vlen_code = self.vlen_bits / 1024 - 1;
        let elen_code = (self.elen_bits / 8).trailing_zeros();
        let lane_code = self.num_lanes.trailing_zeros();
        if elen_code > 7 || lane_code > 15 {
            return None;
        }

        Some(vlen_code | (elen_code << 4) | (lane_code << 8) | self.features.bits())
    }

    /// Probe the register space for a vector unit.
    ///
    /// Returns `Ok(None)` when the feature register does not advertise one.
    pub fn discover(io: &dyn RegisterIo) -> VectorResult<Option<Self>> {
        let features = io.read32(registers::FEATURES)?;
        if features & registers::FEATURE_RVV == 0 {
            log::info!("No vector unit advertised (features 0x{:08X})", features);
            return Ok(None);
        }

        let reg = io.read32(registers::RVV_CONFIG)?;
        let cap = Self::from_config_register(reg)?;
        log::info!("Vector unit: {}", cap);
        Ok(Some(cap))
    }

    /// Check the architectural bounds.
    pub fn validate(&self) -> VectorResult<()> {
        if self.vlen_bits < MIN_VLEN || self.vlen_bits > MAX_VLEN {
            return Err(VectorError::InvalidConfig(format!(
                "VLEN {} outside [{}, {}]",
                self.vlen_bits, MIN_VLEN, MAX_VLEN
            )));
        }
        if self.elen_bits > MAX_ELEN {
            return Err(VectorError::InvalidConfig(format!(
                "ELEN {} exceeds {}",
                self.elen_bits, MAX_ELEN
            )));
        }
        if self.num_lanes == 0 || self.num_lanes > MAX_LANES {
            return Err(VectorError::InvalidConfig(format!(
                "lane count {} outside [1, {}]",
                self.num_lanes, MAX_LANES
            )));
        }
        Ok(())
    }

    pub fn has_fp(&self) -> bool {
        self.features.contains(VectorFeatures::FLOATING_POINT)
    }

    pub fn has_fixed_point(&self) -> bool {
        self.features.contains(VectorFeatures::FIXED_POINT)
    }

    pub fn has_segment(&self) -> bool {
        self.features.contains(VectorFeatures::SEGMENT)
    }

    pub fn has_os_support(&self) -> bool {
        self.features.contains(VectorFeatures::OS_SUPPORT)
    }

    /// Bits of each register held by one lane.
    pub fn lane_width_bits(&self) -> u32 {
        self.vlen_bits / self.num_lanes
    }

    /// Bytes of each register held by one lane (at least one).
    pub fn lane_bytes(&self) -> usize {
        ((self.lane_width_bits() / 8) as usize).max(1)
    }

    /// Bytes backing the 32 vector registers.
    pub fn vregs_bytes(&self) -> usize {
        self.vlenb as usize * NUM_VREGS
    }

    /// Bytes backing the mask register.
    pub fn vmask_bytes(&self) -> usize {
        self.vlenb as usize
    }

    /// Maximum vector length for a SEW and an LMUL ratio `mul / div`.
    pub fn vlmax(&self, sew_bits: u32, lmul_mul: u32, lmul_div: u32) -> u32 {
        if sew_bits == 0 || lmul_div == 0 {
            return 0;
        }
        ((self.vlen_bits as u64 * lmul_mul as u64) / (sew_bits as u64 * lmul_div as u64)) as u32
    }
}

impl fmt::Display for VectorCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VLEN={} ELEN={} lanes={} (FP={} FixPt={} Seg={} OS={})",
            self.vlen_bits,
            self.elen_bits,
            self.num_lanes,
            self.has_fp(),
            self.has_fixed_point(),
            self.has_segment(),
            self.has_os_support()
        )
    }
}
