//! Vector CSR image and VTYPE decoding.
//!
//! # VTYPE Layout
//!
//! ```text
//! [2:0]  vlmul   LMUL code (0..3 => x1..x8, 5..7 => /8../2, 4 reserved)
//! [5:3]  vsew    SEW = 8 << vsew
//! [6]    vta     tail agnostic
//! [7]    vma     mask agnostic
//! [63]   vill    illegal configuration
//! ```

use std::fmt;
use std::time::Instant;

use crate::device::capability::VectorCapability;
use crate::device::io::RegisterIo;
use crate::device::registers::{csr, csr_offset};
use crate::error::{VectorError, VectorResult};

pub const VTYPE_VLMUL_MASK: u64 = 0x7;
pub const VTYPE_VSEW_SHIFT: u32 = 3;
pub const VTYPE_VSEW_MASK: u64 = 0x7 << VTYPE_VSEW_SHIFT;
pub const VTYPE_VTA: u64 = 1 << 6;
pub const VTYPE_VMA: u64 = 1 << 7;
pub const VTYPE_VILL: u64 = 1 << 63;

/// Fields derived from a VTYPE value.
///
/// When `vill` is set every other field is left at its zero value and must
/// not be interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VtypeFields {
    pub vlmul: u8,
    pub vsew: u8,
    pub vta: bool,
    pub vma: bool,
    pub vill: bool,
    pub sew_bits: u32,
    pub lmul_mul: u32,
    pub lmul_div: u32,
}

impl VtypeFields {
    /// Decode a raw VTYPE value.
    pub fn parse(vtype: u64) -> Self {
        if vtype & VTYPE_VILL != 0 {
            return Self { vill: true, ..Self::default() };
        }

        let vlmul = (vtype & VTYPE_VLMUL_MASK) as u8;
        let vsew = ((vtype & VTYPE_VSEW_MASK) >> VTYPE_VSEW_SHIFT) as u8;

        let (lmul_mul, lmul_div) = match vlmul {
            0..=3 => (1 << vlmul, 1),
            5..=7 => (1, 1 << (8 - vlmul)),
            // Reserved encoding
            _ => (1, 1),
        };

        Self {
            vlmul,
            vsew,
            vta: vtype & VTYPE_VTA != 0,
            vma: vtype & VTYPE_VMA != 0,
            vill: false,
            sew_bits: 8 << vsew,
            lmul_mul,
            lmul_div,
        }
    }

    /// Encode back into a VTYPE value.
    pub fn encode(&self) -> u64 {
        if self.vill {
            return VTYPE_VILL;
        }
        let mut vtype = (self.vlmul as u64 & 0x7) | ((self.vsew as u64 & 0x7) << VTYPE_VSEW_SHIFT);
        if self.vta {
            vtype |= VTYPE_VTA;
        }
        if self.vma {
            vtype |= VTYPE_VMA;
        }
        vtype
    }
}

/// Saved image of the seven vector CSRs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsrContext {
    pub vstart: u64,
    pub vxsat: u64,
    pub vxrm: u64,
    pub vcsr: u64,
    pub vl: u64,
    pub vtype: u64,
    pub vlenb: u64,

    /// Decoded view of `vtype`.
    pub fields: VtypeFields,

    /// Image has been populated by a save.
    pub valid: bool,
    /// Hardware state has moved on since the last save.
    pub dirty: bool,
    pub save_count: u64,
    pub last_save: Option<Instant>,
}

impl CsrContext {
    /// A zeroed, invalid image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-derive `fields` from `vtype`.
    pub fn parse_vtype(&mut self) {
        self.fields = VtypeFields::parse(self.vtype);
    }

    /// Read all seven CSRs from hardware.
    ///
    /// The image is only replaced when every read succeeds.
    pub fn save(&mut self, io: &dyn RegisterIo) -> VectorResult<()> {
        let started = Instant::now();

        let mut values = [0u64; 7];
        for (slot, &num) in values.iter_mut().zip(csr::ALL.iter()) {
            *slot = io.read64(csr_offset(num))?;
        }
        let [vstart, vxsat, vxrm, vcsr, vl, vtype, vlenb] = values;

        self.vstart = vstart;
        self.vxsat = vxsat;
        self.vxrm = vxrm;
        self.vcsr = vcsr;
        self.vl = vl;
        self.vtype = vtype;
        self.vlenb = vlenb;
        self.parse_vtype();

        self.valid = true;
        self.dirty = false;
        self.save_count += 1;
        self.last_save = Some(Instant::now());

        log::debug!("CSR save done in {} ns", started.elapsed().as_nanos());
        Ok(())
    }

    /// Write the image back to hardware (all but read-only `vlenb`).
    pub fn restore(&self, io: &dyn RegisterIo) -> VectorResult<()> {
        if !self.valid {
            return Err(VectorError::InvalidState("CSR image was never saved".into()));
        }

        let started = Instant::now();
        io.write64(csr_offset(csr::VSTART), self.vstart)?;
        io.write64(csr_offset(csr::VXSAT), self.vxsat)?;
        io.write64(csr_offset(csr::VXRM), self.vxrm)?;
        io.write64(csr_offset(csr::VCSR), self.vcsr)?;
        io.write64(csr_offset(csr::VL), self.vl)?;
        io.write64(csr_offset(csr::VTYPE), self.vtype)?;

        log::debug!("CSR restore done in {} ns", started.elapsed().as_nanos());
        Ok(())
    }

    /// Check the image against the hardware limits.
    pub fn validate(&self, cap: &VectorCapability) -> VectorResult<()> {
        if self.fields.vill {
            return Err(VectorError::IllegalVtype(self.vtype));
        }

        let sew = self.fields.sew_bits.max(8) as u64;
        let max_vl = cap.vlen_bits as u64 / sew;
        if self.vl > max_vl {
            return Err(VectorError::OutOfRange(format!(
                "vl {} exceeds VLEN/SEW = {}",
                self.vl, max_vl
            )));
        }
        if self.vstart > self.vl {
            return Err(VectorError::OutOfRange(format!(
                "vstart {} exceeds vl {}",
                self.vstart, self.vl
            )));
        }
        Ok(())
    }

    pub fn is_valid_for(&self, cap: &VectorCapability) -> bool {
        self.validate(cap).is_ok()
    }

    /// Bytes occupied by one register group under the current LMUL.
    pub fn vreg_group_bytes(&self, cap: &VectorCapability) -> usize {
        if self.fields.vill {
            return cap.vlenb as usize;
        }
        let bytes = cap.vlenb as u64 * self.fields.lmul_mul as u64 / self.fields.lmul_div.max(1) as u64;
        bytes.max(1) as usize
    }

    /// VLMAX for the current SEW and LMUL; zero when illegal.
    pub fn vlmax(&self, cap: &VectorCapability) -> u32 {
        if self.fields.vill {
            return 0;
        }
        cap.vlmax(self.fields.sew_bits, self.fields.lmul_mul, self.fields.lmul_div)
    }
}

impl fmt::Display for CsrContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "vstart = 0x{:X}", self.vstart)?;
        writeln!(f, "vxsat  = 0x{:X}", self.vxsat)?;
        writeln!(f, "vxrm   = 0x{:X}", self.vxrm)?;
        writeln!(f, "vcsr   = 0x{:X}", self.vcsr)?;
        writeln!(f, "vl     = {}", self.vl)?;
        writeln!(f, "vlenb  = {}", self.vlenb)?;
        write!(f, "vtype  = 0x{:X}", self.vtype)?;

        let v = &self.fields;
        if v.vill {
            write!(f, " (illegal)")
        } else if v.lmul_div > 1 {
            write!(f, " (SEW={} LMUL=1/{} ta={} ma={})", v.sew_bits, v.lmul_div, v.vta, v.vma)
        } else {
            write!(f, " (SEW={} LMUL={} ta={} ma={})", v.sew_bits, v.lmul_mul, v.vta, v.vma)
        }
    }
}
