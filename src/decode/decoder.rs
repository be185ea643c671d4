//! RVV instruction word decoder.
//!
//! # Encoding
//!
//! ```text
//!  31    26 25 24  20 19  15 14 12 11   7 6     0
//! ┌────────┬──┬──────┬──────┬─────┬──────┬───────┐
//! │ funct6 │vm│ vs2  │ vs1  │funct│  vd  │opcode │
//! │        │  │      │      │  3  │      │       │
//! └────────┴──┴──────┴──────┴─────┴──────┴───────┘
//! ```
//!
//! | opcode | funct3 | class |
//! |--------|--------|-------|
//! | 0x07 LOAD-FP | 0..4 | vector load (unit, segment, strided, indexed, whole-reg) |
//! | 0x27 STORE-FP | 0..4 | vector store |
//! | 0x57 OP-V | 0..6 | arithmetic (OPIVV, OPFVV, OPMVV, OPIVI, OPIVX, OPFVF, OPMVX) |
//! | 0x57 OP-V | 7 | vsetvli |
//! | 0x43 MADD | any | arithmetic (fused multiply-add) |
//!
//! `vm = 0` means the instruction is masked by v0. funct6 selects the
//! arithmetic operation from one table shared by every category; codes
//! outside the table decode as `add`, and LOAD-FP/STORE-FP funct3 values
//! above 4 decode as unit-stride.

use std::fmt;

use crate::device::capability::{VectorCapability, NUM_VREGS, VMASK_REG};
use crate::error::{VectorError, VectorResult};
use crate::vmem::{AddressingMode, Direction};

pub const OPCODE_LOAD_FP: u8 = 0x07;
pub const OPCODE_STORE_FP: u8 = 0x27;
pub const OPCODE_OP_V: u8 = 0x57;
pub const OPCODE_MADD: u8 = 0x43;

/// funct3 of OP-V that selects vsetvli.
pub const FUNCT3_OPCFG: u8 = 0x7;

pub const LATENCY_MEMORY: u8 = 10;
pub const LATENCY_MUL_DIV: u8 = 5;
pub const LATENCY_ALU: u8 = 2;
pub const LATENCY_CONFIG: u8 = 1;

/// Default architectural VL ceiling when no capability is known.
pub const DEFAULT_MAX_VL: u32 = 1024;

/// Broad instruction class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionType {
    Vmem,
    Varith,
    Vsetvli,
    Invalid,
}

/// Memory addressing sub-mode (funct3 of LOAD-FP / STORE-FP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemAccessMode {
    UnitStride,
    Segment,
    Strided,
    Indexed,
    WholeRegister,
}

impl MemAccessMode {
    fn from_funct3(funct3: u8) -> Self {
        match funct3 {
            1 => MemAccessMode::Segment,
            2 => MemAccessMode::Strided,
            3 => MemAccessMode::Indexed,
            4 => MemAccessMode::WholeRegister,
            _ => MemAccessMode::UnitStride,
        }
    }

    /// Descriptor-based transfer mode used to execute this access.
    ///
    /// Whole-register moves are a contiguous transfer.
    pub fn addressing_mode(self) -> AddressingMode {
        match self {
            MemAccessMode::UnitStride | MemAccessMode::WholeRegister => AddressingMode::UnitStride,
            MemAccessMode::Segment => AddressingMode::Segment,
            MemAccessMode::Strided => AddressingMode::Strided,
            MemAccessMode::Indexed => AddressingMode::Indexed,
        }
    }

    fn mnemonic_suffix(self) -> &'static str {
        match self {
            MemAccessMode::UnitStride => "e",
            MemAccessMode::Segment => "seg",
            MemAccessMode::Strided => "se",
            MemAccessMode::Indexed => "uxei",
            MemAccessMode::WholeRegister => "r",
        }
    }
}

/// Arithmetic operation selected by funct6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
    Shift,
    Compare,
    Reduce,
}

impl ArithOp {
    pub fn is_mul_div(self) -> bool {
        matches!(self, ArithOp::Mul | ArithOp::Div)
    }

    fn mnemonic(self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
            ArithOp::And => "and",
            ArithOp::Or => "or",
            ArithOp::Xor => "xor",
            ArithOp::Shift => "sh",
            ArithOp::Compare => "mcmp",
            ArithOp::Reduce => "red",
        }
    }
}

/// Operand category (funct3 of OP-V).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithCategory {
    /// Integer vector-vector.
    Opivv,
    /// Float vector-vector.
    Opfvv,
    /// Mask/multiply vector-vector.
    Opmvv,
    /// Integer vector-immediate.
    Opivi,
    /// Integer vector-scalar.
    Opivx,
    /// Float vector-scalar.
    Opfvf,
    /// Mask/multiply vector-scalar.
    Opmvx,
    /// Fused multiply-add opcode.
    Madd,
}

impl ArithCategory {
    fn from_funct3(funct3: u8) -> Option<Self> {
        match funct3 {
            0 => Some(ArithCategory::Opivv),
            1 => Some(ArithCategory::Opfvv),
            2 => Some(ArithCategory::Opmvv),
            3 => Some(ArithCategory::Opivi),
            4 => Some(ArithCategory::Opivx),
            5 => Some(ArithCategory::Opfvf),
            6 => Some(ArithCategory::Opmvx),
            _ => None,
        }
    }

    /// Mnemonic operand suffix (`vv`, `vx`, `vi`, `vf`).
    pub fn suffix(self) -> &'static str {
        match self {
            ArithCategory::Opivv | ArithCategory::Opfvv | ArithCategory::Opmvv | ArithCategory::Madd => "vv",
            ArithCategory::Opivi => "vi",
            ArithCategory::Opivx | ArithCategory::Opmvx => "vx",
            ArithCategory::Opfvf => "vf",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ArithCategory::Opfvv | ArithCategory::Opfvf)
    }

    /// Map funct6 to an operation.
    ///
    /// funct6 0 is `vredsum` in the OPMVV space and `add` everywhere else.
    fn op_for(self, funct6: u8) -> ArithOp {
        match funct6 {
            0x00 if self == ArithCategory::Opmvv => ArithOp::Reduce,
            0x00 => ArithOp::Add,
            0x02 => ArithOp::Sub,
            0x20 => ArithOp::Div,
            0x24 => ArithOp::And,
            0x25 => ArithOp::Mul,
            0x28 => ArithOp::Or,
            0x2C => ArithOp::Xor,
            0x30 | 0x34 | 0x38 => ArithOp::Shift,
            0x18..=0x1B => ArithOp::Compare,
            _ => ArithOp::Add,
        }
    }
}

/// Class-specific part of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionKind {
    Memory {
        mode: MemAccessMode,
        direction: Direction,
    },
    Arithmetic {
        op: ArithOp,
        category: ArithCategory,
    },
    Config {
        /// Requested vector length (rs1 field).
        requested_vl: u32,
        /// Immediate vtype (zimm[10:0]).
        vtypei: u16,
    },
}

/// A decoded vector instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstructionDescriptor {
    pub raw: u32,
    pub opcode: u8,
    pub funct3: u8,
    pub funct6: u8,
    pub vd: u8,
    pub vs1: u8,
    pub vs2: u8,
    /// Executes under the v0 mask.
    pub uses_mask: bool,
    pub modifies_vl: bool,
    pub memory_access: bool,
    pub latency: u8,
    pub kind: InstructionKind,
}

impl InstructionDescriptor {
    /// Synthesise an unmasked arithmetic descriptor (for scheduling tests).
    pub fn arithmetic(op: ArithOp, vd: u8, vs1: u8, vs2: u8) -> Self {
        Self {
            raw: 0,
            opcode: OPCODE_OP_V,
            funct3: 0,
            funct6: 0,
            vd,
            vs1,
            vs2,
            uses_mask: false,
            modifies_vl: false,
            memory_access: false,
            latency: if op.is_mul_div() { LATENCY_MUL_DIV } else { LATENCY_ALU },
            kind: InstructionKind::Arithmetic { op, category: ArithCategory::Opivv },
        }
    }

    /// Synthesise an unmasked memory descriptor.
    pub fn memory(mode: MemAccessMode, direction: Direction, vd: u8, rs1: u8, vs2: u8) -> Self {
        Self {
            raw: 0,
            opcode: match direction {
                Direction::Load => OPCODE_LOAD_FP,
                Direction::Store => OPCODE_STORE_FP,
            },
            funct3: 0,
            funct6: 0,
            vd,
            vs1: rs1,
            vs2,
            uses_mask: false,
            modifies_vl: false,
            memory_access: true,
            latency: LATENCY_MEMORY,
            kind: InstructionKind::Memory { mode, direction },
        }
    }

    /// Builder-style: execute under the v0 mask.
    pub fn masked(mut self) -> Self {
        self.uses_mask = true;
        self
    }

    pub fn instruction_type(&self) -> InstructionType {
        match self.kind {
            InstructionKind::Memory { .. } => InstructionType::Vmem,
            InstructionKind::Arithmetic { .. } => InstructionType::Varith,
            InstructionKind::Config { .. } => InstructionType::Vsetvli,
        }
    }

    pub fn is_reduction(&self) -> bool {
        matches!(self.kind, InstructionKind::Arithmetic { op: ArithOp::Reduce, .. })
    }

    /// Sign-extended 5-bit immediate of OPIVI forms.
    pub fn immediate(&self) -> Option<i8> {
        match self.kind {
            InstructionKind::Arithmetic { category: ArithCategory::Opivi, .. } => {
                Some(((self.vs1 << 3) as i8) >> 3)
            }
            _ => None,
        }
    }
}

impl fmt::Display for InstructionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = if self.uses_mask { ", v0.t" } else { "" };
        match self.kind {
            InstructionKind::Memory { mode, direction } => {
                let prefix = match direction {
                    Direction::Load => "vl",
                    Direction::Store => "vs",
                };
                write!(f, "{}{} v{}, (x{})", prefix, mode.mnemonic_suffix(), self.vd, self.vs1)?;
                if matches!(mode, MemAccessMode::Strided) {
                    write!(f, ", x{}", self.vs2)?;
                } else if matches!(mode, MemAccessMode::Indexed) {
                    write!(f, ", v{}", self.vs2)?;
                }
                write!(f, "{}", mask)
            }
            InstructionKind::Arithmetic { op, category } => {
                let fp = if category.is_float() { "f" } else { "" };
                let src1 = match category {
                    ArithCategory::Opivi => format!("{}", self.immediate().unwrap_or(0)),
                    ArithCategory::Opivx | ArithCategory::Opmvx => format!("x{}", self.vs1),
                    ArithCategory::Opfvf => format!("f{}", self.vs1),
                    _ => format!("v{}", self.vs1),
                };
                write!(
                    f,
                    "v{}{}.{} v{}, v{}, {}{}",
                    fp,
                    op.mnemonic(),
                    category.suffix(),
                    self.vd,
                    self.vs2,
                    src1,
                    mask
                )
            }
            InstructionKind::Config { requested_vl, vtypei } => {
                write!(f, "vsetvli x{}, x{}, 0x{:03X}", self.vd, requested_vl, vtypei)
            }
        }
    }
}

/// Classify a raw word without fully decoding it.
pub fn classify(word: u32) -> InstructionType {
    let opcode = (word & 0x7F) as u8;
    let funct3 = ((word >> 12) & 0x7) as u8;

    match opcode {
        OPCODE_LOAD_FP | OPCODE_STORE_FP => InstructionType::Vmem,
        OPCODE_OP_V if funct3 == FUNCT3_OPCFG => InstructionType::Vsetvli,
        OPCODE_OP_V | OPCODE_MADD => InstructionType::Varith,
        _ => InstructionType::Invalid,
    }
}

/// Decoder with an architectural VL ceiling for `validate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionDecoder {
    max_vl: u32,
}

impl Default for InstructionDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl InstructionDecoder {
    pub fn new() -> Self {
        Self { max_vl: DEFAULT_MAX_VL }
    }

    /// Ceiling from the hardware: VLMAX at SEW=8, LMUL=8.
    pub fn for_capability(cap: &VectorCapability) -> Self {
        Self { max_vl: cap.vlmax(8, 8, 1) }
    }

    pub fn max_vl(&self) -> u32 {
        self.max_vl
    }

    /// Decode a raw instruction word.
    pub fn decode(&self, word: u32) -> VectorResult<InstructionDescriptor> {
        let opcode = (word & 0x7F) as u8;
        let funct3 = ((word >> 12) & 0x7) as u8;
        let funct6 = ((word >> 26) & 0x3F) as u8;
        let vd = ((word >> 7) & 0x1F) as u8;
        let vs1 = ((word >> 15) & 0x1F) as u8;
        let vs2 = ((word >> 20) & 0x1F) as u8;
        let uses_mask = (word >> 25) & 1 == 0;

        let mut desc = InstructionDescriptor {
            raw: word,
            opcode,
            funct3,
            funct6,
            vd,
            vs1,
            vs2,
            uses_mask,
            modifies_vl: false,
            memory_access: false,
            latency: 0,
            kind: InstructionKind::Config { requested_vl: 0, vtypei: 0 },
        };

        match classify(word) {
            InstructionType::Vmem => {
                let mode = MemAccessMode::from_funct3(funct3);
                let direction = if opcode == OPCODE_LOAD_FP { Direction::Load } else { Direction::Store };
                desc.kind = InstructionKind::Memory { mode, direction };
                desc.memory_access = true;
                desc.latency = LATENCY_MEMORY;
            }
            InstructionType::Varith => {
                let category = if opcode == OPCODE_MADD {
                    ArithCategory::Madd
                } else {
                    ArithCategory::from_funct3(funct3).ok_or(VectorError::Decode(word))?
                };
                let op = category.op_for(funct6);
                desc.kind = InstructionKind::Arithmetic { op, category };
                desc.latency = if op.is_mul_div() { LATENCY_MUL_DIV } else { LATENCY_ALU };
            }
            InstructionType::Vsetvli => {
                desc.kind = InstructionKind::Config {
                    requested_vl: vs1 as u32,
                    vtypei: ((word >> 20) & 0x7FF) as u16,
                };
                desc.modifies_vl = true;
                // vsetvli is never masked
                desc.uses_mask = false;
                desc.latency = LATENCY_CONFIG;
            }
            InstructionType::Invalid => return Err(VectorError::Decode(word)),
        }

        log::trace!("Decoded 0x{:08X} as {}", word, desc);
        Ok(desc)
    }

    /// Check operand constraints of a descriptor.
    pub fn validate(&self, desc: &InstructionDescriptor) -> VectorResult<()> {
        for (name, reg) in [("vd", desc.vd), ("vs1", desc.vs1), ("vs2", desc.vs2)] {
            if reg as usize >= NUM_VREGS {
                return Err(VectorError::OutOfRange(format!("{} = {} exceeds v31", name, reg)));
            }
        }

        match desc.kind {
            InstructionKind::Memory { .. } if desc.uses_mask && desc.vd == VMASK_REG => {
                Err(VectorError::InvalidOperand(
                    "masked memory access cannot target the mask register v0".into(),
                ))
            }
            InstructionKind::Arithmetic { op: ArithOp::Reduce, .. } if desc.vd != desc.vs1 => {
                Err(VectorError::InvalidOperand(format!(
                    "reduction destination v{} differs from accumulator v{}",
                    desc.vd, desc.vs1
                )))
            }
            InstructionKind::Config { requested_vl, .. } if requested_vl > self.max_vl => {
                Err(VectorError::OutOfRange(format!(
                    "requested vl {} exceeds maximum {}",
                    requested_vl, self.max_vl
                )))
            }
            _ => Ok(()),
        }
    }

    /// Decode then validate.
    pub fn decode_validated(&self, word: u32) -> VectorResult<InstructionDescriptor> {
        let desc = self.decode(word)?;
        self.validate(&desc)?;
        Ok(desc)
    }
}

/// Decode with the default decoder.
pub fn decode(word: u32) -> VectorResult<InstructionDescriptor> {
    InstructionDecoder::new().decode(word)
}


#[cfg(test)]
mod tests {
    use super::encode::*;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify(0x0000_7057), InstructionType::Vsetvli);
        assert_eq!(classify(0x0000_0057), InstructionType::Varith);
        assert_eq!(classify(0x0000_0007), InstructionType::Vmem);
        assert_eq!(classify(0x0000_0027), InstructionType::Vmem);
        assert_eq!(classify(0x0000_0013), InstructionType::Invalid);
        assert_eq!(classify(0x0000_0043), InstructionType::Varith);
        assert_eq!(classify(0x0000_7043), InstructionType::Varith);
    }

    #[test]
    fn test_decode_vsetvli() {
        // vsetvli x5, x16, e32,m2
        let word = (0x011 << 20) | (16 << 15) | (7 << 12) | (5 << 7) | 0x57;
        let desc = decode(word).unwrap();

        assert_eq!(desc.instruction_type(), InstructionType::Vsetvli);
        assert!(desc.modifies_vl);
        assert!(!desc.uses_mask);
        assert_eq!(desc.latency, 1);
        assert_eq!(desc.kind, InstructionKind::Config { requested_vl: 16, vtypei: 0x011 });
    }

    #[test]
    fn test_decode_vadd_vv() {
        // vadd.vv v3, v2, v1
        let desc = decode(op_v(0x00, false, 2, 1, 0, 3)).unwrap();
        assert_eq!(desc.kind, InstructionKind::Arithmetic { op: ArithOp::Add, category: ArithCategory::Opivv });
        assert_eq!((desc.vd, desc.vs1, desc.vs2), (3, 1, 2));
        assert!(!desc.uses_mask);
        assert_eq!(desc.latency, 2);
        assert_eq!(desc.to_string(), "vadd.vv v3, v2, v1");
    }

    #[test]
    fn test_decode_mul_div_latency() {
        let mul = decode(op_v(0x25, false, 4, 5, 2, 6)).unwrap();
        assert!(matches!(mul.kind, InstructionKind::Arithmetic { op: ArithOp::Mul, .. }));
        assert_eq!(mul.latency, 5);

        let div = decode(op_v(0x20, true, 4, 5, 6, 6)).unwrap();
        assert!(matches!(div.kind, InstructionKind::Arithmetic { op: ArithOp::Div, category: ArithCategory::Opmvx }));
        assert!(div.uses_mask);
        assert_eq!(div.latency, 5);

        let fmul = decode(op_v(0x25, false, 1, 2, 1, 3)).unwrap();
        assert!(matches!(fmul.kind, InstructionKind::Arithmetic { op: ArithOp::Mul, category: ArithCategory::Opfvv }));
        assert_eq!(fmul.to_string(), "vfmul.vv v3, v1, v2");
    }

    #[test]
    fn test_decode_madd() {
        // funct6 0x25 under the MADD opcode, masked
        let word = op_v(0x25, true, 4, 5, 0, 6) & !0x7F | OPCODE_MADD as u32;
        let desc = decode(word).unwrap();
        assert_eq!(desc.instruction_type(), InstructionType::Varith);
        assert_eq!(desc.kind, InstructionKind::Arithmetic { op: ArithOp::Mul, category: ArithCategory::Madd });
        assert!(desc.uses_mask);
        assert_eq!(desc.latency, 5);
        assert!(!desc.memory_access);
    }

    #[test]
    fn test_decode_other_ops() {
        let cases = [
            (0x02, 0, ArithOp::Sub, 2),
            (0x20, 0, ArithOp::Div, 5),
            (0x24, 0, ArithOp::And, 2),
            (0x25, 0, ArithOp::Mul, 5),
            (0x28, 4, ArithOp::Or, 2),
            (0x2C, 3, ArithOp::Xor, 2),
            (0x30, 0, ArithOp::Shift, 2),
            (0x34, 3, ArithOp::Shift, 2),
            (0x38, 4, ArithOp::Shift, 2),
            (0x18, 0, ArithOp::Compare, 2),
            (0x1B, 1, ArithOp::Compare, 2),
        ];
        for (funct6, funct3, expected, latency) in cases {
            let desc = decode(op_v(funct6, false, 1, 2, funct3, 3)).unwrap();
            match desc.kind {
                InstructionKind::Arithmetic { op, .. } => assert_eq!(op, expected, "funct6 0x{:02X}", funct6),
                other => panic!("unexpected kind {:?}", other),
            }
            assert_eq!(desc.latency, latency, "funct6 0x{:02X}", funct6);
        }
    }

    #[test]
    fn test_decode_reduction() {
        // vredsum.vs v4, v8, v4
        let desc = decode(op_v(0x00, false, 8, 4, 2, 4)).unwrap();
        assert!(desc.is_reduction());
        assert!(InstructionDecoder::new().validate(&desc).is_ok());

        let bad = decode(op_v(0x00, false, 8, 5, 2, 4)).unwrap();
        assert!(matches!(InstructionDecoder::new().validate(&bad), Err(VectorError::InvalidOperand(_))));

        // funct6 0 outside OPMVV is a plain add
        let add = decode(op_v(0x00, false, 8, 5, 6, 4)).unwrap();
        assert!(matches!(add.kind, InstructionKind::Arithmetic { op: ArithOp::Add, category: ArithCategory::Opmvx }));
        assert!(InstructionDecoder::new().validate(&add).is_ok());
    }

    #[test]
    fn test_unknown_funct6_decodes_as_add() {
        for funct6 in [0x01, 0x09, 0x3F] {
            let desc = decode(op_v(funct6, false, 1, 2, 0, 3)).unwrap();
            assert!(matches!(desc.kind, InstructionKind::Arithmetic { op: ArithOp::Add, .. }));
            assert_eq!(desc.latency, 2);
        }
    }

    #[test]
    fn test_decode_memory() {
        // vle v1, (x10)
        let load = decode(mem(OPCODE_LOAD_FP, false, 0, 10, 0, 1)).unwrap();
        assert_eq!(load.instruction_type(), InstructionType::Vmem);
        assert!(load.memory_access);
        assert_eq!(load.latency, 10);
        assert_eq!(
            load.kind,
            InstructionKind::Memory { mode: MemAccessMode::UnitStride, direction: Direction::Load }
        );

        let modes = [
            (1, MemAccessMode::Segment),
            (2, MemAccessMode::Strided),
            (3, MemAccessMode::Indexed),
            (4, MemAccessMode::WholeRegister),
        ];
        for (funct3, mode) in modes {
            let store = decode(mem(OPCODE_STORE_FP, false, 2, 11, funct3, 4)).unwrap();
            assert_eq!(store.kind, InstructionKind::Memory { mode, direction: Direction::Store });
        }

        for funct3 in 5..8 {
            let desc = decode(mem(OPCODE_LOAD_FP, false, 0, 10, funct3, 1)).unwrap();
            assert_eq!(desc.kind, InstructionKind::Memory { mode: MemAccessMode::UnitStride, direction: Direction::Load });
        }
    }

    #[test]
    fn test_masked_memory_to_v0() {
        let decoder = InstructionDecoder::new();
        let desc = decode(mem(OPCODE_LOAD_FP, true, 0, 10, 0, 0)).unwrap();
        assert!(desc.uses_mask);
        assert!(matches!(decoder.validate(&desc), Err(VectorError::InvalidOperand(_))));

        let unmasked = decode(mem(OPCODE_LOAD_FP, false, 0, 10, 0, 0)).unwrap();
        assert!(decoder.validate(&unmasked).is_ok());
    }

    #[test]
    fn test_register_range() {
        let mut desc = InstructionDescriptor::arithmetic(ArithOp::Add, 1, 2, 3);
        desc.vs2 = 32;
        assert!(matches!(InstructionDecoder::new().validate(&desc), Err(VectorError::OutOfRange(_))));
    }

    #[test]
    fn test_vl_ceiling() {
        let cap = VectorCapability::new(128, 64, 1).unwrap();
        let decoder = InstructionDecoder::for_capability(&cap);
        assert_eq!(decoder.max_vl(), 128);

        let small = InstructionDecoder { max_vl: 8 };
        let word = (20 << 15) | (7 << 12) | 0x57;
        let desc = small.decode(word).unwrap();
        assert!(matches!(small.validate(&desc), Err(VectorError::OutOfRange(_))));
        assert!(decoder.decode_validated(word).is_ok());
    }

    #[test]
    fn test_immediate_sign_extension() {
        // vadd.vi v1, v2, -3
        let desc = decode(op_v(0x00, false, 2, 0b11101, 3, 1)).unwrap();
        assert_eq!(desc.immediate(), Some(-3));
        assert_eq!(desc.to_string(), "vadd.vi v1, v2, -3");
    }

    proptest! {
        #[test]
        fn decode_never_panics(word in any::<u32>()) {
            let result = decode(word);
            if classify(word) == InstructionType::Invalid {
                prop_assert_eq!(&result, &Err(VectorError::Decode(word)));
            } else {
                // Every vector opcode decodes
                prop_assert!(result.is_ok());
            }
            if let Ok(desc) = result {
                prop_assert!(desc.vd < 32 && desc.vs1 < 32 && desc.vs2 < 32);
                prop_assert!([1, 2, 5, 10].contains(&desc.latency), "latency {}", desc.latency);
                prop_assert_eq!(desc.instruction_type(), classify(word));
            }
        }
    }
}
