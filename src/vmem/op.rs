//! Memory-operation descriptors and their validation.

use std::fmt;

use crate::error::{VectorError, VectorResult};

/// Transfer direction relative to the vector unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device memory into the staging buffer.
    Load,
    /// Staging buffer into device memory.
    Store,
}

/// Addressing mode, without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressingMode {
    UnitStride,
    Strided,
    Indexed,
    Segment,
}

impl AddressingMode {
    /// Mode field of the control register.
    pub fn code(self) -> u32 {
        match self {
            AddressingMode::UnitStride => 0,
            AddressingMode::Strided => 1,
            AddressingMode::Indexed => 2,
            AddressingMode::Segment => 3,
        }
    }
}

impl fmt::Display for AddressingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddressingMode::UnitStride => "unit-stride",
            AddressingMode::Strided => "strided",
            AddressingMode::Indexed => "indexed",
            AddressingMode::Segment => "segment",
        };
        f.write_str(name)
    }
}

/// Addressing mode with its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// Elements packed back to back.
    UnitStride,
    /// Element `i` at `base + i * stride`.
    Strided { stride: u64 },
    /// Element `i` at `base + indices[i]`.
    Indexed { indices: Vec<u64> },
    /// Each element is a record of `fields` equally sized fields,
    /// de-interleaved field-major in the staging buffer.
    Segment { fields: u32 },
}

impl Layout {
    pub fn mode(&self) -> AddressingMode {
        match self {
            Layout::UnitStride => AddressingMode::UnitStride,
            Layout::Strided { .. } => AddressingMode::Strided,
            Layout::Indexed { .. } => AddressingMode::Indexed,
            Layout::Segment { .. } => AddressingMode::Segment,
        }
    }
}

/// One vector load or store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorMemoryOp {
    pub direction: Direction,
    /// Device address of element 0.
    pub base: u64,
    pub elements: u32,
    /// Bytes per element (per record for segment accesses).
    pub element_size: u32,
    pub layout: Layout,
    /// Staging-buffer image: the source of a store, the result of a load.
    payload: Vec<u8>,
}

impl VectorMemoryOp {
    fn build(direction: Direction, base: u64, elements: u32, element_size: u32, layout: Layout) -> Self {
        Self { direction, base, elements, element_size, layout, payload: Vec::new() }
    }

    pub fn unit_stride(direction: Direction, base: u64, elements: u32, element_size: u32) -> Self {
        Self::build(direction, base, elements, element_size, Layout::UnitStride)
    }

    pub fn strided(direction: Direction, base: u64, elements: u32, element_size: u32, stride: u64) -> Self {
        Self::build(direction, base, elements, element_size, Layout::Strided { stride })
    }

    /// Gather or scatter through byte offsets relative to `base`.
    pub fn indexed(direction: Direction, base: u64, element_size: u32, indices: Vec<u64>) -> Self {
        let elements = u32::try_from(indices.len()).unwrap_or(u32::MAX);
        Self::build(direction, base, elements, element_size, Layout::Indexed { indices })
    }

    pub fn segment(direction: Direction, base: u64, elements: u32, element_size: u32, fields: u32) -> Self {
        Self::build(direction, base, elements, element_size, Layout::Segment { fields })
    }

    /// Attach a staging image (the data of a store).
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn mode(&self) -> AddressingMode {
        self.layout.mode()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub(crate) fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.payload
    }

    /// Staging-buffer size in bytes.
    pub fn transfer_size(&self) -> VectorResult<usize> {
        let per_element = match self.layout {
            Layout::Strided { stride } => stride,
            _ => self.element_size as u64,
        };
        (self.elements as u64)
            .checked_mul(per_element)
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or_else(|| {
                VectorError::OutOfRange(format!(
                    "{} elements x {} bytes overflows the address space",
                    self.elements, per_element
                ))
            })
    }

    /// Reject malformed operations before any buffer is allocated.
    pub fn validate(&self) -> VectorResult<()> {
        if self.elements == 0 {
            return Err(VectorError::OutOfRange("memory operation has zero elements".into()));
        }
        if self.element_size == 0 {
            return Err(VectorError::OutOfRange("memory operation has zero element size".into()));
        }

        match &self.layout {
            Layout::UnitStride => {}
            Layout::Strided { stride } => {
                if *stride == 0 {
                    return Err(VectorError::InvalidOperand("strided access with zero stride".into()));
                }
                // Element i is staged at i * stride
                if *stride < self.element_size as u64 {
                    return Err(VectorError::InvalidOperand(format!(
                        "stride {} is smaller than the {} byte element",
                        stride, self.element_size
                    )));
                }
            }
            Layout::Indexed { indices } => {
                if indices.len() != self.elements as usize {
                    return Err(VectorError::InvalidOperand(format!(
                        "{} indices for {} elements",
                        indices.len(),
                        self.elements
                    )));
                }
            }
            Layout::Segment { fields } => {
                if *fields == 0 {
                    return Err(VectorError::InvalidOperand("segment access with zero fields".into()));
                }
                if self.element_size % fields != 0 {
                    return Err(VectorError::InvalidOperand(format!(
                        "{} byte record does not split into {} fields",
                        self.element_size, fields
                    )));
                }
            }
        }

        let size = self.transfer_size()?;
        if self.direction == Direction::Store && !self.payload.is_empty() && self.payload.len() != size {
            return Err(VectorError::InvalidOperand(format!(
                "store payload is {} bytes, transfer needs {}",
                self.payload.len(),
                size
            )));
        }
        Ok(())
    }
}

impl fmt::Display for VectorMemoryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::Load => "load",
            Direction::Store => "store",
        };
        write!(
            f,
            "{} {} @ 0x{:X}: {} x {} bytes",
            self.mode(),
            dir,
            self.base,
            self.elements,
            self.element_size
        )?;
        match &self.layout {
            Layout::Strided { stride } => write!(f, ", stride {}", stride),
            Layout::Segment { fields } => write!(f, ", {} fields", fields),
            _ => Ok(()),
        }
    }
}
