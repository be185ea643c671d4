//! Error type shared by every runtime component.
//!
//! Validation failures (`InvalidConfig`, `OutOfRange`, `InvalidOperand`,
//! `IllegalVtype`, `Decode`) are returned to the caller unchanged. Resource
//! failures (`OutOfMemory`, `NoCapacity`) are reported only after any partial
//! allocation has been unwound. Hardware faults (`Io`, `Hardware`, `Timeout`)
//! are additionally counted by the context manager.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type VectorResult<T> = Result<T, VectorError>;

/// Errors raised by the vector engine runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VectorError {
    /// Hardware capability descriptor violates its bounds.
    #[error("Invalid vector configuration: {0}")]
    InvalidConfig(String),

    /// The vector unit (or the addressed lane window) is not present.
    #[error("Vector unit unavailable: {0}")]
    DeviceUnavailable(String),

    /// A buffer allocation failed.
    #[error("Out of memory allocating {bytes} bytes")]
    OutOfMemory { bytes: usize },

    /// A register index, length or bound is outside its legal range.
    #[error("Value out of range: {0}")]
    OutOfRange(String),

    /// An operand combination is architecturally illegal.
    #[error("Invalid operand: {0}")]
    InvalidOperand(String),

    /// The VTYPE image has its `vill` bit set.
    #[error("Illegal VTYPE 0x{0:016X}")]
    IllegalVtype(u64),

    /// The object is not in a state that permits the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A register accessor failed.
    #[error("Register I/O failed at offset 0x{offset:X}: {reason}")]
    Io { offset: u64, reason: String },

    /// The instruction word does not decode to a vector instruction.
    #[error("Cannot decode instruction 0x{0:08X}")]
    Decode(u32),

    /// A bounded wait elapsed (or was cancelled) before completion.
    #[error("Timed out after {waited_ms} ms{}", if *cancelled { " (cancelled)" } else { "" })]
    Timeout { waited_ms: u64, cancelled: bool },

    /// The device latched an error status.
    #[error("Hardware reported error status 0x{status:08X}")]
    Hardware { status: u32 },

    /// Every slot of a fixed-size resource is taken.
    #[error("No capacity left in {0}")]
    NoCapacity(&'static str),
}

impl VectorError {
    /// Whether this error originated from the device rather than the caller.
    pub fn is_hardware_fault(&self) -> bool {
        matches!(
            self,
            VectorError::Io { .. } | VectorError::Hardware { .. } | VectorError::Timeout { .. }
        )
    }

    /// Whether this error is a synchronous validation rejection.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            VectorError::InvalidConfig(_)
                | VectorError::OutOfRange(_)
                | VectorError::InvalidOperand(_)
                | VectorError::IllegalVtype(_)
                | VectorError::Decode(_)
        )
    }

    /// Map a failed `try_reserve` into an allocation error.
    pub(crate) fn oom(bytes: usize) -> Self {
        VectorError::OutOfMemory { bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_classification() {
        assert!(VectorError::Hardware { status: 3 }.is_hardware_fault());
        assert!(VectorError::Timeout { waited_ms: 10, cancelled: false }.is_hardware_fault());
        assert!(VectorError::Io { offset: 0x40, reason: "bus".into() }.is_hardware_fault());
        assert!(!VectorError::Decode(0).is_hardware_fault());

        assert!(VectorError::IllegalVtype(1 << 63).is_validation());
        assert!(!VectorError::NoCapacity("vrf").is_validation());
    }

    #[test]
    fn test_display() {
        let e = VectorError::Timeout { waited_ms: 1000, cancelled: true };
        assert_eq!(e.to_string(), "Timed out after 1000 ms (cancelled)");

        let e = VectorError::Decode(0xDEAD_BEEF);
        assert_eq!(e.to_string(), "Cannot decode instruction 0xDEADBEEF");
    }
}
