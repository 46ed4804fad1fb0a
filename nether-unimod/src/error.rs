//! Error types for the unified module representation

use thiserror::Error;

/// Errors raised while building, validating or reading unified modules
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UniError {
    /// Read past the end of the module stream
    #[error("unexpected end of module stream")]
    EndOfStream,
    /// Seek target lies outside the module stream
    #[error("seek out of range: {0}")]
    SeekOutOfRange(i64),
    /// Opcode outside the supported range
    #[error("invalid opcode {opcode} at offset {offset}")]
    InvalidOpcode { opcode: u8, offset: usize },
    /// Opcode operands extend past the end of their row
    #[error("opcode {opcode} at offset {offset} overruns its row")]
    OperandOverrun { opcode: u8, offset: usize },
    /// Row header declares a length of zero
    #[error("empty row header at offset {0}")]
    EmptyRow(usize),
    /// Row does not fit in the 5-bit length field
    #[error("row too long: {0} bytes (max 31)")]
    RowTooLong(usize),
    /// Track runs off the end of its buffer without a terminator
    #[error("track is not terminated")]
    Unterminated,
    /// Allocation called before the count it depends on was set, or out of order
    #[error("{0} allocated out of order")]
    AllocationOrder(&'static str),
    /// Allocation request exceeds hard limits
    #[error("cannot allocate {count} {what}")]
    AllocationSize { what: &'static str, count: usize },
    /// Module descriptor failed a structural invariant
    #[error("invalid module: {0}")]
    InvalidModule(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            UniError::EndOfStream.to_string(),
            "unexpected end of module stream"
        );
        assert_eq!(
            UniError::InvalidOpcode {
                opcode: 99,
                offset: 3
            }
            .to_string(),
            "invalid opcode 99 at offset 3"
        );
        assert_eq!(UniError::RowTooLong(40).to_string(), "row too long: 40 bytes (max 31)");
    }
}
