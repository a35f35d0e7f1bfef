//! Compilation error taxonomy.

use thiserror::Error;

/// Why a program could not be compiled.
///
/// All of these are recoverable for the caller: the program can still be
/// interpreted. None of them abort the process.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    /// The translator has no lowering for this opcode.
    #[error("unsupported opcode {opcode:#04x} at instruction {index}")]
    UnsupportedOpcode { index: usize, opcode: u16 },

    /// A branch displacement does not fit the 16-bit branch field.
    #[error("branch to slot {target} needs displacement {displacement}, out of 16-bit range")]
    DisplacementOverflow { target: usize, displacement: i64 },

    /// Executable memory could not be allocated or protected.
    #[error("executable memory unavailable: {reason}")]
    ResourceExhaustion { reason: String },

    /// The input program violates structural rules the verifier should
    /// have enforced (illegal register, bad wide immediate, runaway
    /// control flow).
    #[error("malformed program at instruction {index}: {reason}")]
    MalformedInput { index: usize, reason: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = CompileError::UnsupportedOpcode {
            index: 3,
            opcode: 0x87,
        };
        assert_eq!(e.to_string(), "unsupported opcode 0x87 at instruction 3");

        let e = CompileError::DisplacementOverflow {
            target: 40000,
            displacement: 39990,
        };
        assert!(e.to_string().contains("39990"));
    }
}
