//! Error types for guest binary parsing.

use thiserror::Error;

/// Error type for ELF parsing.
#[derive(Error, Debug)]
pub enum ParseError {
    /// Invalid magic number at start of file.
    #[error("invalid magic number: expected 7f 45 4c 46, got {actual:02x?}")]
    InvalidMagic { actual: Vec<u8> },

    /// File is too short to contain required data.
    #[error("file too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// The file is a valid ELF but not one the emulator can run.
    #[error("unsupported guest binary: {0}")]
    UnsupportedBinary(&'static str),

    /// Invalid structure encountered during parsing.
    #[error("invalid {kind} at offset {offset:#x}: {reason}")]
    InvalidStructure {
        kind: &'static str,
        offset: u64,
        reason: String,
    },
}

impl ParseError {
    /// Creates a new TooShort error.
    pub fn too_short(expected: usize, actual: usize) -> Self {
        Self::TooShort { expected, actual }
    }

    /// Creates a new InvalidStructure error.
    pub fn invalid_structure(kind: &'static str, offset: u64, reason: impl Into<String>) -> Self {
        Self::InvalidStructure {
            kind,
            offset,
            reason: reason.into(),
        }
    }
}
