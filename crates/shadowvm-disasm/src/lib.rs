//! # shadowvm-disasm
//!
//! IA-32 instruction decoder for the shadowvm emulator.
//!
//! The decoder consumes bytes through the [`InsnStream`] trait, one
//! instruction per call; in the emulator the stream is the soft CPU itself,
//! so fetches go through the software MMU and advance EIP as a side effect.
//! The decoded [`Insn`] is a flat operation + operands form that the CPU's
//! execution step dispatches on.
//!
//! Coverage is the integer IA-32 core produced by C compilers. Anything
//! outside it (x87, MMX/SSE, 16-bit addressing, privileged instructions)
//! decodes to an error, which the emulator treats as fatal.

pub mod decoder;
pub mod insn;
pub mod stream;

pub use decoder::decode;
pub use insn::regs;
pub use insn::{Cond, Insn, MemRef, Op, Operand, Rep, Width};
pub use stream::{InsnStream, SliceStream};

use thiserror::Error;

/// Errors that can occur while decoding one instruction.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// An opcode outside the supported set.
    #[error("unknown opcode {opcode:#04x} (two-byte: {two_byte}) at {address:#010x}")]
    UnknownOpcode {
        address: u32,
        opcode: u8,
        two_byte: bool,
    },

    /// A known opcode using an encoding the emulator does not support.
    #[error("unsupported encoding at {address:#010x}: {what}")]
    Unsupported { address: u32, what: &'static str },

    /// The instruction stream could not supply the next byte.
    ///
    /// From a slice-backed stream this means truncated input; from the soft
    /// CPU it wraps a guest memory fault on the fetch path.
    #[error("instruction fetch failed at {address:#010x}")]
    Fetch { address: u32 },
}

impl DecodeError {
    pub fn unknown(address: u32, opcode: u8, two_byte: bool) -> Self {
        Self::UnknownOpcode {
            address,
            opcode,
            two_byte,
        }
    }

    pub fn unsupported(address: u32, what: &'static str) -> Self {
        Self::Unsupported { address, what }
    }
}
