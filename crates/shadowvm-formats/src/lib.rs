//! # shadowvm-formats
//!
//! Guest binary parsing for the shadowvm emulator. The guest ABI is 32-bit
//! little-endian ELF executables, so that is all this crate understands:
//! the ELF header, program headers (PT_LOAD and PT_TLS), section headers,
//! and the symbol tables the emulator needs for malloc/free interposition
//! and backtrace symbolication.

pub mod elf;
pub mod error;
pub mod symbols;

pub use elf::{Elf, ElfHeader, ProgramHeader, SectionHeader, SymbolEntry};
pub use error::ParseError;
pub use symbols::{FunctionRange, Symbols};

/// True when the buffer starts with the ELF magic.
pub fn looks_like_elf(data: &[u8]) -> bool {
    data.len() >= 4 && data[0..4] == [0x7f, b'E', b'L', b'F']
}
