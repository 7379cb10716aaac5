//! # shadowvm-emulate
//!
//! The execution core of shadowvm: a software MMU with typed, shadow-tracked
//! memory regions, a 32-bit x86 soft CPU that propagates per-byte definedness
//! through every operation, a syscall gateway that marshals guest system
//! calls to the host, and a malloc tracer that watches the guest allocator to
//! diagnose heap defects.

pub mod backtrace;
pub mod cpu;
pub mod emulator;
pub mod flags;
pub mod malloc_tracer;
pub mod mmu;
pub mod region;
pub mod syscalls;
pub mod vm_alloc;

pub use cpu::{CpuEvent, SoftCpu};
pub use emulator::Emulator;
pub use malloc_tracer::{BlockState, MallocTracer};
pub use mmu::Mmu;
pub use region::{Region, RegionKind};
pub use vm_alloc::VmAllocator;

use shadowvm_core::Address;
use shadowvm_disasm::DecodeError;
use shadowvm_formats::ParseError;
use std::fmt;
use thiserror::Error;

/// Guest page size.
pub const PAGE_SIZE: u32 = 4096;

/// Rounds up to the next page boundary.
pub fn page_round_up(value: u32) -> u32 {
    value.wrapping_add(PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Rounds down to the containing page boundary.
pub fn page_round_down(value: u32) -> u32 {
    value & !(PAGE_SIZE - 1)
}

/// The kind of access that caused a guest memory fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
            AccessKind::Execute => "execute",
        })
    }
}

/// Why a guest memory access faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    NotMapped,
    NotReadable,
    NotWritable,
    NotExecutable,
    /// The access runs off the end of its region.
    OutOfBounds,
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FaultReason::NotMapped => "address is not mapped",
            FaultReason::NotReadable => "region is not readable",
            FaultReason::NotWritable => "region is not writable",
            FaultReason::NotExecutable => "region is not executable",
            FaultReason::OutOfBounds => "access straddles the region boundary",
        })
    }
}

/// A guest memory fault. Currently always fatal to the emulated process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid {kind} of {address}: {reason}")]
pub struct MemFault {
    pub address: Address,
    pub kind: AccessKind,
    pub reason: FaultReason,
}

impl MemFault {
    pub fn new(address: Address, kind: AccessKind, reason: FaultReason) -> Self {
        Self {
            address,
            kind,
            reason,
        }
    }

    pub fn not_mapped(address: Address, kind: AccessKind) -> Self {
        Self::new(address, kind, FaultReason::NotMapped)
    }
}

/// Errors that stop emulation. Every variant is reported with a guest
/// backtrace before the emulator exits.
#[derive(Debug, Error)]
pub enum EmuError {
    #[error(transparent)]
    Mem(#[from] MemFault),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("failed to load guest binary: {0}")]
    Load(#[from] ParseError),

    #[error("division error at {eip:#010x}")]
    DivideError { eip: u32 },

    #[error("unknown syscall {function} at {eip:#010x}")]
    UnknownSyscall { function: u32, eip: u32 },

    #[error("not yet implemented: {what} (at {eip:#010x})")]
    Unimplemented { what: String, eip: u32 },
}

impl EmuError {
    pub fn unimplemented(what: impl Into<String>, eip: u32) -> Self {
        Self::Unimplemented {
            what: what.into(),
            eip,
        }
    }
}
