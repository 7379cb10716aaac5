//! Heap inspection by allocator interposition.
//!
//! The tracer watches the guest's own `malloc`/`free` by EIP window: at the
//! entry of `malloc` it captures the size argument and the return site from
//! the stack, and when execution reaches that return site it reads the
//! returned pointer out of EAX. Freed blocks stay registered (and poisoned)
//! until their address is handed out again, which is what makes
//! use-after-free attributable to an exact allocation.

use crate::backtrace;
use crate::mmu::Mmu;
use crate::AccessKind;
use shadowvm_core::{report, reportln, Address};
use shadowvm_formats::{FunctionRange, Symbols};
use std::collections::BTreeMap;

/// Heap block lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Live,
    Freed,
}

/// One tracked guest heap block, keyed by its user address.
#[derive(Debug, Clone)]
pub struct HeapBlock {
    pub address: u32,
    pub size: u32,
    pub state: BlockState,
    pub alloc_backtrace: Vec<u32>,
    pub free_backtrace: Option<Vec<u32>>,
}

#[derive(Debug)]
struct PendingMalloc {
    size: u32,
    return_site: u32,
    backtrace: Vec<u32>,
}

/// Watches the guest allocator and maintains the heap-block registry.
#[derive(Debug, Default)]
pub struct MallocTracer {
    blocks: BTreeMap<u32, HeapBlock>,
    malloc_range: Option<FunctionRange>,
    free_range: Option<FunctionRange>,
    /// A malloc call whose return site has not been reached yet. Recursive
    /// malloc is not tracked; the innermost call wins.
    pending: Option<PendingMalloc>,
}

impl MallocTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the tracer with the allocator's EIP windows.
    pub fn set_ranges(&mut self, malloc: FunctionRange, free: FunctionRange) {
        self.malloc_range = Some(malloc);
        self.free_range = Some(free);
    }

    pub fn is_active(&self) -> bool {
        self.malloc_range.is_some()
    }

    /// True while EIP is inside the allocator itself; accesses there are the
    /// allocator's own bookkeeping, not guest bugs.
    pub fn is_in_malloc_or_free(&self, eip: u32) -> bool {
        self.malloc_range
            .as_ref()
            .is_some_and(|r| r.contains(eip))
            || self.free_range.as_ref().is_some_and(|r| r.contains(eip))
    }

    /// Consulted at every instruction boundary with the CPU's scalar state.
    pub fn on_instruction(
        &mut self,
        base_eip: u32,
        eax: u32,
        esp: u32,
        ebp: u32,
        mmu: &mut Mmu,
        symbols: Option<&Symbols>,
    ) {
        let at_return_site = self
            .pending
            .as_ref()
            .is_some_and(|p| base_eip == p.return_site && !self.is_in_malloc_or_free(base_eip));
        if at_return_site {
            if let Some(pending) = self.pending.take() {
                if eax != 0 {
                    self.target_did_malloc(eax, pending.size, pending.backtrace, mmu);
                }
            }
        }

        if self.malloc_range.as_ref().is_some_and(|r| base_eip == r.start) {
            // At malloc entry [esp] is the return site and [esp+4] the size.
            let Ok(return_site) = mmu.read32(Address::flat(esp)) else {
                return;
            };
            let Ok(size) = mmu.read32(Address::flat(esp.wrapping_add(4))) else {
                return;
            };
            self.pending = Some(PendingMalloc {
                size: size.value(),
                return_site: return_site.value(),
                backtrace: backtrace::raw_backtrace(base_eip, ebp, mmu),
            });
        } else if self.free_range.as_ref().is_some_and(|r| base_eip == r.start) {
            if let Ok(pointer) = mmu.read32(Address::flat(esp.wrapping_add(4))) {
                self.target_did_free(pointer.value(), base_eip, ebp, mmu, symbols);
            }
        }
    }

    fn target_did_malloc(&mut self, address: u32, size: u32, alloc_backtrace: Vec<u32>, mmu: &mut Mmu) {
        // Reusing an address retires whatever block was recorded there.
        self.blocks.remove(&address);
        // Fresh heap memory is undefined until the guest writes it.
        mmu.poison_range(address, size);
        self.blocks.insert(
            address,
            HeapBlock {
                address,
                size,
                state: BlockState::Live,
                alloc_backtrace,
                free_backtrace: None,
            },
        );
    }

    fn target_did_free(
        &mut self,
        address: u32,
        base_eip: u32,
        ebp: u32,
        mmu: &mut Mmu,
        symbols: Option<&Symbols>,
    ) {
        if address == 0 {
            return; // free(NULL)
        }
        let pid = report::pid();
        match self.blocks.get_mut(&address) {
            Some(block) if block.state == BlockState::Live => {
                let current = backtrace::raw_backtrace(base_eip, ebp, mmu);
                block.state = BlockState::Freed;
                block.free_backtrace = Some(current);
                mmu.poison_range(address, block.size);
            }
            Some(block) => {
                reportln!(
                    "=={}==  \x1b[31;1mDouble free of {:#010x} ({} bytes)\x1b[0m",
                    pid,
                    address,
                    block.size
                );
                backtrace::dump_backtrace(
                    &backtrace::raw_backtrace(base_eip, ebp, mmu),
                    symbols,
                );
                if let Some(free_backtrace) = &block.free_backtrace {
                    reportln!("=={}==  Previously freed at:", pid);
                    backtrace::dump_backtrace(free_backtrace, symbols);
                }
                report::note_diagnostic();
            }
            None => {
                reportln!(
                    "=={}==  \x1b[31;1mFree of untracked address {:#010x}\x1b[0m",
                    pid,
                    address
                );
                backtrace::dump_backtrace(
                    &backtrace::raw_backtrace(base_eip, ebp, mmu),
                    symbols,
                );
                report::note_diagnostic();
            }
        }
    }

    /// Checks a guest memory access against the freed-block registry.
    pub fn audit(
        &self,
        kind: AccessKind,
        address: u32,
        len: u32,
        base_eip: u32,
        ebp: u32,
        mmu: &Mmu,
        symbols: Option<&Symbols>,
    ) {
        if !self.is_active() || self.is_in_malloc_or_free(base_eip) {
            return;
        }
        let Some(block) = self.block_containing(address) else {
            return;
        };
        if block.state != BlockState::Freed {
            return;
        }

        let pid = report::pid();
        reportln!(
            "=={}==  \x1b[31;1mUse-after-free: {} of size {} at {:#010x} (in block {:#010x}, {} bytes)\x1b[0m",
            pid,
            kind,
            len,
            address,
            block.address,
            block.size
        );
        backtrace::dump_backtrace(&backtrace::raw_backtrace(base_eip, ebp, mmu), symbols);
        reportln!("=={}==  Allocated at:", pid);
        backtrace::dump_backtrace(&block.alloc_backtrace, symbols);
        if let Some(free_backtrace) = &block.free_backtrace {
            reportln!("=={}==  Freed at:", pid);
            backtrace::dump_backtrace(free_backtrace, symbols);
        }
        report::note_diagnostic();
    }

    fn block_containing(&self, address: u32) -> Option<&HeapBlock> {
        let (_, block) = self.blocks.range(..=address).next_back()?;
        (address < block.address.wrapping_add(block.size)).then_some(block)
    }

    pub fn block_at(&self, address: u32) -> Option<&HeapBlock> {
        self.blocks.get(&address)
    }

    pub fn live_blocks(&self) -> impl Iterator<Item = &HeapBlock> {
        self.blocks
            .values()
            .filter(|b| b.state == BlockState::Live)
    }

    /// Prints the end-of-run leak report, grouped by allocation site.
    pub fn dump_leak_report(&self, symbols: Option<&Symbols>) {
        let pid = report::pid();
        let mut groups: Vec<(&Vec<u32>, u32, u32)> = Vec::new();
        for block in self.live_blocks() {
            match groups
                .iter_mut()
                .find(|(backtrace, _, _)| *backtrace == &block.alloc_backtrace)
            {
                Some((_, count, bytes)) => {
                    *count += 1;
                    *bytes += block.size;
                }
                None => groups.push((&block.alloc_backtrace, 1, block.size)),
            }
        }

        for (alloc_backtrace, count, bytes) in &groups {
            reportln!(
                "=={}==  \x1b[31;1mLeaked {} byte(s) in {} allocation(s)\x1b[0m, allocated at:",
                pid,
                bytes,
                count
            );
            backtrace::dump_backtrace(alloc_backtrace, symbols);
        }
        if !groups.is_empty() {
            let total: u32 = groups.iter().map(|(_, _, bytes)| *bytes).sum();
            reportln!("=={}==  {} byte(s) leaked in total", pid, total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;

    fn heap_mmu() -> Mmu {
        let mut mmu = Mmu::new();
        mmu.add_region(Region::simple(0x2000_0000, 0x10000));
        mmu
    }

    fn armed_tracer() -> MallocTracer {
        let mut tracer = MallocTracer::new();
        tracer.set_ranges(
            FunctionRange {
                name: "malloc".into(),
                start: 0x1000,
                size: 0x40,
            },
            FunctionRange {
                name: "free".into(),
                start: 0x1040,
                size: 0x20,
            },
        );
        tracer
    }

    #[test]
    fn tracks_a_malloc_free_cycle() {
        let mut tracer = armed_tracer();
        let mut mmu = heap_mmu();

        tracer.target_did_malloc(0x2000_1000, 32, vec![0x8048000], &mut mmu);
        let block = tracer.block_at(0x2000_1000).unwrap();
        assert_eq!(block.state, BlockState::Live);
        assert_eq!(block.size, 32);
        // Fresh allocation is poisoned.
        assert!(mmu
            .read8(Address::flat(0x2000_1000))
            .unwrap()
            .is_uninitialized());

        tracer.target_did_free(0x2000_1000, 0x8048010, 0, &mut mmu, None);
        let block = tracer.block_at(0x2000_1000).unwrap();
        assert_eq!(block.state, BlockState::Freed);
        assert!(block.free_backtrace.is_some());
        assert_eq!(tracer.live_blocks().count(), 0);
    }

    #[test]
    fn freed_block_is_poisoned_until_reuse() {
        let mut tracer = armed_tracer();
        let mut mmu = heap_mmu();

        tracer.target_did_malloc(0x2000_2000, 16, vec![], &mut mmu);
        mmu.unpoison_range(0x2000_2000, 16);
        assert!(mmu
            .read8(Address::flat(0x2000_2000))
            .unwrap()
            .is_initialized());

        tracer.target_did_free(0x2000_2000, 0x8048010, 0, &mut mmu, None);
        assert!(mmu
            .read8(Address::flat(0x2000_2000))
            .unwrap()
            .is_uninitialized());

        // Reallocation at the same address retires the freed record.
        tracer.target_did_malloc(0x2000_2000, 16, vec![], &mut mmu);
        assert_eq!(tracer.block_at(0x2000_2000).unwrap().state, BlockState::Live);
    }

    #[test]
    fn double_free_is_diagnosed() {
        let mut tracer = armed_tracer();
        let mut mmu = heap_mmu();
        tracer.target_did_malloc(0x2000_3000, 8, vec![], &mut mmu);
        tracer.target_did_free(0x2000_3000, 0x8048010, 0, &mut mmu, None);

        let before = report::diagnostics_emitted();
        tracer.target_did_free(0x2000_3000, 0x8048020, 0, &mut mmu, None);
        assert!(report::diagnostics_emitted() >= before + 1);
    }

    #[test]
    fn invalid_free_is_diagnosed() {
        let mut tracer = armed_tracer();
        let mut mmu = heap_mmu();
        let before = report::diagnostics_emitted();
        tracer.target_did_free(0x2000_4000, 0x8048010, 0, &mut mmu, None);
        assert!(report::diagnostics_emitted() >= before + 1);
    }

    #[test]
    fn free_null_is_silent() {
        let mut tracer = armed_tracer();
        let mut mmu = heap_mmu();
        let before = report::diagnostics_emitted();
        tracer.target_did_free(0, 0x8048010, 0, &mut mmu, None);
        assert_eq!(report::diagnostics_emitted(), before);
    }

    #[test]
    fn audit_reports_use_after_free_interior_bytes() {
        let mut tracer = armed_tracer();
        let mut mmu = heap_mmu();
        tracer.target_did_malloc(0x2000_5000, 64, vec![], &mut mmu);
        tracer.target_did_free(0x2000_5000, 0x8048010, 0, &mut mmu, None);

        let before = report::diagnostics_emitted();
        tracer.audit(
            AccessKind::Read,
            0x2000_5010,
            4,
            0x8048030,
            0,
            &mmu,
            None,
        );
        assert!(report::diagnostics_emitted() >= before + 1);
    }

    #[test]
    fn audit_is_suppressed_inside_the_allocator() {
        let mut tracer = armed_tracer();
        let mut mmu = heap_mmu();
        tracer.target_did_malloc(0x2000_6000, 8, vec![], &mut mmu);
        tracer.target_did_free(0x2000_6000, 0x8048010, 0, &mut mmu, None);

        let before = report::diagnostics_emitted();
        // base_eip inside the malloc window.
        tracer.audit(AccessKind::Write, 0x2000_6000, 4, 0x1010, 0, &mmu, None);
        assert_eq!(report::diagnostics_emitted(), before);
    }

    #[test]
    fn entry_exit_state_machine() {
        let mut tracer = armed_tracer();
        let mut mmu = heap_mmu();
        let esp = 0x2000_8000u32;
        // Stack at malloc entry: [esp] = return site, [esp+4] = size.
        mmu.copy_to_vm(esp, &0x8048123u32.to_le_bytes()).unwrap();
        mmu.copy_to_vm(esp + 4, &32u32.to_le_bytes()).unwrap();

        // Entering malloc.
        tracer.on_instruction(0x1000, 0, esp, 0, &mut mmu, None);
        // Executing at the return site with the result in EAX.
        tracer.on_instruction(0x8048123, 0x2000_9000, esp + 4, 0, &mut mmu, None);

        let block = tracer.block_at(0x2000_9000).unwrap();
        assert_eq!(block.size, 32);
        assert_eq!(block.state, BlockState::Live);
    }
}
