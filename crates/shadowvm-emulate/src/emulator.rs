//! The top-level driver: guest image loading, initial stack construction,
//! and the fetch-decode-execute loop.

use crate::cpu::{CpuEvent, SoftCpu};
use crate::mmu::Mmu;
use crate::region::Region;
use crate::vm_alloc::VmAllocator;
use crate::{page_round_down, page_round_up, EmuError};
use shadowvm_core::{reportln, ShadowValue};
use shadowvm_disasm as disasm;
use shadowvm_formats::{Elf, Symbols};
use std::collections::HashMap;
use std::rc::Rc;

/// Fixed guest stack placement.
pub const STACK_BASE: u32 = 0x1000_0000;
pub const STACK_SIZE: u32 = 64 * 1024;

/// Where the TLS control block lands.
const TCB_BASE: u32 = 0x2000_0000;

/// Drives one guest process from ELF load to exit.
pub struct Emulator {
    pub(crate) cpu: SoftCpu,
    pub(crate) vm: VmAllocator,
    pub(crate) symbols: Rc<Symbols>,
    /// shbuf id -> mapped region base.
    pub(crate) shbufs: HashMap<i32, u32>,
    pub(crate) next_shbuf_id: i32,
    pub(crate) shutdown: bool,
    pub(crate) exit_status: i32,
    pub(crate) process_name: String,
    trace: bool,
}

impl Emulator {
    /// Builds a ready-to-run emulator: guest image mapped, allocator symbols
    /// located, SysV i386 entry stack in place, EIP at the ELF entry point.
    pub fn new(
        elf: &Elf<'_>,
        arguments: &[String],
        environment: &[String],
    ) -> Result<Self, EmuError> {
        let mut mmu = Mmu::new();
        let mut stack = Region::simple(STACK_BASE, STACK_SIZE);
        stack.set_stack(true);
        mmu.add_region(stack);

        let mut cpu = SoftCpu::new(mmu);
        cpu.set_esp(ShadowValue::<u32>::wrap_initialized(STACK_BASE + STACK_SIZE));

        let mut emulator = Self {
            cpu,
            vm: VmAllocator::new(),
            symbols: Rc::new(Symbols::default()),
            shbufs: HashMap::new(),
            next_shbuf_id: 1,
            shutdown: false,
            exit_status: 0,
            process_name: arguments.first().cloned().unwrap_or_default(),
            trace: false,
        };
        emulator.load_elf(elf)?;
        emulator.setup_stack(arguments, environment)?;
        Ok(emulator)
    }

    /// Enables per-instruction disassembly + register dumps.
    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    pub fn cpu(&self) -> &SoftCpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut SoftCpu {
        &mut self.cpu
    }

    pub fn symbols(&self) -> &Symbols {
        &self.symbols
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// EIP currently inside the guest allocator? Heap accesses there are
    /// bookkeeping, not guest bugs.
    pub fn is_in_malloc_or_free(&self) -> bool {
        self.cpu.tracer().is_in_malloc_or_free(self.cpu.base_eip())
    }

    pub fn raw_backtrace(&self) -> Vec<u32> {
        self.cpu.raw_backtrace()
    }

    pub fn dump_backtrace(&self) {
        self.cpu.dump_backtrace();
    }

    fn load_elf(&mut self, elf: &Elf<'_>) -> Result<(), EmuError> {
        for header in &elf.segments {
            if header.is_load() {
                if header.p_memsz == 0 {
                    continue;
                }
                let base = page_round_down(header.p_vaddr);
                let size = page_round_up(header.p_vaddr.wrapping_add(header.p_memsz)) - base;
                let mut region = Region::simple(base, size);
                region.set_executable(header.is_executable());

                let file_data = elf.segment_data(header)?;
                let load_offset = (header.p_vaddr - base) as usize;
                region.data_mut()[load_offset..load_offset + file_data.len()]
                    .copy_from_slice(file_data);
                // Loaded segments are fully defined, .bss included.
                region.mark_initialized(0, size);

                if header.is_executable() && !header.is_writable() {
                    region.set_text(true);
                }
                self.cpu.mmu_mut().add_region(region);
            } else if header.is_tls() {
                let size = page_round_up(header.p_memsz.max(1));
                let mut tcb = Region::simple(TCB_BASE, size);
                let file_data = elf.segment_data(header)?;
                tcb.data_mut()[..file_data.len()].copy_from_slice(file_data);
                tcb.mark_initialized(0, size);
                self.cpu.mmu_mut().add_region(tcb);

                // The TLS selector resolves to one pointer: the TCB's end.
                let mut tls = Region::simple(0, 4);
                tls.write32(
                    0,
                    ShadowValue::<u32>::wrap_initialized(TCB_BASE.wrapping_add(header.p_memsz)),
                )?;
                self.cpu.mmu_mut().set_tls_region(tls);
            }
        }

        self.cpu.set_eip(elf.entry());

        self.symbols = Rc::new(Symbols::from_elf(elf)?);
        self.cpu.set_symbols(Rc::clone(&self.symbols));

        match (
            self.symbols.find_function("malloc"),
            self.symbols.find_function("free"),
        ) {
            (Some(malloc), Some(free)) => {
                self.cpu
                    .tracer_mut()
                    .set_ranges(malloc.clone(), free.clone());
            }
            _ => {
                log::debug!("malloc/free not found in guest symbols; heap tracing disabled");
            }
        }
        Ok(())
    }

    /// Builds the SysV i386 process entry frame: stack-resident argv/envp
    /// strings, NUL-terminated pointer tables, then argc at final ESP.
    fn setup_stack(&mut self, arguments: &[String], environment: &[String]) -> Result<(), EmuError> {
        let mut argv_entries = Vec::new();
        for argument in arguments {
            self.cpu.push_string(argument)?;
            argv_entries.push(self.cpu.esp().value());
        }

        let mut env_entries = Vec::new();
        for variable in environment {
            self.cpu.push_string(variable)?;
            env_entries.push(self.cpu.esp().value());
        }

        let push = |cpu: &mut SoftCpu, value: u32| cpu.push32(ShadowValue::<u32>::wrap_initialized(value));

        push(&mut self.cpu, 0)?; // envp table terminator
        for &entry in env_entries.iter().rev() {
            push(&mut self.cpu, entry)?;
        }
        let envp = self.cpu.esp().value();

        push(&mut self.cpu, 0)?; // argv table terminator
        for &entry in argv_entries.iter().rev() {
            push(&mut self.cpu, entry)?;
        }
        let argv = self.cpu.esp().value();

        push(&mut self.cpu, 0)?; // keeps the triple 16-byte aligned
        push(&mut self.cpu, envp)?;
        push(&mut self.cpu, argv)?;
        push(&mut self.cpu, argv_entries.len() as u32)?;
        Ok(())
    }

    /// Runs the guest to completion. Returns the guest's exit status, or 1
    /// after reporting a fatal emulation error.
    pub fn exec(&mut self) -> i32 {
        while !self.shutdown {
            if let Err(error) = self.step_one() {
                let pid = shadowvm_core::report::pid();
                reportln!("=={}==  \x1b[31;1m{}\x1b[0m", pid, error);
                self.cpu.dump_backtrace();
                return 1;
            }
        }
        self.cpu.tracer().dump_leak_report(Some(&self.symbols));
        self.exit_status
    }

    fn step_one(&mut self) -> Result<(), EmuError> {
        self.cpu.save_base_eip();
        self.cpu.tracer_step();

        let insn = disasm::decode(&mut self.cpu)?;
        if self.trace {
            reportln!("{:#010x}  \x1b[33;1m{}\x1b[0m", self.cpu.base_eip(), insn);
        }

        match self.cpu.step(&insn)? {
            CpuEvent::Continue => {}
            CpuEvent::SyscallTrap => self.dispatch_syscall()?,
        }

        if self.trace {
            self.cpu.dump();
        }
        Ok(())
    }

    /// Carves a fresh guest VM range for a dynamic mapping.
    pub(crate) fn allocate_vm(&mut self, size: u32, alignment: u32) -> Result<u32, EmuError> {
        self.vm
            .allocate(size, alignment)
            .ok_or_else(|| EmuError::unimplemented("guest address space exhausted", self.cpu.base_eip()))
    }
}
