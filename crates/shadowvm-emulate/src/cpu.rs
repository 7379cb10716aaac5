//! The 32-bit x86 soft CPU.
//!
//! Owns the register file, the software MMU and the malloc tracer, and
//! implements the per-instruction semantics the decoder dispatches to. Every
//! operation propagates shadow bits: the result of `a OP b` carries
//! `shadow(a) | shadow(b)`, flags computed from tainted inputs are tainted,
//! and consuming a tainted flag in a branch emits a diagnostic.

use crate::backtrace;
use crate::flags::{self, ARITH_MASK, CF, DF, INITIAL_EFLAGS};
use crate::malloc_tracer::MallocTracer;
use crate::mmu::Mmu;
use crate::{AccessKind, EmuError};
use shadowvm_core::{reportln, Address, ShadowValue, DATA_SELECTOR};
use shadowvm_disasm::{regs, Cond, DecodeError, Insn, InsnStream, MemRef, Op, Operand, Rep, Width};
use shadowvm_formats::Symbols;
use std::rc::Rc;

type Sv32 = ShadowValue<u32>;

/// What the execution of one instruction asks the driver to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuEvent {
    /// Fall through to the next fetch.
    Continue,
    /// The instruction was a syscall trap; run the syscall gateway.
    SyscallTrap,
}

/// Segment register file indices.
const SEGMENT_COUNT: usize = 6;

/// The emulated CPU state plus the memory it operates on.
pub struct SoftCpu {
    gpr: [Sv32; 8],
    segments: [ShadowValue<u16>; SEGMENT_COUNT],
    eflags: Sv32,
    eip: u32,
    base_eip: u32,
    mmu: Mmu,
    tracer: MallocTracer,
    symbols: Option<Rc<Symbols>>,
}

impl SoftCpu {
    pub fn new(mmu: Mmu) -> Self {
        // cs/ds/es/ss get the flat selector, gs the TLS selector; all other
        // state starts uninitialised, as the real kernel leaves it.
        let mut segments = [ShadowValue::<u16>::wrap_initialized(u16::from(DATA_SELECTOR)); SEGMENT_COUNT];
        segments[5] = ShadowValue::<u16>::wrap_initialized(u16::from(shadowvm_core::TLS_SELECTOR));
        Self {
            gpr: [Sv32::default(); 8],
            segments,
            eflags: Sv32::with_shadow(INITIAL_EFLAGS, ARITH_MASK),
            eip: 0,
            base_eip: 0,
            mmu,
            tracer: MallocTracer::new(),
            symbols: None,
        }
    }

    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    pub fn mmu_mut(&mut self) -> &mut Mmu {
        &mut self.mmu
    }

    pub fn tracer(&self) -> &MallocTracer {
        &self.tracer
    }

    pub fn tracer_mut(&mut self) -> &mut MallocTracer {
        &mut self.tracer
    }

    pub fn set_symbols(&mut self, symbols: Rc<Symbols>) {
        self.symbols = Some(symbols);
    }

    // ==================== EIP ====================

    pub fn eip(&self) -> u32 {
        self.eip
    }

    pub fn set_eip(&mut self, eip: u32) {
        self.eip = eip;
    }

    /// Remembers the start of the instruction about to execute, for
    /// diagnostics emitted after the fetch has advanced EIP.
    pub fn save_base_eip(&mut self) {
        self.base_eip = self.eip;
    }

    pub fn base_eip(&self) -> u32 {
        self.base_eip
    }

    // ==================== Registers ====================

    pub fn read_reg32(&self, id: u8) -> Sv32 {
        self.gpr[(id & 7) as usize]
    }

    pub fn write_reg32(&mut self, id: u8, value: Sv32) {
        self.gpr[(id & 7) as usize] = value;
    }

    pub fn read_reg16(&self, id: u8) -> ShadowValue<u16> {
        self.gpr[(id & 7) as usize].low_word()
    }

    pub fn write_reg16(&mut self, id: u8, value: ShadowValue<u16>) {
        let full = self.gpr[(id & 7) as usize];
        self.gpr[(id & 7) as usize] = full.with_low_word(value);
    }

    /// Byte registers: 0..=3 are AL/CL/DL/BL, 4..=7 are AH/CH/DH/BH.
    pub fn read_reg8(&self, id: u8) -> ShadowValue<u8> {
        if id < 4 {
            self.gpr[id as usize].low_byte()
        } else {
            self.gpr[(id - 4) as usize].high_byte()
        }
    }

    pub fn write_reg8(&mut self, id: u8, value: ShadowValue<u8>) {
        if id < 4 {
            self.gpr[id as usize] = self.gpr[id as usize].with_low_byte(value);
        } else {
            let parent = (id - 4) as usize;
            self.gpr[parent] = self.gpr[parent].with_high_byte(value);
        }
    }

    pub fn segment(&self, index: usize) -> ShadowValue<u16> {
        self.segments[index]
    }

    pub fn eflags(&self) -> Sv32 {
        self.eflags
    }

    fn read_reg(&self, id: u8, width: Width) -> Sv32 {
        match width {
            Width::Dword => self.read_reg32(id),
            Width::Word => Sv32::from_word(self.read_reg16(id)),
            Width::Byte => Sv32::from_byte(self.read_reg8(id)),
        }
    }

    fn write_reg(&mut self, id: u8, width: Width, value: Sv32) {
        match width {
            Width::Dword => self.write_reg32(id, value),
            Width::Word => self.write_reg16(id, value.low_word()),
            Width::Byte => self.write_reg8(id, value.low_byte()),
        }
    }

    // ==================== Fetch (decoder interface) ====================

    pub fn fetch8(&mut self) -> Result<ShadowValue<u8>, EmuError> {
        let value = self.mmu.fetch8(Address::flat(self.eip))?;
        self.eip = self.eip.wrapping_add(1);
        Ok(value)
    }

    // ==================== Memory ====================

    fn audit_access(&self, kind: AccessKind, address: Address, len: u32) {
        if address.selector != DATA_SELECTOR {
            return;
        }
        self.tracer.audit(
            kind,
            address.offset,
            len,
            self.base_eip,
            self.read_reg32(regs::EBP).value(),
            &self.mmu,
            self.symbols.as_deref(),
        );
    }

    pub fn read_mem(&mut self, address: Address, width: Width) -> Result<Sv32, EmuError> {
        self.audit_access(AccessKind::Read, address, width.bytes());
        Ok(match width {
            Width::Byte => Sv32::from_byte(self.mmu.read8(address)?),
            Width::Word => Sv32::from_word(self.mmu.read16(address)?),
            Width::Dword => self.mmu.read32(address)?,
        })
    }

    pub fn write_mem(&mut self, address: Address, width: Width, value: Sv32) -> Result<(), EmuError> {
        self.audit_access(AccessKind::Write, address, width.bytes());
        match width {
            Width::Byte => self.mmu.write8(address, value.low_byte())?,
            Width::Word => self.mmu.write16(address, value.low_word())?,
            Width::Dword => self.mmu.write32(address, value)?,
        }
        Ok(())
    }

    /// The offset part of a ModR/M effective address, with shadow
    /// propagation from every register that feeds it.
    fn effective_offset(&self, mem: &MemRef) -> Sv32 {
        let mut offset = Sv32::wrap_initialized(mem.disp as u32);
        if let Some(base) = mem.base {
            offset = offset.wrapping_add(self.read_reg32(base));
        }
        if let Some(index) = mem.index {
            let scaled = self
                .read_reg32(index)
                .map(|v| v.wrapping_mul(u32::from(mem.scale)));
            offset = offset.wrapping_add(scaled);
        }
        offset
    }

    fn effective_address(&self, mem: &MemRef) -> Address {
        let offset = self.effective_offset(mem);
        if offset.is_uninitialized() {
            self.report_taint("Address computation uses uninitialized value(s)");
        }
        if mem.tls_segment {
            Address::tls(offset.value())
        } else {
            Address::flat(offset.value())
        }
    }

    fn read_operand(&mut self, operand: &Operand, width: Width) -> Result<Sv32, EmuError> {
        match operand {
            Operand::Reg(id) => Ok(self.read_reg(*id, width)),
            Operand::Imm(value) => Ok(Sv32::wrap_initialized(*value & width.mask())),
            Operand::Mem(mem) => {
                let address = self.effective_address(mem);
                self.read_mem(address, width)
            }
        }
    }

    fn write_operand(&mut self, operand: &Operand, width: Width, value: Sv32) -> Result<(), EmuError> {
        match operand {
            Operand::Reg(id) => {
                self.write_reg(*id, width, value);
                Ok(())
            }
            Operand::Mem(mem) => {
                let address = self.effective_address(mem);
                self.write_mem(address, width, value)
            }
            Operand::Imm(_) => Err(EmuError::unimplemented(
                "write to immediate operand",
                self.base_eip,
            )),
        }
    }

    // ==================== Stack ====================

    pub fn esp(&self) -> Sv32 {
        self.read_reg32(regs::ESP)
    }

    pub fn set_esp(&mut self, value: Sv32) {
        self.write_reg32(regs::ESP, value);
    }

    pub fn push32(&mut self, value: Sv32) -> Result<(), EmuError> {
        let esp = self.esp().value().wrapping_sub(4);
        self.set_esp(Sv32::wrap_initialized(esp));
        self.write_mem(Address::flat(esp), Width::Dword, value)
    }

    pub fn pop32(&mut self) -> Result<Sv32, EmuError> {
        let esp = self.esp().value();
        let value = self.read_mem(Address::flat(esp), Width::Dword)?;
        self.set_esp(Sv32::wrap_initialized(esp.wrapping_add(4)));
        Ok(value)
    }

    /// Pushes a NUL-terminated string onto the stack; ESP ends up pointing
    /// at its first byte.
    pub fn push_string(&mut self, string: &str) -> Result<(), EmuError> {
        let len = string.len() as u32 + 1;
        let esp = self.esp().value().wrapping_sub(len);
        self.set_esp(Sv32::wrap_initialized(esp));
        self.mmu.copy_to_vm(esp, string.as_bytes())?;
        self.mmu
            .copy_to_vm(esp.wrapping_add(string.len() as u32), &[0])?;
        Ok(())
    }

    // ==================== Flags ====================

    fn set_flags(&mut self, mask: u32, bits: u32, tainted: bool) {
        let value = (self.eflags.value() & !mask) | (bits & mask);
        let shadow = if tainted {
            self.eflags.shadow() | mask
        } else {
            self.eflags.shadow() & !mask
        };
        self.eflags = Sv32::with_shadow(value, shadow);
    }

    fn direction_down(&self) -> bool {
        self.eflags.value() & DF != 0
    }

    /// Evaluates a condition code, diagnosing consumption of tainted flags.
    fn check_condition(&self, cond: Cond, what: &str) -> bool {
        if self.eflags.shadow() & flags::cond_mask(cond) != 0 {
            self.report_taint(what);
        }
        flags::eval_cond(cond, self.eflags.value())
    }

    // ==================== Diagnostics ====================

    pub fn raw_backtrace(&self) -> Vec<u32> {
        backtrace::raw_backtrace(self.base_eip, self.read_reg32(regs::EBP).value(), &self.mmu)
    }

    pub fn dump_backtrace(&self) {
        backtrace::dump_backtrace(&self.raw_backtrace(), self.symbols.as_deref());
    }

    fn report_taint(&self, what: &str) {
        let pid = shadowvm_core::report::pid();
        reportln!("=={}==  \x1b[31;1m{}\x1b[0m", pid, what);
        self.dump_backtrace();
        shadowvm_core::report::note_diagnostic();
    }

    /// Prints the register file, tagging uninitialised values with '?'.
    pub fn dump(&self) {
        reportln!(
            "  eax={} ecx={} edx={} ebx={}",
            self.gpr[0],
            self.gpr[1],
            self.gpr[2],
            self.gpr[3]
        );
        reportln!(
            "  esp={} ebp={} esi={} edi={} eip={:#010x} eflags={}",
            self.gpr[4],
            self.gpr[5],
            self.gpr[6],
            self.gpr[7],
            self.eip,
            self.eflags
        );
    }

    // ==================== Malloc tracing hook ====================

    /// Consulted at every instruction boundary, before decode.
    pub fn tracer_step(&mut self) {
        let Self {
            ref mut tracer,
            ref mut mmu,
            ref symbols,
            base_eip,
            ref gpr,
            ..
        } = *self;
        if !tracer.is_active() {
            return;
        }
        tracer.on_instruction(
            base_eip,
            gpr[regs::EAX as usize].value(),
            gpr[regs::ESP as usize].value(),
            gpr[regs::EBP as usize].value(),
            mmu,
            symbols.as_deref(),
        );
    }

    // ==================== Execution ====================

    /// Executes one decoded instruction.
    pub fn step(&mut self, insn: &Insn) -> Result<CpuEvent, EmuError> {
        match insn.op {
            Op::Nop => {}

            Op::Mov => {
                let (dst, src) = operands2(insn, self.base_eip)?;
                let value = self.read_operand(&src, insn.width)?;
                self.write_operand(&dst, insn.width, value)?;
            }

            Op::Movzx(src_width) => {
                let (dst, src) = operands2(insn, self.base_eip)?;
                // Narrow reads already zero-extend value and shadow, so the
                // widened lanes come out initialised.
                let value = self.read_operand(&src, src_width)?;
                self.write_operand(&dst, insn.width, value)?;
            }

            Op::Movsx(src_width) => {
                let (dst, src) = operands2(insn, self.base_eip)?;
                let narrow = self.read_operand(&src, src_width)?;
                let value = sign_extend(narrow.value(), src_width);
                let extended = if narrow.is_uninitialized() {
                    Sv32::wrap_uninitialized(value)
                } else {
                    Sv32::wrap_initialized(value)
                };
                self.write_operand(&dst, insn.width, extended)?;
            }

            Op::Lea => {
                let (dst, src) = operands2(insn, self.base_eip)?;
                let Operand::Mem(ref mem) = src else {
                    return Err(EmuError::unimplemented("lea without memory source", self.base_eip));
                };
                let offset = self.effective_offset(mem);
                self.write_operand(&dst, insn.width, offset)?;
            }

            Op::Xchg => {
                let (dst, src) = operands2(insn, self.base_eip)?;
                let a = self.read_operand(&dst, insn.width)?;
                let b = self.read_operand(&src, insn.width)?;
                self.write_operand(&dst, insn.width, b)?;
                self.write_operand(&src, insn.width, a)?;
            }

            Op::Add | Op::Adc | Op::Sub | Op::Sbb | Op::Cmp => self.alu_addsub(insn)?,
            Op::And | Op::Or | Op::Xor | Op::Test => self.alu_logic(insn)?,

            Op::Inc | Op::Dec => {
                let dst = operand1(insn, self.base_eip)?;
                let a = self.read_operand(&dst, insn.width)?;
                let one = Sv32::wrap_initialized(1);
                let (result, bits) = if insn.op == Op::Inc {
                    (
                        a.wrapping_add(one),
                        flags::flags_for_add(a.value(), 1, false, insn.width),
                    )
                } else {
                    (
                        a.wrapping_sub(one),
                        flags::flags_for_sub(a.value(), 1, false, insn.width),
                    )
                };
                // INC/DEC leave CF alone.
                self.set_flags(ARITH_MASK & !CF, bits, a.is_uninitialized());
                self.write_operand(&dst, insn.width, result)?;
            }

            Op::Not => {
                let dst = operand1(insn, self.base_eip)?;
                let a = self.read_operand(&dst, insn.width)?;
                let result = a.map(|v| !v & insn.width.mask());
                self.write_operand(&dst, insn.width, result)?;
            }

            Op::Neg => {
                let dst = operand1(insn, self.base_eip)?;
                let a = self.read_operand(&dst, insn.width)?;
                let result = a.map(|v| v.wrapping_neg() & insn.width.mask());
                let bits = flags::flags_for_sub(0, a.value(), false, insn.width);
                self.set_flags(ARITH_MASK, bits, a.is_uninitialized());
                self.write_operand(&dst, insn.width, result)?;
            }

            Op::Mul | Op::Imul => self.mul_wide(insn)?,
            Op::Imul2 => {
                let (dst, src) = operands2(insn, self.base_eip)?;
                let a = self.read_operand(&dst, insn.width)?;
                let b = self.read_operand(&src, insn.width)?;
                let wide = i64::from(sign_extend(a.value(), insn.width) as i32)
                    * i64::from(sign_extend(b.value(), insn.width) as i32);
                let result = a.zip_with(b, |_, _| (wide as u32) & insn.width.mask());
                let overflowed = wide != i64::from(sign_extend(result.value(), insn.width) as i32);
                let mut bits = flags::flags_zsp(result.value(), insn.width);
                if overflowed {
                    bits |= CF | flags::OF;
                }
                self.set_flags(ARITH_MASK, bits, result.is_uninitialized());
                self.write_operand(&dst, insn.width, result)?;
            }

            Op::Div | Op::Idiv => self.divide(insn)?,

            Op::Rol | Op::Ror | Op::Shl | Op::Shr | Op::Sar => self.shift(insn)?,

            Op::Cwde => {
                if insn.width == Width::Dword {
                    let ax = Sv32::from_word(self.read_reg16(regs::EAX));
                    let value = sign_extend(ax.value(), Width::Word);
                    let result = if ax.is_uninitialized() {
                        Sv32::wrap_uninitialized(value)
                    } else {
                        Sv32::wrap_initialized(value)
                    };
                    self.write_reg32(regs::EAX, result);
                } else {
                    // CBW: AX <- sign-extended AL.
                    let al = Sv32::from_byte(self.read_reg8(regs::EAX));
                    let value = sign_extend(al.value(), Width::Byte) & 0xffff;
                    let result = if al.is_uninitialized() {
                        Sv32::wrap_uninitialized(value)
                    } else {
                        Sv32::wrap_initialized(value)
                    };
                    self.write_reg16(regs::EAX, result.low_word());
                }
            }

            Op::Cdq => {
                let (source, fill_width) = if insn.width == Width::Dword {
                    (self.read_reg32(regs::EAX), Width::Dword)
                } else {
                    (Sv32::from_word(self.read_reg16(regs::EAX)), Width::Word)
                };
                let negative = source.value() & fill_width.sign_bit() != 0;
                let fill = if negative { fill_width.mask() } else { 0 };
                let result = if source.is_uninitialized() {
                    Sv32::wrap_uninitialized(fill)
                } else {
                    Sv32::wrap_initialized(fill)
                };
                if insn.width == Width::Dword {
                    self.write_reg32(regs::EDX, result);
                } else {
                    self.write_reg16(regs::EDX, result.low_word());
                }
            }

            Op::Push => {
                let src = operand1(insn, self.base_eip)?;
                let value = self.read_operand(&src, Width::Dword)?;
                self.push32(value)?;
            }

            Op::Pop => {
                let dst = operand1(insn, self.base_eip)?;
                let value = self.pop32()?;
                self.write_operand(&dst, Width::Dword, value)?;
            }

            Op::Leave => {
                let ebp = self.read_reg32(regs::EBP);
                self.set_esp(ebp);
                let saved = self.pop32()?;
                self.write_reg32(regs::EBP, saved);
            }

            Op::Jmp => {
                let target = operand1(insn, self.base_eip)?;
                let address = self.branch_target(&target)?;
                self.eip = address;
            }

            Op::Jcc(cond) => {
                let target = operand1(insn, self.base_eip)?;
                if self.check_condition(cond, "Conditional jump depends on uninitialized value(s)") {
                    let address = self.branch_target(&target)?;
                    self.eip = address;
                }
            }

            Op::Call => {
                let target = operand1(insn, self.base_eip)?;
                let address = self.branch_target(&target)?;
                // EIP is already past this instruction: it is the return site.
                self.push32(Sv32::wrap_initialized(self.eip))?;
                self.eip = address;
            }

            Op::Ret { pop } => {
                let return_address = self.pop32()?;
                if return_address.is_uninitialized() {
                    self.report_taint("Return address is uninitialized");
                }
                self.eip = return_address.value();
                let esp = self.esp().value().wrapping_add(u32::from(pop));
                self.set_esp(Sv32::wrap_initialized(esp));
            }

            Op::Setcc(cond) => {
                let dst = operand1(insn, self.base_eip)?;
                let taken =
                    self.check_condition(cond, "SETcc depends on uninitialized value(s)");
                self.write_operand(&dst, Width::Byte, Sv32::wrap_initialized(u32::from(taken)))?;
            }

            Op::Movs | Op::Stos | Op::Lods | Op::Scas | Op::Cmps => self.string_op(insn)?,

            Op::Cld => self.set_flags(DF, 0, false),
            Op::Std => self.set_flags(DF, DF, false),

            Op::Int { vector } => {
                if vector == 0x82 {
                    return Ok(CpuEvent::SyscallTrap);
                }
                return Err(EmuError::unimplemented(
                    format!("int {vector:#04x}"),
                    self.base_eip,
                ));
            }

            Op::Hlt => {
                return Err(EmuError::unimplemented("hlt", self.base_eip));
            }
        }
        Ok(CpuEvent::Continue)
    }

    /// Resolves a branch operand to a target address. Direct targets come
    /// from the decoder; indirect ones read a register or memory and are
    /// checked for taint.
    fn branch_target(&mut self, operand: &Operand) -> Result<u32, EmuError> {
        match operand {
            Operand::Imm(target) => Ok(*target),
            _ => {
                let value = self.read_operand(operand, Width::Dword)?;
                if value.is_uninitialized() {
                    self.report_taint("Indirect branch target is uninitialized");
                }
                Ok(value.value())
            }
        }
    }

    fn alu_addsub(&mut self, insn: &Insn) -> Result<(), EmuError> {
        let (dst, src) = operands2(insn, self.base_eip)?;
        let width = insn.width;
        let a = self.read_operand(&dst, width)?;
        let b = self.read_operand(&src, width)?;

        let carry_in = match insn.op {
            Op::Adc | Op::Sbb => self.eflags.value() & CF != 0,
            _ => false,
        };
        let carry_tainted = matches!(insn.op, Op::Adc | Op::Sbb) && self.eflags.shadow() & CF != 0;

        let (result_value, bits) = match insn.op {
            Op::Add | Op::Adc => {
                let bits = flags::flags_for_add(a.value(), b.value(), carry_in, width);
                let value = a
                    .value()
                    .wrapping_add(b.value())
                    .wrapping_add(u32::from(carry_in))
                    & width.mask();
                (value, bits)
            }
            _ => {
                let bits = flags::flags_for_sub(a.value(), b.value(), carry_in, width);
                let value = a
                    .value()
                    .wrapping_sub(b.value())
                    .wrapping_sub(u32::from(carry_in))
                    & width.mask();
                (value, bits)
            }
        };

        let tainted = a.is_uninitialized() || b.is_uninitialized() || carry_tainted;
        self.set_flags(ARITH_MASK, bits, tainted);

        if insn.op != Op::Cmp {
            let shadow = a.combined_shadow(&b) | if carry_tainted { width.mask() } else { 0 };
            let result = Sv32::with_shadow(result_value, shadow & width.mask());
            self.write_operand(&dst, width, result)?;
        }
        Ok(())
    }

    fn alu_logic(&mut self, insn: &Insn) -> Result<(), EmuError> {
        let (dst, src) = operands2(insn, self.base_eip)?;
        let width = insn.width;
        let a = self.read_operand(&dst, width)?;
        let b = self.read_operand(&src, width)?;

        let result = match insn.op {
            Op::And | Op::Test => a.bitand(b),
            Op::Or => a.bitor(b),
            _ => a.bitxor(b),
        };

        // xor reg, reg is the idiomatic zeroing: the result is a constant
        // regardless of how undefined the inputs were.
        let result = if insn.op == Op::Xor && dst == src {
            Sv32::wrap_initialized(0)
        } else {
            result
        };

        let bits = flags::flags_for_logic(result.value(), width);
        self.set_flags(ARITH_MASK, bits, result.is_uninitialized());

        if insn.op != Op::Test {
            self.write_operand(&dst, width, result)?;
        }
        Ok(())
    }

    /// One-operand MUL/IMUL: widening multiply into DX:AX / EDX:EAX.
    fn mul_wide(&mut self, insn: &Insn) -> Result<(), EmuError> {
        let src = operand1(insn, self.base_eip)?;
        let b = self.read_operand(&src, insn.width)?;
        let signed = insn.op == Op::Imul;

        match insn.width {
            Width::Byte => {
                let a = Sv32::from_byte(self.read_reg8(regs::EAX));
                let wide = if signed {
                    (i32::from(sign_extend(a.value(), Width::Byte) as i8 as i16)
                        * i32::from(sign_extend(b.value(), Width::Byte) as i8 as i16))
                        as u32
                } else {
                    a.value() * b.value()
                };
                let result = a.zip_with(b, |_, _| wide & 0xffff);
                self.write_reg16(regs::EAX, result.low_word());
                let expanded = if signed {
                    result.value() as u16 as i16 != i16::from(result.value() as u8 as i8)
                } else {
                    result.value() >> 8 != 0
                };
                self.finish_mul_flags(result, expanded);
            }
            Width::Word => {
                let a = Sv32::from_word(self.read_reg16(regs::EAX));
                let wide = if signed {
                    (i32::from(a.value() as i16) * i32::from(b.value() as i16)) as u32
                } else {
                    a.value() * b.value()
                };
                let result = a.zip_with(b, |_, _| wide);
                self.write_reg16(regs::EAX, result.low_word());
                let high = Sv32::with_shadow(wide >> 16, result.shadow());
                self.write_reg16(regs::EDX, high.low_word());
                let expanded = if signed {
                    wide as i32 != i32::from(wide as i16)
                } else {
                    wide >> 16 != 0
                };
                self.finish_mul_flags(result, expanded);
            }
            Width::Dword => {
                let a = self.read_reg32(regs::EAX);
                let wide = if signed {
                    (i64::from(a.value() as i32) * i64::from(b.value() as i32)) as u64
                } else {
                    u64::from(a.value()) * u64::from(b.value())
                };
                let result = a.zip_with(b, |_, _| wide as u32);
                let high = Sv32::with_shadow((wide >> 32) as u32, result.shadow());
                self.write_reg32(regs::EAX, result);
                self.write_reg32(regs::EDX, high);
                let expanded = if signed {
                    wide as i64 != i64::from(wide as u32 as i32)
                } else {
                    wide >> 32 != 0
                };
                self.finish_mul_flags(result, expanded);
            }
        }
        Ok(())
    }

    fn finish_mul_flags(&mut self, result: Sv32, expanded: bool) {
        let mut bits = flags::flags_zsp(result.value(), Width::Dword);
        if expanded {
            bits |= CF | flags::OF;
        }
        self.set_flags(ARITH_MASK, bits, result.is_uninitialized());
    }

    fn divide(&mut self, insn: &Insn) -> Result<(), EmuError> {
        let src = operand1(insn, self.base_eip)?;
        let divisor = self.read_operand(&src, insn.width)?;
        if divisor.is_uninitialized() {
            self.report_taint("Division by uninitialized value");
        }
        if divisor.value() == 0 {
            return Err(EmuError::DivideError { eip: self.base_eip });
        }
        let signed = insn.op == Op::Idiv;

        match insn.width {
            Width::Byte => {
                let dividend = Sv32::from_word(self.read_reg16(regs::EAX));
                let taint = dividend.combined_shadow(&divisor) != 0;
                let (q, r) = if signed {
                    let n = i32::from(dividend.value() as i16);
                    let d = i32::from(sign_extend(divisor.value(), Width::Byte) as i32 as i8);
                    let q = n.wrapping_div(d);
                    if q > i32::from(i8::MAX) || q < i32::from(i8::MIN) {
                        return Err(EmuError::DivideError { eip: self.base_eip });
                    }
                    (q as u32, n.wrapping_rem(d) as u32)
                } else {
                    let n = dividend.value();
                    let d = divisor.value();
                    let q = n / d;
                    if q > 0xff {
                        return Err(EmuError::DivideError { eip: self.base_eip });
                    }
                    (q, n % d)
                };
                let ax = (r & 0xff) << 8 | (q & 0xff);
                let result = if taint {
                    Sv32::wrap_uninitialized(ax)
                } else {
                    Sv32::wrap_initialized(ax)
                };
                self.write_reg16(regs::EAX, result.low_word());
            }
            Width::Word => {
                let lo = u32::from(self.read_reg16(regs::EAX).value());
                let hi = u32::from(self.read_reg16(regs::EDX).value());
                let taint = self.read_reg16(regs::EAX).is_uninitialized()
                    || self.read_reg16(regs::EDX).is_uninitialized()
                    || divisor.is_uninitialized();
                let n = (hi << 16) | lo;
                let (q, r) = if signed {
                    let n = n as i32;
                    let d = i32::from(divisor.value() as i16);
                    let q = n.wrapping_div(d);
                    if q > i32::from(i16::MAX) || q < i32::from(i16::MIN) {
                        return Err(EmuError::DivideError { eip: self.base_eip });
                    }
                    (q as u32, n.wrapping_rem(d) as u32)
                } else {
                    let d = divisor.value();
                    let q = n / d;
                    if q > 0xffff {
                        return Err(EmuError::DivideError { eip: self.base_eip });
                    }
                    (q, n % d)
                };
                let wrap = |v: u32| {
                    if taint {
                        Sv32::wrap_uninitialized(v)
                    } else {
                        Sv32::wrap_initialized(v)
                    }
                };
                self.write_reg16(regs::EAX, wrap(q).low_word());
                self.write_reg16(regs::EDX, wrap(r).low_word());
            }
            Width::Dword => {
                let eax = self.read_reg32(regs::EAX);
                let edx = self.read_reg32(regs::EDX);
                let taint = eax.is_uninitialized()
                    || edx.is_uninitialized()
                    || divisor.is_uninitialized();
                let n = (u64::from(edx.value()) << 32) | u64::from(eax.value());
                let (q, r) = if signed {
                    let n = n as i64;
                    let d = i64::from(divisor.value() as i32);
                    let q = n.wrapping_div(d);
                    if q > i64::from(i32::MAX) || q < i64::from(i32::MIN) {
                        return Err(EmuError::DivideError { eip: self.base_eip });
                    }
                    (q as u32, n.wrapping_rem(d) as u32)
                } else {
                    let d = u64::from(divisor.value());
                    let q = n / d;
                    if q > u64::from(u32::MAX) {
                        return Err(EmuError::DivideError { eip: self.base_eip });
                    }
                    (q as u32, (n % d) as u32)
                };
                let wrap = |v: u32| {
                    if taint {
                        Sv32::wrap_uninitialized(v)
                    } else {
                        Sv32::wrap_initialized(v)
                    }
                };
                self.write_reg32(regs::EAX, wrap(q));
                self.write_reg32(regs::EDX, wrap(r));
            }
        }
        Ok(())
    }

    fn shift(&mut self, insn: &Insn) -> Result<(), EmuError> {
        let (dst, src) = operands2(insn, self.base_eip)?;
        let width = insn.width;
        let a = self.read_operand(&dst, width)?;
        // Shift counts come from an immediate or CL, masked to 5 bits.
        let count_sv = match src {
            Operand::Reg(_) => Sv32::from_byte(self.read_reg8(regs::ECX)),
            _ => self.read_operand(&src, Width::Byte)?,
        };
        let count = count_sv.value() & 0x1f;
        if count == 0 {
            return Ok(());
        }
        if count_sv.is_uninitialized() {
            self.report_taint("Shift count is uninitialized");
        }

        let bits_in = width.bits();
        let value = a.value() & width.mask();
        let (result_value, carry, overflow) = match insn.op {
            Op::Shl => {
                let result = (value << count) & width.mask();
                let carry = if count <= bits_in {
                    (value >> (bits_in - count)) & 1 != 0
                } else {
                    false
                };
                let overflow = (result & width.sign_bit() != 0) != carry;
                (result, carry, overflow)
            }
            Op::Shr => {
                let result = value >> count;
                let carry = (value >> (count - 1)) & 1 != 0;
                let overflow = value & width.sign_bit() != 0;
                (result, carry, overflow)
            }
            Op::Sar => {
                let signed = sign_extend(value, width) as i32;
                let result = (signed >> count.min(31)) as u32 & width.mask();
                let carry = (signed >> (count - 1).min(31)) & 1 != 0;
                (result, carry, false)
            }
            Op::Rol => {
                let count = count % bits_in;
                let result = if count == 0 {
                    value
                } else {
                    ((value << count) | (value >> (bits_in - count))) & width.mask()
                };
                let carry = result & 1 != 0;
                (result, carry, false)
            }
            _ => {
                // Ror
                let count = count % bits_in;
                let result = if count == 0 {
                    value
                } else {
                    ((value >> count) | (value << (bits_in - count))) & width.mask()
                };
                let carry = result & width.sign_bit() != 0;
                (result, carry, false)
            }
        };

        let tainted = a.is_uninitialized() || count_sv.is_uninitialized();
        let result = Sv32::with_shadow(
            result_value,
            (a.shadow() | count_sv.shadow()) & width.mask(),
        );

        let rotate = matches!(insn.op, Op::Rol | Op::Ror);
        let mut bits = if rotate {
            0
        } else {
            flags::flags_zsp(result_value, width)
        };
        if carry {
            bits |= CF;
        }
        if overflow {
            bits |= flags::OF;
        }
        let mask = if rotate { CF | flags::OF } else { ARITH_MASK };
        self.set_flags(mask, bits, tainted);

        self.write_operand(&dst, width, result)?;
        Ok(())
    }

    fn string_op(&mut self, insn: &Insn) -> Result<(), EmuError> {
        let width = insn.width;
        let step = if self.direction_down() {
            (width.bytes() as i32).wrapping_neg() as u32
        } else {
            width.bytes()
        };

        let counted = insn.rep != Rep::None;
        let mut count = if counted {
            let ecx = self.read_reg32(regs::ECX);
            if ecx.is_uninitialized() {
                self.report_taint("String operation count is uninitialized");
            }
            ecx.value()
        } else {
            1
        };

        while count > 0 {
            let esi = self.read_reg32(regs::ESI).value();
            let edi = self.read_reg32(regs::EDI).value();
            let mut stop = false;

            match insn.op {
                Op::Movs => {
                    let value = self.read_mem(Address::flat(esi), width)?;
                    self.write_mem(Address::flat(edi), width, value)?;
                    self.advance_reg(regs::ESI, step);
                    self.advance_reg(regs::EDI, step);
                }
                Op::Stos => {
                    let value = self.read_reg(regs::EAX, width);
                    self.write_mem(Address::flat(edi), width, value)?;
                    self.advance_reg(regs::EDI, step);
                }
                Op::Lods => {
                    let value = self.read_mem(Address::flat(esi), width)?;
                    self.write_reg(regs::EAX, width, value);
                    self.advance_reg(regs::ESI, step);
                }
                Op::Scas => {
                    let a = self.read_reg(regs::EAX, width);
                    let b = self.read_mem(Address::flat(edi), width)?;
                    let bits = flags::flags_for_sub(a.value(), b.value(), false, width);
                    self.set_flags(
                        ARITH_MASK,
                        bits,
                        a.is_uninitialized() || b.is_uninitialized(),
                    );
                    self.advance_reg(regs::EDI, step);
                    stop = self.rep_terminates(insn.rep);
                }
                _ => {
                    // Cmps
                    let a = self.read_mem(Address::flat(esi), width)?;
                    let b = self.read_mem(Address::flat(edi), width)?;
                    let bits = flags::flags_for_sub(a.value(), b.value(), false, width);
                    self.set_flags(
                        ARITH_MASK,
                        bits,
                        a.is_uninitialized() || b.is_uninitialized(),
                    );
                    self.advance_reg(regs::ESI, step);
                    self.advance_reg(regs::EDI, step);
                    stop = self.rep_terminates(insn.rep);
                }
            }

            count -= 1;
            if stop {
                break;
            }
        }

        if counted {
            self.write_reg32(regs::ECX, Sv32::wrap_initialized(count));
        }
        Ok(())
    }

    /// REPE stops when ZF clears, REPNE when ZF sets. Only meaningful for
    /// SCAS/CMPS.
    fn rep_terminates(&self, rep: Rep) -> bool {
        let zf = self.eflags.value() & flags::ZF != 0;
        match rep {
            Rep::None => false,
            Rep::Rep => !zf,
            Rep::Repne => zf,
        }
    }

    fn advance_reg(&mut self, id: u8, step: u32) {
        let value = self.read_reg32(id).map(|v| v.wrapping_add(step));
        self.write_reg32(id, value);
    }
}

/// Sign-extends a narrow value to 32 bits.
fn sign_extend(value: u32, from: Width) -> u32 {
    match from {
        Width::Byte => value as u8 as i8 as i32 as u32,
        Width::Word => value as u16 as i16 as i32 as u32,
        Width::Dword => value,
    }
}

fn operand1(insn: &Insn, eip: u32) -> Result<Operand, EmuError> {
    insn.dst
        .ok_or_else(|| EmuError::unimplemented("instruction missing operand", eip))
}

fn operands2(insn: &Insn, eip: u32) -> Result<(Operand, Operand), EmuError> {
    match (insn.dst, insn.src) {
        (Some(dst), Some(src)) => Ok((dst, src)),
        _ => Err(EmuError::unimplemented("instruction missing operands", eip)),
    }
}

impl InsnStream for SoftCpu {
    fn pos(&self) -> u32 {
        self.eip
    }

    fn read8(&mut self) -> Result<u8, DecodeError> {
        let address = self.eip;
        match self.fetch8() {
            Ok(value) => Ok(value.value()),
            Err(_) => Err(DecodeError::Fetch { address }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;

    const STACK_BASE: u32 = 0x1000_0000;
    const STACK_SIZE: u32 = 0x10000;

    fn cpu_with_stack() -> SoftCpu {
        let mut mmu = Mmu::new();
        let mut stack = Region::simple(STACK_BASE, STACK_SIZE);
        stack.set_stack(true);
        mmu.add_region(stack);
        let mut cpu = SoftCpu::new(mmu);
        cpu.set_esp(Sv32::wrap_initialized(STACK_BASE + STACK_SIZE));
        cpu
    }

    fn mov_reg(id: u8, value: u32) -> Insn {
        Insn::binary(Op::Mov, Width::Dword, Operand::Reg(id), Operand::Imm(value))
    }

    #[test]
    fn add_combines_value_and_shadow() {
        let mut cpu = cpu_with_stack();
        cpu.write_reg32(regs::EAX, Sv32::wrap_initialized(10));
        cpu.write_reg32(regs::EBX, Sv32::wrap_uninitialized(3));

        let insn = Insn::binary(
            Op::Add,
            Width::Dword,
            Operand::Reg(regs::EAX),
            Operand::Reg(regs::EBX),
        );
        cpu.step(&insn).unwrap();

        let eax = cpu.read_reg32(regs::EAX);
        assert_eq!(eax.value(), 13);
        assert!(eax.is_uninitialized());
        // Flags inherited the taint.
        assert_ne!(cpu.eflags().shadow() & ARITH_MASK, 0);
    }

    #[test]
    fn add_of_initialised_inputs_stays_initialised() {
        let mut cpu = cpu_with_stack();
        cpu.step(&mov_reg(regs::EAX, 7)).unwrap();
        cpu.step(&mov_reg(regs::ECX, 8)).unwrap();
        let insn = Insn::binary(
            Op::Add,
            Width::Dword,
            Operand::Reg(regs::EAX),
            Operand::Reg(regs::ECX),
        );
        cpu.step(&insn).unwrap();
        let eax = cpu.read_reg32(regs::EAX);
        assert_eq!(eax.value(), 15);
        assert!(eax.is_initialized());
        assert_eq!(cpu.eflags().shadow() & ARITH_MASK, 0);
    }

    #[test]
    fn push_decrements_and_pop_increments_esp() {
        let mut cpu = cpu_with_stack();
        let top = cpu.esp().value();
        cpu.push32(Sv32::wrap_initialized(0x1234)).unwrap();
        assert_eq!(cpu.esp().value(), top - 4);
        let value = cpu.pop32().unwrap();
        assert_eq!(value.value(), 0x1234);
        assert!(value.is_initialized());
        assert_eq!(cpu.esp().value(), top);
    }

    #[test]
    fn byte_register_overlays_parent() {
        let mut cpu = cpu_with_stack();
        cpu.write_reg32(regs::EAX, Sv32::wrap_initialized(0x1122_3344));
        // mov ah, 0xcc
        let insn = Insn::binary(Op::Mov, Width::Byte, Operand::Reg(4), Operand::Imm(0xcc));
        cpu.step(&insn).unwrap();
        assert_eq!(cpu.read_reg32(regs::EAX).value(), 0x1122_cc44);
    }

    #[test]
    fn word_write_preserves_upper_half() {
        let mut cpu = cpu_with_stack();
        cpu.write_reg32(regs::EDX, Sv32::wrap_initialized(0xaabb_ccdd));
        let insn = Insn::binary(
            Op::Mov,
            Width::Word,
            Operand::Reg(regs::EDX),
            Operand::Imm(0x1234),
        );
        cpu.step(&insn).unwrap();
        assert_eq!(cpu.read_reg32(regs::EDX).value(), 0xaabb_1234);
    }

    #[test]
    fn conditional_jump_on_tainted_flags_diagnoses_and_continues() {
        let mut cpu = cpu_with_stack();
        cpu.write_reg32(regs::EAX, Sv32::wrap_uninitialized(0));
        // test eax, eax taints ZF.
        let test = Insn::binary(
            Op::Test,
            Width::Dword,
            Operand::Reg(regs::EAX),
            Operand::Reg(regs::EAX),
        );
        cpu.step(&test).unwrap();

        let before = shadowvm_core::report::diagnostics_emitted();
        let jcc = Insn::unary(Op::Jcc(Cond::E), Width::Dword, Operand::Imm(0x4000));
        let event = cpu.step(&jcc).unwrap();
        assert_eq!(event, CpuEvent::Continue);
        assert!(shadowvm_core::report::diagnostics_emitted() >= before + 1);
        // ZF was concretely set (0 & 0 == 0), so the jump was taken anyway.
        assert_eq!(cpu.eip(), 0x4000);
    }

    #[test]
    fn xor_self_defines_the_register() {
        let mut cpu = cpu_with_stack();
        cpu.write_reg32(regs::ESI, Sv32::wrap_uninitialized(0xdead));
        let insn = Insn::binary(
            Op::Xor,
            Width::Dword,
            Operand::Reg(regs::ESI),
            Operand::Reg(regs::ESI),
        );
        cpu.step(&insn).unwrap();
        let esi = cpu.read_reg32(regs::ESI);
        assert_eq!(esi.value(), 0);
        assert!(esi.is_initialized());
    }

    #[test]
    fn memory_round_trip_preserves_shadow() {
        let mut cpu = cpu_with_stack();
        let addr = STACK_BASE + 0x100;
        cpu.write_mem(
            Address::flat(addr),
            Width::Dword,
            Sv32::wrap_uninitialized(0x5555_5555),
        )
        .unwrap();
        let value = cpu.read_mem(Address::flat(addr), Width::Dword).unwrap();
        assert!(value.is_uninitialized());
        assert_eq!(value.value(), 0x5555_5555);
    }

    #[test]
    fn rep_movs_copies_bytes_and_shadow() {
        let mut cpu = cpu_with_stack();
        let src = STACK_BASE + 0x200;
        let dst = STACK_BASE + 0x300;
        // Two defined bytes, one undefined in the middle.
        cpu.mmu_mut().copy_to_vm(src, &[0x11]).unwrap();
        cpu.mmu_mut().copy_to_vm(src + 2, &[0x33]).unwrap();

        cpu.write_reg32(regs::ESI, Sv32::wrap_initialized(src));
        cpu.write_reg32(regs::EDI, Sv32::wrap_initialized(dst));
        cpu.write_reg32(regs::ECX, Sv32::wrap_initialized(3));
        // cld; rep movsb
        cpu.step(&Insn::no_operands(Op::Cld, Width::Dword)).unwrap();
        let mut movs = Insn::no_operands(Op::Movs, Width::Byte);
        movs.rep = Rep::Rep;
        cpu.step(&movs).unwrap();

        assert_eq!(cpu.read_reg32(regs::ECX).value(), 0);
        assert_eq!(cpu.read_reg32(regs::ESI).value(), src + 3);
        let b0 = cpu.mmu().read8(Address::flat(dst)).unwrap();
        let b1 = cpu.mmu().read8(Address::flat(dst + 1)).unwrap();
        let b2 = cpu.mmu().read8(Address::flat(dst + 2)).unwrap();
        assert!(b0.is_initialized());
        assert_eq!(b0.value(), 0x11);
        assert!(b1.is_uninitialized());
        assert!(b2.is_initialized());
        assert_eq!(b2.value(), 0x33);
    }

    #[test]
    fn call_pushes_return_site_and_ret_restores_it() {
        let mut cpu = cpu_with_stack();
        cpu.set_eip(0x0804_8005); // pretend the call was fetched
        let call = Insn::unary(Op::Call, Width::Dword, Operand::Imm(0x0804_9000));
        cpu.step(&call).unwrap();
        assert_eq!(cpu.eip(), 0x0804_9000);

        let ret = Insn::no_operands(Op::Ret { pop: 0 }, Width::Dword);
        cpu.step(&ret).unwrap();
        assert_eq!(cpu.eip(), 0x0804_8005);
    }

    #[test]
    fn int_0x82_raises_syscall_event() {
        let mut cpu = cpu_with_stack();
        let insn = Insn::no_operands(Op::Int { vector: 0x82 }, Width::Dword);
        assert_eq!(cpu.step(&insn).unwrap(), CpuEvent::SyscallTrap);
    }

    #[test]
    fn division_by_zero_is_fatal() {
        let mut cpu = cpu_with_stack();
        cpu.write_reg32(regs::EAX, Sv32::wrap_initialized(10));
        cpu.write_reg32(regs::EDX, Sv32::wrap_initialized(0));
        cpu.write_reg32(regs::EBX, Sv32::wrap_initialized(0));
        let insn = Insn::unary(Op::Div, Width::Dword, Operand::Reg(regs::EBX));
        assert!(matches!(
            cpu.step(&insn),
            Err(EmuError::DivideError { .. })
        ));
    }

    #[test]
    fn shl_computes_carry() {
        let mut cpu = cpu_with_stack();
        cpu.write_reg32(regs::EAX, Sv32::wrap_initialized(0x8000_0001));
        let insn = Insn::binary(
            Op::Shl,
            Width::Dword,
            Operand::Reg(regs::EAX),
            Operand::Imm(1),
        );
        cpu.step(&insn).unwrap();
        assert_eq!(cpu.read_reg32(regs::EAX).value(), 2);
        assert_ne!(cpu.eflags().value() & CF, 0);
    }

    #[test]
    fn movzx_defines_upper_lanes() {
        let mut cpu = cpu_with_stack();
        let addr = STACK_BASE + 0x80;
        cpu.mmu_mut().copy_to_vm(addr, &[0xfe]).unwrap();
        cpu.write_reg32(regs::EBX, Sv32::wrap_initialized(addr));
        let insn = Insn::binary(
            Op::Movzx(Width::Byte),
            Width::Dword,
            Operand::Reg(regs::EAX),
            Operand::Mem(MemRef::base(regs::EBX)),
        );
        cpu.step(&insn).unwrap();
        let eax = cpu.read_reg32(regs::EAX);
        assert_eq!(eax.value(), 0xfe);
        assert!(eax.is_initialized());
    }
}
