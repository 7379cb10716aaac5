//! IA-32 instruction decoder.
//!
//! One call decodes one instruction from an [`InsnStream`]. The decoder
//! handles legacy prefixes (operand size, REP/REPNE, segment overrides,
//! LOCK), ModR/M and SIB bytes with 32-bit addressing, and the opcode
//! families produced by C compilers for integer code.

use crate::insn::{regs, Cond, Insn, MemRef, Op, Operand, Rep, Width};
use crate::stream::InsnStream;
use crate::DecodeError;

/// Decoded ModR/M byte: the `reg` field plus the resolved r/m operand.
struct ModRm {
    reg: u8,
    rm: Operand,
}

fn decode_modrm(stream: &mut impl InsnStream, tls_segment: bool) -> Result<ModRm, DecodeError> {
    let modrm = stream.read8()?;
    let mode = modrm >> 6;
    let reg = (modrm >> 3) & 7;
    let rm = modrm & 7;

    if mode == 3 {
        return Ok(ModRm {
            reg,
            rm: Operand::Reg(rm),
        });
    }

    let mut base = None;
    let mut index = None;
    let mut scale = 1u8;
    let mut disp32_from_sib = false;

    if rm == 4 {
        let sib = stream.read8()?;
        scale = 1 << (sib >> 6);
        let sib_index = (sib >> 3) & 7;
        let sib_base = sib & 7;
        if sib_index != regs::ESP {
            index = Some(sib_index);
        }
        if sib_base == 5 && mode == 0 {
            disp32_from_sib = true;
        } else {
            base = Some(sib_base);
        }
    } else if !(mode == 0 && rm == 5) {
        base = Some(rm);
    }

    let disp = match mode {
        0 => {
            if rm == 5 || disp32_from_sib {
                stream.read32()? as i32
            } else {
                0
            }
        }
        1 => stream.read8()? as i8 as i32,
        2 => stream.read32()? as i32,
        _ => unreachable!(),
    };

    Ok(ModRm {
        reg,
        rm: Operand::Mem(MemRef {
            base,
            index,
            scale,
            disp,
            tls_segment,
        }),
    })
}

fn read_imm(stream: &mut impl InsnStream, width: Width) -> Result<u32, DecodeError> {
    Ok(match width {
        Width::Byte => u32::from(stream.read8()?),
        Width::Word => u32::from(stream.read16()?),
        Width::Dword => stream.read32()?,
    })
}

fn read_rel8_target(stream: &mut impl InsnStream) -> Result<u32, DecodeError> {
    let rel = stream.read8()? as i8 as i32;
    Ok(stream.pos().wrapping_add(rel as u32))
}

fn read_rel32_target(stream: &mut impl InsnStream) -> Result<u32, DecodeError> {
    let rel = stream.read32()? as i32;
    Ok(stream.pos().wrapping_add(rel as u32))
}

/// The eight-member ALU family selected by bits 5:3 of the opcode byte
/// (and by the reg field of the 0x80/0x81/0x83 immediate groups).
const ALU_OPS: [Op; 8] = [
    Op::Add,
    Op::Or,
    Op::Adc,
    Op::Sbb,
    Op::And,
    Op::Sub,
    Op::Xor,
    Op::Cmp,
];

const SHIFT_OPS: [Option<Op>; 8] = [
    Some(Op::Rol),
    Some(Op::Ror),
    None, // RCL
    None, // RCR
    Some(Op::Shl),
    Some(Op::Shr),
    Some(Op::Shl), // SAL is SHL
    Some(Op::Sar),
];

/// Decodes one instruction from the stream.
pub fn decode(stream: &mut impl InsnStream) -> Result<Insn, DecodeError> {
    let start = stream.pos();
    let mut operand_size_16 = false;
    let mut rep = Rep::None;
    let mut tls_segment = false;

    let opcode = loop {
        match stream.read8()? {
            0x66 => operand_size_16 = true,
            0x67 => return Err(DecodeError::unsupported(start, "16-bit addressing")),
            0xf0 => {} // LOCK: the guest is single-threaded, every access is atomic
            0xf2 => rep = Rep::Repne,
            0xf3 => rep = Rep::Rep,
            0x65 => tls_segment = true,
            // Flat segments, no override effect.
            0x26 | 0x2e | 0x36 | 0x3e | 0x64 => {}
            other => break other,
        }
    };

    // Default operand width for "32-bit" forms, honoring the 0x66 prefix.
    let dword = if operand_size_16 {
        Width::Word
    } else {
        Width::Dword
    };

    let mut insn = match opcode {
        // ALU families: ADD/OR/ADC/SBB/AND/SUB/XOR/CMP.
        0x00..=0x3d if opcode & 7 <= 5 && opcode != 0x0f => {
            let op = ALU_OPS[(opcode >> 3) as usize];
            match opcode & 7 {
                0 | 1 => {
                    let width = if opcode & 1 == 0 { Width::Byte } else { dword };
                    let modrm = decode_modrm(stream, tls_segment)?;
                    Insn::binary(op, width, modrm.rm, Operand::Reg(modrm.reg))
                }
                2 | 3 => {
                    let width = if opcode & 1 == 0 { Width::Byte } else { dword };
                    let modrm = decode_modrm(stream, tls_segment)?;
                    Insn::binary(op, width, Operand::Reg(modrm.reg), modrm.rm)
                }
                4 => {
                    let imm = read_imm(stream, Width::Byte)?;
                    Insn::binary(op, Width::Byte, Operand::Reg(regs::EAX), Operand::Imm(imm))
                }
                5 => {
                    let imm = read_imm(stream, dword)?;
                    Insn::binary(op, dword, Operand::Reg(regs::EAX), Operand::Imm(imm))
                }
                _ => unreachable!(),
            }
        }

        // Two-byte escape.
        0x0f => return decode_two_byte(stream, start, dword, tls_segment, rep),

        0x40..=0x47 => Insn::unary(Op::Inc, dword, Operand::Reg(opcode & 7)),
        0x48..=0x4f => Insn::unary(Op::Dec, dword, Operand::Reg(opcode & 7)),
        0x50..=0x57 => Insn::unary(Op::Push, Width::Dword, Operand::Reg(opcode & 7)),
        0x58..=0x5f => Insn::unary(Op::Pop, Width::Dword, Operand::Reg(opcode & 7)),

        0x68 => {
            let imm = stream.read32()?;
            Insn::unary(Op::Push, Width::Dword, Operand::Imm(imm))
        }
        0x6a => {
            let imm = stream.read8()? as i8 as i32 as u32;
            Insn::unary(Op::Push, Width::Dword, Operand::Imm(imm))
        }

        // Jcc rel8.
        0x70..=0x7f => {
            let cond = Cond::from_encoding(opcode);
            let target = read_rel8_target(stream)?;
            Insn::unary(Op::Jcc(cond), Width::Dword, Operand::Imm(target))
        }

        // Immediate ALU groups.
        0x80 | 0x81 | 0x83 => {
            let width = if opcode == 0x80 { Width::Byte } else { dword };
            let modrm = decode_modrm(stream, tls_segment)?;
            let op = ALU_OPS[modrm.reg as usize];
            let imm = if opcode == 0x83 {
                stream.read8()? as i8 as i32 as u32 & width.mask()
            } else {
                read_imm(stream, width)?
            };
            Insn::binary(op, width, modrm.rm, Operand::Imm(imm))
        }

        0x84 | 0x85 => {
            let width = if opcode == 0x84 { Width::Byte } else { dword };
            let modrm = decode_modrm(stream, tls_segment)?;
            Insn::binary(Op::Test, width, modrm.rm, Operand::Reg(modrm.reg))
        }
        0x86 | 0x87 => {
            let width = if opcode == 0x86 { Width::Byte } else { dword };
            let modrm = decode_modrm(stream, tls_segment)?;
            Insn::binary(Op::Xchg, width, modrm.rm, Operand::Reg(modrm.reg))
        }

        // MOV.
        0x88 | 0x89 => {
            let width = if opcode == 0x88 { Width::Byte } else { dword };
            let modrm = decode_modrm(stream, tls_segment)?;
            Insn::binary(Op::Mov, width, modrm.rm, Operand::Reg(modrm.reg))
        }
        0x8a | 0x8b => {
            let width = if opcode == 0x8a { Width::Byte } else { dword };
            let modrm = decode_modrm(stream, tls_segment)?;
            Insn::binary(Op::Mov, width, Operand::Reg(modrm.reg), modrm.rm)
        }

        0x8d => {
            let modrm = decode_modrm(stream, tls_segment)?;
            if !matches!(modrm.rm, Operand::Mem(_)) {
                return Err(DecodeError::unsupported(start, "lea with register source"));
            }
            Insn::binary(Op::Lea, dword, Operand::Reg(modrm.reg), modrm.rm)
        }

        0x8f => {
            let modrm = decode_modrm(stream, tls_segment)?;
            if modrm.reg != 0 {
                return Err(DecodeError::unknown(start, opcode, false));
            }
            Insn::unary(Op::Pop, Width::Dword, modrm.rm)
        }

        0x90 => Insn::no_operands(Op::Nop, Width::Dword),
        0x91..=0x97 => Insn::binary(
            Op::Xchg,
            dword,
            Operand::Reg(regs::EAX),
            Operand::Reg(opcode & 7),
        ),

        0x98 => Insn::no_operands(Op::Cwde, dword),
        0x99 => Insn::no_operands(Op::Cdq, dword),

        // MOV accumulator <-> absolute address.
        0xa0 | 0xa1 => {
            let width = if opcode == 0xa0 { Width::Byte } else { dword };
            let disp = stream.read32()? as i32;
            let mut mem = MemRef::absolute(disp);
            mem.tls_segment = tls_segment;
            Insn::binary(Op::Mov, width, Operand::Reg(regs::EAX), Operand::Mem(mem))
        }
        0xa2 | 0xa3 => {
            let width = if opcode == 0xa2 { Width::Byte } else { dword };
            let disp = stream.read32()? as i32;
            let mut mem = MemRef::absolute(disp);
            mem.tls_segment = tls_segment;
            Insn::binary(Op::Mov, width, Operand::Mem(mem), Operand::Reg(regs::EAX))
        }

        // String operations.
        0xa4 | 0xa5 => Insn::no_operands(Op::Movs, if opcode == 0xa4 { Width::Byte } else { dword }),
        0xa6 | 0xa7 => Insn::no_operands(Op::Cmps, if opcode == 0xa6 { Width::Byte } else { dword }),
        0xaa | 0xab => Insn::no_operands(Op::Stos, if opcode == 0xaa { Width::Byte } else { dword }),
        0xac | 0xad => Insn::no_operands(Op::Lods, if opcode == 0xac { Width::Byte } else { dword }),
        0xae | 0xaf => Insn::no_operands(Op::Scas, if opcode == 0xae { Width::Byte } else { dword }),

        0xa8 => {
            let imm = read_imm(stream, Width::Byte)?;
            Insn::binary(
                Op::Test,
                Width::Byte,
                Operand::Reg(regs::EAX),
                Operand::Imm(imm),
            )
        }
        0xa9 => {
            let imm = read_imm(stream, dword)?;
            Insn::binary(Op::Test, dword, Operand::Reg(regs::EAX), Operand::Imm(imm))
        }

        // MOV reg, imm.
        0xb0..=0xb7 => {
            let imm = read_imm(stream, Width::Byte)?;
            Insn::binary(
                Op::Mov,
                Width::Byte,
                Operand::Reg(opcode & 7),
                Operand::Imm(imm),
            )
        }
        0xb8..=0xbf => {
            let imm = read_imm(stream, dword)?;
            Insn::binary(Op::Mov, dword, Operand::Reg(opcode & 7), Operand::Imm(imm))
        }

        // Shift groups.
        0xc0 | 0xc1 => {
            let width = if opcode == 0xc0 { Width::Byte } else { dword };
            let modrm = decode_modrm(stream, tls_segment)?;
            let op = SHIFT_OPS[modrm.reg as usize]
                .ok_or_else(|| DecodeError::unsupported(start, "rcl/rcr"))?;
            let imm = u32::from(stream.read8()?);
            Insn::binary(op, width, modrm.rm, Operand::Imm(imm))
        }
        0xd0..=0xd3 => {
            let width = if opcode & 1 == 0 { Width::Byte } else { dword };
            let modrm = decode_modrm(stream, tls_segment)?;
            let op = SHIFT_OPS[modrm.reg as usize]
                .ok_or_else(|| DecodeError::unsupported(start, "rcl/rcr"))?;
            let src = if opcode < 0xd2 {
                Operand::Imm(1)
            } else {
                Operand::Reg(regs::ECX) // shift by CL
            };
            Insn::binary(op, width, modrm.rm, src)
        }

        0xc2 => {
            let pop = stream.read16()?;
            Insn::no_operands(Op::Ret { pop }, Width::Dword)
        }
        0xc3 => Insn::no_operands(Op::Ret { pop: 0 }, Width::Dword),

        // MOV r/m, imm.
        0xc6 | 0xc7 => {
            let width = if opcode == 0xc6 { Width::Byte } else { dword };
            let modrm = decode_modrm(stream, tls_segment)?;
            if modrm.reg != 0 {
                return Err(DecodeError::unknown(start, opcode, false));
            }
            let imm = read_imm(stream, width)?;
            Insn::binary(Op::Mov, width, modrm.rm, Operand::Imm(imm))
        }

        0xc9 => Insn::no_operands(Op::Leave, Width::Dword),

        0xcc => Insn::no_operands(Op::Int { vector: 3 }, Width::Dword),
        0xcd => {
            let vector = stream.read8()?;
            Insn::no_operands(Op::Int { vector }, Width::Dword)
        }

        0xe8 => {
            let target = read_rel32_target(stream)?;
            Insn::unary(Op::Call, Width::Dword, Operand::Imm(target))
        }
        0xe9 => {
            let target = read_rel32_target(stream)?;
            Insn::unary(Op::Jmp, Width::Dword, Operand::Imm(target))
        }
        0xeb => {
            let target = read_rel8_target(stream)?;
            Insn::unary(Op::Jmp, Width::Dword, Operand::Imm(target))
        }

        0xf4 => Insn::no_operands(Op::Hlt, Width::Dword),

        // Group 3: TEST/NOT/NEG/MUL/IMUL/DIV/IDIV.
        0xf6 | 0xf7 => {
            let width = if opcode == 0xf6 { Width::Byte } else { dword };
            let modrm = decode_modrm(stream, tls_segment)?;
            match modrm.reg {
                0 | 1 => {
                    let imm = read_imm(stream, width)?;
                    Insn::binary(Op::Test, width, modrm.rm, Operand::Imm(imm))
                }
                2 => Insn::unary(Op::Not, width, modrm.rm),
                3 => Insn::unary(Op::Neg, width, modrm.rm),
                4 => Insn::unary(Op::Mul, width, modrm.rm),
                5 => Insn::unary(Op::Imul, width, modrm.rm),
                6 => Insn::unary(Op::Div, width, modrm.rm),
                7 => Insn::unary(Op::Idiv, width, modrm.rm),
                _ => unreachable!(),
            }
        }

        0xfc => Insn::no_operands(Op::Cld, Width::Dword),
        0xfd => Insn::no_operands(Op::Std, Width::Dword),

        // Group 4: INC/DEC r/m8.
        0xfe => {
            let modrm = decode_modrm(stream, tls_segment)?;
            match modrm.reg {
                0 => Insn::unary(Op::Inc, Width::Byte, modrm.rm),
                1 => Insn::unary(Op::Dec, Width::Byte, modrm.rm),
                _ => return Err(DecodeError::unknown(start, opcode, false)),
            }
        }

        // Group 5: INC/DEC/CALL/JMP/PUSH r/m.
        0xff => {
            let modrm = decode_modrm(stream, tls_segment)?;
            match modrm.reg {
                0 => Insn::unary(Op::Inc, dword, modrm.rm),
                1 => Insn::unary(Op::Dec, dword, modrm.rm),
                2 => Insn::unary(Op::Call, Width::Dword, modrm.rm),
                4 => Insn::unary(Op::Jmp, Width::Dword, modrm.rm),
                6 => Insn::unary(Op::Push, Width::Dword, modrm.rm),
                _ => return Err(DecodeError::unsupported(start, "far call/jmp")),
            }
        }

        other => return Err(DecodeError::unknown(start, other, false)),
    };

    insn.rep = rep;
    Ok(insn)
}

fn decode_two_byte(
    stream: &mut impl InsnStream,
    start: u32,
    dword: Width,
    tls_segment: bool,
    rep: Rep,
) -> Result<Insn, DecodeError> {
    let opcode = stream.read8()?;
    let mut insn = match opcode {
        // Jcc rel32.
        0x80..=0x8f => {
            let cond = Cond::from_encoding(opcode);
            let target = read_rel32_target(stream)?;
            Insn::unary(Op::Jcc(cond), Width::Dword, Operand::Imm(target))
        }

        // SETcc r/m8.
        0x90..=0x9f => {
            let cond = Cond::from_encoding(opcode);
            let modrm = decode_modrm(stream, tls_segment)?;
            Insn::unary(Op::Setcc(cond), Width::Byte, modrm.rm)
        }

        // IMUL r, r/m.
        0xaf => {
            let modrm = decode_modrm(stream, tls_segment)?;
            Insn::binary(Op::Imul2, dword, Operand::Reg(modrm.reg), modrm.rm)
        }

        // MOVZX / MOVSX.
        0xb6 | 0xb7 | 0xbe | 0xbf => {
            let src_width = if opcode & 1 == 0 {
                Width::Byte
            } else {
                Width::Word
            };
            let op = if opcode < 0xbe {
                Op::Movzx(src_width)
            } else {
                Op::Movsx(src_width)
            };
            let modrm = decode_modrm(stream, tls_segment)?;
            Insn::binary(op, dword, Operand::Reg(modrm.reg), modrm.rm)
        }

        other => return Err(DecodeError::unknown(start, other, true)),
    };

    insn.rep = rep;
    Ok(insn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::SliceStream;

    fn decode_bytes(bytes: &[u8]) -> Insn {
        let mut stream = SliceStream::new(bytes, 0x1000);
        decode(&mut stream).unwrap()
    }

    #[test]
    fn mov_reg_imm32() {
        // mov eax, 0x12345678
        let insn = decode_bytes(&[0xb8, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(
            insn,
            Insn::binary(
                Op::Mov,
                Width::Dword,
                Operand::Reg(regs::EAX),
                Operand::Imm(0x1234_5678)
            )
        );
    }

    #[test]
    fn mov_reg_membase_disp8() {
        // mov eax, [ebp-4]
        let insn = decode_bytes(&[0x8b, 0x45, 0xfc]);
        assert_eq!(
            insn,
            Insn::binary(
                Op::Mov,
                Width::Dword,
                Operand::Reg(regs::EAX),
                Operand::Mem(MemRef::base_disp(regs::EBP, -4)),
            )
        );
    }

    #[test]
    fn mov_mem_sib() {
        // mov [eax + ecx*4 + 0x10], edx
        let insn = decode_bytes(&[0x89, 0x54, 0x88, 0x10]);
        assert_eq!(
            insn,
            Insn::binary(
                Op::Mov,
                Width::Dword,
                Operand::Mem(MemRef {
                    base: Some(regs::EAX),
                    index: Some(regs::ECX),
                    scale: 4,
                    disp: 0x10,
                    tls_segment: false,
                }),
                Operand::Reg(regs::EDX),
            )
        );
    }

    #[test]
    fn absolute_memory_operand() {
        // mov ecx, [0x804a000]
        let insn = decode_bytes(&[0x8b, 0x0d, 0x00, 0xa0, 0x04, 0x08]);
        assert_eq!(
            insn,
            Insn::binary(
                Op::Mov,
                Width::Dword,
                Operand::Reg(regs::ECX),
                Operand::Mem(MemRef::absolute(0x0804_a000)),
            )
        );
    }

    #[test]
    fn alu_group_sign_extended_imm8() {
        // sub esp, 0x10 (83 /5 ib)
        let insn = decode_bytes(&[0x83, 0xec, 0x10]);
        assert_eq!(
            insn,
            Insn::binary(
                Op::Sub,
                Width::Dword,
                Operand::Reg(regs::ESP),
                Operand::Imm(0x10)
            )
        );

        // add eax, -1
        let insn = decode_bytes(&[0x83, 0xc0, 0xff]);
        assert_eq!(
            insn,
            Insn::binary(
                Op::Add,
                Width::Dword,
                Operand::Reg(regs::EAX),
                Operand::Imm(0xffff_ffff)
            )
        );
    }

    #[test]
    fn jcc_rel8_target() {
        // jne +6 at 0x1000: next insn at 0x1002, target 0x1008
        let insn = decode_bytes(&[0x75, 0x06]);
        assert_eq!(
            insn,
            Insn::unary(Op::Jcc(Cond::Ne), Width::Dword, Operand::Imm(0x1008))
        );
    }

    #[test]
    fn call_rel32_backwards() {
        // call -0x20 at 0x1000: next insn at 0x1005, target 0xfe5
        let insn = decode_bytes(&[0xe8, 0xe0, 0xff, 0xff, 0xff]);
        assert_eq!(
            insn,
            Insn::unary(Op::Call, Width::Dword, Operand::Imm(0x0fe5))
        );
    }

    #[test]
    fn int_imm8() {
        let insn = decode_bytes(&[0xcd, 0x82]);
        assert_eq!(insn.op, Op::Int { vector: 0x82 });
    }

    #[test]
    fn group3_and_group5() {
        // neg dword [ebx]
        let insn = decode_bytes(&[0xf7, 0x1b]);
        assert_eq!(
            insn,
            Insn::unary(Op::Neg, Width::Dword, Operand::Mem(MemRef::base(regs::EBX)))
        );

        // call [eax]
        let insn = decode_bytes(&[0xff, 0x10]);
        assert_eq!(
            insn,
            Insn::unary(
                Op::Call,
                Width::Dword,
                Operand::Mem(MemRef::base(regs::EAX))
            )
        );
    }

    #[test]
    fn rep_string_op() {
        // rep movsd
        let insn = decode_bytes(&[0xf3, 0xa5]);
        assert_eq!(insn.op, Op::Movs);
        assert_eq!(insn.width, Width::Dword);
        assert_eq!(insn.rep, Rep::Rep);
    }

    #[test]
    fn movzx_byte_source() {
        // movzx eax, byte [esi]
        let insn = decode_bytes(&[0x0f, 0xb6, 0x06]);
        assert_eq!(
            insn,
            Insn::binary(
                Op::Movzx(Width::Byte),
                Width::Dword,
                Operand::Reg(regs::EAX),
                Operand::Mem(MemRef::base(regs::ESI)),
            )
        );
    }

    #[test]
    fn operand_size_prefix() {
        // mov ax, 0x1234
        let insn = decode_bytes(&[0x66, 0xb8, 0x34, 0x12]);
        assert_eq!(
            insn,
            Insn::binary(
                Op::Mov,
                Width::Word,
                Operand::Reg(regs::EAX),
                Operand::Imm(0x1234)
            )
        );
    }

    #[test]
    fn tls_segment_override() {
        // mov eax, gs:[0]
        let insn = decode_bytes(&[0x65, 0xa1, 0x00, 0x00, 0x00, 0x00]);
        match insn.src {
            Some(Operand::Mem(mem)) => assert!(mem.tls_segment),
            other => panic!("expected memory source, got {other:?}"),
        }
    }

    #[test]
    fn shift_by_cl() {
        // shl edx, cl
        let insn = decode_bytes(&[0xd3, 0xe2]);
        assert_eq!(
            insn,
            Insn::binary(
                Op::Shl,
                Width::Dword,
                Operand::Reg(regs::EDX),
                Operand::Reg(regs::ECX)
            )
        );
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        let mut stream = SliceStream::new(&[0x0f, 0x0b], 0x1000); // ud2
        assert!(matches!(
            decode(&mut stream),
            Err(DecodeError::UnknownOpcode {
                two_byte: true,
                ..
            })
        ));
    }

    #[test]
    fn push_pop_and_ret() {
        assert_eq!(
            decode_bytes(&[0x55]),
            Insn::unary(Op::Push, Width::Dword, Operand::Reg(regs::EBP))
        );
        assert_eq!(
            decode_bytes(&[0x5d]),
            Insn::unary(Op::Pop, Width::Dword, Operand::Reg(regs::EBP))
        );
        assert_eq!(
            decode_bytes(&[0xc2, 0x08, 0x00]),
            Insn::no_operands(Op::Ret { pop: 8 }, Width::Dword)
        );
    }
}
