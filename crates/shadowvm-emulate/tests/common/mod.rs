//! Test support: builds minimal ELF32 guest images from hand-assembled
//! IA-32 code so scenarios can drive the whole load/execute pipeline.
#![allow(dead_code)]

pub const TEXT_BASE: u32 = 0x0804_8000;
pub const DATA_BASE: u32 = 0x0805_0000;

/// A tiny append-only assembler for the handful of encodings the scenario
/// guests need.
pub struct Asm {
    pub base: u32,
    pub bytes: Vec<u8>,
}

impl Asm {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            bytes: Vec::new(),
        }
    }

    /// Address of the next byte to be emitted.
    pub fn here(&self) -> u32 {
        self.base + self.bytes.len() as u32
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// `mov r32, imm32` (b8+r).
    pub fn mov_reg_imm(&mut self, reg: u8, imm: u32) -> &mut Self {
        self.bytes.push(0xb8 + reg);
        self.bytes.extend_from_slice(&imm.to_le_bytes());
        self
    }

    /// `int 0x82`, the syscall trap.
    pub fn int_syscall(&mut self) -> &mut Self {
        self.raw(&[0xcd, 0x82])
    }

    /// `call rel32` to an absolute target.
    pub fn call(&mut self, target: u32) -> &mut Self {
        let next = self.here() + 5;
        self.bytes.push(0xe8);
        self.bytes
            .extend_from_slice(&target.wrapping_sub(next).to_le_bytes());
        self
    }

    /// `mov dword [esp+offset], imm32`.
    pub fn mov_esp_slot_imm(&mut self, offset: u8, imm: u32) -> &mut Self {
        if offset == 0 {
            self.raw(&[0xc7, 0x04, 0x24]);
        } else {
            self.raw(&[0xc7, 0x44, 0x24, offset]);
        }
        self.bytes.extend_from_slice(&imm.to_le_bytes());
        self
    }

    /// `mov eax, N; mov ebx, status; int 0x82` for exit.
    pub fn exit_with(&mut self, exit_number: u32, status: u32) -> &mut Self {
        self.mov_reg_imm(3, status); // ebx
        self.mov_reg_imm(0, exit_number); // eax
        self.int_syscall()
    }

    /// Pads with NOPs up to an absolute address.
    pub fn pad_to(&mut self, address: u32) -> &mut Self {
        assert!(address >= self.here());
        let padding = (address - self.here()) as usize;
        self.bytes.extend(std::iter::repeat(0x90).take(padding));
        self
    }
}

/// A named function symbol to inject into the image's symbol table.
pub struct GuestFn {
    pub name: &'static str,
    pub value: u32,
    pub size: u32,
}

/// Builds a statically linked ELF32 i386 executable: one RX text segment at
/// [`TEXT_BASE`], one RW data segment at [`DATA_BASE`], a symbol table with
/// the given function symbols, entry at [`TEXT_BASE`].
pub fn build_elf(text: &[u8], data: &[u8], symbols: &[GuestFn]) -> Vec<u8> {
    const EHSIZE: usize = 52;
    const PHENTSIZE: usize = 32;
    const SHENTSIZE: usize = 40;
    const SYMENTSIZE: usize = 16;

    let text_offset = 0x100usize;
    let data_offset = text_offset + text.len();
    let symtab_offset = data_offset + data.len();
    let symtab_size = SYMENTSIZE * (1 + symbols.len());
    let strtab_offset = symtab_offset + symtab_size;

    // String table: leading NUL, then each name NUL-terminated.
    let mut strtab = vec![0u8];
    let mut name_offsets = Vec::new();
    for symbol in symbols {
        name_offsets.push(strtab.len() as u32);
        strtab.extend_from_slice(symbol.name.as_bytes());
        strtab.push(0);
    }
    let shoff = strtab_offset + strtab.len();

    let mut image = Vec::new();

    // ELF header.
    image.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
    image.extend_from_slice(&[0; 8]);
    image.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
    image.extend_from_slice(&3u16.to_le_bytes()); // e_machine = EM_386
    image.extend_from_slice(&1u32.to_le_bytes()); // e_version
    image.extend_from_slice(&TEXT_BASE.to_le_bytes()); // e_entry
    image.extend_from_slice(&(EHSIZE as u32).to_le_bytes()); // e_phoff
    image.extend_from_slice(&(shoff as u32).to_le_bytes()); // e_shoff
    image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    image.extend_from_slice(&(EHSIZE as u16).to_le_bytes()); // e_ehsize
    image.extend_from_slice(&(PHENTSIZE as u16).to_le_bytes());
    image.extend_from_slice(&2u16.to_le_bytes()); // e_phnum
    image.extend_from_slice(&(SHENTSIZE as u16).to_le_bytes());
    image.extend_from_slice(&3u16.to_le_bytes()); // e_shnum
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    assert_eq!(image.len(), EHSIZE);

    let phdr = |image: &mut Vec<u8>, offset: usize, vaddr: u32, len: usize, flags: u32| {
        image.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        image.extend_from_slice(&(offset as u32).to_le_bytes());
        image.extend_from_slice(&vaddr.to_le_bytes());
        image.extend_from_slice(&vaddr.to_le_bytes()); // p_paddr
        image.extend_from_slice(&(len as u32).to_le_bytes()); // p_filesz
        image.extend_from_slice(&(len as u32).to_le_bytes()); // p_memsz
        image.extend_from_slice(&flags.to_le_bytes());
        image.extend_from_slice(&0x1000u32.to_le_bytes()); // p_align
    };
    phdr(&mut image, text_offset, TEXT_BASE, text.len(), 5); // R+X
    phdr(&mut image, data_offset, DATA_BASE, data.len(), 6); // R+W

    image.resize(text_offset, 0);
    image.extend_from_slice(text);
    image.extend_from_slice(data);

    // Symbol table: null entry then the function symbols.
    image.extend_from_slice(&[0u8; SYMENTSIZE]);
    for (symbol, &name_offset) in symbols.iter().zip(&name_offsets) {
        image.extend_from_slice(&name_offset.to_le_bytes());
        image.extend_from_slice(&symbol.value.to_le_bytes());
        image.extend_from_slice(&symbol.size.to_le_bytes());
        image.push(0x12); // GLOBAL | FUNC
        image.push(0);
        image.extend_from_slice(&1u16.to_le_bytes()); // st_shndx: defined
    }
    image.extend_from_slice(&strtab);

    // Section headers: null, .symtab, .strtab.
    let shdr = |image: &mut Vec<u8>, sh_type: u32, offset: usize, size: usize, link: u32, entsize: u32| {
        image.extend_from_slice(&0u32.to_le_bytes()); // sh_name
        image.extend_from_slice(&sh_type.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes()); // sh_flags
        image.extend_from_slice(&0u32.to_le_bytes()); // sh_addr
        image.extend_from_slice(&(offset as u32).to_le_bytes());
        image.extend_from_slice(&(size as u32).to_le_bytes());
        image.extend_from_slice(&link.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes()); // sh_info
        image.extend_from_slice(&0u32.to_le_bytes()); // sh_addralign
        image.extend_from_slice(&entsize.to_le_bytes());
    };
    assert_eq!(image.len(), shoff);
    shdr(&mut image, 0, 0, 0, 0, 0);
    shdr(&mut image, 2, symtab_offset, symtab_size, 2, SYMENTSIZE as u32); // .symtab -> .strtab
    shdr(&mut image, 3, strtab_offset, strtab.len(), 0, 0); // .strtab

    image
}
