//! ELF (Executable and Linkable Format) parser for guest binaries.
//!
//! The emulator only runs statically linked 32-bit little-endian i386
//! executables, so this parser is deliberately narrow: program headers drive
//! loading, section headers are only consulted to find symbol tables.

mod header;
mod section;
mod segment;
mod symbol;

pub use header::ElfHeader;
pub use section::SectionHeader;
pub use segment::{ProgramHeader, PF_R, PF_W, PF_X, PT_LOAD, PT_TLS};
pub use symbol::SymbolEntry;

use crate::ParseError;

/// A parsed guest ELF binary.
#[derive(Debug)]
pub struct Elf<'a> {
    /// Raw bytes of the file.
    data: &'a [u8],
    /// Parsed ELF header.
    pub header: ElfHeader,
    /// Program headers (segments).
    pub segments: Vec<ProgramHeader>,
    /// Section headers.
    pub sections: Vec<SectionHeader>,
}

impl<'a> Elf<'a> {
    /// Parse an ELF file from raw bytes.
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        let header = ElfHeader::parse(data)?;
        let segments = Self::parse_program_headers(data, &header)?;
        let sections = Self::parse_section_headers(data, &header)?;
        Ok(Self {
            data,
            header,
            segments,
            sections,
        })
    }

    fn parse_program_headers(
        data: &[u8],
        header: &ElfHeader,
    ) -> Result<Vec<ProgramHeader>, ParseError> {
        let mut segments = Vec::with_capacity(header.e_phnum as usize);
        let mut offset = header.e_phoff as usize;

        for _ in 0..header.e_phnum {
            if offset + header.e_phentsize as usize > data.len() {
                return Err(ParseError::too_short(
                    offset + header.e_phentsize as usize,
                    data.len(),
                ));
            }
            segments.push(ProgramHeader::parse(&data[offset..])?);
            offset += header.e_phentsize as usize;
        }

        Ok(segments)
    }

    fn parse_section_headers(
        data: &[u8],
        header: &ElfHeader,
    ) -> Result<Vec<SectionHeader>, ParseError> {
        let mut sections = Vec::with_capacity(header.e_shnum as usize);
        let mut offset = header.e_shoff as usize;

        for _ in 0..header.e_shnum {
            if offset + header.e_shentsize as usize > data.len() {
                return Err(ParseError::too_short(
                    offset + header.e_shentsize as usize,
                    data.len(),
                ));
            }
            sections.push(SectionHeader::parse(&data[offset..])?);
            offset += header.e_shentsize as usize;
        }

        Ok(sections)
    }

    /// Guest entry point.
    pub fn entry(&self) -> u32 {
        self.header.e_entry
    }

    /// The file-backed bytes of a segment (may be shorter than p_memsz,
    /// the remainder is zero-filled by the loader).
    pub fn segment_data(&self, segment: &ProgramHeader) -> Result<&'a [u8], ParseError> {
        let start = segment.p_offset as usize;
        let end = start + segment.p_filesz as usize;
        if end > self.data.len() {
            return Err(ParseError::invalid_structure(
                "segment",
                segment.p_offset as u64,
                format!("file data [{start:#x}..{end:#x}] out of bounds"),
            ));
        }
        Ok(&self.data[start..end])
    }

    /// Iterates over (entry, name) pairs of every named symbol in the
    /// binary's symbol tables.
    pub fn for_each_symbol(
        &self,
        mut f: impl FnMut(&SymbolEntry, &str),
    ) -> Result<(), ParseError> {
        for section in self.sections.iter().filter(|s| s.is_symbol_table()) {
            let strtab = self.section_string_table(section)?;

            let start = section.sh_offset as usize;
            let end = start + section.sh_size as usize;
            if end > self.data.len() {
                return Err(ParseError::too_short(end, self.data.len()));
            }
            let entsize = section.sh_entsize as usize;
            if entsize < SymbolEntry::SIZE {
                continue;
            }

            let mut offset = start;
            while offset + entsize <= end {
                let entry = SymbolEntry::parse(&self.data[offset..])?;
                if let Some(name) = strtab.get(entry.st_name as usize) {
                    if !name.is_empty() {
                        f(&entry, name);
                    }
                }
                offset += entsize;
            }
        }
        Ok(())
    }

    fn section_string_table(&self, symtab: &SectionHeader) -> Result<StringTable<'a>, ParseError> {
        let strtab_idx = symtab.sh_link as usize;
        if strtab_idx >= self.sections.len() {
            return Ok(StringTable::empty());
        }
        let strtab = &self.sections[strtab_idx];
        let start = strtab.sh_offset as usize;
        let end = start + strtab.sh_size as usize;
        if end > self.data.len() {
            return Ok(StringTable::empty());
        }
        Ok(StringTable::new(&self.data[start..end]))
    }
}

/// A simple string table for null-terminated strings.
#[derive(Debug)]
struct StringTable<'a> {
    data: &'a [u8],
}

impl<'a> StringTable<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn empty() -> Self {
        Self { data: &[] }
    }

    fn get(&self, offset: usize) -> Option<&'a str> {
        if offset >= self.data.len() {
            return None;
        }
        let remaining = &self.data[offset..];
        let end = remaining.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&remaining[..end]).ok()
    }
}
