//! Symbol index for backtrace symbolication and allocator interposition.

use crate::elf::Elf;
use crate::ParseError;

/// The `[start, end)` EIP window of a named function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRange {
    pub name: String,
    pub start: u32,
    pub size: u32,
}

impl FunctionRange {
    pub fn end(&self) -> u32 {
        self.start.wrapping_add(self.size)
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && address < self.end()
    }
}

/// An address-sorted index of a guest binary's function symbols.
///
/// Built once at load time and shared (via `Rc`) between the emulator driver
/// and the diagnostic paths, so backtraces can be symbolised from anywhere
/// without threading the loader through every call.
#[derive(Debug, Default)]
pub struct Symbols {
    functions: Vec<FunctionRange>,
}

impl Symbols {
    /// Builds the index from a parsed binary.
    pub fn from_elf(elf: &Elf<'_>) -> Result<Self, ParseError> {
        let mut functions = Vec::new();
        elf.for_each_symbol(|entry, name| {
            if entry.is_function() && entry.st_shndx != 0 {
                functions.push(FunctionRange {
                    name: name.to_string(),
                    start: entry.st_value,
                    size: entry.st_size,
                });
            }
        })?;
        functions.sort_by_key(|f| f.start);
        Ok(Self { functions })
    }

    /// Looks up a function's EIP window by exact name.
    pub fn find_function(&self, name: &str) -> Option<&FunctionRange> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Resolves an address to the containing (or nearest preceding)
    /// function and the offset into it.
    pub fn symbolicate(&self, address: u32) -> Option<(&str, u32)> {
        let idx = match self.functions.binary_search_by_key(&address, |f| f.start) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let function = &self.functions[idx];
        // Zero-sized symbols still symbolicate by proximity.
        if function.size != 0 && !function.contains(address) {
            return None;
        }
        Some((&function.name, address - function.start))
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(entries: &[(&str, u32, u32)]) -> Symbols {
        let mut functions: Vec<_> = entries
            .iter()
            .map(|&(name, start, size)| FunctionRange {
                name: name.to_string(),
                start,
                size,
            })
            .collect();
        functions.sort_by_key(|f| f.start);
        Symbols { functions }
    }

    #[test]
    fn finds_by_name() {
        let symbols = index(&[("malloc", 0x1000, 0x40), ("free", 0x1040, 0x20)]);
        let malloc = symbols.find_function("malloc").unwrap();
        assert_eq!(malloc.start, 0x1000);
        assert_eq!(malloc.end(), 0x1040);
        assert!(symbols.find_function("realloc").is_none());
    }

    #[test]
    fn symbolicates_interior_addresses() {
        let symbols = index(&[("main", 0x2000, 0x100), ("helper", 0x2100, 0x10)]);
        assert_eq!(symbols.symbolicate(0x2004), Some(("main", 4)));
        assert_eq!(symbols.symbolicate(0x2100), Some(("helper", 0)));
        assert_eq!(symbols.symbolicate(0x1fff), None);
        assert_eq!(symbols.symbolicate(0x2200), None);
    }
}
