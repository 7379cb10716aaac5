//! Segmented guest addresses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Selector used for ordinary flat data and code accesses.
pub const DATA_SELECTOR: u8 = 0x20;

/// Selector routed to the thread-local-storage mini-region.
pub const TLS_SELECTOR: u8 = 0x28;

/// A guest virtual address: segment selector plus 32-bit offset.
///
/// Ordinary accesses use the flat [`DATA_SELECTOR`]; the only other selector
/// with a mapping is [`TLS_SELECTOR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub selector: u8,
    pub offset: u32,
}

impl Address {
    /// An address in the flat data segment.
    pub fn flat(offset: u32) -> Self {
        Self {
            selector: DATA_SELECTOR,
            offset,
        }
    }

    /// An address resolved through the TLS selector.
    pub fn tls(offset: u32) -> Self {
        Self {
            selector: TLS_SELECTOR,
            offset,
        }
    }

    /// The address `bytes` further along in the same segment, wrapping.
    pub fn offset_by(self, bytes: u32) -> Self {
        Self {
            selector: self.selector,
            offset: self.offset.wrapping_add(bytes),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}:{:#010x}", self.selector, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_and_offset() {
        let a = Address::flat(0x1000);
        assert_eq!(a.selector, DATA_SELECTOR);
        assert_eq!(a.offset_by(4).offset, 0x1004);
        assert_eq!(a.offset_by(4).selector, DATA_SELECTOR);
    }

    #[test]
    fn display_format() {
        assert_eq!(Address::flat(0xdead).to_string(), "0x20:0x0000dead");
    }
}
