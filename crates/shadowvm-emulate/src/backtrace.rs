//! Guest stack unwinding for diagnostics.

use crate::mmu::Mmu;
use shadowvm_core::{report, reportln, Address};
use shadowvm_formats::Symbols;

/// Frames are capped to keep a corrupted EBP chain from looping forever.
const MAX_FRAMES: usize = 64;

/// Walks the guest frame-pointer chain: `[ebp]` holds the saved EBP,
/// `[ebp+4]` the return address. The walk stops at a zero saved EBP, a zero
/// return address, or the first unreadable frame.
pub fn raw_backtrace(base_eip: u32, ebp: u32, mmu: &Mmu) -> Vec<u32> {
    let mut backtrace = vec![base_eip];
    let mut frame = ebp;
    while frame != 0 && backtrace.len() < MAX_FRAMES {
        let Ok(ret) = mmu.read32(Address::flat(frame.wrapping_add(4))) else {
            break;
        };
        if ret.value() == 0 {
            break;
        }
        backtrace.push(ret.value());
        match mmu.read32(Address::flat(frame)) {
            Ok(saved) => frame = saved.value(),
            Err(_) => break,
        }
    }
    backtrace
}

/// Prints a symbolised backtrace through the report sink.
pub fn dump_backtrace(backtrace: &[u32], symbols: Option<&Symbols>) {
    let pid = shadowvm_core::report::pid();
    for &address in backtrace {
        report!("=={}==    {:#010x}  ", pid, address);
        match symbols.and_then(|s| s.symbolicate(address)) {
            Some((name, offset)) => reportln!("{} +{:#x}", name, offset),
            None => reportln!("??"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;
    use shadowvm_core::ShadowValue;

    #[test]
    fn walks_frame_chain() {
        let mut mmu = Mmu::new();
        mmu.add_region(Region::simple(0x10000, 0x1000));

        // Frame at 0x10800: saved ebp -> 0x10900, return 0x8048010.
        mmu.write32(Address::flat(0x10800), ShadowValue::<u32>::wrap_initialized(0x10900))
            .unwrap();
        mmu.write32(Address::flat(0x10804), ShadowValue::<u32>::wrap_initialized(0x0804_8010))
            .unwrap();
        // Frame at 0x10900: saved ebp 0 ends the walk.
        mmu.write32(Address::flat(0x10900), ShadowValue::<u32>::wrap_initialized(0))
            .unwrap();
        mmu.write32(Address::flat(0x10904), ShadowValue::<u32>::wrap_initialized(0x0804_8020))
            .unwrap();

        let backtrace = raw_backtrace(0x0804_8000, 0x10800, &mmu);
        assert_eq!(backtrace, vec![0x0804_8000, 0x0804_8010, 0x0804_8020]);
    }

    #[test]
    fn unreadable_frame_stops_the_walk() {
        let mmu = Mmu::new();
        let backtrace = raw_backtrace(0x0804_8000, 0xdead_0000, &mmu);
        assert_eq!(backtrace, vec![0x0804_8000]);
    }
}
