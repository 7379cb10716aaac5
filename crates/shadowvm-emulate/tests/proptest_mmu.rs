//! Property tests for the MMU copy helpers, shadow combination, and the VM
//! range allocator.

use proptest::prelude::*;
use shadowvm_core::ShadowValue;
use shadowvm_emulate::{Mmu, Region, VmAllocator, PAGE_SIZE};

fn mmu_with_region() -> Mmu {
    let mut mmu = Mmu::new();
    mmu.add_region(Region::simple(0x10000, 2 * PAGE_SIZE));
    mmu
}

proptest! {
    /// Round-trip: whatever byte pattern is copied into guest memory comes
    /// back out identical and fully initialised.
    #[test]
    fn copy_to_vm_round_trips(
        pattern in proptest::collection::vec(any::<u8>(), 1..=PAGE_SIZE as usize),
        offset in 0u32..PAGE_SIZE,
    ) {
        let mut mmu = mmu_with_region();
        let address = 0x10000 + offset;
        mmu.copy_to_vm(address, &pattern).unwrap();
        let (copied, tainted) = mmu
            .copy_buffer_from_vm(address, pattern.len() as u32)
            .unwrap();
        prop_assert_eq!(copied, pattern);
        prop_assert!(!tainted);
    }

    /// The shadow of a binary operation is exactly the OR of the input
    /// shadows, for any inputs.
    #[test]
    fn arithmetic_shadow_is_or_of_inputs(a: u32, b: u32, sa: u32, sb: u32) {
        let x = ShadowValue::<u32>::with_shadow(a, sa);
        let y = ShadowValue::<u32>::with_shadow(b, sb);
        prop_assert_eq!(x.wrapping_add(y).shadow(), sa | sb);
        prop_assert_eq!(x.wrapping_sub(y).shadow(), sa | sb);
        prop_assert_eq!(x.bitand(y).shadow(), sa | sb);
        prop_assert_eq!(x.bitor(y).shadow(), sa | sb);
        prop_assert_eq!(x.bitxor(y).shadow(), sa | sb);
    }

    /// Byte split/join loses nothing.
    #[test]
    fn split_join_identity(value: u32, shadow: u32) {
        let v = ShadowValue::<u32>::with_shadow(value, shadow);
        let joined = ShadowValue::<u32>::join_bytes(v.split_bytes());
        prop_assert_eq!(joined.value(), value);
        prop_assert_eq!(joined.shadow(), shadow);
    }

    /// Every allocation the VM allocator hands out is page-aligned and
    /// disjoint from every other live allocation.
    #[test]
    fn vm_allocations_are_aligned_and_disjoint(
        sizes in proptest::collection::vec(1u32..100_000, 1..16),
    ) {
        let mut vm = VmAllocator::new();
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        for size in sizes {
            let base = vm.allocate(size, 0).unwrap();
            let rounded = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            prop_assert_eq!(base % PAGE_SIZE, 0);
            for &(other_base, other_size) in &ranges {
                let disjoint = base + rounded <= other_base || other_base + other_size <= base;
                prop_assert!(disjoint, "{:#x}+{:#x} overlaps {:#x}+{:#x}", base, rounded, other_base, other_size);
            }
            ranges.push((base, rounded));
        }
    }

    /// Partially-initialised words keep per-byte precision through memory.
    #[test]
    fn partial_word_precision(init_mask in 0u8..16) {
        let mut mmu = mmu_with_region();
        for bit in 0..4u32 {
            if init_mask & (1 << bit) != 0 {
                mmu.write8(
                    shadowvm_core::Address::flat(0x10040 + bit),
                    ShadowValue::<u8>::wrap_initialized(0xa0 | bit as u8),
                )
                .unwrap();
            }
        }
        let word = mmu.read32(shadowvm_core::Address::flat(0x10040)).unwrap();
        for (bit, byte) in word.split_bytes().into_iter().enumerate() {
            prop_assert_eq!(byte.is_initialized(), init_mask & (1 << bit) != 0);
        }
    }
}
