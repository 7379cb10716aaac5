//! The software MMU.
//!
//! Owns every guest memory region and routes segmented addresses to them.
//! Ordinary accesses resolve through the flat data selector against an
//! address-sorted region list; the TLS selector resolves to a dedicated
//! mini-region. Multi-byte accesses are serviced by the containing region,
//! which rejects anything straddling its end.

use crate::region::Region;
use crate::{AccessKind, FaultReason, MemFault, PAGE_SIZE};
use shadowvm_core::{Address, ShadowValue, TLS_SELECTOR};

/// Owns and routes all guest memory.
#[derive(Debug, Default)]
pub struct Mmu {
    /// All flat-selector regions, sorted by base address.
    regions: Vec<Region>,
    tls_region: Option<Region>,
}

impl Mmu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a region, keeping the list address-sorted.
    ///
    /// Region placement is controlled by the emulator's VM allocator and the
    /// ELF loader, so alignment or overlap violations are internal bugs.
    pub fn add_region(&mut self, region: Region) {
        assert_eq!(region.base() % PAGE_SIZE, 0, "region base not page-aligned");
        assert_eq!(region.size() % PAGE_SIZE, 0, "region size not page-aligned");
        assert!(region.size() > 0, "empty region");
        let idx = self.regions.partition_point(|r| r.base() < region.base());
        if let Some(next) = self.regions.get(idx) {
            assert!(region.end() <= next.base(), "overlapping regions");
        }
        if idx > 0 {
            assert!(self.regions[idx - 1].end() <= region.base(), "overlapping regions");
        }
        self.regions.insert(idx, region);
    }

    /// Removes and returns the region based at `base`.
    pub fn remove_region(&mut self, base: u32) -> Option<Region> {
        let idx = self.regions.iter().position(|r| r.base() == base)?;
        Some(self.regions.remove(idx))
    }

    /// Finds the region containing a flat address.
    pub fn find_region(&self, address: u32) -> Option<&Region> {
        let idx = self.regions.partition_point(|r| r.base() <= address);
        let region = self.regions.get(idx.checked_sub(1)?)?;
        region.contains(address).then_some(region)
    }

    /// Finds the region containing a flat address, mutably.
    pub fn find_region_mut(&mut self, address: u32) -> Option<&mut Region> {
        let idx = self.regions.partition_point(|r| r.base() <= address);
        let region = self.regions.get_mut(idx.checked_sub(1)?)?;
        region.contains(address).then(|| region)
    }

    /// Installs the mini-region behind the TLS selector.
    pub fn set_tls_region(&mut self, region: Region) {
        self.tls_region = Some(region);
    }

    /// The shared-buffer region with the given id, if mapped.
    pub fn shbuf_region(&mut self, shbuf_id: i32) -> Option<&mut Region> {
        self.regions
            .iter_mut()
            .find(|r| r.shbuf_id() == Some(shbuf_id))
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    fn resolve(&self, address: Address, kind: AccessKind) -> Result<(&Region, u32), MemFault> {
        if address.selector == TLS_SELECTOR {
            let region = self
                .tls_region
                .as_ref()
                .ok_or_else(|| MemFault::not_mapped(address, kind))?;
            return Ok((region, address.offset.wrapping_sub(region.base())));
        }
        let region = self
            .find_region(address.offset)
            .ok_or_else(|| MemFault::not_mapped(address, kind))?;
        Ok((region, address.offset - region.base()))
    }

    fn resolve_mut(&mut self, address: Address, kind: AccessKind) -> Result<(&mut Region, u32), MemFault> {
        if address.selector == TLS_SELECTOR {
            let region = self
                .tls_region
                .as_mut()
                .ok_or_else(|| MemFault::not_mapped(address, kind))?;
            let offset = address.offset.wrapping_sub(region.base());
            return Ok((region, offset));
        }
        let region = self
            .find_region_mut(address.offset)
            .ok_or_else(|| MemFault::not_mapped(address, kind))?;
        let offset = address.offset - region.base();
        Ok((region, offset))
    }

    pub fn read8(&self, address: Address) -> Result<ShadowValue<u8>, MemFault> {
        let (region, offset) = self.resolve(address, AccessKind::Read)?;
        region.read8(offset)
    }

    pub fn read16(&self, address: Address) -> Result<ShadowValue<u16>, MemFault> {
        let (region, offset) = self.resolve(address, AccessKind::Read)?;
        region.read16(offset)
    }

    pub fn read32(&self, address: Address) -> Result<ShadowValue<u32>, MemFault> {
        let (region, offset) = self.resolve(address, AccessKind::Read)?;
        region.read32(offset)
    }

    pub fn write8(&mut self, address: Address, value: ShadowValue<u8>) -> Result<(), MemFault> {
        let (region, offset) = self.resolve_mut(address, AccessKind::Write)?;
        region.write8(offset, value)
    }

    pub fn write16(&mut self, address: Address, value: ShadowValue<u16>) -> Result<(), MemFault> {
        let (region, offset) = self.resolve_mut(address, AccessKind::Write)?;
        region.write16(offset, value)
    }

    pub fn write32(&mut self, address: Address, value: ShadowValue<u32>) -> Result<(), MemFault> {
        let (region, offset) = self.resolve_mut(address, AccessKind::Write)?;
        region.write32(offset, value)
    }

    /// Instruction fetch: a read that additionally requires execute
    /// permission on the region.
    pub fn fetch8(&self, address: Address) -> Result<ShadowValue<u8>, MemFault> {
        let (region, offset) = self.resolve(address, AccessKind::Execute)?;
        if !region.is_executable() {
            return Err(MemFault::new(
                address,
                AccessKind::Execute,
                FaultReason::NotExecutable,
            ));
        }
        region.read8(offset)
    }

    /// Copies host bytes into guest memory, marking them initialised.
    pub fn copy_to_vm(&mut self, destination: u32, source: &[u8]) -> Result<(), MemFault> {
        for (i, &byte) in source.iter().enumerate() {
            self.write8(
                Address::flat(destination.wrapping_add(i as u32)),
                ShadowValue::<u8>::wrap_initialized(byte),
            )?;
        }
        Ok(())
    }

    /// Copies guest memory into a host buffer, dropping shadow metadata.
    pub fn copy_from_vm(&self, destination: &mut [u8], source: u32) -> Result<(), MemFault> {
        for (i, slot) in destination.iter_mut().enumerate() {
            *slot = self
                .read8(Address::flat(source.wrapping_add(i as u32)))?
                .value();
        }
        Ok(())
    }

    /// Copies a guest buffer out, also reporting whether any byte of it was
    /// uninitialised (used to flag tainted syscall input buffers).
    pub fn copy_buffer_from_vm(&self, source: u32, size: u32) -> Result<(Vec<u8>, bool), MemFault> {
        let mut buffer = Vec::with_capacity(size as usize);
        let mut tainted = false;
        for i in 0..size {
            let byte = self.read8(Address::flat(source.wrapping_add(i)))?;
            tainted |= byte.is_uninitialized();
            buffer.push(byte.value());
        }
        Ok((buffer, tainted))
    }

    /// Marks a flat byte range uninitialised, ignoring permissions. Used by
    /// the malloc tracer to poison freed blocks.
    pub fn poison_range(&mut self, base: u32, len: u32) {
        if let Some(region) = self.find_region_mut(base) {
            let offset = base - region.base();
            let len = len.min(region.size() - offset);
            region.poison(offset, len);
        }
    }

    /// Marks a flat byte range initialised, ignoring permissions.
    pub fn unpoison_range(&mut self, base: u32, len: u32) {
        if let Some(region) = self.find_region_mut(base) {
            let offset = base - region.base();
            let len = len.min(region.size() - offset);
            region.mark_initialized(offset, len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::PROT_READ;

    fn mmu_with_region(base: u32, size: u32) -> Mmu {
        let mut mmu = Mmu::new();
        mmu.add_region(Region::simple(base, size));
        mmu
    }

    #[test]
    fn routes_to_containing_region() {
        let mut mmu = Mmu::new();
        mmu.add_region(Region::simple(0x10000, 0x1000));
        mmu.add_region(Region::simple(0x20000, 0x2000));

        assert_eq!(mmu.find_region(0x10000).unwrap().base(), 0x10000);
        assert_eq!(mmu.find_region(0x10fff).unwrap().base(), 0x10000);
        assert!(mmu.find_region(0x11000).is_none());
        assert_eq!(mmu.find_region(0x21234).unwrap().base(), 0x20000);
    }

    #[test]
    fn unmapped_access_faults() {
        let mmu = mmu_with_region(0x10000, 0x1000);
        let err = mmu.read32(Address::flat(0x50000)).unwrap_err();
        assert_eq!(err.reason, FaultReason::NotMapped);
    }

    #[test]
    fn read_write_round_trip() {
        let mut mmu = mmu_with_region(0x10000, 0x1000);
        mmu.write32(Address::flat(0x10040), ShadowValue::<u32>::wrap_initialized(0xcafe_f00d))
            .unwrap();
        let value = mmu.read32(Address::flat(0x10040)).unwrap();
        assert_eq!(value.value(), 0xcafe_f00d);
        assert!(value.is_initialized());
    }

    #[test]
    fn copy_round_trip() {
        let mut mmu = mmu_with_region(0x10000, 0x1000);
        let pattern = [1u8, 2, 3, 4, 5, 6, 7];
        mmu.copy_to_vm(0x10100, &pattern).unwrap();
        let (copied, tainted) = mmu.copy_buffer_from_vm(0x10100, 7).unwrap();
        assert_eq!(copied, pattern);
        assert!(!tainted);
    }

    #[test]
    fn copy_buffer_flags_taint() {
        let mut mmu = mmu_with_region(0x10000, 0x1000);
        mmu.copy_to_vm(0x10100, &[1, 2]).unwrap();
        // Byte at +2 was never written.
        let (_, tainted) = mmu.copy_buffer_from_vm(0x10100, 3).unwrap();
        assert!(tainted);
    }

    #[test]
    fn tls_selector_routes_to_tls_region() {
        let mut mmu = mmu_with_region(0x10000, 0x1000);
        let mut tls = Region::simple(0, 4);
        tls.write32(0, ShadowValue::<u32>::wrap_initialized(0x2000_1000))
            .unwrap();
        mmu.set_tls_region(tls);

        let value = mmu.read32(Address::tls(0)).unwrap();
        assert_eq!(value.value(), 0x2000_1000);
    }

    #[test]
    fn fetch_requires_execute() {
        let mut mmu = Mmu::new();
        mmu.add_region(Region::mmap_anonymous(0x30000000, 0x1000, PROT_READ));
        let err = mmu.fetch8(Address::flat(0x30000000)).unwrap_err();
        assert_eq!(err.reason, FaultReason::NotExecutable);
    }

    #[test]
    fn remove_region_unmaps() {
        let mut mmu = mmu_with_region(0x10000, 0x1000);
        assert!(mmu.remove_region(0x10000).is_some());
        assert!(mmu.read8(Address::flat(0x10000)).is_err());
        assert!(mmu.remove_region(0x10000).is_none());
    }

    #[test]
    fn poison_range_marks_uninitialised() {
        let mut mmu = mmu_with_region(0x10000, 0x1000);
        mmu.copy_to_vm(0x10200, &[9; 16]).unwrap();
        mmu.poison_range(0x10204, 8);
        assert!(mmu.read8(Address::flat(0x10203)).unwrap().is_initialized());
        assert!(mmu.read8(Address::flat(0x10204)).unwrap().is_uninitialized());
        assert!(mmu.read8(Address::flat(0x1020b)).unwrap().is_uninitialized());
        assert!(mmu.read8(Address::flat(0x1020c)).unwrap().is_initialized());
    }
}
