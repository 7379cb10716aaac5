//! Virtual-memory syscall handlers.

use super::{neg_errno, GuestSlice, StructReader};
use crate::emulator::Emulator;
use crate::region::Region;
use crate::{page_round_up, EmuError};

/// Guest MAP_* bits (the subset the emulator interprets).
const GUEST_MAP_ANONYMOUS: i32 = 0x20;

impl Emulator {
    pub(crate) fn virt_mmap(&mut self, params_addr: u32) -> Result<u32, EmuError> {
        let mut reader = StructReader::new(self.cpu.mmu(), params_addr);
        let addr = reader.read_u32()?;
        let size = reader.read_u32()?;
        let alignment = reader.read_u32()?;
        let prot = reader.read_i32()?;
        let flags = reader.read_i32()?;
        let fd = reader.read_i32()?;
        let offset = reader.read_i32()?;
        let _name = GuestSlice::read(&mut reader)?;

        if addr != 0 {
            return Err(EmuError::unimplemented(
                "mmap with a requested address",
                self.cpu.base_eip(),
            ));
        }

        let final_size = page_round_up(size.max(1));
        let final_address = self.allocate_vm(final_size, alignment)?;

        if flags & GUEST_MAP_ANONYMOUS != 0 {
            self.cpu
                .mmu_mut()
                .add_region(Region::mmap_anonymous(final_address, final_size, prot));
        } else {
            let mut region = Region::mmap_file(final_address, final_size, prot, fd, offset as u32);
            // Materialise the file contents; there is no host page cache
            // behind emulated guest memory.
            let rc = unsafe {
                libc::pread(
                    fd,
                    region.data_mut().as_mut_ptr().cast(),
                    final_size as usize,
                    libc::off_t::from(offset),
                )
            };
            if rc < 0 {
                self.vm.free(final_address, final_size);
                return Ok(neg_errno());
            }
            self.cpu.mmu_mut().add_region(region);
        }

        Ok(final_address)
    }

    pub(crate) fn virt_munmap(&mut self, address: u32, size: u32) -> Result<u32, EmuError> {
        let Some(region) = self.cpu.mmu().find_region(address) else {
            return Err(EmuError::unimplemented(
                format!("munmap of unmapped address {address:#010x}"),
                self.cpu.base_eip(),
            ));
        };
        let base = region.base();
        let region_size = region.size();
        if region_size != page_round_up(size.max(1)) {
            return Err(EmuError::unimplemented(
                "munmap of a partial region",
                self.cpu.base_eip(),
            ));
        }
        self.cpu.mmu_mut().remove_region(base);
        self.vm.free(base, region_size);
        Ok(0)
    }

    pub(crate) fn virt_mprotect(&self, _address: u32, _size: u32, _prot: i32) -> u32 {
        0
    }

    pub(crate) fn virt_madvise(&self, _address: u32, _size: u32, _advice: i32) -> u32 {
        0
    }

    pub(crate) fn virt_set_mmap_name(&self, _params_addr: u32) -> u32 {
        0
    }
}
