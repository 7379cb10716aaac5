//! Shared-buffer syscall handlers.
//!
//! Under emulation there is no cross-process kernel object; buffers live in
//! a process-local registry keyed by id. `shbuf_get` of an id created in
//! this process maps the same region; permissions are tracked on the region
//! so the guest observes consistent results.

use crate::emulator::Emulator;
use crate::region::Region;
use crate::{page_round_up, EmuError};

impl Emulator {
    pub(crate) fn virt_shbuf_create(&mut self, size: i32, buffer_out: u32) -> Result<u32, EmuError> {
        if size <= 0 {
            return Ok((-libc::EINVAL) as u32);
        }
        let shbuf_id = self.next_shbuf_id;
        self.next_shbuf_id += 1;

        let final_size = page_round_up(size as u32);
        let address = self.allocate_vm(final_size, 0)?;
        self.cpu
            .mmu_mut()
            .add_region(Region::shared_buffer(address, final_size, shbuf_id));
        self.shbufs.insert(shbuf_id, address);

        self.cpu
            .mmu_mut()
            .copy_to_vm(buffer_out, &address.to_le_bytes())?;
        Ok(shbuf_id as u32)
    }

    pub(crate) fn virt_shbuf_get(&mut self, shbuf_id: i32, size_out: u32) -> Result<u32, EmuError> {
        let Some(&address) = self.shbufs.get(&shbuf_id) else {
            return Ok((-libc::EINVAL) as u32);
        };
        let Some(region) = self.cpu.mmu().find_region(address) else {
            return Ok((-libc::EINVAL) as u32);
        };
        let size = region.size();
        self.cpu
            .mmu_mut()
            .copy_to_vm(size_out, &size.to_le_bytes())?;
        Ok(address)
    }

    pub(crate) fn virt_shbuf_allow_pid(&mut self, shbuf_id: i32, peer_pid: i32) -> u32 {
        match self.cpu.mmu_mut().shbuf_region(shbuf_id) {
            Some(region) => region.allow_pid(peer_pid) as u32,
            None => (-libc::EINVAL) as u32,
        }
    }

    pub(crate) fn virt_shbuf_allow_all(&mut self, shbuf_id: i32) -> u32 {
        match self.cpu.mmu_mut().shbuf_region(shbuf_id) {
            Some(region) => region.allow_all() as u32,
            None => (-libc::EINVAL) as u32,
        }
    }

    pub(crate) fn virt_shbuf_release(&mut self, shbuf_id: i32) -> Result<u32, EmuError> {
        let Some(address) = self.shbufs.remove(&shbuf_id) else {
            return Ok((-libc::EINVAL) as u32);
        };
        if let Some(region) = self.cpu.mmu_mut().remove_region(address) {
            self.vm.free(region.base(), region.size());
        }
        Ok(0)
    }

    pub(crate) fn virt_shbuf_seal(&mut self, shbuf_id: i32) -> u32 {
        match self.cpu.mmu_mut().shbuf_region(shbuf_id) {
            Some(region) => region.seal() as u32,
            None => (-libc::EINVAL) as u32,
        }
    }

    pub(crate) fn virt_shbuf_set_volatile(&mut self, shbuf_id: i32, is_volatile: bool) -> u32 {
        match self.cpu.mmu_mut().shbuf_region(shbuf_id) {
            Some(region) => region.set_volatile(is_volatile) as u32,
            None => (-libc::EINVAL) as u32,
        }
    }
}
