//! Time and randomness syscall handlers.

use super::{host_result, host_struct_bytes, neg_errno};
use crate::emulator::Emulator;
use crate::EmuError;

impl Emulator {
    pub(crate) fn virt_gettimeofday(&mut self, timeval: u32) -> Result<u32, EmuError> {
        let mut host_timeval: libc::timeval = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::gettimeofday(&mut host_timeval, std::ptr::null_mut()) };
        if rc < 0 {
            return Ok(neg_errno());
        }
        self.cpu
            .mmu_mut()
            .copy_to_vm(timeval, host_struct_bytes(&host_timeval))?;
        Ok(rc as u32)
    }

    pub(crate) fn virt_clock_gettime(&mut self, clockid: i32, timespec: u32) -> Result<u32, EmuError> {
        let mut host_timespec: libc::timespec = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::clock_gettime(clockid, &mut host_timespec) };
        if rc < 0 {
            return Ok(neg_errno());
        }
        self.cpu
            .mmu_mut()
            .copy_to_vm(timespec, host_struct_bytes(&host_timespec))?;
        Ok(rc as u32)
    }

    pub(crate) fn virt_getrandom(&mut self, buffer: u32, buffer_size: u32, flags: u32) -> Result<u32, EmuError> {
        let mut host_buffer = vec![0u8; buffer_size as usize];

        #[cfg(target_os = "linux")]
        let rc = unsafe {
            libc::getrandom(
                host_buffer.as_mut_ptr().cast(),
                host_buffer.len(),
                flags,
            )
        };
        #[cfg(not(target_os = "linux"))]
        let rc = {
            let _ = flags;
            unsafe { libc::arc4random_buf(host_buffer.as_mut_ptr().cast(), host_buffer.len()) };
            host_buffer.len() as isize
        };

        if rc < 0 {
            return Ok(neg_errno());
        }
        self.cpu
            .mmu_mut()
            .copy_to_vm(buffer, &host_buffer[..rc as usize])?;
        Ok(rc as u32)
    }

    pub(crate) fn virt_usleep(&self, microseconds: u32) -> u32 {
        host_result(i64::from(unsafe { libc::usleep(microseconds) }))
    }
}
