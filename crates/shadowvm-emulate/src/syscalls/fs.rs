//! File-system syscall handlers.

use super::{host_result, host_struct_bytes, neg_errno, GuestSlice, StructReader};
use crate::emulator::Emulator;
use crate::EmuError;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;

fn cstring(bytes: Vec<u8>) -> Option<CString> {
    CString::new(bytes).ok()
}

impl Emulator {
    pub(crate) fn virt_open(&mut self, params_addr: u32) -> Result<u32, EmuError> {
        let mut reader = StructReader::new(self.cpu.mmu(), params_addr);
        let dirfd = reader.read_i32()?;
        let path = GuestSlice::read(&mut reader)?;
        let options = reader.read_i32()?;
        let mode = reader.read_u32()?;

        let (bytes, tainted) = self.cpu.mmu().copy_buffer_from_vm(path.ptr, path.len)?;
        if tainted {
            self.flag_tainted_buffer("open path");
        }
        let Some(path) = cstring(bytes) else {
            return Ok((-libc::EINVAL) as u32);
        };

        let fd = unsafe { libc::openat(dirfd, path.as_ptr(), options, mode) };
        Ok(host_result(i64::from(fd)))
    }

    pub(crate) fn virt_close(&mut self, fd: i32) -> u32 {
        host_result(i64::from(unsafe { libc::close(fd) }))
    }

    pub(crate) fn virt_read(&mut self, fd: i32, buffer: u32, size: i32) -> Result<u32, EmuError> {
        if size < 0 {
            return Ok((-libc::EINVAL) as u32);
        }
        let mut local = vec![0u8; size as usize];
        let nread = unsafe { libc::read(fd, local.as_mut_ptr().cast(), local.len()) };
        if nread < 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            if errno == libc::EPERM {
                self.cpu.dump_backtrace();
                return Err(EmuError::unimplemented(
                    "read returned EPERM",
                    self.cpu.base_eip(),
                ));
            }
            return Ok((-errno) as u32);
        }
        // Only the bytes the host actually produced become initialised.
        self.cpu
            .mmu_mut()
            .copy_to_vm(buffer, &local[..nread as usize])?;
        Ok(nread as u32)
    }

    pub(crate) fn virt_write(&mut self, fd: i32, data: u32, size: i32) -> Result<u32, EmuError> {
        if size < 0 {
            return Ok((-libc::EINVAL) as u32);
        }
        let (buffer, tainted) = self.cpu.mmu().copy_buffer_from_vm(data, size as u32)?;
        if tainted {
            self.flag_tainted_buffer("write");
        }
        let rc = unsafe { libc::write(fd, buffer.as_ptr().cast(), buffer.len()) };
        Ok(host_result(rc as i64))
    }

    pub(crate) fn virt_lseek(&mut self, fd: i32, offset: i32, whence: i32) -> u32 {
        host_result(unsafe { libc::lseek(fd, libc::off_t::from(offset), whence) } as i64)
    }

    pub(crate) fn virt_stat(&mut self, params_addr: u32) -> Result<u32, EmuError> {
        let mut reader = StructReader::new(self.cpu.mmu(), params_addr);
        let path = GuestSlice::read(&mut reader)?;
        let statbuf = reader.read_u32()?;
        let follow_symlinks = reader.read_u32()? != 0;

        let (bytes, _) = self.cpu.mmu().copy_buffer_from_vm(path.ptr, path.len)?;
        let Some(path) = cstring(bytes) else {
            return Ok((-libc::EINVAL) as u32);
        };

        let mut host_statbuf: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            if follow_symlinks {
                libc::stat(path.as_ptr(), &mut host_statbuf)
            } else {
                libc::lstat(path.as_ptr(), &mut host_statbuf)
            }
        };
        if rc < 0 {
            return Ok(neg_errno());
        }
        self.cpu
            .mmu_mut()
            .copy_to_vm(statbuf, host_struct_bytes(&host_statbuf))?;
        Ok(rc as u32)
    }

    pub(crate) fn virt_fstat(&mut self, fd: i32, statbuf: u32) -> Result<u32, EmuError> {
        let mut host_statbuf: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(fd, &mut host_statbuf) };
        if rc < 0 {
            return Ok(neg_errno());
        }
        self.cpu
            .mmu_mut()
            .copy_to_vm(statbuf, host_struct_bytes(&host_statbuf))?;
        Ok(rc as u32)
    }

    pub(crate) fn virt_mkdir(&mut self, path: u32, path_length: u32, mode: u32) -> Result<u32, EmuError> {
        let (bytes, _) = self.cpu.mmu().copy_buffer_from_vm(path, path_length)?;
        let Some(path) = cstring(bytes) else {
            return Ok((-libc::EINVAL) as u32);
        };
        let rc = unsafe { libc::mkdir(path.as_ptr(), mode as libc::mode_t) };
        Ok(host_result(i64::from(rc)))
    }

    pub(crate) fn virt_unlink(&mut self, path: u32, path_length: u32) -> Result<u32, EmuError> {
        let (bytes, _) = self.cpu.mmu().copy_buffer_from_vm(path, path_length)?;
        let Some(path) = cstring(bytes) else {
            return Ok((-libc::EINVAL) as u32);
        };
        let rc = unsafe { libc::unlink(path.as_ptr()) };
        Ok(host_result(i64::from(rc)))
    }

    pub(crate) fn virt_fchmod(&mut self, fd: i32, mode: u32) -> u32 {
        host_result(i64::from(unsafe {
            libc::fchmod(fd, mode as libc::mode_t)
        }))
    }

    pub(crate) fn virt_realpath(&mut self, params_addr: u32) -> Result<u32, EmuError> {
        let mut reader = StructReader::new(self.cpu.mmu(), params_addr);
        let path = GuestSlice::read(&mut reader)?;
        let buffer = GuestSlice::read(&mut reader)?;

        let (bytes, _) = self.cpu.mmu().copy_buffer_from_vm(path.ptr, path.len)?;
        let Some(path) = cstring(bytes) else {
            return Ok((-libc::EINVAL) as u32);
        };

        let mut host_buffer = vec![0u8; libc::PATH_MAX as usize];
        let resolved = unsafe { libc::realpath(path.as_ptr(), host_buffer.as_mut_ptr().cast()) };
        if resolved.is_null() {
            return Ok(neg_errno());
        }
        let length = host_buffer
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(host_buffer.len() - 1);
        let count = (length + 1).min(buffer.len as usize);
        self.cpu
            .mmu_mut()
            .copy_to_vm(buffer.ptr, &host_buffer[..count])?;
        Ok(0)
    }

    /// Serialises the directory stream into the guest's dirent format:
    /// one `{ ino: u32, type: u8, name_len: u32, name: [u8] }` per entry.
    pub(crate) fn virt_get_dir_entries(
        &mut self,
        fd: i32,
        buffer: u32,
        size: i32,
    ) -> Result<u32, EmuError> {
        if size < 0 {
            return Ok((-libc::EINVAL) as u32);
        }
        // The guest keeps ownership of its fd; duplicate it so closedir
        // does not pull the stream out from under the guest.
        let dup_fd = unsafe { libc::dup(fd) };
        if dup_fd < 0 {
            return Ok(neg_errno());
        }
        let dir = unsafe { libc::fdopendir(dup_fd) };
        if dir.is_null() {
            unsafe { libc::close(dup_fd) };
            return Ok(neg_errno());
        }

        let mut serialized = Vec::new();
        loop {
            let entry = unsafe { libc::readdir(dir) };
            if entry.is_null() {
                break;
            }
            let entry = unsafe { &*entry };
            let name = unsafe { std::ffi::CStr::from_ptr(entry.d_name.as_ptr()) };
            let name = name.to_bytes();
            serialized.extend_from_slice(&(entry.d_ino as u32).to_le_bytes());
            serialized.push(entry.d_type);
            serialized.extend_from_slice(&(name.len() as u32).to_le_bytes());
            serialized.extend_from_slice(name);
        }
        unsafe { libc::closedir(dir) };

        if serialized.len() > size as usize {
            return Ok((-libc::EINVAL) as u32);
        }
        self.cpu.mmu_mut().copy_to_vm(buffer, &serialized)?;
        Ok(serialized.len() as u32)
    }

    pub(crate) fn virt_pipe(&mut self, vm_pipefd: u32, flags: i32) -> Result<u32, EmuError> {
        let mut pipefd = [0i32; 2];
        let rc = unsafe { libc::pipe2(pipefd.as_mut_ptr(), flags) };
        if rc < 0 {
            return Ok(neg_errno());
        }
        self.cpu
            .mmu_mut()
            .copy_to_vm(vm_pipefd, host_struct_bytes(&pipefd))?;
        Ok(rc as u32)
    }

    pub(crate) fn virt_fcntl(&mut self, fd: i32, cmd: i32, arg: u32) -> Result<u32, EmuError> {
        match cmd {
            libc::F_DUPFD | libc::F_GETFD | libc::F_SETFD | libc::F_GETFL | libc::F_SETFL => {}
            _ => {
                return Err(EmuError::unimplemented(
                    format!("fcntl command {cmd}"),
                    self.cpu.base_eip(),
                ));
            }
        }
        let rc = unsafe { libc::fcntl(fd, cmd, arg) };
        Ok(host_result(i64::from(rc)))
    }

    pub(crate) fn virt_ioctl(&mut self, fd: i32, request: u32, arg: u32) -> Result<u32, EmuError> {
        if u64::from(request) == libc::TIOCGWINSZ as u64 {
            let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
            let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
            if rc < 0 {
                return Ok(neg_errno());
            }
            self.cpu.mmu_mut().copy_to_vm(arg, host_struct_bytes(&ws))?;
            return Ok(0);
        }
        log::debug!("unsupported ioctl: {request:#x}");
        self.cpu.dump_backtrace();
        Err(EmuError::unimplemented(
            format!("ioctl request {request:#x}"),
            self.cpu.base_eip(),
        ))
    }

    pub(crate) fn virt_get_process_name(&mut self, buffer: u32, size: i32) -> Result<u32, EmuError> {
        if size < 0 {
            return Ok((-libc::EINVAL) as u32);
        }
        let name = std::path::Path::new(&self.process_name)
            .file_name()
            .map(|n| n.as_bytes().to_vec())
            .unwrap_or_default();
        let mut host_buffer = vec![0u8; size as usize];
        let count = name.len().min(host_buffer.len().saturating_sub(1));
        host_buffer[..count].copy_from_slice(&name[..count]);
        self.cpu.mmu_mut().copy_to_vm(buffer, &host_buffer)?;
        Ok(0)
    }
}
