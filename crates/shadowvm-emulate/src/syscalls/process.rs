//! Process and identity syscall handlers.

use super::{host_result, neg_errno, GuestSlice, StructReader};
use crate::emulator::Emulator;
use crate::EmuError;
use shadowvm_core::reportln;
use std::ffi::CString;
use std::io::Write;

impl Emulator {
    pub(crate) fn virt_exit(&mut self, status: i32) {
        let pid = shadowvm_core::report::pid();
        reportln!(
            "\n=={}==  \x1b[33;1mSyscall: exit({})\x1b[0m, shutting down!",
            pid,
            status
        );
        self.exit_status = status;
        self.shutdown = true;
    }

    pub(crate) fn virt_getpid(&self) -> u32 {
        unsafe { libc::getpid() as u32 }
    }

    pub(crate) fn virt_gettid(&self) -> u32 {
        #[cfg(target_os = "linux")]
        unsafe {
            libc::gettid() as u32
        }
        #[cfg(not(target_os = "linux"))]
        unsafe {
            libc::getpid() as u32
        }
    }

    pub(crate) fn virt_getuid(&self) -> u32 {
        unsafe { libc::getuid() }
    }

    pub(crate) fn virt_getgid(&self) -> u32 {
        unsafe { libc::getgid() }
    }

    pub(crate) fn virt_setuid(&self, uid: u32) -> u32 {
        host_result(i64::from(unsafe { libc::setuid(uid) }))
    }

    pub(crate) fn virt_setgid(&self, gid: u32) -> u32 {
        host_result(i64::from(unsafe { libc::setgid(gid) }))
    }

    pub(crate) fn virt_getgroups(&mut self, count: i32, groups: u32) -> Result<u32, EmuError> {
        if count == 0 {
            let rc = unsafe { libc::getgroups(0, std::ptr::null_mut()) };
            return Ok(host_result(i64::from(rc)));
        }
        if count < 0 {
            return Ok((-libc::EINVAL) as u32);
        }
        let mut buffer = vec![0 as libc::gid_t; count as usize];
        let rc = unsafe { libc::getgroups(count, buffer.as_mut_ptr()) };
        if rc < 0 {
            return Ok(neg_errno());
        }
        let bytes: Vec<u8> = buffer[..rc as usize]
            .iter()
            .flat_map(|gid| (*gid as u32).to_le_bytes())
            .collect();
        self.cpu.mmu_mut().copy_to_vm(groups, &bytes)?;
        Ok(0)
    }

    pub(crate) fn virt_kill(&self, pid: i32, signal: i32) -> u32 {
        host_result(i64::from(unsafe { libc::kill(pid, signal) }))
    }

    pub(crate) fn virt_fork(&self) -> u32 {
        host_result(i64::from(unsafe { libc::fork() }))
    }

    /// Replaces the process image with the emulator itself re-invoked on the
    /// new program, so emulation follows across exec.
    pub(crate) fn virt_execve(&mut self, params_addr: u32) -> Result<u32, EmuError> {
        let mut reader = StructReader::new(self.cpu.mmu(), params_addr);
        let path = GuestSlice::read(&mut reader)?;
        let argument_list = GuestSlice::read(&mut reader)?;
        let environment_list = GuestSlice::read(&mut reader)?;

        let (path_bytes, _) = self.cpu.mmu().copy_buffer_from_vm(path.ptr, path.len)?;
        let path = String::from_utf8_lossy(&path_bytes).into_owned();

        let copy_string_list = |emulator: &Emulator, list: GuestSlice| -> Result<Vec<String>, EmuError> {
            let mut output = Vec::new();
            for i in 0..list.len {
                let mut entry = StructReader::new(emulator.cpu.mmu(), list.ptr.wrapping_add(i * 8));
                let string = GuestSlice::read(&mut entry)?;
                let (bytes, _) = emulator
                    .cpu
                    .mmu()
                    .copy_buffer_from_vm(string.ptr, string.len)?;
                output.push(String::from_utf8_lossy(&bytes).into_owned());
            }
            Ok(output)
        };

        let arguments = copy_string_list(self, argument_list)?;
        let environment = copy_string_list(self, environment_list)?;

        let pid = shadowvm_core::report::pid();
        reportln!();
        reportln!("=={}==  \x1b[33;1mSyscall:\x1b[0m execve", pid);
        reportln!("=={}==    - {}", pid, path);
        for argument in &arguments {
            reportln!("=={}==    - {}", pid, argument);
        }

        let emulator_path = std::env::current_exe()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "shadowvm".to_string());

        let mut argv_strings = vec![emulator_path, path];
        argv_strings.extend(arguments.into_iter().skip(1));

        let argv_cstrings: Vec<CString> = argv_strings
            .into_iter()
            .filter_map(|s| CString::new(s).ok())
            .collect();
        let envp_cstrings: Vec<CString> = environment
            .into_iter()
            .filter_map(|s| CString::new(s).ok())
            .collect();

        let mut argv: Vec<*const libc::c_char> =
            argv_cstrings.iter().map(|s| s.as_ptr()).collect();
        argv.push(std::ptr::null());
        let mut envp: Vec<*const libc::c_char> =
            envp_cstrings.iter().map(|s| s.as_ptr()).collect();
        envp.push(std::ptr::null());

        let rc = unsafe { libc::execve(argv[0], argv.as_ptr(), envp.as_ptr()) };
        Ok(host_result(i64::from(rc)))
    }

    pub(crate) fn virt_set_process_icon(&self, _shbuf_id: i32) -> u32 {
        // No window server to forward the icon to under emulation.
        0
    }

    pub(crate) fn virt_dbgputstr(&mut self, characters: u32, length: i32) -> Result<u32, EmuError> {
        if length < 0 {
            return Ok((-libc::EINVAL) as u32);
        }
        let (buffer, _) = self
            .cpu
            .mmu()
            .copy_buffer_from_vm(characters, length as u32)?;
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(&buffer);
        Ok(0)
    }

    pub(crate) fn virt_dbgputch(&self, ch: u8) -> u32 {
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(&[ch]);
        0
    }

    pub(crate) fn virt_pledge(&self, _promises: u32) -> u32 {
        0
    }

    pub(crate) fn virt_unveil(&self, _path: u32) -> u32 {
        0
    }
}
