//! The syscall gateway.
//!
//! Guest system calls arrive via `int 0x82` with the function number in EAX
//! and up to three arguments in EBX/ECX/EDX. Each known number dispatches to
//! a `virt_*` handler that marshals arguments through the software MMU,
//! services the call (against the host kernel where one exists, internally
//! otherwise) and returns the result for EAX. Failures are negative errno
//! values; unknown numbers are fatal.

mod fs;
mod process;
mod shbuf;
mod socket;
mod time;
mod vm;

use crate::emulator::Emulator;
use crate::mmu::Mmu;
use crate::{EmuError, MemFault};
use shadowvm_core::{reportln, Address, ShadowValue};
use shadowvm_disasm::regs;

/// The guest kernel's system call numbering. The emulator is only useful if
/// this table matches the kernel the guest was compiled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Sys {
    Exit = 1,
    Fork = 2,
    Read = 3,
    Write = 4,
    Open = 5,
    Close = 6,
    Lseek = 7,
    Stat = 8,
    Fstat = 9,
    Mkdir = 10,
    Unlink = 11,
    Fchmod = 12,
    Realpath = 13,
    GetDirEntries = 14,
    Pipe = 15,
    Fcntl = 16,
    Ioctl = 17,

    Getpid = 20,
    Gettid = 21,
    Getuid = 22,
    Getgid = 23,
    Setuid = 24,
    Setgid = 25,
    Getgroups = 26,
    Kill = 27,
    Execve = 28,
    GetProcessName = 29,
    SetProcessIcon = 30,

    Mmap = 35,
    Munmap = 36,
    Mprotect = 37,
    Madvise = 38,
    SetMmapName = 39,

    Socket = 45,
    Bind = 46,
    Listen = 47,
    Accept = 48,
    Connect = 49,
    Recvfrom = 50,
    Getsockopt = 51,
    Setsockopt = 52,
    Select = 53,
    Gethostname = 54,

    Gettimeofday = 60,
    ClockGettime = 61,
    Getrandom = 62,
    Usleep = 63,

    ShbufCreate = 70,
    ShbufGet = 71,
    ShbufAllowPid = 72,
    ShbufAllowAll = 73,
    ShbufRelease = 74,
    ShbufSeal = 75,
    ShbufSetVolatile = 76,

    Dbgputstr = 80,
    Dbgputch = 81,
    Pledge = 82,
    Unveil = 83,
}

impl Sys {
    /// How many of EBX/ECX/EDX this call consumes; the rest are ignored by
    /// the handler and never inspected.
    pub fn arg_count(self) -> usize {
        match self {
            Sys::Fork | Sys::Getpid | Sys::Gettid | Sys::Getuid | Sys::Getgid => 0,

            Sys::Exit
            | Sys::Open
            | Sys::Close
            | Sys::Stat
            | Sys::Realpath
            | Sys::Setuid
            | Sys::Setgid
            | Sys::Execve
            | Sys::SetProcessIcon
            | Sys::Mmap
            | Sys::SetMmapName
            | Sys::Recvfrom
            | Sys::Getsockopt
            | Sys::Setsockopt
            | Sys::Select
            | Sys::Gettimeofday
            | Sys::Usleep
            | Sys::ShbufAllowAll
            | Sys::ShbufRelease
            | Sys::ShbufSeal
            | Sys::Dbgputch
            | Sys::Pledge
            | Sys::Unveil => 1,

            Sys::Fstat
            | Sys::Unlink
            | Sys::Fchmod
            | Sys::Pipe
            | Sys::Getgroups
            | Sys::Kill
            | Sys::GetProcessName
            | Sys::Munmap
            | Sys::Listen
            | Sys::Gethostname
            | Sys::ClockGettime
            | Sys::ShbufCreate
            | Sys::ShbufGet
            | Sys::ShbufAllowPid
            | Sys::ShbufSetVolatile
            | Sys::Dbgputstr => 2,

            Sys::Read
            | Sys::Write
            | Sys::Lseek
            | Sys::Mkdir
            | Sys::GetDirEntries
            | Sys::Fcntl
            | Sys::Ioctl
            | Sys::Mprotect
            | Sys::Madvise
            | Sys::Socket
            | Sys::Bind
            | Sys::Accept
            | Sys::Connect
            | Sys::Getrandom => 3,
        }
    }

    pub fn from_u32(function: u32) -> Option<Self> {
        Some(match function {
            1 => Sys::Exit,
            2 => Sys::Fork,
            3 => Sys::Read,
            4 => Sys::Write,
            5 => Sys::Open,
            6 => Sys::Close,
            7 => Sys::Lseek,
            8 => Sys::Stat,
            9 => Sys::Fstat,
            10 => Sys::Mkdir,
            11 => Sys::Unlink,
            12 => Sys::Fchmod,
            13 => Sys::Realpath,
            14 => Sys::GetDirEntries,
            15 => Sys::Pipe,
            16 => Sys::Fcntl,
            17 => Sys::Ioctl,
            20 => Sys::Getpid,
            21 => Sys::Gettid,
            22 => Sys::Getuid,
            23 => Sys::Getgid,
            24 => Sys::Setuid,
            25 => Sys::Setgid,
            26 => Sys::Getgroups,
            27 => Sys::Kill,
            28 => Sys::Execve,
            29 => Sys::GetProcessName,
            30 => Sys::SetProcessIcon,
            35 => Sys::Mmap,
            36 => Sys::Munmap,
            37 => Sys::Mprotect,
            38 => Sys::Madvise,
            39 => Sys::SetMmapName,
            45 => Sys::Socket,
            46 => Sys::Bind,
            47 => Sys::Listen,
            48 => Sys::Accept,
            49 => Sys::Connect,
            50 => Sys::Recvfrom,
            51 => Sys::Getsockopt,
            52 => Sys::Setsockopt,
            53 => Sys::Select,
            54 => Sys::Gethostname,
            60 => Sys::Gettimeofday,
            61 => Sys::ClockGettime,
            62 => Sys::Getrandom,
            63 => Sys::Usleep,
            70 => Sys::ShbufCreate,
            71 => Sys::ShbufGet,
            72 => Sys::ShbufAllowPid,
            73 => Sys::ShbufAllowAll,
            74 => Sys::ShbufRelease,
            75 => Sys::ShbufSeal,
            76 => Sys::ShbufSetVolatile,
            80 => Sys::Dbgputstr,
            81 => Sys::Dbgputch,
            82 => Sys::Pledge,
            83 => Sys::Unveil,
            _ => return None,
        })
    }
}

/// errno of the last failed host call, as a negative guest return value.
pub(crate) fn neg_errno() -> u32 {
    let errno = std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO);
    (-errno) as u32
}

/// Maps a host return code: negative becomes -errno, otherwise the value.
pub(crate) fn host_result(rc: i64) -> u32 {
    if rc < 0 {
        neg_errno()
    } else {
        rc as u32
    }
}

/// The raw bytes of a host struct, for copying into guest memory.
///
/// Guest libc is assumed to share the host's struct layouts for the plain
/// data types marshalled this way (stat, timeval, winsize, fd_set), as the
/// original tool does.
pub(crate) fn host_struct_bytes<T>(value: &T) -> &[u8] {
    // Safe: T is plain data and we only read size_of::<T>() bytes of it.
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    }
}

/// Sequential reader for guest parameter blocks (packed u32 fields).
pub(crate) struct StructReader<'m> {
    mmu: &'m Mmu,
    address: u32,
}

impl<'m> StructReader<'m> {
    pub fn new(mmu: &'m Mmu, address: u32) -> Self {
        Self { mmu, address }
    }

    pub fn read_u32(&mut self) -> Result<u32, MemFault> {
        let value = self.mmu.read32(Address::flat(self.address))?.value();
        self.address = self.address.wrapping_add(4);
        Ok(value)
    }

    pub fn read_i32(&mut self) -> Result<i32, MemFault> {
        Ok(self.read_u32()? as i32)
    }
}

/// A (pointer, length) string descriptor in a guest parameter block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GuestSlice {
    pub ptr: u32,
    pub len: u32,
}

impl GuestSlice {
    pub fn read(reader: &mut StructReader<'_>) -> Result<Self, MemFault> {
        Ok(Self {
            ptr: reader.read_u32()?,
            len: reader.read_u32()?,
        })
    }
}

impl Emulator {
    /// Entry point from the CPU's `int 0x82` trap.
    pub(crate) fn dispatch_syscall(&mut self) -> Result<(), EmuError> {
        let function = self.cpu.read_reg32(regs::EAX);
        let arg1 = self.cpu.read_reg32(regs::EBX);
        let arg2 = self.cpu.read_reg32(regs::ECX);
        let arg3 = self.cpu.read_reg32(regs::EDX);

        let Some(number) = Sys::from_u32(function.value()) else {
            return Err(EmuError::UnknownSyscall {
                function: function.value(),
                eip: self.cpu.base_eip(),
            });
        };

        let args = [arg1, arg2, arg3];
        let consumed_taint = function.is_uninitialized()
            || args[..number.arg_count()]
                .iter()
                .any(|arg| arg.is_uninitialized());
        if consumed_taint {
            // Flagged but passed through; the concrete values still drive
            // the call.
            let pid = shadowvm_core::report::pid();
            reportln!(
                "=={}==  \x1b[31;1mSyscall arguments contain uninitialized value(s)\x1b[0m",
                pid
            );
            self.cpu.dump_backtrace();
            shadowvm_core::report::note_diagnostic();
        }

        log::debug!(
            "syscall {:?}({:#x}, {:#x}, {:#x})",
            number,
            arg1.value(),
            arg2.value(),
            arg3.value()
        );

        let result = self.syscall(number, arg1.value(), arg2.value(), arg3.value())?;
        self.cpu
            .write_reg32(regs::EAX, ShadowValue::<u32>::wrap_initialized(result));
        Ok(())
    }

    fn syscall(&mut self, number: Sys, arg1: u32, arg2: u32, arg3: u32) -> Result<u32, EmuError> {
        match number {
            Sys::Exit => {
                self.virt_exit(arg1 as i32);
                Ok(0)
            }
            Sys::Fork => Ok(self.virt_fork()),
            Sys::Read => self.virt_read(arg1 as i32, arg2, arg3 as i32),
            Sys::Write => self.virt_write(arg1 as i32, arg2, arg3 as i32),
            Sys::Open => self.virt_open(arg1),
            Sys::Close => Ok(self.virt_close(arg1 as i32)),
            Sys::Lseek => Ok(self.virt_lseek(arg1 as i32, arg2 as i32, arg3 as i32)),
            Sys::Stat => self.virt_stat(arg1),
            Sys::Fstat => self.virt_fstat(arg1 as i32, arg2),
            Sys::Mkdir => self.virt_mkdir(arg1, arg2, arg3),
            Sys::Unlink => self.virt_unlink(arg1, arg2),
            Sys::Fchmod => Ok(self.virt_fchmod(arg1 as i32, arg2)),
            Sys::Realpath => self.virt_realpath(arg1),
            Sys::GetDirEntries => self.virt_get_dir_entries(arg1 as i32, arg2, arg3 as i32),
            Sys::Pipe => self.virt_pipe(arg1, arg2 as i32),
            Sys::Fcntl => self.virt_fcntl(arg1 as i32, arg2 as i32, arg3),
            Sys::Ioctl => self.virt_ioctl(arg1 as i32, arg2, arg3),
            Sys::Getpid => Ok(self.virt_getpid()),
            Sys::Gettid => Ok(self.virt_gettid()),
            Sys::Getuid => Ok(self.virt_getuid()),
            Sys::Getgid => Ok(self.virt_getgid()),
            Sys::Setuid => Ok(self.virt_setuid(arg1)),
            // The first argument carries the gid.
            Sys::Setgid => Ok(self.virt_setgid(arg1)),
            Sys::Getgroups => self.virt_getgroups(arg1 as i32, arg2),
            Sys::Kill => Ok(self.virt_kill(arg1 as i32, arg2 as i32)),
            Sys::Execve => self.virt_execve(arg1),
            Sys::GetProcessName => self.virt_get_process_name(arg1, arg2 as i32),
            Sys::SetProcessIcon => Ok(self.virt_set_process_icon(arg1 as i32)),
            Sys::Mmap => self.virt_mmap(arg1),
            Sys::Munmap => self.virt_munmap(arg1, arg2),
            Sys::Mprotect => Ok(self.virt_mprotect(arg1, arg2, arg3 as i32)),
            Sys::Madvise => Ok(self.virt_madvise(arg1, arg2, arg3 as i32)),
            Sys::SetMmapName => Ok(self.virt_set_mmap_name(arg1)),
            Sys::Socket => Ok(self.virt_socket(arg1 as i32, arg2 as i32, arg3 as i32)),
            Sys::Bind => self.virt_bind(arg1 as i32, arg2, arg3),
            Sys::Listen => Ok(self.virt_listen(arg1 as i32, arg2 as i32)),
            Sys::Accept => self.virt_accept(arg1 as i32, arg2, arg3),
            Sys::Connect => self.virt_connect(arg1 as i32, arg2, arg3),
            Sys::Recvfrom => self.virt_recvfrom(arg1),
            Sys::Getsockopt => self.virt_getsockopt(arg1),
            Sys::Setsockopt => self.virt_setsockopt(arg1),
            Sys::Select => self.virt_select(arg1),
            Sys::Gethostname => self.virt_gethostname(arg1, arg2 as i32),
            Sys::Gettimeofday => self.virt_gettimeofday(arg1),
            Sys::ClockGettime => self.virt_clock_gettime(arg1 as i32, arg2),
            Sys::Getrandom => self.virt_getrandom(arg1, arg2, arg3),
            Sys::Usleep => Ok(self.virt_usleep(arg1)),
            Sys::ShbufCreate => self.virt_shbuf_create(arg1 as i32, arg2),
            Sys::ShbufGet => self.virt_shbuf_get(arg1 as i32, arg2),
            Sys::ShbufAllowPid => Ok(self.virt_shbuf_allow_pid(arg1 as i32, arg2 as i32)),
            Sys::ShbufAllowAll => Ok(self.virt_shbuf_allow_all(arg1 as i32)),
            Sys::ShbufRelease => self.virt_shbuf_release(arg1 as i32),
            Sys::ShbufSeal => Ok(self.virt_shbuf_seal(arg1 as i32)),
            Sys::ShbufSetVolatile => Ok(self.virt_shbuf_set_volatile(arg1 as i32, arg2 != 0)),
            Sys::Dbgputstr => self.virt_dbgputstr(arg1, arg2 as i32),
            Sys::Dbgputch => Ok(self.virt_dbgputch(arg1 as u8)),
            Sys::Pledge => Ok(self.virt_pledge(arg1)),
            Sys::Unveil => Ok(self.virt_unveil(arg1)),
        }
    }

    /// Reports a syscall input buffer that carries uninitialised bytes.
    pub(crate) fn flag_tainted_buffer(&self, what: &str) {
        let pid = shadowvm_core::report::pid();
        reportln!(
            "=={}==  \x1b[31;1mSyscall {} buffer contains uninitialized byte(s)\x1b[0m",
            pid,
            what
        );
        self.cpu.dump_backtrace();
        shadowvm_core::report::note_diagnostic();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_round_trip() {
        for number in [
            Sys::Exit,
            Sys::Read,
            Sys::Mmap,
            Sys::ShbufCreate,
            Sys::Unveil,
        ] {
            assert_eq!(Sys::from_u32(number as u32), Some(number));
        }
        assert_eq!(Sys::from_u32(0), None);
        assert_eq!(Sys::from_u32(999), None);
    }
}
