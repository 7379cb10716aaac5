//! Socket syscall handlers.

use super::{host_result, host_struct_bytes, neg_errno, GuestSlice, StructReader};
use crate::emulator::Emulator;
use crate::EmuError;

impl Emulator {
    pub(crate) fn virt_socket(&self, domain: i32, socket_type: i32, protocol: i32) -> u32 {
        host_result(i64::from(unsafe {
            libc::socket(domain, socket_type, protocol)
        }))
    }

    pub(crate) fn virt_bind(&mut self, sockfd: i32, address: u32, address_length: u32) -> Result<u32, EmuError> {
        let (buffer, _) = self.cpu.mmu().copy_buffer_from_vm(address, address_length)?;
        let rc = unsafe {
            libc::bind(
                sockfd,
                buffer.as_ptr().cast(),
                buffer.len() as libc::socklen_t,
            )
        };
        Ok(host_result(i64::from(rc)))
    }

    pub(crate) fn virt_connect(&mut self, sockfd: i32, address: u32, address_size: u32) -> Result<u32, EmuError> {
        let (buffer, _) = self.cpu.mmu().copy_buffer_from_vm(address, address_size)?;
        let rc = unsafe {
            libc::connect(
                sockfd,
                buffer.as_ptr().cast(),
                buffer.len() as libc::socklen_t,
            )
        };
        Ok(host_result(i64::from(rc)))
    }

    pub(crate) fn virt_listen(&self, fd: i32, backlog: i32) -> u32 {
        host_result(i64::from(unsafe { libc::listen(fd, backlog) }))
    }

    pub(crate) fn virt_accept(&mut self, sockfd: i32, address: u32, address_length: u32) -> Result<u32, EmuError> {
        let mut guest_length = [0u8; 4];
        self.cpu.mmu().copy_from_vm(&mut guest_length, address_length)?;
        let mut host_address_length = u32::from_le_bytes(guest_length) as libc::socklen_t;

        let mut host_buffer = vec![0u8; host_address_length.max(1) as usize];
        let rc = unsafe {
            libc::accept(
                sockfd,
                host_buffer.as_mut_ptr().cast(),
                &mut host_address_length,
            )
        };
        if rc < 0 {
            return Ok(neg_errno());
        }
        let count = (host_buffer.len() as libc::socklen_t).min(host_address_length) as usize;
        self.cpu.mmu_mut().copy_to_vm(address, &host_buffer[..count])?;
        self.cpu
            .mmu_mut()
            .copy_to_vm(address_length, &(host_address_length as u32).to_le_bytes())?;
        Ok(rc as u32)
    }

    pub(crate) fn virt_recvfrom(&mut self, params_addr: u32) -> Result<u32, EmuError> {
        let mut reader = StructReader::new(self.cpu.mmu(), params_addr);
        let sockfd = reader.read_i32()?;
        let buffer = GuestSlice::read(&mut reader)?;
        let flags = reader.read_i32()?;
        let addr = reader.read_u32()?;
        let addr_length_ptr = reader.read_u32()?;

        let mut local = vec![0u8; buffer.len as usize];
        let mut host_address: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

        let mut address_length: libc::socklen_t = 0;
        if addr_length_ptr != 0 {
            let mut raw = [0u8; 4];
            self.cpu.mmu().copy_from_vm(&mut raw, addr_length_ptr)?;
            address_length = u32::from_le_bytes(raw) as libc::socklen_t;
        }

        let rc = unsafe {
            libc::recvfrom(
                sockfd,
                local.as_mut_ptr().cast(),
                local.len(),
                flags,
                if addr != 0 {
                    (&mut host_address as *mut libc::sockaddr_storage).cast()
                } else {
                    std::ptr::null_mut()
                },
                if addr_length_ptr != 0 {
                    &mut address_length as *mut libc::socklen_t
                } else {
                    std::ptr::null_mut()
                },
            )
        };
        if rc < 0 {
            return Ok(neg_errno());
        }

        self.cpu.mmu_mut().copy_to_vm(buffer.ptr, &local[..rc as usize])?;
        if addr != 0 {
            let bytes = host_struct_bytes(&host_address);
            let count = (address_length as usize).min(bytes.len());
            self.cpu.mmu_mut().copy_to_vm(addr, &bytes[..count])?;
        }
        if addr_length_ptr != 0 {
            self.cpu
                .mmu_mut()
                .copy_to_vm(addr_length_ptr, &(address_length as u32).to_le_bytes())?;
        }
        Ok(rc as u32)
    }

    pub(crate) fn virt_getsockopt(&mut self, params_addr: u32) -> Result<u32, EmuError> {
        let mut reader = StructReader::new(self.cpu.mmu(), params_addr);
        let sockfd = reader.read_i32()?;
        let level = reader.read_i32()?;
        let option = reader.read_i32()?;
        let value = reader.read_u32()?;
        let _value_size = reader.read_u32()?;

        if option == libc::SO_PEERCRED {
            #[cfg(target_os = "linux")]
            {
                let mut creds: libc::ucred = unsafe { std::mem::zeroed() };
                let mut creds_size = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
                let rc = unsafe {
                    libc::getsockopt(
                        sockfd,
                        level,
                        libc::SO_PEERCRED,
                        (&mut creds as *mut libc::ucred).cast(),
                        &mut creds_size,
                    )
                };
                if rc < 0 {
                    return Ok(neg_errno());
                }
                self.cpu.mmu_mut().copy_to_vm(value, host_struct_bytes(&creds))?;
                return Ok(rc as u32);
            }
            #[cfg(not(target_os = "linux"))]
            {
                let _ = (sockfd, level, value);
                return Ok((-libc::ENOTSUP) as u32);
            }
        }

        Err(EmuError::unimplemented(
            format!("getsockopt option {option}"),
            self.cpu.base_eip(),
        ))
    }

    pub(crate) fn virt_setsockopt(&mut self, params_addr: u32) -> Result<u32, EmuError> {
        let mut reader = StructReader::new(self.cpu.mmu(), params_addr);
        let sockfd = reader.read_i32()?;
        let level = reader.read_i32()?;
        let option = reader.read_i32()?;
        let value = reader.read_u32()?;
        let value_size = reader.read_u32()?;

        if option == libc::SO_RCVTIMEO {
            let (host_value, _) = self.cpu.mmu().copy_buffer_from_vm(value, value_size)?;
            let rc = unsafe {
                libc::setsockopt(
                    sockfd,
                    level,
                    libc::SO_RCVTIMEO,
                    host_value.as_ptr().cast(),
                    host_value.len() as libc::socklen_t,
                )
            };
            return Ok(host_result(i64::from(rc)));
        }

        Err(EmuError::unimplemented(
            format!("setsockopt option {option}"),
            self.cpu.base_eip(),
        ))
    }

    pub(crate) fn virt_select(&mut self, params_addr: u32) -> Result<u32, EmuError> {
        let mut reader = StructReader::new(self.cpu.mmu(), params_addr);
        let nfds = reader.read_i32()?;
        let readfds_ptr = reader.read_u32()?;
        let writefds_ptr = reader.read_u32()?;
        let exceptfds_ptr = reader.read_u32()?;
        let timeout_ptr = reader.read_u32()?;
        let sigmask_ptr = reader.read_u32()?;

        let mut readfds: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut writefds: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut exceptfds: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut timeout: libc::timespec = unsafe { std::mem::zeroed() };

        let fd_set_size = std::mem::size_of::<libc::fd_set>();
        let copy_in = |emulator: &Emulator, ptr: u32, target: &mut libc::fd_set| -> Result<(), EmuError> {
            if ptr != 0 {
                let mut raw = vec![0u8; fd_set_size];
                emulator.cpu.mmu().copy_from_vm(&mut raw, ptr)?;
                // Safe: fd_set is plain data of exactly fd_set_size bytes.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        raw.as_ptr(),
                        (target as *mut libc::fd_set).cast(),
                        fd_set_size,
                    );
                }
            }
            Ok(())
        };
        copy_in(self, readfds_ptr, &mut readfds)?;
        copy_in(self, writefds_ptr, &mut writefds)?;
        copy_in(self, exceptfds_ptr, &mut exceptfds)?;

        if timeout_ptr != 0 {
            let mut raw = [0u8; 8];
            self.cpu.mmu().copy_from_vm(&mut raw, timeout_ptr)?;
            timeout.tv_sec = libc::time_t::from(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));
            timeout.tv_nsec =
                i32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as libc::c_long;
        }

        let mut sigmask: libc::sigset_t = unsafe { std::mem::zeroed() };
        if sigmask_ptr != 0 {
            let mut raw = [0u8; 4];
            self.cpu.mmu().copy_from_vm(&mut raw, sigmask_ptr)?;
            let guest_mask = u32::from_le_bytes(raw);
            unsafe {
                libc::sigemptyset(&mut sigmask);
                for signal in 1..32 {
                    if guest_mask & (1 << (signal - 1)) != 0 {
                        libc::sigaddset(&mut sigmask, signal);
                    }
                }
            }
        }

        let rc = unsafe {
            libc::pselect(
                nfds,
                if readfds_ptr != 0 {
                    &mut readfds as *mut libc::fd_set
                } else {
                    std::ptr::null_mut()
                },
                if writefds_ptr != 0 {
                    &mut writefds as *mut libc::fd_set
                } else {
                    std::ptr::null_mut()
                },
                if exceptfds_ptr != 0 {
                    &mut exceptfds as *mut libc::fd_set
                } else {
                    std::ptr::null_mut()
                },
                if timeout_ptr != 0 {
                    &timeout as *const libc::timespec
                } else {
                    std::ptr::null()
                },
                if sigmask_ptr != 0 {
                    &sigmask as *const libc::sigset_t
                } else {
                    std::ptr::null()
                },
            )
        };
        if rc < 0 {
            return Ok(neg_errno());
        }

        if readfds_ptr != 0 {
            self.cpu
                .mmu_mut()
                .copy_to_vm(readfds_ptr, host_struct_bytes(&readfds))?;
        }
        if writefds_ptr != 0 {
            self.cpu
                .mmu_mut()
                .copy_to_vm(writefds_ptr, host_struct_bytes(&writefds))?;
        }
        if exceptfds_ptr != 0 {
            self.cpu
                .mmu_mut()
                .copy_to_vm(exceptfds_ptr, host_struct_bytes(&exceptfds))?;
        }
        if timeout_ptr != 0 {
            let mut raw = [0u8; 8];
            raw[..4].copy_from_slice(&(timeout.tv_sec as i32).to_le_bytes());
            raw[4..].copy_from_slice(&(timeout.tv_nsec as i32).to_le_bytes());
            self.cpu.mmu_mut().copy_to_vm(timeout_ptr, &raw)?;
        }
        Ok(rc as u32)
    }

    pub(crate) fn virt_gethostname(&mut self, buffer: u32, buffer_size: i32) -> Result<u32, EmuError> {
        if buffer_size < 0 {
            return Ok((-libc::EINVAL) as u32);
        }
        let mut host_buffer = vec![0u8; buffer_size as usize];
        let rc = unsafe { libc::gethostname(host_buffer.as_mut_ptr().cast(), host_buffer.len()) };
        if rc < 0 {
            return Ok(neg_errno());
        }
        self.cpu.mmu_mut().copy_to_vm(buffer, &host_buffer)?;
        Ok(rc as u32)
    }
}
