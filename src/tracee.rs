//! Register and memory access to a stopped tracee, over ptrace.

use std::fs;
use std::marker::PhantomData;

use nix::errno::Errno;
use nix::sys::ptrace;

use crate::abi::Target;
use crate::error::{Result, ResultExt};
use crate::ptracer::{Pid, Siginfo};

/// Linux constant defined in `include/uapi/linux/elf.h`.
#[cfg(target_arch = "aarch64")]
const NT_PRSTATUS: libc::c_int = 0x1;

/// Defined in `include/uapi/linux/elf.h`.
#[cfg(target_arch = "aarch64")]
const NT_ARM_SYSTEM_CALL: libc::c_int = 0x404;

/// Defined in `arch/arm/include/uapi/asm/ptrace.h`.
#[cfg(target_arch = "arm")]
const PTRACE_SET_SYSCALL: libc::c_int = 23;

/// Defined in [`arch/arm64/include/uapi/asm/ptrace.h`](https://android.googlesource.com/kernel/common/+/refs/heads/android-mainline/arch/arm64/include/uapi/asm/ptrace.h#88).
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct user_pt_regs {
    regs: [u64; 31],
    sp: u64,
    pc: u64,
    pstate: u64,
}

#[cfg(target_arch = "aarch64")]
impl user_pt_regs {
    const WORDS: usize = 34;

    fn word(&self, index: usize) -> Option<u64> {
        match index {
            0..=30 => Some(self.regs[index]),
            31 => Some(self.sp),
            32 => Some(self.pc),
            33 => Some(self.pstate),
            _ => None,
        }
    }

    fn word_mut(&mut self, index: usize) -> Option<&mut u64> {
        match index {
            0..=30 => Some(&mut self.regs[index]),
            31 => Some(&mut self.sp),
            32 => Some(&mut self.pc),
            33 => Some(&mut self.pstate),
            _ => None,
        }
    }
}

/// A stopped tracee thread, addressed by its TID.
///
/// **Warning:** the underlying tracee is not guaranteed to exist, and operations on it
/// fail with `ESRCH` if it has died since it was last seen stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tracee {
    pid: Pid,

    #[doc(hidden)]
    _not_send: PhantomData<*const ()>,
}

impl Tracee {
    pub fn new(pid: Pid) -> Self {
        let _not_send = PhantomData;

        Self { pid, _not_send }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn siginfo(&self) -> Result<Siginfo> {
        ptrace::getsiginfo(self.pid).died_if_esrch(self.pid)
    }

    fn proc_mem_path(&self) -> String {
        let tid = self.pid.as_raw() as u32;
        format!("/proc/{}/mem", tid)
    }

    #[cfg(not(target_arch = "aarch64"))]
    fn peek_user(&self, off: u64) -> nix::Result<u64> {
        // SAFETY: `off` is not used as a pointer by the kernel, only as an offset into the
        // tracee's saved register file, which it bounds-checks.
        let data = unsafe {
            Errno::clear();
            libc::ptrace(
                libc::PTRACE_PEEKUSER,
                self.pid.as_raw(),
                off as *mut libc::c_void,
                std::ptr::null_mut::<libc::c_void>(),
            )
        };

        peek_result(data)
    }

    #[cfg(not(target_arch = "aarch64"))]
    fn poke_user(&self, off: u64, data: u64) -> nix::Result<()> {
        // SAFETY: as for `peek_user()`.
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEUSER,
                self.pid.as_raw(),
                off as *mut libc::c_void,
                data as *mut libc::c_void,
            )
        };

        Errno::result(res).map(drop)
    }

    #[cfg(target_arch = "aarch64")]
    fn get_regset(&self) -> nix::Result<user_pt_regs> {
        let mut data = user_pt_regs::default();
        let mut rv = libc::iovec {
            iov_base: &mut data as *mut _ as *mut libc::c_void,
            iov_len: std::mem::size_of::<user_pt_regs>(),
        };

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                self.pid.as_raw(),
                NT_PRSTATUS,
                &mut rv as *mut _ as *mut libc::c_void,
            )
        };

        Errno::result(res)?;

        Ok(data)
    }

    #[cfg(target_arch = "aarch64")]
    fn set_regset(&self, mut regs: user_pt_regs) -> nix::Result<()> {
        let mut rv = libc::iovec {
            iov_base: &mut regs as *mut _ as *mut libc::c_void,
            iov_len: std::mem::size_of::<user_pt_regs>(),
        };

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                self.pid.as_raw(),
                NT_PRSTATUS,
                &mut rv as *mut _ as *mut libc::c_void,
            )
        };

        Errno::result(res).map(drop)
    }
}

impl Target for Tracee {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn word_size(&self) -> usize {
        std::mem::size_of::<libc::c_long>()
    }

    #[cfg(not(target_arch = "aarch64"))]
    fn read_user(&self, offset: u64) -> nix::Result<u64> {
        self.peek_user(offset)
    }

    #[cfg(not(target_arch = "aarch64"))]
    fn write_user(&mut self, offset: u64, value: u64) -> nix::Result<()> {
        self.poke_user(offset, value)
    }

    #[cfg(target_arch = "aarch64")]
    fn read_user(&self, offset: u64) -> nix::Result<u64> {
        let regs = self.get_regset()?;
        regs.word(offset as usize / 8).ok_or(Errno::EIO)
    }

    #[cfg(target_arch = "aarch64")]
    fn write_user(&mut self, offset: u64, value: u64) -> nix::Result<()> {
        self.write_user_many(&[(offset, value)])
    }

    // One `GETREGSET`/`SETREGSET` pair for the whole update.
    #[cfg(target_arch = "aarch64")]
    fn write_user_many(&mut self, writes: &[(u64, u64)]) -> nix::Result<()> {
        let mut regs = self.get_regset()?;

        for &(offset, value) in writes {
            let index = offset as usize / 8;

            if index >= user_pt_regs::WORDS {
                return Err(Errno::EIO);
            }

            if let Some(word) = regs.word_mut(index) {
                *word = value;
            }
        }

        self.set_regset(regs)
    }

    fn read_word(&self, addr: u64) -> nix::Result<u64> {
        let data = unsafe {
            Errno::clear();
            libc::ptrace(
                libc::PTRACE_PEEKDATA,
                self.pid.as_raw(),
                addr as *mut libc::c_void,
                std::ptr::null_mut::<libc::c_void>(),
            )
        };

        peek_result(data)
    }

    fn write_word(&mut self, addr: u64, value: u64) -> nix::Result<()> {
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEDATA,
                self.pid.as_raw(),
                addr as *mut libc::c_void,
                value as *mut libc::c_void,
            )
        };

        Errno::result(res).map(drop)
    }

    fn read_bulk(&self, addr: u64, buf: &mut [u8]) -> nix::Result<usize> {
        use std::os::unix::fs::FileExt;

        let mem = fs::File::open(self.proc_mem_path()).map_err(io_errno)?;
        let len = mem.read_at(buf, addr).map_err(io_errno)?;

        if len == 0 {
            return Err(Errno::EIO);
        }

        Ok(len)
    }

    fn write_bulk(&mut self, addr: u64, data: &[u8]) -> nix::Result<usize> {
        use std::os::unix::fs::FileExt;

        let mem = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.proc_mem_path())
            .map_err(io_errno)?;

        let len = mem.write_at(data, addr).map_err(io_errno)?;

        if len == 0 {
            return Err(Errno::EIO);
        }

        Ok(len)
    }

    #[cfg(target_arch = "arm")]
    fn write_syscall_register(&mut self, nr: u64) -> nix::Result<()> {
        let res = unsafe {
            libc::ptrace(
                PTRACE_SET_SYSCALL as _,
                self.pid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                nr as *mut libc::c_void,
            )
        };

        Errno::result(res).map(drop)
    }

    #[cfg(target_arch = "aarch64")]
    fn write_syscall_register(&mut self, nr: u64) -> nix::Result<()> {
        let mut nr = nr as libc::c_int;
        let mut rv = libc::iovec {
            iov_base: &mut nr as *mut _ as *mut libc::c_void,
            iov_len: std::mem::size_of::<libc::c_int>(),
        };

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                self.pid.as_raw(),
                NT_ARM_SYSTEM_CALL,
                &mut rv as *mut _ as *mut libc::c_void,
            )
        };

        Errno::result(res).map(drop)
    }
}

// `PEEK*` requests return data in-band, so a `-1` result is only an error if `errno` was
// set by the call.
fn peek_result(data: libc::c_long) -> nix::Result<u64> {
    if data == -1 {
        let errno = Errno::last();

        if errno as i32 != 0 {
            return Err(errno);
        }
    }

    Ok(data as u64)
}

fn io_errno(err: std::io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}
