//! x86-64 kernels, which execute the x86-64, x32, and i386 (compat) ABIs.

use super::{check_index, decode_negated, encode_negated, Abi, Arch, Backend, Retval, Target};
use crate::error::{Error, Result, ResultExt};

/// Byte offsets into `struct user_regs_struct`.
pub(crate) mod regs {
    pub const RBP: u64 = 8 * 4;
    pub const RBX: u64 = 8 * 5;
    pub const R10: u64 = 8 * 7;
    pub const R9: u64 = 8 * 8;
    pub const R8: u64 = 8 * 9;
    pub const RAX: u64 = 8 * 10;
    pub const RCX: u64 = 8 * 11;
    pub const RDX: u64 = 8 * 12;
    pub const RSI: u64 = 8 * 13;
    pub const RDI: u64 = 8 * 14;
    pub const ORIG_RAX: u64 = 8 * 15;
    pub const CS: u64 = 8 * 17;
}

/// Code segment selector of 64-bit user code.
const USER_CS_64: u64 = 0x33;

/// Code segment selector of 32-bit (compat) user code.
const USER_CS_32: u64 = 0x23;

/// Set in the syscall number of x32 syscalls.
pub(crate) const X32_SYSCALL_BIT: u64 = 0x4000_0000;

const X86_64_ARGS: [u64; 6] = [regs::RDI, regs::RSI, regs::RDX, regs::R10, regs::R8, regs::R9];
const I386_ARGS: [u64; 6] = [regs::RBX, regs::RCX, regs::RDX, regs::RSI, regs::RDI, regs::RBP];

#[derive(Clone, Copy, Debug, Default)]
pub struct X86_64;

impl X86_64 {
    fn arg_offset(&self, abi: Abi, index: usize) -> Result<u64> {
        check_index(index)?;

        match abi {
            Abi::X86_64 | Abi::X32 => Ok(X86_64_ARGS[index]),
            Abi::I386 => Ok(I386_ARGS[index]),
            abi => Err(Error::ForeignAbi { arch: Arch::X86_64, abi }),
        }
    }
}

impl Backend for X86_64 {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn detect_abi(&self, target: &dyn Target) -> Result<Abi> {
        let pid = target.pid();
        let cs = target.read_user(regs::CS).died_if_esrch(pid)?;

        match cs {
            USER_CS_64 => {
                // Only meaningful in a syscall; `orig_rax` is -1 at other stops.
                let orig_rax = target.read_user(regs::ORIG_RAX).died_if_esrch(pid)?;

                if (orig_rax as i64) >= 0 && orig_rax & X32_SYSCALL_BIT != 0 {
                    Ok(Abi::X32)
                } else {
                    Ok(Abi::X86_64)
                }
            },
            USER_CS_32 => Ok(Abi::I386),
            _ => Err(Error::UnknownAbi { pid }),
        }
    }

    fn syscall_number(&self, target: &dyn Target, abi: Abi) -> Result<u64> {
        let nr = target.read_user(regs::ORIG_RAX).died_if_esrch(target.pid())?;

        match abi {
            Abi::X86_64 => Ok(nr),
            Abi::X32 => Ok(nr & !X32_SYSCALL_BIT),
            Abi::I386 => Ok(nr & u64::from(u32::MAX)),
            abi => Err(Error::ForeignAbi { arch: Arch::X86_64, abi }),
        }
    }

    fn set_syscall_number(&self, target: &mut dyn Target, abi: Abi, nr: u64) -> Result<()> {
        let nr = match abi {
            Abi::X86_64 => nr,
            Abi::X32 => nr | X32_SYSCALL_BIT,
            Abi::I386 => nr & u64::from(u32::MAX),
            abi => return Err(Error::ForeignAbi { arch: Arch::X86_64, abi }),
        };

        let pid = target.pid();
        target.write_user(regs::ORIG_RAX, nr).died_if_esrch(pid)
    }

    fn argument(&self, target: &dyn Target, abi: Abi, index: usize) -> Result<u64> {
        let offset = self.arg_offset(abi, index)?;
        let value = target.read_user(offset).died_if_esrch(target.pid())?;

        Ok(abi.register_width().truncate(value))
    }

    fn set_argument(&self, target: &mut dyn Target, abi: Abi, index: usize, value: u64) -> Result<()> {
        let offset = self.arg_offset(abi, index)?;
        let value = abi.register_width().truncate(value);

        let pid = target.pid();
        target.write_user(offset, value).died_if_esrch(pid)
    }

    fn return_value(&self, target: &dyn Target, abi: Abi) -> Result<Retval> {
        if !matches!(abi, Abi::X86_64 | Abi::X32 | Abi::I386) {
            return Err(Error::ForeignAbi { arch: Arch::X86_64, abi });
        }

        let rax = target.read_user(regs::RAX).died_if_esrch(target.pid())?;

        Ok(decode_negated(rax, abi.register_width()))
    }

    fn set_return_value(&self, target: &mut dyn Target, abi: Abi, retval: Retval) -> Result<()> {
        if !matches!(abi, Abi::X86_64 | Abi::X32 | Abi::I386) {
            return Err(Error::ForeignAbi { arch: Arch::X86_64, abi });
        }

        let rax = encode_negated(retval, abi.register_width())?;

        // A compat tracee sees `eax`; sign-extend so `rax` agrees with it.
        let rax = abi.register_width().sign_extend(rax) as u64;

        let pid = target.pid();
        target.write_user(regs::RAX, rax).died_if_esrch(pid)
    }
}
