//! 32-bit x86 kernels.

use super::{check_index, decode_negated, encode_negated, Abi, Arch, Backend, Bitness, Retval, Target};
use crate::error::{Error, Result, ResultExt};

/// Byte offsets into the i386 `struct user_regs_struct`.
mod regs {
    pub const EBX: u64 = 0;
    pub const ECX: u64 = 4;
    pub const EDX: u64 = 4 * 2;
    pub const ESI: u64 = 4 * 3;
    pub const EDI: u64 = 4 * 4;
    pub const EBP: u64 = 4 * 5;
    pub const EAX: u64 = 4 * 6;
    pub const ORIG_EAX: u64 = 4 * 11;
}

const ARGS: [u64; 6] = [regs::EBX, regs::ECX, regs::EDX, regs::ESI, regs::EDI, regs::EBP];

#[derive(Clone, Copy, Debug, Default)]
pub struct X86;

fn check_abi(abi: Abi) -> Result<()> {
    match abi {
        Abi::I386 => Ok(()),
        abi => Err(Error::ForeignAbi { arch: Arch::X86, abi }),
    }
}

impl Backend for X86 {
    fn arch(&self) -> Arch {
        Arch::X86
    }

    fn detect_abi(&self, _target: &dyn Target) -> Result<Abi> {
        Ok(Abi::I386)
    }

    fn syscall_number(&self, target: &dyn Target, abi: Abi) -> Result<u64> {
        check_abi(abi)?;

        let nr = target.read_user(regs::ORIG_EAX).died_if_esrch(target.pid())?;

        Ok(Bitness::Bits32.truncate(nr))
    }

    fn set_syscall_number(&self, target: &mut dyn Target, abi: Abi, nr: u64) -> Result<()> {
        check_abi(abi)?;

        let pid = target.pid();
        target.write_user(regs::ORIG_EAX, Bitness::Bits32.truncate(nr)).died_if_esrch(pid)
    }

    fn argument(&self, target: &dyn Target, abi: Abi, index: usize) -> Result<u64> {
        check_abi(abi)?;
        check_index(index)?;

        let value = target.read_user(ARGS[index]).died_if_esrch(target.pid())?;

        Ok(Bitness::Bits32.truncate(value))
    }

    fn set_argument(&self, target: &mut dyn Target, abi: Abi, index: usize, value: u64) -> Result<()> {
        check_abi(abi)?;
        check_index(index)?;

        let pid = target.pid();
        target.write_user(ARGS[index], Bitness::Bits32.truncate(value)).died_if_esrch(pid)
    }

    fn return_value(&self, target: &dyn Target, abi: Abi) -> Result<Retval> {
        check_abi(abi)?;

        let eax = target.read_user(regs::EAX).died_if_esrch(target.pid())?;

        Ok(decode_negated(eax, Bitness::Bits32))
    }

    fn set_return_value(&self, target: &mut dyn Target, abi: Abi, retval: Retval) -> Result<()> {
        check_abi(abi)?;

        let eax = encode_negated(retval, Bitness::Bits32)?;

        let pid = target.pid();
        target.write_user(regs::EAX, eax).died_if_esrch(pid)
    }
}
