//! 32-bit ARM kernels (EABI, with OABI trap decoding).
//!
//! In ARM mode the syscall number may be encoded in the `swi` immediate, so it is
//! decoded from the trapping instruction. In Thumb mode it is always in `r7`.

use super::{check_index, decode_negated, encode_negated, memory, Abi, Arch, Backend, Bitness, Retval, Target};
use crate::error::{Error, Result, ResultExt};

/// Byte offsets into `struct pt_regs`.
pub(crate) mod regs {
    pub const R0: u64 = 0;
    pub const R7: u64 = 4 * 7;
    pub const PC: u64 = 4 * 15;
    pub const CPSR: u64 = 4 * 16;
}

/// Thumb state bit of `cpsr`.
pub(crate) const PSR_T_BIT: u64 = 0x20;

/// `swi 0`: an EABI syscall, numbered by `r7`.
pub(crate) const EABI_TRAP: u64 = 0xef00_0000;

/// OABI `swi` instructions carry the syscall number in their immediate.
const OABI_TRAP_MASK: u64 = 0x0ff0_0000;
const OABI_TRAP: u64 = 0x0f90_0000;
const OABI_NR_MASK: u64 = 0x000f_ffff;

/// ARM-private syscalls, numbered from `0x0f0000`.
const ARM_PRIVATE: u64 = 0x0f_0000;

#[derive(Clone, Copy, Debug, Default)]
pub struct Arm;

fn check_abi(abi: Abi) -> Result<()> {
    match abi {
        Abi::Arm => Ok(()),
        abi => Err(Error::ForeignAbi { arch: Arch::Arm, abi }),
    }
}

/// Decode the syscall number from a trapping ARM-mode instruction.
fn decode_trap(insn: u64, r7: u64) -> Result<u64> {
    let insn = Bitness::Bits32.truncate(insn);

    let nr = if insn == 0 {
        0
    } else if insn == EABI_TRAP {
        r7
    } else if insn & OABI_TRAP_MASK == OABI_TRAP {
        insn & OABI_NR_MASK
    } else {
        return Err(Error::TrapDecode { insn });
    };

    Ok(nr)
}

impl Backend for Arm {
    fn arch(&self) -> Arch {
        Arch::Arm
    }

    fn detect_abi(&self, _target: &dyn Target) -> Result<Abi> {
        Ok(Abi::Arm)
    }

    fn syscall_number(&self, target: &dyn Target, abi: Abi) -> Result<u64> {
        check_abi(abi)?;

        let pid = target.pid();
        let cpsr = target.read_user(regs::CPSR).died_if_esrch(pid)?;
        let r7 = target.read_user(regs::R7).died_if_esrch(pid)?;

        let mut nr = if cpsr & PSR_T_BIT != 0 {
            r7
        } else {
            let pc = target.read_user(regs::PC).died_if_esrch(pid)?;
            let insn = memory::read_word(target, abi, pc.wrapping_sub(4))?;

            decode_trap(insn, r7)?
        };

        if nr & ARM_PRIVATE != 0 {
            nr &= 0xffff;
        }

        Ok(Bitness::Bits32.truncate(nr))
    }

    fn set_syscall_number(&self, target: &mut dyn Target, abi: Abi, nr: u64) -> Result<()> {
        check_abi(abi)?;

        let pid = target.pid();
        target.write_syscall_register(nr & 0xffff).died_if_esrch(pid)
    }

    fn argument(&self, target: &dyn Target, abi: Abi, index: usize) -> Result<u64> {
        check_abi(abi)?;
        check_index(index)?;

        let offset = regs::R0 + 4 * index as u64;
        let value = target.read_user(offset).died_if_esrch(target.pid())?;

        Ok(Bitness::Bits32.truncate(value))
    }

    fn set_argument(&self, target: &mut dyn Target, abi: Abi, index: usize, value: u64) -> Result<()> {
        check_abi(abi)?;
        check_index(index)?;

        // `r5` is not writable at syscall-stops through the user area.
        if index == 5 {
            return Err(Error::Unsupported { arch: Arch::Arm, op: "set_argument(5)" });
        }

        let offset = regs::R0 + 4 * index as u64;

        let pid = target.pid();
        target.write_user(offset, Bitness::Bits32.truncate(value)).died_if_esrch(pid)
    }

    fn return_value(&self, target: &dyn Target, abi: Abi) -> Result<Retval> {
        check_abi(abi)?;

        let r0 = target.read_user(regs::R0).died_if_esrch(target.pid())?;

        Ok(decode_negated(r0, Bitness::Bits32))
    }

    fn set_return_value(&self, target: &mut dyn Target, abi: Abi, retval: Retval) -> Result<()> {
        check_abi(abi)?;

        let r0 = encode_negated(retval, Bitness::Bits32)?;

        let pid = target.pid();
        target.write_user(regs::R0, r0).died_if_esrch(pid)
    }
}
