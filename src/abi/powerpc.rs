//! 32- and 64-bit PowerPC kernels.
//!
//! PowerPC does not use the negative-errno convention. A failed syscall sets the
//! summary-overflow bit of `cr0` in the condition register, and `r3` holds the positive
//! errno.

use super::{check_index, Abi, Arch, Backend, Bitness, Retval, Target};
use crate::error::{Error, Result, ResultExt};

/// Word indices into `struct pt_regs`.
mod regs {
    pub const R0: u64 = 0;
    pub const R3: u64 = 3;
    pub const ORIG_GPR3: u64 = 34;
    pub const CCR: u64 = 38;
}

/// Summary-overflow bit of `cr0`.
pub(crate) const SO_MASK: u64 = 0x1000_0000;

#[derive(Clone, Copy, Debug)]
pub struct PowerPc {
    bitness: Bitness,
}

impl PowerPc {
    pub fn new(bitness: Bitness) -> Self {
        Self { bitness }
    }

    fn abi(&self) -> Abi {
        match self.bitness {
            Bitness::Bits32 => Abi::PowerPc32,
            Bitness::Bits64 => Abi::PowerPc64,
        }
    }

    fn check_abi(&self, abi: Abi) -> Result<()> {
        if abi != self.abi() {
            return Err(Error::ForeignAbi { arch: Arch::PowerPc, abi });
        }

        Ok(())
    }

    fn offset(&self, index: u64) -> u64 {
        self.bitness.word_size() as u64 * index
    }

    // The first argument is clobbered by the return value, so the kernel preserves it
    // in `orig_gpr3`.
    fn arg_offset(&self, index: usize) -> u64 {
        if index == 0 {
            self.offset(regs::ORIG_GPR3)
        } else {
            self.offset(regs::R3 + index as u64)
        }
    }
}

impl Backend for PowerPc {
    fn arch(&self) -> Arch {
        Arch::PowerPc
    }

    fn detect_abi(&self, _target: &dyn Target) -> Result<Abi> {
        Ok(self.abi())
    }

    fn syscall_number(&self, target: &dyn Target, abi: Abi) -> Result<u64> {
        self.check_abi(abi)?;

        let nr = target.read_user(self.offset(regs::R0)).died_if_esrch(target.pid())?;

        Ok(self.bitness.truncate(nr))
    }

    fn set_syscall_number(&self, target: &mut dyn Target, abi: Abi, nr: u64) -> Result<()> {
        self.check_abi(abi)?;

        let pid = target.pid();
        target
            .write_user(self.offset(regs::R0), self.bitness.truncate(nr))
            .died_if_esrch(pid)
    }

    fn argument(&self, target: &dyn Target, abi: Abi, index: usize) -> Result<u64> {
        self.check_abi(abi)?;
        check_index(index)?;

        let value = target.read_user(self.arg_offset(index)).died_if_esrch(target.pid())?;

        Ok(self.bitness.truncate(value))
    }

    fn set_argument(&self, target: &mut dyn Target, abi: Abi, index: usize, value: u64) -> Result<()> {
        self.check_abi(abi)?;
        check_index(index)?;

        let pid = target.pid();
        target
            .write_user(self.arg_offset(index), self.bitness.truncate(value))
            .died_if_esrch(pid)
    }

    fn return_value(&self, target: &dyn Target, abi: Abi) -> Result<Retval> {
        self.check_abi(abi)?;

        let pid = target.pid();
        let r3 = target.read_user(self.offset(regs::R3)).died_if_esrch(pid)?;
        let ccr = target.read_user(self.offset(regs::CCR)).died_if_esrch(pid)?;

        if ccr & SO_MASK != 0 {
            Ok(Retval::Error(r3 as i32))
        } else {
            Ok(Retval::Value(self.bitness.sign_extend(r3)))
        }
    }

    fn set_return_value(&self, target: &mut dyn Target, abi: Abi, retval: Retval) -> Result<()> {
        self.check_abi(abi)?;

        let pid = target.pid();
        let ccr = target.read_user(self.offset(regs::CCR)).died_if_esrch(pid)?;

        let (r3, ccr) = match retval {
            Retval::Value(value) => {
                if self.bitness.sign_extend(value as u64) != value {
                    return Err(Error::ReturnValue { value });
                }

                (self.bitness.truncate(value as u64), ccr & !SO_MASK)
            },
            Retval::Error(errno) => {
                if errno <= 0 {
                    return Err(Error::ReturnValue { value: -i64::from(errno) });
                }

                (errno as u64, ccr | SO_MASK)
            },
        };

        let writes = [
            (self.offset(regs::R3), r3),
            (self.offset(regs::CCR), ccr),
        ];

        target.write_user_many(&writes).died_if_esrch(pid)
    }
}
