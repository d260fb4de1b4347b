//! 64-bit ARM kernels.
//!
//! The register file is only reachable as the `NT_PRSTATUS` regset, laid out as
//! `struct user_pt_regs`. Offsets below index into that struct.

use super::{check_index, decode_negated, encode_negated, Abi, Arch, Backend, Bitness, Retval, Target};
use crate::error::{Error, Result, ResultExt};

/// Byte offsets into `struct user_pt_regs`.
pub(crate) mod regs {
    pub const X0: u64 = 0;
    pub const X8: u64 = 8 * 8;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Aarch64;

fn check_abi(abi: Abi) -> Result<()> {
    match abi {
        Abi::Aarch64 => Ok(()),
        abi => Err(Error::ForeignAbi { arch: Arch::Aarch64, abi }),
    }
}

impl Backend for Aarch64 {
    fn arch(&self) -> Arch {
        Arch::Aarch64
    }

    fn detect_abi(&self, _target: &dyn Target) -> Result<Abi> {
        Ok(Abi::Aarch64)
    }

    fn syscall_number(&self, target: &dyn Target, abi: Abi) -> Result<u64> {
        check_abi(abi)?;

        target.read_user(regs::X8).died_if_esrch(target.pid())
    }

    fn set_syscall_number(&self, target: &mut dyn Target, abi: Abi, nr: u64) -> Result<()> {
        check_abi(abi)?;

        // Writing `x8` has no effect once the kernel has latched the syscall number.
        let pid = target.pid();
        target.write_syscall_register(nr).died_if_esrch(pid)?;
        target.write_user(regs::X8, nr).died_if_esrch(pid)
    }

    fn argument(&self, target: &dyn Target, abi: Abi, index: usize) -> Result<u64> {
        check_abi(abi)?;
        check_index(index)?;

        target.read_user(regs::X0 + 8 * index as u64).died_if_esrch(target.pid())
    }

    fn set_argument(&self, target: &mut dyn Target, abi: Abi, index: usize, value: u64) -> Result<()> {
        check_abi(abi)?;
        check_index(index)?;

        let pid = target.pid();
        target.write_user(regs::X0 + 8 * index as u64, value).died_if_esrch(pid)
    }

    fn return_value(&self, target: &dyn Target, abi: Abi) -> Result<Retval> {
        check_abi(abi)?;

        let x0 = target.read_user(regs::X0).died_if_esrch(target.pid())?;

        Ok(decode_negated(x0, Bitness::Bits64))
    }

    fn set_return_value(&self, target: &mut dyn Target, abi: Abi, retval: Retval) -> Result<()> {
        check_abi(abi)?;

        let x0 = encode_negated(retval, Bitness::Bits64)?;

        let pid = target.pid();
        target.write_user(regs::X0, x0).died_if_esrch(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::testing::FakeTarget;
    use crate::abi::MAX_ERRNO;

    #[test]
    fn test_syscall_number() {
        let mut target = FakeTarget::new(8);
        target.set_user(regs::X8, 56);

        assert_eq!(Aarch64.syscall_number(&target, Abi::Aarch64).unwrap(), 56);

        Aarch64.set_syscall_number(&mut target, Abi::Aarch64, 172).unwrap();

        assert_eq!(target.syscall_register, Some(172));
        assert_eq!(Aarch64.syscall_number(&target, Abi::Aarch64).unwrap(), 172);
    }

    #[test]
    fn test_argument_round_trip() {
        let mut target = FakeTarget::new(8);

        for index in 0..Aarch64.max_args() {
            for value in [0, u64::MAX, 0x0000_ffff_0000_ffff] {
                Aarch64.set_argument(&mut target, Abi::Aarch64, index, value).unwrap();
                assert_eq!(Aarch64.argument(&target, Abi::Aarch64, index).unwrap(), value);
            }
        }

        assert!(matches!(
            Aarch64.argument(&target, Abi::Aarch64, 6),
            Err(Error::ArgumentIndex { .. }),
        ));
        assert!(matches!(
            Aarch64.set_argument(&mut target, Abi::Aarch64, 6, 0),
            Err(Error::ArgumentIndex { .. }),
        ));
    }

    #[test]
    fn test_return_round_trip() {
        let cases = [
            Retval::Value(0),
            Retval::Value(i64::MIN),
            Retval::Value(-MAX_ERRNO - 1),
            Retval::Error(1),
            Retval::Error(MAX_ERRNO as i32),
        ];

        for retval in cases {
            let mut target = FakeTarget::new(8);

            Aarch64.set_return_value(&mut target, Abi::Aarch64, retval).unwrap();
            assert_eq!(Aarch64.return_value(&target, Abi::Aarch64).unwrap(), retval);
        }
    }
}
