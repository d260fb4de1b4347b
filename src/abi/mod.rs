//! Per-architecture syscall linkage.
//!
//! A [`Backend`] knows where a stopped tracee keeps its syscall number, arguments, and
//! return value, for each ABI the architecture can execute. Backends never issue ptrace
//! requests themselves: they go through a [`Target`], which is implemented over ptrace by
//! [`Tracee`](crate::tracee::Tracee).

use std::fmt;

use nix::errno::Errno;

use crate::error::{Error, Result};
use crate::ptracer::Pid;

pub mod memory;

mod aarch64;
mod arm;
mod powerpc;
mod x86;
mod x86_64;

#[cfg(test)]
pub(crate) mod testing;

pub use aarch64::Aarch64;
pub use arm::Arm;
pub use powerpc::PowerPc;
pub use x86::X86;
pub use x86_64::X86_64;

/// Maximum number of syscall arguments on every supported architecture.
pub const MAX_ARGS: usize = 6;

/// Largest errno the kernel encodes with the negative-errno convention.
pub const MAX_ERRNO: i64 = 4095;

/// CPU architecture of a backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Arch {
    X86_64,
    X86,
    Aarch64,
    Arm,
    PowerPc,
}

/// Pointer width of a tracee.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Bitness {
    Bits32,
    Bits64,
}

impl Bitness {
    pub fn word_size(self) -> usize {
        match self {
            Bitness::Bits32 => 4,
            Bitness::Bits64 => 8,
        }
    }

    /// Truncate `value` to this width.
    pub fn truncate(self, value: u64) -> u64 {
        match self {
            Bitness::Bits32 => value & u64::from(u32::MAX),
            Bitness::Bits64 => value,
        }
    }

    /// Reinterpret the low bits of `value` as a signed word of this width.
    pub fn sign_extend(self, value: u64) -> i64 {
        match self {
            Bitness::Bits32 => value as u32 as i32 as i64,
            Bitness::Bits64 => value as i64,
        }
    }
}

/// Calling convention in effect for a tracee.
///
/// A single architecture may execute more than one ABI, and a tracee may switch ABI
/// across a successful `execve()`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Abi {
    X86_64,
    X32,
    I386,
    Aarch64,
    Arm,
    PowerPc32,
    PowerPc64,
}

impl Abi {
    /// Pointer width of the ABI.
    pub fn bitness(self) -> Bitness {
        use Abi::*;

        match self {
            X86_64 | Aarch64 | PowerPc64 => Bitness::Bits64,
            X32 | I386 | Arm | PowerPc32 => Bitness::Bits32,
        }
    }

    /// Width of the registers which carry syscall arguments and return values.
    ///
    /// This differs from the pointer width for x32, which passes 64-bit registers.
    pub fn register_width(self) -> Bitness {
        match self {
            Abi::X32 => Bitness::Bits64,
            abi => abi.bitness(),
        }
    }

    pub fn name(self) -> &'static str {
        use Abi::*;

        match self {
            X86_64 => "x86_64",
            X32 => "x32",
            I386 => "i386",
            Aarch64 => "aarch64",
            Arm => "arm",
            PowerPc32 => "ppc32",
            PowerPc64 => "ppc64",
        }
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded syscall return value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Retval {
    /// The syscall succeeded with this value.
    Value(i64),

    /// The syscall failed with this (positive) errno.
    Error(i32),
}

impl Retval {
    pub fn is_error(&self) -> bool {
        matches!(self, Retval::Error(_))
    }

    /// Value as returned by the libc wrapper-free syscall: either the value, or the
    /// negated errno.
    pub fn as_raw(&self) -> i64 {
        match *self {
            Retval::Value(value) => value,
            Retval::Error(errno) => -i64::from(errno),
        }
    }

    pub fn errno(&self) -> Option<Errno> {
        match *self {
            Retval::Value(_) => None,
            Retval::Error(errno) => Some(Errno::from_raw(errno)),
        }
    }
}

/// Register and memory access for one stopped tracee.
///
/// Offsets passed to `read_user()` and `write_user()` are byte offsets into the
/// architecture's register file, as laid out in its `struct pt_regs` (or
/// `user_regs_struct`). All methods report raw OS errors.
pub trait Target {
    fn pid(&self) -> Pid;

    /// Size in bytes of the words moved by `read_word()` and `write_word()`.
    fn word_size(&self) -> usize;

    fn read_user(&self, offset: u64) -> nix::Result<u64>;

    fn write_user(&mut self, offset: u64, value: u64) -> nix::Result<()>;

    /// Write several registers as a single update of the register file.
    fn write_user_many(&mut self, writes: &[(u64, u64)]) -> nix::Result<()> {
        for &(offset, value) in writes {
            self.write_user(offset, value)?;
        }

        Ok(())
    }

    fn read_word(&self, addr: u64) -> nix::Result<u64>;

    fn write_word(&mut self, addr: u64, value: u64) -> nix::Result<()>;

    /// Bulk read, returning the count of bytes read. `ENOSYS` if unavailable.
    fn read_bulk(&self, _addr: u64, _buf: &mut [u8]) -> nix::Result<usize> {
        Err(Errno::ENOSYS)
    }

    /// Bulk write, returning the count of bytes written. `ENOSYS` if unavailable.
    fn write_bulk(&mut self, _addr: u64, _data: &[u8]) -> nix::Result<usize> {
        Err(Errno::ENOSYS)
    }

    /// Change the syscall number through a dedicated request, for architectures whose
    /// register file does not expose it.
    fn write_syscall_register(&mut self, _nr: u64) -> nix::Result<()> {
        Err(Errno::ENOSYS)
    }
}

/// Syscall linkage of one CPU architecture.
pub trait Backend: fmt::Debug {
    fn arch(&self) -> Arch;

    fn max_args(&self) -> usize {
        MAX_ARGS
    }

    /// Classify the ABI the tracee is currently executing.
    ///
    /// Must be called again after a successful `execve()`.
    fn detect_abi(&self, target: &dyn Target) -> Result<Abi>;

    fn syscall_number(&self, target: &dyn Target, abi: Abi) -> Result<u64>;

    fn set_syscall_number(&self, target: &mut dyn Target, abi: Abi, nr: u64) -> Result<()>;

    fn argument(&self, target: &dyn Target, abi: Abi, index: usize) -> Result<u64>;

    fn set_argument(&self, target: &mut dyn Target, abi: Abi, index: usize, value: u64) -> Result<()>;

    fn return_value(&self, target: &dyn Target, abi: Abi) -> Result<Retval>;

    fn set_return_value(&self, target: &mut dyn Target, abi: Abi, retval: Retval) -> Result<()>;
}

/// Backend for the architecture this crate was built for.
#[cfg(target_arch = "x86_64")]
pub fn native() -> Box<dyn Backend> {
    Box::new(X86_64)
}

#[cfg(target_arch = "x86")]
pub fn native() -> Box<dyn Backend> {
    Box::new(X86)
}

#[cfg(target_arch = "aarch64")]
pub fn native() -> Box<dyn Backend> {
    Box::new(Aarch64)
}

#[cfg(target_arch = "arm")]
pub fn native() -> Box<dyn Backend> {
    Box::new(Arm)
}

#[cfg(target_arch = "powerpc")]
pub fn native() -> Box<dyn Backend> {
    Box::new(PowerPc::new(Bitness::Bits32))
}

#[cfg(target_arch = "powerpc64")]
pub fn native() -> Box<dyn Backend> {
    Box::new(PowerPc::new(Bitness::Bits64))
}

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm",
    target_arch = "powerpc",
    target_arch = "powerpc64",
)))]
compile_error!("unsupported target architecture");

pub(crate) fn check_index(index: usize) -> Result<()> {
    if index >= MAX_ARGS {
        return Err(Error::ArgumentIndex { index, max: MAX_ARGS });
    }

    Ok(())
}

/// Decode a return register using the negative-errno convention.
pub(crate) fn decode_negated(raw: u64, width: Bitness) -> Retval {
    let value = width.sign_extend(raw);

    if (-MAX_ERRNO..0).contains(&value) {
        Retval::Error(-value as i32)
    } else {
        Retval::Value(value)
    }
}

/// Encode a return register using the negative-errno convention.
///
/// Fails for values which would decode as something else: those outside the register
/// width, and successful values inside the errno range.
pub(crate) fn encode_negated(retval: Retval, width: Bitness) -> Result<u64> {
    match retval {
        Retval::Value(value) => {
            if width.sign_extend(value as u64) != value || (-MAX_ERRNO..0).contains(&value) {
                return Err(Error::ReturnValue { value });
            }

            Ok(width.truncate(value as u64))
        },
        Retval::Error(errno) => {
            let errno = i64::from(errno);

            if !(1..=MAX_ERRNO).contains(&errno) {
                return Err(Error::ReturnValue { value: -errno });
            }

            Ok(width.truncate(-errno as u64))
        },
    }
}
