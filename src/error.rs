use std::io;

use nix::errno::Errno;

use crate::abi::{Abi, Arch};
use crate::ptracer::Pid;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure of a tracing session.
///
/// Errors are `Clone` so a session can keep the last one it saw. Cloned I/O errors keep
/// their OS error code, or else their kind and message.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not spawn tracee")]
    Spawn { source: io::Error },

    #[error("Could not fork tracee")]
    Fork { source: nix::Error },

    #[error("Could not attach to tracee = {pid}")]
    Attach {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Could not set up tracing options for tracee = {pid}")]
    Setup { pid: Pid, source: nix::Error },

    #[error("Could not restart tracee = {pid}")]
    Restart { pid: Pid, source: nix::Error },

    #[error("Could not wait on tracees")]
    Wait { source: nix::Error },

    #[error("Tracee died while we were tracing it, pid = {pid}")]
    TraceeDied { pid: Pid, source: nix::Error },

    #[error("No tracee with pid = {pid}")]
    UnknownTracee { pid: Pid },

    #[error("Tracee = {pid} is not stopped")]
    NotStopped { pid: Pid },

    #[error("Could not determine the ABI of tracee = {pid}")]
    UnknownAbi { pid: Pid },

    #[error("Syscall argument index {index} is out of range (max = {max})")]
    ArgumentIndex { index: usize, max: usize },

    #[error("Memory transfer at 0x{addr:x} failed after {transferred} bytes")]
    Memory {
        addr: u64,
        transferred: usize,
        source: nix::Error,
    },

    #[error("Operation not supported on {arch:?}: {op}")]
    Unsupported { arch: Arch, op: &'static str },

    #[error("ABI {abi:?} is not handled by the {arch:?} backend")]
    ForeignAbi { arch: Arch, abi: Abi },

    #[error("Unrecognized syscall trap instruction 0x{insn:08x}")]
    TrapDecode { insn: u64 },

    #[error("Return value cannot be encoded for this ABI: {value}")]
    ReturnValue { value: i64 },

    #[error("Tracing session aborted by handler")]
    Aborted,

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Return `true` if the error means the tracee no longer exists.
    ///
    /// Such errors race with the tracee's own exit, and are reported on the next wait.
    pub fn tracee_died(&self) -> bool {
        match self {
            Error::TraceeDied { .. } => true,
            Error::Restart { source, .. } => *source == Errno::ESRCH,
            Error::Memory { source, .. } => *source == Errno::ESRCH,
            Error::OS(errno) => *errno == Errno::ESRCH,
            _ => false,
        }
    }
}

// `io::Error` is not `Clone`. OS errors keep their errno, others their kind and message.
fn clone_io(err: &io::Error) -> io::Error {
    match err.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(err.kind(), err.to_string()),
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        use Error::*;

        match self {
            Spawn { source } => Spawn { source: clone_io(source) },
            Fork { source } => Fork { source: *source },
            Attach { pid, source } => Attach { pid: *pid, source: *source },
            Setup { pid, source } => Setup { pid: *pid, source: *source },
            Restart { pid, source } => Restart { pid: *pid, source: *source },
            Wait { source } => Wait { source: *source },
            TraceeDied { pid, source } => TraceeDied { pid: *pid, source: *source },
            UnknownTracee { pid } => UnknownTracee { pid: *pid },
            NotStopped { pid } => NotStopped { pid: *pid },
            UnknownAbi { pid } => UnknownAbi { pid: *pid },
            ArgumentIndex { index, max } => ArgumentIndex { index: *index, max: *max },
            Memory { addr, transferred, source } => Memory {
                addr: *addr,
                transferred: *transferred,
                source: *source,
            },
            Unsupported { arch, op } => Unsupported { arch: *arch, op: *op },
            ForeignAbi { arch, abi } => ForeignAbi { arch: *arch, abi: *abi },
            TrapDecode { insn } => TrapDecode { insn: *insn },
            ReturnValue { value } => ReturnValue { value: *value },
            Aborted => Aborted,
            IO(err) => IO(clone_io(err)),
            OS(errno) => OS(*errno),
            Internal(msg) => Internal(msg.clone()),
        }
    }
}

pub(crate) trait ResultExt<T> {
    /// Convert an `ESRCH` into `Error::TraceeDied`.
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, nix::Error> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|source| {
            if source == Errno::ESRCH {
                Error::TraceeDied { pid, source }
            } else {
                Error::OS(source)
            }
        })
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_keeps_kind() {
        let pid = Pid::from_raw(3);

        let setup = Error::Setup { pid, source: Errno::EINVAL };
        assert!(matches!(setup.clone(), Error::Setup { source: Errno::EINVAL, .. }));

        let spawn = Error::Spawn { source: io::Error::from_raw_os_error(libc::ENOENT) };
        let Error::Spawn { source } = spawn.clone() else {
            panic!("clone changed variant");
        };
        assert_eq!(source.raw_os_error(), Some(libc::ENOENT));

        let io = Error::IO(io::Error::new(io::ErrorKind::InvalidData, "bad status line"));
        let Error::IO(source) = io.clone() else {
            panic!("clone changed variant");
        };
        assert_eq!(source.kind(), io::ErrorKind::InvalidData);
        assert_eq!(source.to_string(), "bad status line");

        assert!(Error::TraceeDied { pid, source: Errno::ESRCH }.clone().tracee_died());
    }
}
