#[macro_use]
pub mod error;

pub mod abi;
mod cmd;
pub mod context;
pub mod ptracer;
pub mod registry;
pub mod tracee;

pub use abi::{Abi, Arch, Backend, Bitness, Retval, Target, MAX_ARGS};
pub use abi::memory::RemoteString;
pub use context::{
    Action,
    ContextError,
    ErrorAction,
    Exit,
    Handler,
    Inspector,
    Session,
    SignalAction,
    SyscallFrame,
    TraceContext,
};
pub use error::Error;
pub use ptracer::{Options, Pid, Ptracer, Siginfo, Signal, Status, Stop};
pub use registry::{ProcessEntry, ProcessFlags, ProcessRegistry};
pub use tracee::Tracee;
