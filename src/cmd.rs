//! Forking a child that runs a closure under tracing.

use std::panic::{self, AssertUnwindSafe};

use nix::{
    sys::{ptrace, signal::{kill, Signal}},
    unistd::{fork, getpid, ForkResult, Pid},
};

use crate::error::{Error, Result};
use crate::ptracer::SETUP_FAILURE;

/// Fork a child process to run `f` as a tracee.
///
/// The child sets itself as a tracee of the parent, then stops itself with `SIGSTOP` so
/// the parent can set options and resume it without a race. It exits with the value
/// returned by `f`, without running exit handlers.
///
/// # Safety
///
/// As for [`nix::unistd::fork()`]: in a multi-threaded parent, the child may only perform
/// async-signal-safe operations, and that includes everything `f` does.
pub(crate) unsafe fn fork_traced<F>(f: F) -> Result<Pid>
where
    F: FnOnce() -> i32,
{
    match fork().map_err(|source| Error::Fork { source })? {
        ForkResult::Child => {
            // Never return into the caller's stack from here: `?` and unwinding would run
            // the parent's code in the child.
            if ptrace::traceme().is_err() {
                libc::_exit(SETUP_FAILURE);
            }

            // `raise()` may mask signals around the `kill`, which the tracer would then
            // observe as syscalls.
            if kill(getpid(), Signal::SIGSTOP).is_err() {
                libc::_exit(SETUP_FAILURE);
            }

            let code = panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or(libc::EXIT_FAILURE);

            libc::_exit(code)
        },
        ForkResult::Parent { child } => Ok(child),
    }
}
