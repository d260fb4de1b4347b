//! Trace control for tracee processes, and classification of their `wait(2)` statuses.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        signal,
        wait::{self, WaitPidFlag, WaitStatus},
    },
};
use tracing::{debug, info, trace};

use crate::error::{Error, Result, ResultExt};

pub use nix::unistd::Pid;
pub use nix::sys::ptrace::Options;

/// POSIX signal.
pub use nix::sys::signal::Signal;

/// Extra signal info, such as its cause.
pub type Siginfo = libc::siginfo_t;

/// A _ptrace-stop_, a tracee state in which it is stopped and ready to accept ptrace
/// commands.
///
/// Syscall-stops are not labelled as entry or exit here. The two are indistinguishable to
/// the kernel interface, and the direction is tracked per process by the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stop {
    // signal-delivery-stop
    SignalDelivery { signal: Signal },

    // group-stop
    Group { signal: Signal },

    // syscall-stop
    Syscall,

    // ptrace-event-stops
    Clone { new: Pid },
    Fork { new: Pid },
    Vfork { new: Pid },
    VforkDone { new: Pid },
    Exec { old: Pid },
    Exiting { exit_code: i32 },
    Signaling {
        signal: Signal,
        core_dumped: bool,
    },
    Seccomp { data: u16 },
}

impl Stop {
    /// The new task, if this stop reports one.
    pub fn new_child(&self) -> Option<Pid> {
        match *self {
            Stop::Clone { new } | Stop::Fork { new } | Stop::Vfork { new } => Some(new),
            _ => None,
        }
    }

    /// The signal, if this is a signal-delivery-stop or group-stop.
    pub fn signal(&self) -> Option<Signal> {
        match *self {
            Stop::SignalDelivery { signal } | Stop::Group { signal } => Some(signal),
            _ => None,
        }
    }
}

/// A classified `wait(2)` status of some tracee.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Stopped(Pid, Stop),
    Exited(Pid, i32),
    Signaled {
        pid: Pid,
        signal: Signal,
        core_dumped: bool,
    },
}

impl Status {
    pub fn pid(&self) -> Pid {
        match *self {
            Status::Stopped(pid, _) | Status::Exited(pid, _) => pid,
            Status::Signaled { pid, .. } => pid,
        }
    }
}

/// Default options: follow forks, vforks and clones.
pub const DEFAULT_OPTIONS: Options = REQUIRED_OPTIONS
    .union(Options::PTRACE_O_TRACEFORK)
    .union(Options::PTRACE_O_TRACEVFORK)
    .union(Options::PTRACE_O_TRACECLONE);

/// Options required for syscall-stop and exec tracking.
/// These are:
/// - [`PTRACE_O_TRACESYSGOOD`](Options::PTRACE_O_TRACESYSGOOD)
/// - [`PTRACE_O_TRACEEXEC`](Options::PTRACE_O_TRACEEXEC)
/// - [`PTRACE_O_TRACEEXIT`](Options::PTRACE_O_TRACEEXIT)
pub const REQUIRED_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACESYSGOOD)
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_TRACEEXIT);

/// Options that make the kernel auto-attach new children.
pub const FOLLOW_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACEFORK)
    .union(Options::PTRACE_O_TRACEVFORK)
    .union(Options::PTRACE_O_TRACECLONE);

/// Exit status for a forked tracee whose pre-call setup failed.
pub const SETUP_FAILURE: i32 = 126;

/// Tracer for a set of Linux tasks.
///
/// A `Ptracer` holds no per-tracee state: it issues ptrace requests and classifies wait
/// statuses, and the caller decides what each stop means for its own bookkeeping.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ptracer {
    /// Ptrace options applied to tracees when they are set up.
    options: Options,
}

impl Default for Ptracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Ptracer {
    pub fn new() -> Self {
        let options = DEFAULT_OPTIONS;

        Self { options }
    }

    /// Return the ptrace options applied to tracees on setup.
    pub fn options(&self) -> Options {
        self.options
    }

    /// Set the ptrace options applied to tracees on setup.
    ///
    /// **NOTE:** [`REQUIRED_OPTIONS`] are always set, even if unset in the passed value.
    ///
    /// Tracees already set up keep their options. Auto-attached children inherit the
    /// options of their parent, not these.
    pub fn set_options(&mut self, options: Options) {
        self.options = options | REQUIRED_OPTIONS;
    }

    /// Return `true` if the current options auto-attach new children.
    pub fn follows_forks(&self) -> bool {
        self.options.intersects(FOLLOW_OPTIONS)
    }

    /// Spawn `cmd` for tracing.
    ///
    /// The command will be configured to request `PTRACE_TRACEME` after `fork()` and
    /// pre-`exec()`. Its first stop is the `SIGTRAP` raised by a successful `execve()`.
    pub fn spawn(&mut self, mut cmd: Command) -> Result<Child> {
        // On fork, request `PTRACE_TRACEME`.
        unsafe {
            cmd.pre_exec(|| ptrace::traceme().map_err(|err| io::Error::from_raw_os_error(err as i32)))
        };

        let child = cmd.spawn().map_err(|source| Error::Spawn { source })?;

        info!(pid = child.id(), "spawned tracee");

        Ok(child)
    }

    /// Fork a child which requests `PTRACE_TRACEME`, stops itself with `SIGSTOP`, then
    /// exits with the value returned by `f`.
    ///
    /// # Safety
    ///
    /// `f` runs in the forked child. If the calling process is multi-threaded, it must
    /// only perform async-signal-safe operations.
    pub unsafe fn fork_call<F>(&mut self, f: F) -> Result<Pid>
    where
        F: FnOnce() -> i32,
    {
        let pid = crate::cmd::fork_traced(f)?;

        info!(pid = pid.as_raw(), "forked tracee");

        Ok(pid)
    }

    /// Attach to a running task. This will deliver a `SIGSTOP`.
    ///
    /// **Warning:** the tracee may not be considered stopped until it has been seen to
    /// stop via `wait()`.
    pub fn attach(&mut self, pid: Pid) -> Result<()> {
        ptrace::attach(pid).map_err(|source| Error::Attach { pid, source })?;

        info!(pid = pid.as_raw(), "attached to tracee");

        Ok(())
    }

    /// Apply the configured options to a stopped tracee.
    pub fn setup(&self, pid: Pid) -> Result<()> {
        debug!(pid = pid.as_raw(), options = ?self.options, "setting tracee options");

        ptrace::setoptions(pid, self.options).map_err(|source| {
            if source == Errno::ESRCH {
                Error::TraceeDied { pid, source }
            } else {
                Error::Setup { pid, source }
            }
        })
    }

    /// Restart a stopped tracee until its next syscall-stop, delivering `signal`.
    pub fn resume(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        trace!(pid = pid.as_raw(), ?signal, "resuming tracee");

        ptrace::syscall(pid, signal).map_err(|source| Error::Restart { pid, source })
    }

    /// Restart a stopped tracee without stopping at syscalls.
    pub fn cont(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        ptrace::cont(pid, signal).died_if_esrch(pid)
    }

    /// Detach from a stopped tracee, delivering `signal`.
    pub fn detach(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        info!(pid = pid.as_raw(), ?signal, "detaching from tracee");

        ptrace::detach(pid, signal).died_if_esrch(pid)
    }

    /// Send `signal` to a task.
    pub fn kill(&mut self, pid: Pid, signal: Signal) -> Result<()> {
        debug!(pid = pid.as_raw(), %signal, "signaling tracee");

        signal::kill(pid, signal).died_if_esrch(pid)
    }

    /// Wait for any tracee to change state.
    ///
    /// Returns `None` if there are no children left to wait on.
    pub fn wait(&mut self) -> Result<Option<Status>> {
        self.wait_on(None)
    }

    /// Wait for `pid` to change state.
    pub fn wait_pid(&mut self, pid: Pid) -> Result<Option<Status>> {
        self.wait_on(Some(pid))
    }

    fn wait_on(&mut self, pid: Option<Pid>) -> Result<Option<Status>> {
        let flags = WaitPidFlag::__WALL;

        let status = loop {
            match wait::waitpid(pid, Some(flags)) {
                Ok(status) => break status,
                Err(Errno::EINTR) => {
                    trace!("wait interrupted, retrying");
                    continue;
                },
                Err(Errno::ECHILD) => {
                    debug!("no tracees to wait on");
                    return Ok(None);
                },
                Err(source) => {
                    return Err(Error::Wait { source });
                },
            }
        };

        trace!(?status, "wait status");

        classify(status).map(Some)
    }
}

// Interpret a raw `wait(2)` status, making any follow-up ptrace requests it needs.
fn classify(status: WaitStatus) -> Result<Status> {
    let status = match status {
        WaitStatus::Exited(pid, exit_code) => Status::Exited(pid, exit_code),
        WaitStatus::Signaled(pid, signal, core_dumped) => Status::Signaled { pid, signal, core_dumped },
        WaitStatus::Stopped(pid, signal) => {
            let stop = if is_group_stop(pid, signal)? {
                Stop::Group { signal }
            } else {
                Stop::SignalDelivery { signal }
            };

            Status::Stopped(pid, stop)
        },
        WaitStatus::PtraceEvent(pid, _signal, code) => {
            let stop = match code {
                libc::PTRACE_EVENT_FORK => Stop::Fork { new: event_pid(pid)? },
                libc::PTRACE_EVENT_VFORK => Stop::Vfork { new: event_pid(pid)? },
                libc::PTRACE_EVENT_CLONE => Stop::Clone { new: event_pid(pid)? },
                libc::PTRACE_EVENT_VFORK_DONE => Stop::VforkDone { new: event_pid(pid)? },
                libc::PTRACE_EVENT_EXEC => {
                    // The reporting `pid` is always the thread group leader. The message is
                    // the former TID of the exec-ing thread, which differs for an
                    // off-leader exec.
                    Stop::Exec { old: event_pid(pid)? }
                },
                libc::PTRACE_EVENT_EXIT => {
                    // In this context, `PTRACE_GETEVENTMSG` returns the pending wait status
                    // as an `unsigned long`. We are only interested in the low 16-bit word.
                    let status = ptrace::getevent(pid).died_if_esrch(pid)? as u16;

                    match ExitType::parse(status)? {
                        ExitType::Exit(exit_code) => Stop::Exiting { exit_code },
                        ExitType::Signaled(signal, core_dumped) => Stop::Signaling { signal, core_dumped },
                    }
                },
                libc::PTRACE_EVENT_SECCOMP => {
                    // `SECCOMP_RET_DATA`, which is the low 16 bits of an int.
                    let data = ptrace::getevent(pid).died_if_esrch(pid)? as u16;
                    Stop::Seccomp { data }
                },
                libc::PTRACE_EVENT_STOP => {
                    // Unreachable by us, since we do not use `PTRACE_SEIZE`.
                    internal_error!("unreachable ptrace-event-stop")
                },
                _ => {
                    internal_error!("unexpected ptrace-event-stop code")
                },
            };

            Status::Stopped(pid, stop)
        },
        WaitStatus::PtraceSyscall(pid) => Status::Stopped(pid, Stop::Syscall),
        // Assume `!WNOHANG`, `!WCONTINUED`.
        WaitStatus::Continued(_) | WaitStatus::StillAlive => {
            internal_error!("unreachable `wait()` status")
        },
    };

    Ok(status)
}

fn event_pid(pid: Pid) -> Result<Pid> {
    let msg = ptrace::getevent(pid).died_if_esrch(pid)?;

    Ok(Pid::from_raw(msg as u32 as i32))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ExitType {
    Exit(i32),
    Signaled(Signal, bool),
}

impl ExitType {
    fn parse(status: u16) -> Result<Self> {
        // The bit layout of the word `status` is:
        //
        //   15                         8   7                     0
        //    +-------------------------+---+---------------------+
        //    |        exit_code        | c |       sig_no        |
        //    +-------------------------+---+---------------------+
        //
        // A nonzero `status[6:0]` is a fatal signal, with `status[7]` set on core dump.
        // Otherwise it is a normal exit with exit code `status[15:8]`.
        let sig_no = status & 0x7f;

        let ty = if sig_no == 0 {
            let exit_code = (status >> 8) as u8 as i32;

            ExitType::Exit(exit_code)
        } else {
            let signal = Signal::try_from(i32::from(sig_no))?;
            let core_dumped = status & (1 << 7) != 0;

            ExitType::Signaled(signal, core_dumped)
        };

        Ok(ty)
    }
}

// Check if a wait stop with signal delivery is a group-stop.
fn is_group_stop(pid: Pid, sig: Signal) -> Result<bool> {
    use Signal::*;

    match sig {
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => {
            // Only stopping signals can cause a group-stop. `PTRACE_GETSIGINFO` fails with
            // `EINVAL` exactly when the stop is one.
            match ptrace::getsiginfo(pid) {
                Err(Errno::EINVAL) => Ok(true),
                Err(err) => Err::<bool, _>(err).died_if_esrch(pid),
                Ok(_) => Ok(false),
            }
        },
        _ => Ok(false),
    }
}
