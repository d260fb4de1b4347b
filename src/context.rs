//! The tracing event loop.
//!
//! A [`TraceContext`] owns every traced task of one session. It resumes stopped tasks,
//! waits for the next stop, and turns each stop into a call on its [`Handler`]. Handlers
//! get a [`Session`], through which they can look up tasks and [inspect](Inspector) or
//! rewrite a stopped task's syscall.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::process::Command;

use nix::errno::Errno;
use tracing::{debug, error, info, trace, warn};

use crate::abi::{self, memory::{self, RemoteString}, Abi, Backend, Retval, MAX_ARGS};
use crate::error::{Error, Result};
use crate::ptracer::{Options, Pid, Ptracer, Siginfo, Signal, Status, Stop};
use crate::registry::{ProcessEntry, ProcessFlags, ProcessRegistry};
use crate::tracee::Tracee;

/// What the event loop should do after a callback.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Action {
    #[default]
    Continue,

    /// Tear down every tracee and end the session with [`Error::Aborted`].
    Abort,
}

/// What to do with a signal that stopped a tracee.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SignalAction {
    /// Deliver the signal when the tracee is resumed.
    #[default]
    Deliver,

    /// Discard the signal.
    Suppress,

    Abort,
}

/// Whether a per-tracee error ends the session.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ErrorAction {
    #[default]
    Continue,
    Abort,
}

/// How a tracee terminated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Exit {
    Code(i32),
    Signal {
        signal: Signal,
        core_dumped: bool,
    },
}

impl Exit {
    /// Shell-style status: the exit code, or `128` plus the signal number.
    pub fn as_status(&self) -> i32 {
        match *self {
            Exit::Code(code) => code,
            Exit::Signal { signal, .. } => 128 + signal as i32,
        }
    }

    pub fn success(&self) -> bool {
        *self == Exit::Code(0)
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Code(code) => write!(f, "exited with code {code}"),
            Exit::Signal { signal, core_dumped: true } => write!(f, "killed by {signal} (core dumped)"),
            Exit::Signal { signal, .. } => write!(f, "killed by {signal}"),
        }
    }
}

/// The last error seen by a session.
#[derive(Clone, Debug)]
pub struct ContextError {
    /// Tracee the error concerns, if any.
    pub pid: Option<Pid>,

    pub error: Error,

    /// The error ended the session.
    pub fatal: bool,
}

/// Decoded state of a tracee at a syscall-stop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SyscallFrame {
    pub abi: Abi,
    pub number: u64,
    pub args: [u64; MAX_ARGS],

    /// Set at syscall-exit-stops only.
    pub retval: Option<Retval>,
}

impl SyscallFrame {
    pub fn arg(&self, index: usize) -> Option<u64> {
        self.args.get(index).copied()
    }

    pub fn is_entry(&self) -> bool {
        self.retval.is_none()
    }
}

/// Syscall and memory access to one stopped tracee.
pub struct Inspector<'a> {
    backend: &'a dyn Backend,
    tracee: Tracee,
    abi: Abi,
}

impl<'a> Inspector<'a> {
    pub(crate) fn new(backend: &'a dyn Backend, pid: Pid, abi: Abi) -> Self {
        let tracee = Tracee::new(pid);

        Self { backend, tracee, abi }
    }

    pub fn pid(&self) -> Pid {
        self.tracee.pid()
    }

    pub fn abi(&self) -> Abi {
        self.abi
    }

    pub fn syscall_number(&self) -> Result<u64> {
        self.backend.syscall_number(&self.tracee, self.abi)
    }

    pub fn set_syscall_number(&mut self, nr: u64) -> Result<()> {
        self.backend.set_syscall_number(&mut self.tracee, self.abi, nr)
    }

    pub fn argument(&self, index: usize) -> Result<u64> {
        self.backend.argument(&self.tracee, self.abi, index)
    }

    pub fn set_argument(&mut self, index: usize, value: u64) -> Result<()> {
        self.backend.set_argument(&mut self.tracee, self.abi, index, value)
    }

    pub fn arguments(&self) -> Result<[u64; MAX_ARGS]> {
        let mut args = [0; MAX_ARGS];

        for (index, arg) in args.iter_mut().enumerate().take(self.backend.max_args()) {
            *arg = self.argument(index)?;
        }

        Ok(args)
    }

    /// Only meaningful at a syscall-exit-stop.
    pub fn return_value(&self) -> Result<Retval> {
        self.backend.return_value(&self.tracee, self.abi)
    }

    pub fn set_return_value(&mut self, retval: Retval) -> Result<()> {
        self.backend.set_return_value(&mut self.tracee, self.abi, retval)
    }

    /// Decode the syscall number and arguments, and at exit, the return value.
    pub fn frame(&self, exit: bool) -> Result<SyscallFrame> {
        let number = self.syscall_number()?;
        let args = self.arguments()?;
        let retval = if exit { Some(self.return_value()?) } else { None };

        Ok(SyscallFrame { abi: self.abi, number, args, retval })
    }

    pub fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        memory::read_memory(&self.tracee, self.abi, addr, buf)
    }

    pub fn read_exact(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        memory::read_exact(&self.tracee, self.abi, addr, len)
    }

    pub fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<usize> {
        memory::write_memory(&mut self.tracee, self.abi, addr, data)
    }

    pub fn read_cstring(&self, addr: u64, max_len: usize) -> Result<RemoteString> {
        memory::read_cstring(&self.tracee, self.abi, addr, max_len)
    }

    pub fn write_cstring(&mut self, addr: u64, s: &[u8]) -> Result<usize> {
        memory::write_cstring(&mut self.tracee, self.abi, addr, s)
    }

    pub fn read_pointer(&self, addr: u64) -> Result<u64> {
        memory::read_pointer(&self.tracee, self.abi, addr)
    }

    /// Read the C string pointed to by syscall argument `index`.
    pub fn read_string_argument(&self, index: usize, max_len: usize) -> Result<RemoteString> {
        let addr = self.argument(index)?;

        self.read_cstring(addr, max_len)
    }

    /// Read member `index` of a NULL-terminated array of C strings, such as `argv`.
    pub fn read_string_array_member(&self, addr: u64, index: usize, max_len: usize) -> Result<Option<RemoteString>> {
        memory::read_string_array_member(&self.tracee, self.abi, addr, index, max_len)
    }

    pub fn siginfo(&self) -> Result<Siginfo> {
        self.tracee.siginfo()
    }
}

/// Callbacks for tracing events.
///
/// Every method has a default which continues the session, so implementors override only
/// what they need. All callbacks run on the thread that called [`TraceContext::run()`],
/// with the reporting tracee stopped.
pub trait Handler {
    /// Per-tracee payload, dropped when the tracee's entry is.
    type Data;

    /// A new tracee is registered. `parent` is `None` for tracees launched directly, and
    /// for children whose parent's fork was never reported.
    fn on_birth(&mut self, _session: &mut Session<Self::Data>, _pid: Pid, _parent: Option<Pid>) -> Action {
        Action::Continue
    }

    /// A tracee terminated. Its entry is removed after this returns.
    fn on_exit(&mut self, _session: &mut Session<Self::Data>, _pid: Pid, _exit: Exit) -> Action {
        Action::Continue
    }

    fn on_signal(&mut self, _session: &mut Session<Self::Data>, _pid: Pid, _signal: Signal) -> SignalAction {
        SignalAction::Deliver
    }

    fn on_syscall_entry(&mut self, _session: &mut Session<Self::Data>, _pid: Pid, _frame: &SyscallFrame) -> Action {
        Action::Continue
    }

    fn on_syscall_exit(&mut self, _session: &mut Session<Self::Data>, _pid: Pid, _frame: &SyscallFrame) -> Action {
        Action::Continue
    }

    /// A tracee returned from a successful `execve()`. Its ABI has been re-detected, and
    /// `old_abi` is the one in effect before.
    fn on_exec(&mut self, _session: &mut Session<Self::Data>, _pid: Pid, _old_abi: Option<Abi>) -> Action {
        Action::Continue
    }

    /// A request on behalf of a tracee failed for a reason other than its death.
    fn on_error(&mut self, _session: &mut Session<Self::Data>, _pid: Option<Pid>, _error: &Error) -> ErrorAction {
        ErrorAction::Continue
    }
}

/// The tracees of a [`TraceContext`], as seen from a [`Handler`].
pub struct Session<T> {
    ptracer: Ptracer,
    backend: Box<dyn Backend>,
    registry: ProcessRegistry<T>,
    eldest: Option<Pid>,
    eldest_exit: Option<Exit>,
    last_error: Option<ContextError>,

    #[doc(hidden)]
    _not_send: PhantomData<*const ()>,
}

impl<T> Session<T> {
    fn new() -> Self {
        Self {
            ptracer: Ptracer::new(),
            backend: abi::native(),
            registry: ProcessRegistry::new(),
            eldest: None,
            eldest_exit: None,
            last_error: None,
            _not_send: PhantomData,
        }
    }

    pub fn registry(&self) -> &ProcessRegistry<T> {
        &self.registry
    }

    pub fn process(&self, pid: Pid) -> Option<&ProcessEntry<T>> {
        self.registry.get(pid)
    }

    pub fn process_mut(&mut self, pid: Pid) -> Option<&mut ProcessEntry<T>> {
        self.registry.get_mut(pid)
    }

    /// The first tracee launched. Its exit status is the session's.
    pub fn eldest(&self) -> Option<Pid> {
        self.eldest
    }

    pub fn options(&self) -> Options {
        self.ptracer.options()
    }

    pub fn backend(&self) -> &dyn Backend {
        &*self.backend
    }

    pub fn last_error(&self) -> Option<&ContextError> {
        self.last_error.as_ref()
    }

    /// Access the syscall state and memory of a stopped tracee.
    pub fn inspector(&self, pid: Pid) -> Result<Inspector<'_>> {
        let entry = self.registry.get(pid).ok_or(Error::UnknownTracee { pid })?;

        if !entry.is_stopped() {
            return Err(Error::NotStopped { pid });
        }

        let abi = entry.abi().ok_or(Error::UnknownAbi { pid })?;

        Ok(Inspector::new(&*self.backend, pid, abi))
    }

    /// Send `signal` to a tracee.
    pub fn kill(&mut self, pid: Pid, signal: Signal) -> Result<()> {
        if !self.registry.contains(pid) {
            return Err(Error::UnknownTracee { pid });
        }

        self.ptracer.kill(pid, signal)
    }

    /// Leave a tracee stopped until [`resume()`](Self::resume) is called for it.
    pub fn suspend(&mut self, pid: Pid) -> Result<()> {
        let entry = self.registry.get_mut(pid).ok_or(Error::UnknownTracee { pid })?;

        debug!(pid = pid.as_raw(), "suspending tracee");
        entry.insert_flags(ProcessFlags::SUSPENDED);

        Ok(())
    }

    pub fn resume(&mut self, pid: Pid) -> Result<()> {
        let entry = self.registry.get_mut(pid).ok_or(Error::UnknownTracee { pid })?;

        debug!(pid = pid.as_raw(), "unsuspending tracee");
        entry.remove_flags(ProcessFlags::SUSPENDED);

        Ok(())
    }

    fn record(&mut self, pid: Option<Pid>, err: &Error, fatal: bool) {
        if fatal {
            error!(pid = pid.map(Pid::as_raw), %err, "fatal tracing error");
        } else {
            warn!(pid = pid.map(Pid::as_raw), %err, "tracing error");
        }

        let error = err.clone();

        self.last_error = Some(ContextError { pid, error, fatal });
    }
}

/// A tracing session over a tree of processes.
///
/// Launch one or more tracees with [`spawn()`](Self::spawn), [`call()`](Self::call) or
/// [`attach()`](Self::attach), then drive the session with [`run()`](Self::run). Any
/// tracees left when the context is dropped are detached if attached to, and killed
/// otherwise.
pub struct TraceContext<H: Handler> {
    session: Session<H::Data>,
    handler: H,
}

impl<H: Handler> TraceContext<H> {
    pub fn new(handler: H) -> Self {
        let session = Session::new();

        Self { session, handler }
    }

    /// Use `backend` instead of the one for the build architecture.
    pub fn with_backend(mut self, backend: Box<dyn Backend>) -> Self {
        self.session.backend = backend;
        self
    }

    pub fn options(&self) -> Options {
        self.session.ptracer.options()
    }

    /// Set the ptrace options applied to launched tracees.
    ///
    /// **NOTE:** [`REQUIRED_OPTIONS`](crate::ptracer::REQUIRED_OPTIONS) are always set.
    pub fn set_options(&mut self, options: Options) {
        self.session.ptracer.set_options(options);
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn session(&self) -> &Session<H::Data> {
        &self.session
    }

    pub fn last_error(&self) -> Option<&ContextError> {
        self.session.last_error()
    }

    /// Spawn `cmd` as a tracee, stopped just after its `execve()`.
    pub fn spawn(&mut self, cmd: Command) -> Result<Pid> {
        let child = match self.session.ptracer.spawn(cmd) {
            Ok(child) => child,
            Err(err) => return self.fail(None, err),
        };

        let pid = Pid::from_raw(child.id() as i32);

        let mut entry = ProcessEntry::new(pid).with_flags(ProcessFlags::STARTUP);
        entry.set_tgid(pid);

        if !self.session.registry.insert(entry) {
            return self.fail(Some(pid), Error::Internal("spawned tracee already registered".into()));
        }

        // A successful `execve()` after `PTRACE_TRACEME` raises `SIGTRAP`. Options are not
        // set yet, so this is a plain signal-delivery-stop.
        match self.session.ptracer.wait_pid(pid) {
            Ok(Some(Status::Stopped(_, Stop::SignalDelivery { signal: Signal::SIGTRAP }))) => {},
            Ok(status) => {
                let err = Error::Internal(format!("unexpected initial status for spawned tracee: {status:?}"));
                return self.fail(Some(pid), err);
            },
            Err(err) => return self.fail(Some(pid), err),
        }

        let abi = match self.session.backend.detect_abi(&Tracee::new(pid)) {
            Ok(abi) => abi,
            Err(err) => return self.fail(Some(pid), err),
        };

        if let Err(err) = self.session.ptracer.setup(pid) {
            return self.fail(Some(pid), err);
        }

        let follow = self.follow_flag();

        if let Some(entry) = self.session.registry.get_mut(pid) {
            entry.set_abi(abi);
            entry.remove_flags(ProcessFlags::STARTUP);
            entry.insert_flags(follow);
            entry.state.stopped = true;
        }

        self.launched(pid)?;

        Ok(pid)
    }

    /// Fork a tracee which runs `f`, and exits with its return value.
    ///
    /// # Safety
    ///
    /// `f` runs in a forked copy of the calling process. If the caller is multi-threaded,
    /// `f` may only perform async-signal-safe operations. See [`nix::unistd::fork()`].
    pub unsafe fn call<F>(&mut self, f: F) -> Result<Pid>
    where
        F: FnOnce() -> i32,
    {
        let pid = match self.session.ptracer.fork_call(f) {
            Ok(pid) => pid,
            Err(err) => return self.fail(None, err),
        };

        let flags = ProcessFlags::STARTUP | ProcessFlags::IGNORE_ONE_SIGSTOP | self.follow_flag();
        let mut entry = ProcessEntry::new(pid).with_flags(flags);
        entry.set_tgid(pid);

        if !self.session.registry.insert(entry) {
            return self.fail(Some(pid), Error::Internal("forked tracee already registered".into()));
        }

        self.launched(pid)?;

        Ok(pid)
    }

    /// Attach to a running task.
    ///
    /// The task is detached, rather than killed, if the session ends early.
    pub fn attach(&mut self, pid: Pid) -> Result<()> {
        if let Err(err) = self.session.ptracer.attach(pid) {
            return self.fail(Some(pid), err);
        }

        self.attached(pid, None)
    }

    /// Attach to every thread of the process `pid`, returning how many were attached.
    pub fn attach_all(&mut self, pid: Pid) -> Result<usize> {
        let tids = match task_ids(pid) {
            Ok(tids) => tids,
            Err(err) => return self.fail(Some(pid), err.into()),
        };

        let mut count = 0;

        for tid in tids {
            match self.session.ptracer.attach(tid) {
                Ok(()) => {},
                Err(Error::Attach { source: Errno::ESRCH, .. }) if tid != pid => {
                    debug!(pid = tid.as_raw(), "thread exited before attach");
                    continue;
                },
                Err(err) => return self.fail(Some(tid), err),
            }

            self.attached(tid, Some(pid))?;
            count += 1;
        }

        Ok(count)
    }

    /// Trace until every tracee has terminated.
    ///
    /// Returns how the eldest tracee terminated. On error, including an abort requested
    /// by the handler, the remaining tracees are torn down.
    pub fn run(&mut self) -> Result<Exit> {
        match self.event_loop() {
            Ok(exit) => {
                info!(%exit, "tracing finished");
                Ok(exit)
            },
            Err(err) => self.fail(None, err),
        }
    }

    fn follow_flag(&self) -> ProcessFlags {
        if self.session.ptracer.follows_forks() {
            ProcessFlags::FOLLOW_FORK
        } else {
            ProcessFlags::empty()
        }
    }

    fn attached(&mut self, pid: Pid, tgid: Option<Pid>) -> Result<()> {
        let flags = ProcessFlags::STARTUP
            | ProcessFlags::ATTACHED
            | ProcessFlags::IGNORE_ONE_SIGSTOP
            | self.follow_flag();
        let mut entry = ProcessEntry::new(pid).with_flags(flags);

        if let Some(tgid) = tgid {
            entry.set_tgid(tgid);
        }

        if !self.session.registry.insert(entry) {
            return self.fail(Some(pid), Error::Internal("attached tracee already registered".into()));
        }

        self.launched(pid)
    }

    // Record a directly-launched tracee, and report its birth.
    fn launched(&mut self, pid: Pid) -> Result<()> {
        if self.session.eldest.is_none() {
            self.session.eldest = Some(pid);
        }

        match self.birth(pid, None) {
            Ok(()) => Ok(()),
            Err(err) => self.fail(Some(pid), err),
        }
    }

    fn birth(&mut self, pid: Pid, parent: Option<Pid>) -> Result<()> {
        info!(pid = pid.as_raw(), parent = parent.map(Pid::as_raw), "new tracee");

        let action = self.handler.on_birth(&mut self.session, pid, parent);
        check(action)
    }

    // Record a fatal error, tear down all tracees, and return the error.
    fn fail<R>(&mut self, pid: Option<Pid>, err: Error) -> Result<R> {
        self.session.record(pid, &err, true);
        self.teardown();

        Err(err)
    }

    fn event_loop(&mut self) -> Result<Exit> {
        if self.session.eldest.is_none() {
            internal_error!("no tracee was launched");
        }

        while !self.session.registry.is_empty() {
            self.resume_stopped()?;

            let status = match self.session.ptracer.wait() {
                Ok(Some(status)) => status,
                Err(err) if err.tracee_died() => {
                    // Killed while its stop was being classified. The death follows.
                    debug!(%err, "tracee died before its stop was classified");
                    continue;
                },
                Err(err) => return Err(err),
                Ok(None) => {
                    warn!(remaining = self.session.registry.len(), "no tracees left to wait on");

                    for pid in self.session.registry.pids() {
                        self.session.registry.remove(pid);
                    }

                    break;
                },
            };

            self.dispatch(status)?;
        }

        match self.session.eldest_exit {
            Some(exit) => Ok(exit),
            None => internal_error!("exit of eldest tracee was not seen"),
        }
    }

    // Restart every stopped tracee which is not held back, with its pending signal.
    fn resume_stopped(&mut self) -> Result<()> {
        let session = &mut self.session;
        let mut running = 0;

        for entry in session.registry.iter_mut() {
            if !entry.state.stopped {
                running += 1;
                continue;
            }

            if entry.is_suspended() || entry.state.awaiting_parent {
                continue;
            }

            let pid = entry.pid();
            let signal = entry.state.pending.take();

            match session.ptracer.resume(pid, signal) {
                Ok(()) => {},
                Err(err) if err.tracee_died() => {
                    // Its death is reported by a later wait.
                    debug!(pid = pid.as_raw(), "tracee died before restart");
                },
                Err(err) => return Err(err),
            }

            entry.state.stopped = false;
            running += 1;
        }

        if running > 0 {
            return Ok(());
        }

        // Nothing can report a stop. Any held children will never see their parent's
        // fork event.
        if self.adopt_orphans()? {
            return self.resume_stopped();
        }

        internal_error!("every tracee is suspended")
    }

    fn adopt_orphans(&mut self) -> Result<bool> {
        let orphans: Vec<Pid> = self.session.registry
            .iter()
            .filter(|entry| entry.state.awaiting_parent)
            .map(ProcessEntry::pid)
            .collect();

        for &pid in &orphans {
            warn!(pid = pid.as_raw(), "adopting tracee whose parent's fork was not seen");

            if let Some(entry) = self.session.registry.get_mut(pid) {
                entry.state.awaiting_parent = false;
            }

            self.birth(pid, None)?;
        }

        Ok(!orphans.is_empty())
    }

    fn dispatch(&mut self, status: Status) -> Result<()> {
        match status {
            Status::Exited(pid, code) => self.handle_death(pid, Exit::Code(code)),
            Status::Signaled { pid, signal, core_dumped } => {
                self.handle_death(pid, Exit::Signal { signal, core_dumped })
            },
            Status::Stopped(pid, stop) => self.handle_stop(pid, stop),
        }
    }

    fn handle_stop(&mut self, pid: Pid, stop: Stop) -> Result<()> {
        trace!(pid = pid.as_raw(), ?stop, "tracee stopped");

        if let Stop::Exec { old } = stop {
            if old != pid {
                self.exec_takeover(pid, old);
            }
        }

        let Some(entry) = self.session.registry.get_mut(pid) else {
            return self.handle_early_child(pid, stop);
        };

        entry.state.stopped = true;
        let starting = entry.flags().contains(ProcessFlags::STARTUP);

        if starting && self.startup(pid, stop)? {
            return Ok(());
        }

        match stop {
            Stop::Syscall => self.handle_syscall(pid),
            Stop::SignalDelivery { signal } | Stop::Group { signal } => self.handle_signal(pid, signal),
            Stop::Fork { new } | Stop::Vfork { new } | Stop::Clone { new } => self.handle_new_child(pid, new),
            Stop::Exec { .. } => self.handle_exec(pid),
            Stop::Exiting { .. } | Stop::Signaling { .. } => {
                debug!(pid = pid.as_raw(), ?stop, "tracee exiting");

                if let Some(entry) = self.session.registry.get_mut(pid) {
                    entry.insert_flags(ProcessFlags::EXITING);
                }

                Ok(())
            },
            Stop::VforkDone { .. } | Stop::Seccomp { .. } => Ok(()),
        }
    }

    // First stop of a tracee: apply options and detect its ABI.
    //
    // Returns `true` if the stop was an artifact of attaching, and must not be reported.
    fn startup(&mut self, pid: Pid, stop: Stop) -> Result<bool> {
        // A tracee without options still reports syscalls, as `SIGTRAP` stops.
        if let Err(err) = self.session.ptracer.setup(pid) {
            self.report(Some(pid), err)?;
        }

        let abi = self.session.backend.detect_abi(&Tracee::new(pid));

        let tgid = match read_tgid(pid) {
            Ok(tgid) => tgid,
            Err(err) => {
                debug!(pid = pid.as_raw(), %err, "could not read thread group id");
                None
            },
        };

        let Some(entry) = self.session.registry.get_mut(pid) else {
            internal_error!("startup stop for unregistered tracee")
        };

        entry.remove_flags(ProcessFlags::STARTUP);

        if let (None, Some(tgid)) = (entry.tgid(), tgid) {
            entry.set_tgid(tgid);
        }

        if let Ok(abi) = abi {
            entry.set_abi(abi);
        }

        let swallow = stop.signal() == Some(Signal::SIGSTOP)
            && entry.flags().contains(ProcessFlags::IGNORE_ONE_SIGSTOP);

        if swallow {
            entry.remove_flags(ProcessFlags::IGNORE_ONE_SIGSTOP);
        }

        debug!(pid = pid.as_raw(), abi = ?entry.abi(), "tracee started");

        if let Err(err) = abi {
            self.report(Some(pid), err)?;
        }

        Ok(swallow)
    }

    // A new child may report its attach-stop before its parent reports the fork. Hold it
    // stopped until the parent's event arrives, so its birth is reported first.
    fn handle_early_child(&mut self, pid: Pid, stop: Stop) -> Result<()> {
        debug!(pid = pid.as_raw(), ?stop, "stop for unknown tracee, holding for parent");

        let flags = ProcessFlags::STARTUP | ProcessFlags::IGNORE_ONE_SIGSTOP;
        let mut entry = ProcessEntry::new(pid).with_flags(flags);
        entry.state.stopped = true;
        entry.state.awaiting_parent = true;

        if !self.session.registry.insert(entry) {
            internal_error!("held child already registered");
        }

        let swallowed = self.startup(pid, stop)?;

        if !swallowed {
            if let (Some(signal), Some(entry)) = (stop.signal(), self.session.registry.get_mut(pid)) {
                entry.state.pending = Some(signal);
            }
        }

        Ok(())
    }

    fn handle_new_child(&mut self, parent: Pid, new: Pid) -> Result<()> {
        let Some(parent_entry) = self.session.registry.get(parent) else {
            internal_error!("fork event for unregistered tracee")
        };

        let abi = parent_entry.abi();
        let follow = parent_entry.flags() & ProcessFlags::FOLLOW_FORK;

        if let Some(child) = self.session.registry.get_mut(new) {
            if !child.state.awaiting_parent {
                debug!(pid = new.as_raw(), "child already registered");
                return Ok(());
            }

            child.state.awaiting_parent = false;
            child.insert_flags(follow);

            self.session.registry.set_parent(new, Some(parent));
        } else {
            let flags = ProcessFlags::STARTUP | ProcessFlags::IGNORE_ONE_SIGSTOP | follow;
            let child = ProcessEntry::new(new)
                .with_flags(flags)
                .with_parent(parent)
                .with_abi(abi);

            if !self.session.registry.insert(child) {
                internal_error!("new child already registered");
            }
        }

        self.birth(new, Some(parent))
    }

    // After an off-leader `execve()`, the exec-ing thread continues under the leader's
    // TID, and its old TID is never reported again.
    fn exec_takeover(&mut self, leader: Pid, old: Pid) {
        let registry = &mut self.session.registry;

        let Some(mut former) = registry.remove(old) else {
            return;
        };

        info!(pid = leader.as_raw(), old = old.as_raw(), "exec off thread group leader");

        if !registry.contains(leader) {
            former.set_pid(leader);
            registry.insert(former);
        }
    }

    fn handle_exec(&mut self, pid: Pid) -> Result<()> {
        let Some(entry) = self.session.registry.get_mut(pid) else {
            internal_error!("exec event for unregistered tracee")
        };

        debug!(pid = pid.as_raw(), "tracee exec'd");

        // The matching syscall-exit-stop follows.
        entry.state.exec_pending = true;
        entry.insert_flags(ProcessFlags::IN_SYSCALL);

        Ok(())
    }

    fn handle_syscall(&mut self, pid: Pid) -> Result<()> {
        let Some(entry) = self.session.registry.get_mut(pid) else {
            internal_error!("syscall-stop for unregistered tracee")
        };

        entry.toggle_flags(ProcessFlags::IN_SYSCALL);

        let entering = entry.in_syscall();
        let exec_exit = !entering && std::mem::take(&mut entry.state.exec_pending);
        let abi = entry.abi();

        if exec_exit {
            let new_abi = match self.session.backend.detect_abi(&Tracee::new(pid)) {
                Ok(abi) => abi,
                Err(err) => return self.report(Some(pid), err),
            };

            if let Some(entry) = self.session.registry.get_mut(pid) {
                entry.set_abi(new_abi);
            }

            let action = self.handler.on_exec(&mut self.session, pid, abi);
            return check(action);
        }

        let Some(abi) = abi else {
            return self.report(Some(pid), Error::UnknownAbi { pid });
        };

        let frame = match Inspector::new(&*self.session.backend, pid, abi).frame(!entering) {
            Ok(frame) => frame,
            Err(err) => return self.report(Some(pid), err),
        };

        trace!(pid = pid.as_raw(), entering, nr = frame.number, "syscall-stop");

        let action = if entering {
            self.handler.on_syscall_entry(&mut self.session, pid, &frame)
        } else {
            self.handler.on_syscall_exit(&mut self.session, pid, &frame)
        };

        check(action)
    }

    fn handle_signal(&mut self, pid: Pid, signal: Signal) -> Result<()> {
        if let Some(entry) = self.session.registry.get_mut(pid) {
            if signal == Signal::SIGSTOP && entry.flags().contains(ProcessFlags::IGNORE_ONE_SIGSTOP) {
                debug!(pid = pid.as_raw(), "suppressing attach SIGSTOP");
                entry.remove_flags(ProcessFlags::IGNORE_ONE_SIGSTOP);
                return Ok(());
            }
        }

        let pending = match self.handler.on_signal(&mut self.session, pid, signal) {
            SignalAction::Deliver => Some(signal),
            SignalAction::Suppress => None,
            SignalAction::Abort => return Err(Error::Aborted),
        };

        trace!(pid = pid.as_raw(), %signal, deliver = pending.is_some(), "signal-stop");

        if let Some(entry) = self.session.registry.get_mut(pid) {
            entry.state.pending = pending;
        }

        Ok(())
    }

    fn handle_death(&mut self, pid: Pid, exit: Exit) -> Result<()> {
        if !self.session.registry.contains(pid) {
            debug!(pid = pid.as_raw(), %exit, "reaped unregistered task");
            return Ok(());
        }

        info!(pid = pid.as_raw(), %exit, "tracee terminated");

        if self.session.eldest == Some(pid) {
            self.session.eldest_exit = Some(exit);
        }

        let action = self.handler.on_exit(&mut self.session, pid, exit);
        self.session.registry.remove(pid);

        check(action)
    }

    // Report a per-tracee error to the handler. Errors caused by the tracee's death are
    // not reported: the death itself is, on a later wait.
    fn report(&mut self, pid: Option<Pid>, err: Error) -> Result<()> {
        if err.tracee_died() {
            debug!(pid = pid.map(Pid::as_raw), %err, "tracee died mid-request");
            return Ok(());
        }

        self.session.record(pid, &err, false);

        match self.handler.on_error(&mut self.session, pid, &err) {
            ErrorAction::Continue => Ok(()),
            ErrorAction::Abort => Err(Error::Aborted),
        }
    }

    // Detach from attached tracees, and kill the rest.
    fn teardown(&mut self) {
        let session = &mut self.session;

        if session.registry.is_empty() {
            return;
        }

        info!(tracees = session.registry.len(), "tearing down tracees");

        let mut detaching = BTreeSet::new();
        let mut killing = BTreeSet::new();

        for pid in session.registry.pids() {
            let Some(entry) = session.registry.get(pid) else { continue };

            if entry.flags().contains(ProcessFlags::ATTACHED) {
                if entry.is_stopped() {
                    let res = session.ptracer.detach(pid, entry.pending_signal());
                    teardown_request(pid, "detach", res);
                } else if entry.flags().contains(ProcessFlags::IGNORE_ONE_SIGSTOP)
                    || teardown_request(pid, "stop", session.ptracer.kill(pid, Signal::SIGSTOP))
                {
                    // Detached once seen stopped. An attach-stop not yet seen is already
                    // on its way, and a second `SIGSTOP` would outlive the detach.
                    detaching.insert(pid);
                }
            } else if teardown_request(pid, "kill", session.ptracer.kill(pid, Signal::SIGKILL)) {
                killing.insert(pid);
            }
        }

        while !detaching.is_empty() || !killing.is_empty() {
            let status = match session.ptracer.wait() {
                Ok(Some(status)) => status,
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "wait failed during teardown");
                    break;
                },
            };

            let pid = status.pid();

            match status {
                Status::Exited(..) | Status::Signaled { .. } => {
                    detaching.remove(&pid);
                    killing.remove(&pid);
                },
                Status::Stopped(_, stop) if detaching.contains(&pid) => {
                    if stop == (Stop::SignalDelivery { signal: Signal::SIGSTOP }) {
                        let res = session.ptracer.detach(pid, None);
                        teardown_request(pid, "detach", res);
                        detaching.remove(&pid);
                    } else if !teardown_request(pid, "continue", session.ptracer.cont(pid, stop.signal())) {
                        detaching.remove(&pid);
                    }
                },
                Status::Stopped(..) => {
                    // Killed tracees may still report `PTRACE_EVENT_EXIT`, and new children
                    // of killed tracees may report their attach-stop.
                    if !killing.contains(&pid)
                        && teardown_request(pid, "kill", session.ptracer.kill(pid, Signal::SIGKILL))
                    {
                        killing.insert(pid);
                    }

                    teardown_request(pid, "continue", session.ptracer.cont(pid, None));
                },
            }
        }

        for pid in session.registry.pids() {
            session.registry.remove(pid);
        }
    }
}

impl<H: Handler> Drop for TraceContext<H> {
    fn drop(&mut self) {
        self.teardown();
    }
}

// Teardown is best effort: log a failed request, and return whether it succeeded.
fn teardown_request(pid: Pid, request: &str, res: Result<()>) -> bool {
    match res {
        Ok(()) => true,
        Err(err) if err.tracee_died() => {
            debug!(pid = pid.as_raw(), request, "tracee died during teardown");
            false
        },
        Err(err) => {
            warn!(pid = pid.as_raw(), request, %err, "teardown request failed");
            false
        },
    }
}

fn check(action: Action) -> Result<()> {
    match action {
        Action::Continue => Ok(()),
        Action::Abort => {
            info!("session aborted by handler");
            Err(Error::Aborted)
        },
    }
}

fn read_tgid(pid: Pid) -> io::Result<Option<Pid>> {
    let status = fs::read_to_string(format!("/proc/{}/status", pid))?;

    let tgid = status
        .lines()
        .find_map(|line| line.strip_prefix("Tgid:"))
        .and_then(|value| value.trim().parse().ok())
        .map(Pid::from_raw);

    Ok(tgid)
}

// Thread IDs of the process `pid`, leader first.
fn task_ids(pid: Pid) -> io::Result<Vec<Pid>> {
    let mut tids = vec![];

    for entry in fs::read_dir(format!("/proc/{}/task", pid))? {
        let name = entry?.file_name();

        if let Some(tid) = name.to_str().and_then(|name| name.parse().ok()) {
            tids.push(Pid::from_raw(tid));
        }
    }

    tids.sort_by_key(|&tid| (tid != pid, tid));

    Ok(tids)
}
