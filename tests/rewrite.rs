use std::io;

use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use serial_test::serial;
use tether::{Action, Exit, Handler, Pid, Retval, Session, SyscallFrame, TraceContext};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Rewrite {
    ReturnValue,
    Errno,
    Argument,
    Number,
    Memory,
}

// Rewrites one syscall, and records what it saw.
struct Rewriter {
    rewrite: Rewrite,
    hits: usize,
    seen: Vec<u8>,
}

impl Rewriter {
    fn new(rewrite: Rewrite) -> Self {
        Self { rewrite, hits: 0, seen: vec![] }
    }

    fn entry(&mut self, session: &mut Session<()>, pid: Pid, frame: &SyscallFrame) -> tether::error::Result<()> {
        let nr = frame.number as i64;
        let mut inspector = session.inspector(pid)?;

        match self.rewrite {
            Rewrite::Argument if nr == libc::SYS_getpgid as i64 && frame.args[0] == 999_999 => {
                inspector.set_argument(0, 0)?;
                self.hits += 1;
            },
            Rewrite::Number if nr == libc::SYS_getppid as i64 => {
                inspector.set_syscall_number(libc::SYS_getpid as u64)?;
                self.hits += 1;
            },
            Rewrite::Memory if nr == libc::SYS_write as i64 && frame.args[0] as i32 == -1 => {
                let s = inspector.read_string_argument(1, 64)?;
                assert!(!s.is_truncated());
                self.seen = s.bytes;

                inspector.write_memory(frame.args[1], b"HELLO")?;
                self.hits += 1;
            },
            _ => {},
        }

        Ok(())
    }

    fn exit(&mut self, session: &mut Session<()>, pid: Pid, frame: &SyscallFrame) -> tether::error::Result<()> {
        if frame.number as i64 != libc::SYS_getpid as i64 {
            return Ok(());
        }

        let retval = match self.rewrite {
            Rewrite::ReturnValue => Retval::Value(1234),
            Rewrite::Errno => Retval::Error(libc::EPERM),
            _ => return Ok(()),
        };

        session.inspector(pid)?.set_return_value(retval)?;
        self.hits += 1;

        Ok(())
    }
}

impl Handler for Rewriter {
    type Data = ();

    fn on_syscall_entry(&mut self, session: &mut Session<()>, pid: Pid, frame: &SyscallFrame) -> Action {
        match self.entry(session, pid, frame) {
            Ok(()) => Action::Continue,
            Err(_) => Action::Abort,
        }
    }

    fn on_syscall_exit(&mut self, session: &mut Session<()>, pid: Pid, frame: &SyscallFrame) -> Action {
        match self.exit(session, pid, frame) {
            Ok(()) => Action::Continue,
            Err(_) => Action::Abort,
        }
    }
}

fn trace_call<F>(rewrite: Rewrite, f: F) -> Result<(Exit, Rewriter)>
where
    F: FnOnce() -> i32,
{
    let mut ctx = TraceContext::new(Rewriter::new(rewrite));

    unsafe { ctx.call(f)? };

    let exit = ctx.run()?;
    let rewriter = std::mem::replace(ctx.handler_mut(), Rewriter::new(rewrite));

    Ok((exit, rewriter))
}

#[test]
#[serial]
#[timeout(2000)]
fn test_rewrite_return_value() -> Result<()> {
    let (exit, rewriter) = trace_call(Rewrite::ReturnValue, || unsafe {
        if libc::syscall(libc::SYS_getpid) == 1234 { 0 } else { 1 }
    })?;

    assert_eq!(exit, Exit::Code(0));
    assert_eq!(rewriter.hits, 1);

    Ok(())
}

#[test]
#[serial]
#[timeout(2000)]
fn test_inject_errno() -> Result<()> {
    let (exit, rewriter) = trace_call(Rewrite::Errno, || unsafe {
        let ret = libc::syscall(libc::SYS_getpid);
        let errno = io::Error::last_os_error().raw_os_error();

        if ret == -1 && errno == Some(libc::EPERM) { 0 } else { 1 }
    })?;

    assert_eq!(exit, Exit::Code(0));
    assert_eq!(rewriter.hits, 1);

    Ok(())
}

#[test]
#[serial]
#[timeout(2000)]
fn test_rewrite_argument() -> Result<()> {
    let (exit, rewriter) = trace_call(Rewrite::Argument, || unsafe {
        // No such process, unless the argument is replaced with 0.
        if libc::syscall(libc::SYS_getpgid, 999_999) >= 0 { 0 } else { 1 }
    })?;

    assert_eq!(exit, Exit::Code(0));
    assert_eq!(rewriter.hits, 1);

    Ok(())
}

#[test]
#[serial]
#[timeout(2000)]
fn test_rewrite_syscall_number() -> Result<()> {
    let (exit, rewriter) = trace_call(Rewrite::Number, || unsafe {
        let pid = libc::syscall(libc::SYS_getpid);

        if libc::syscall(libc::SYS_getppid) == pid { 0 } else { 1 }
    })?;

    assert_eq!(exit, Exit::Code(0));
    assert_eq!(rewriter.hits, 1);

    Ok(())
}

#[test]
#[serial]
#[timeout(2000)]
fn test_rewrite_memory() -> Result<()> {
    let (exit, rewriter) = trace_call(Rewrite::Memory, || unsafe {
        let mut buf = *b"hello\0";

        libc::write(-1, buf.as_mut_ptr() as *const libc::c_void, 5);

        let after = std::ptr::read_volatile(&buf);
        if &after == b"HELLO\0" { 0 } else { 1 }
    })?;

    assert_eq!(exit, Exit::Code(0));
    assert_eq!(rewriter.hits, 1);
    assert_eq!(rewriter.seen, b"hello");

    Ok(())
}
