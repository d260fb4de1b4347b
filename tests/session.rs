use std::process::Command;

use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use serial_test::serial;
use tether::{Error, Exit, Retval, TraceContext};

#[macro_use]
mod support;
use support::*;

#[test]
#[serial]
#[timeout(2000)]
fn test_call_exit_status() -> Result<()> {
    let mut ctx = TraceContext::new(Recorder::default());

    let pid = unsafe {
        ctx.call(|| {
            libc::syscall(libc::SYS_getpid);
            7
        })?
    };

    let exit = ctx.run()?;

    assert_eq!(exit, Exit::Code(7));
    assert_eq!(exit.as_status(), 7);

    let recorder = ctx.handler();
    recorder.assert_born_first();

    // One syscall-entry and one syscall-exit, in that order.
    assert_eq!(recorder.syscall_count(i64::from(libc::SYS_getpid)), (1, 1));

    let getpid = libc::SYS_getpid as u64;
    let entry = recorder.events.iter().position(|e| *e == Event::Entry { pid, nr: getpid });
    let exit = recorder.events.iter().position(|e| {
        *e == Event::Exit { pid, nr: getpid, retval: Retval::Value(pid.as_raw().into()) }
    });
    assert!(entry.is_some());
    assert!(entry < exit);

    // `exit_group()` does not return.
    assert_eq!(recorder.syscall_count(i64::from(libc::SYS_exit_group)), (1, 0));

    assert_eq!(recorder.births(), vec![Event::Birth { pid, parent: None }]);
    assert_eq!(recorder.events.last(), Some(&Event::Died { pid, exit: Exit::Code(7) }));

    assert!(ctx.session().registry().is_empty());
    assert!(ctx.last_error().is_none());

    Ok(())
}

#[test]
#[serial]
#[timeout(2000)]
fn test_spawn_exit_status() -> Result<()> {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", "exit 3"]);

    let mut ctx = TraceContext::new(Recorder::default());
    let pid = ctx.spawn(cmd)?;

    let eldest = ctx.session().process(pid).expect("eldest is registered");
    assert_eq!(eldest.abi(), Some(native_abi()));
    assert!(eldest.is_stopped());

    let exit = ctx.run()?;

    assert_eq!(exit, Exit::Code(3));

    let recorder = ctx.handler();
    recorder.assert_born_first();

    assert_eq!(recorder.events.first(), Some(&Event::Birth { pid, parent: None }));
    assert_eq!(recorder.events.last(), Some(&Event::Died { pid, exit: Exit::Code(3) }));

    Ok(())
}

#[test]
#[serial]
#[timeout(2000)]
fn test_syscalls_alternate() -> Result<()> {
    let cmd = Command::new("true");

    let mut ctx = TraceContext::new(Recorder::default());
    ctx.spawn(cmd)?;

    assert_eq!(ctx.run()?, Exit::Code(0));

    // Every exit matches the entry before it.
    let mut in_syscall = None;

    for event in &ctx.handler().events {
        match *event {
            Event::Entry { nr, .. } => {
                assert_eq!(in_syscall, None);
                in_syscall = Some(nr);
            },
            Event::Exit { nr, .. } => {
                assert_eq!(in_syscall.take(), Some(nr));
            },
            _ => {},
        }
    }

    // Left inside `exit_group()`.
    assert_eq!(in_syscall, Some(libc::SYS_exit_group as u64));

    Ok(())
}

#[test]
#[serial]
#[timeout(2000)]
fn test_spawn_failure() -> Result<()> {
    let cmd = Command::new("/nonexistent/tether-tracee");

    let mut ctx = TraceContext::new(Recorder::default());
    let res = ctx.spawn(cmd);

    assert!(matches!(res, Err(Error::Spawn { .. })));

    let last = ctx.last_error().expect("failure is recorded");
    assert!(last.fatal);
    assert!(matches!(last.error, Error::Spawn { .. }));

    assert!(ctx.handler().events.is_empty());
    assert!(ctx.session().registry().is_empty());

    Ok(())
}
