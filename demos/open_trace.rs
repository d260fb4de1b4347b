//! Trace a command, printing the files it opens.
//!
//! Usage: `cargo run --example open_trace -- [--no-follow] <cmd> [args...]`

use std::process::Command;

use structopt::StructOpt;
use tether::{Abi, Action, Handler, Options, Pid, Retval, Session, SyscallFrame, TraceContext};
use tracing_subscriber::EnvFilter;

const MAX_PATH: usize = 4096;

#[derive(StructOpt, Debug)]
struct Opt {
    /// Only trace the command itself, not its children.
    #[structopt(long)]
    no_follow: bool,

    #[structopt(min_values = 1)]
    cmd: Vec<String>,
}

#[derive(Clone, Copy, Debug)]
enum Open {
    Open,
    OpenAt,
}

impl Open {
    fn decode(abi: Abi, nr: u64) -> Option<Self> {
        use Abi::*;

        let (open, openat) = match abi {
            X86_64 | X32 => (Some(2), 257),
            I386 => (Some(5), 295),
            Arm => (Some(5), 322),
            PowerPc32 | PowerPc64 => (Some(5), 286),
            Aarch64 => (None, 56),
        };

        if Some(nr) == open {
            Some(Open::Open)
        } else if nr == openat {
            Some(Open::OpenAt)
        } else {
            None
        }
    }

    fn name(self) -> &'static str {
        match self {
            Open::Open => "open",
            Open::OpenAt => "openat",
        }
    }

    // Index of the path argument.
    fn path_index(self) -> usize {
        match self {
            Open::Open => 0,
            Open::OpenAt => 1,
        }
    }
}

/// Decoded call, held between syscall-entry and -exit.
struct Call {
    open: Open,
    path: String,
    flags: u64,
}

struct OpenTrace;

impl Handler for OpenTrace {
    type Data = Call;

    fn on_syscall_entry(&mut self, session: &mut Session<Call>, pid: Pid, frame: &SyscallFrame) -> Action {
        let Some(open) = Open::decode(frame.abi, frame.number) else {
            return Action::Continue;
        };

        let index = open.path_index();

        let path = match session.inspector(pid).and_then(|i| i.read_string_argument(index, MAX_PATH)) {
            Ok(path) if path.is_truncated() => format!("{:?}...", path.to_string_lossy()),
            Ok(path) => format!("{:?}", path.to_string_lossy()),
            Err(err) => format!("<{err}>"),
        };

        let flags = frame.args[index + 1];

        if let Some(entry) = session.process_mut(pid) {
            entry.set_data(Call { open, path, flags });
        }

        Action::Continue
    }

    fn on_syscall_exit(&mut self, session: &mut Session<Call>, pid: Pid, frame: &SyscallFrame) -> Action {
        let Some(call) = session.process_mut(pid).and_then(|entry| entry.take_data()) else {
            return Action::Continue;
        };

        let result = match frame.retval {
            Some(Retval::Error(errno)) => format!("-1 {}", nix::errno::Errno::from_raw(errno)),
            Some(retval) => retval.as_raw().to_string(),
            None => "?".into(),
        };

        println!("[{pid}] {}({}, 0x{:x}) = {result}", call.open.name(), call.path, call.flags);

        Action::Continue
    }

    fn on_exec(&mut self, _session: &mut Session<Call>, pid: Pid, old_abi: Option<Abi>) -> Action {
        println!("[{pid}] exec (was {})", old_abi.map(|abi| abi.name()).unwrap_or("?"));

        Action::Continue
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::from_args();

    let mut cmd = Command::new(&opt.cmd[0]);
    cmd.args(&opt.cmd[1..]);

    let mut ctx = TraceContext::new(OpenTrace);

    if opt.no_follow {
        ctx.set_options(Options::empty());
    }

    ctx.spawn(cmd)?;
    let exit = ctx.run()?;

    eprintln!("{} {exit}", opt.cmd[0]);

    drop(ctx);

    std::process::exit(exit.as_status());
}
