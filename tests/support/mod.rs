use std::collections::{BTreeSet, HashMap};
use std::convert::TryInto;

use tether::{
    Abi,
    Action,
    Error,
    ErrorAction,
    Exit,
    Handler,
    Pid,
    Retval,
    Session,
    Signal,
    SignalAction,
    SyscallFrame,
};

#[allow(unused)]
macro_rules! pid {
    ($raw: expr) => {
        tether::Pid::from_raw($raw)
    };
}

/// A tracing event, as seen by a [`Recorder`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    Birth { pid: Pid, parent: Option<Pid> },
    Entry { pid: Pid, nr: u64 },
    Exit { pid: Pid, nr: u64, retval: Retval },
    Signal { pid: Pid, signal: Signal },
    Exec { pid: Pid, old_abi: Option<Abi> },
    Died { pid: Pid, exit: Exit },
}

impl Event {
    pub fn pid(&self) -> Pid {
        match *self {
            Event::Birth { pid, .. } |
            Event::Entry { pid, .. } |
            Event::Exit { pid, .. } |
            Event::Signal { pid, .. } |
            Event::Exec { pid, .. } |
            Event::Died { pid, .. } => pid,
        }
    }
}

/// Handler which records every event.
#[derive(Debug, Default)]
pub struct Recorder {
    pub events: Vec<Event>,

    /// Registry size seen at each birth.
    pub registry_sizes: Vec<usize>,

    /// Registry contents seen at each exec.
    pub registry_at_exec: Vec<Vec<Pid>>,

    /// Errors reported to the handler, in order.
    pub errors: Vec<(Option<Pid>, Error)>,

    pub signal_action: SignalAction,
    pub error_action: ErrorAction,
}

#[allow(unused)]
impl Recorder {
    pub fn with_signal_action(signal_action: SignalAction) -> Self {
        Self { signal_action, ..Self::default() }
    }

    pub fn with_error_action(mut self, error_action: ErrorAction) -> Self {
        self.error_action = error_action;
        self
    }

    pub fn births(&self) -> Vec<Event> {
        self.events
            .iter()
            .copied()
            .filter(|e| matches!(e, Event::Birth { .. }))
            .collect()
    }

    /// Count syscall-entry and -exit events for syscall `nr`.
    pub fn syscall_count(&self, nr: i64) -> (usize, usize) {
        let nr = nr as u64;

        let entries = self.events
            .iter()
            .filter(|e| matches!(e, Event::Entry { nr: n, .. } if *n == nr))
            .count();
        let exits = self.events
            .iter()
            .filter(|e| matches!(e, Event::Exit { nr: n, .. } if *n == nr))
            .count();

        (entries, exits)
    }

    /// Assert that no tracee is reported before its birth.
    pub fn assert_born_first(&self) {
        let mut born = BTreeSet::new();

        for event in &self.events {
            if let Event::Birth { pid, .. } = event {
                assert!(born.insert(*pid), "born twice: {event:?}");
            } else {
                assert!(born.contains(&event.pid()), "reported before birth: {event:?}");
            }
        }
    }
}

impl Handler for Recorder {
    type Data = ();

    fn on_birth(&mut self, session: &mut Session<()>, pid: Pid, parent: Option<Pid>) -> Action {
        self.registry_sizes.push(session.registry().len());
        self.events.push(Event::Birth { pid, parent });
        Action::Continue
    }

    fn on_exit(&mut self, _session: &mut Session<()>, pid: Pid, exit: Exit) -> Action {
        self.events.push(Event::Died { pid, exit });
        Action::Continue
    }

    fn on_signal(&mut self, _session: &mut Session<()>, pid: Pid, signal: Signal) -> SignalAction {
        self.events.push(Event::Signal { pid, signal });
        self.signal_action
    }

    fn on_syscall_entry(&mut self, _session: &mut Session<()>, pid: Pid, frame: &SyscallFrame) -> Action {
        self.events.push(Event::Entry { pid, nr: frame.number });
        Action::Continue
    }

    fn on_syscall_exit(&mut self, _session: &mut Session<()>, pid: Pid, frame: &SyscallFrame) -> Action {
        if let Some(retval) = frame.retval {
            self.events.push(Event::Exit { pid, nr: frame.number, retval });
        }

        Action::Continue
    }

    fn on_exec(&mut self, session: &mut Session<()>, pid: Pid, old_abi: Option<Abi>) -> Action {
        self.registry_at_exec.push(session.registry().pids());
        self.events.push(Event::Exec { pid, old_abi });
        Action::Continue
    }

    fn on_error(&mut self, _session: &mut Session<()>, pid: Option<Pid>, error: &Error) -> ErrorAction {
        self.errors.push((pid, error.clone()));
        self.error_action
    }
}

/// Assert that two event traces are equivalent modulo PID normalization.
#[allow(unused)]
pub fn assert_equivalent(left: &[Event], right: &[Event]) {
    let normed_left = Normalizer::normalize(left);
    let normed_right = Normalizer::normalize(right);
    pretty_assertions::assert_eq!(normed_left, normed_right)
}

/// Normalizes an event trace by substituting each concrete raw PID value with one that
/// matches its ordinal of appearance in the trace.
#[derive(Default)]
struct Normalizer {
    map: HashMap<Pid, Pid>,
}

impl Normalizer {
    pub fn normalize(trace: &[Event]) -> Vec<Event> {
        let mut normalizer = Normalizer::default();

        trace.iter().map(|event| normalizer.normalize_event(*event)).collect()
    }

    fn normalize_event(&mut self, event: Event) -> Event {
        match event {
            Event::Birth { pid, parent } => {
                let pid = self.normalize_pid(pid);
                let parent = parent.map(|parent| self.normalize_pid(parent));
                Event::Birth { pid, parent }
            },
            Event::Entry { pid, nr } => Event::Entry { pid: self.normalize_pid(pid), nr },
            Event::Exit { pid, nr, retval } => Event::Exit { pid: self.normalize_pid(pid), nr, retval },
            Event::Signal { pid, signal } => Event::Signal { pid: self.normalize_pid(pid), signal },
            Event::Exec { pid, old_abi } => Event::Exec { pid: self.normalize_pid(pid), old_abi },
            Event::Died { pid, exit } => Event::Died { pid: self.normalize_pid(pid), exit },
        }
    }

    fn normalize_pid(&mut self, pid: Pid) -> Pid {
        // Avoid borrowck error in `default` fn.
        let next_free = self.map.len();

        let entry = self.map.entry(pid).or_insert_with(|| {
            let raw: i32 = next_free.try_into().expect("exhausted free test PIDs");
            Pid::from_raw(raw)
        });

        *entry
    }
}

/// ABI of tracees built for the host.
#[allow(unused)]
pub fn native_abi() -> Abi {
    #[cfg(target_arch = "x86_64")]
    return Abi::X86_64;

    #[cfg(target_arch = "x86")]
    return Abi::I386;

    #[cfg(target_arch = "aarch64")]
    return Abi::Aarch64;

    #[cfg(target_arch = "arm")]
    return Abi::Arm;

    #[cfg(target_arch = "powerpc")]
    return Abi::PowerPc32;

    #[cfg(target_arch = "powerpc64")]
    return Abi::PowerPc64;
}
