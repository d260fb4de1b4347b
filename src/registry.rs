//! Bookkeeping for the set of traced tasks.

use std::collections::btree_map::{self, BTreeMap};
use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::abi::{Abi, Bitness};
use crate::ptracer::{Pid, Signal};

bitflags::bitflags! {
    /// Per-task tracing state.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ProcessFlags: u32 {
        /// Not yet seen at its first stop: options and ABI are still unset.
        const STARTUP = 1 << 0;
        /// Between a syscall-entry-stop and the matching syscall-exit-stop.
        const IN_SYSCALL = 1 << 1;
        /// Attached to, rather than started by us. Detached on teardown, never killed.
        const ATTACHED = 1 << 2;
        /// Seen at `PTRACE_EVENT_EXIT`.
        const EXITING = 1 << 3;
        /// Left stopped by the event loop until resumed by a handler.
        const SUSPENDED = 1 << 4;
        /// New children are auto-attached.
        const FOLLOW_FORK = 1 << 5;
        /// The next `SIGSTOP` is an artifact of attaching, and is not delivered.
        const IGNORE_ONE_SIGSTOP = 1 << 6;
    }
}

// Loop-private state of an entry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct EntryState {
    /// Signal to deliver when the task is next resumed.
    pub pending: Option<Signal>,

    /// Stopped, and not yet resumed.
    pub stopped: bool,

    /// `PTRACE_EVENT_EXEC` was seen, and the matching syscall-exit-stop was not.
    pub exec_pending: bool,

    /// Seen stopped before the ptrace-event-stop of its parent's fork.
    pub awaiting_parent: bool,
}

/// A traced task and its user payload.
///
/// The payload is dropped exactly once, when the entry is.
#[derive(Debug)]
pub struct ProcessEntry<T> {
    pid: Pid,
    tgid: Option<Pid>,
    abi: Option<Abi>,
    flags: ProcessFlags,
    parent: Option<Pid>,

    // Registered entries whose `parent` is this entry. Maintained by the registry.
    children: BTreeSet<Pid>,

    data: Option<T>,
    pub(crate) state: EntryState,
}

impl<T> ProcessEntry<T> {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            tgid: None,
            abi: None,
            flags: ProcessFlags::empty(),
            parent: None,
            children: BTreeSet::new(),
            data: None,
            state: EntryState::default(),
        }
    }

    pub fn with_flags(mut self, flags: ProcessFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_parent(mut self, parent: impl Into<Option<Pid>>) -> Self {
        self.parent = parent.into();
        self
    }

    pub fn with_abi(mut self, abi: impl Into<Option<Abi>>) -> Self {
        self.abi = abi.into();
        self
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Thread group ID, if known.
    pub fn tgid(&self) -> Option<Pid> {
        self.tgid
    }

    /// Syscall ABI, if determined.
    pub fn abi(&self) -> Option<Abi> {
        self.abi
    }

    pub fn bitness(&self) -> Option<Bitness> {
        self.abi.map(Abi::bitness)
    }

    pub fn flags(&self) -> ProcessFlags {
        self.flags
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stopped
    }

    pub fn is_suspended(&self) -> bool {
        self.flags.contains(ProcessFlags::SUSPENDED)
    }

    pub fn in_syscall(&self) -> bool {
        self.flags.contains(ProcessFlags::IN_SYSCALL)
    }

    /// Signal to deliver when the task is next resumed.
    pub fn pending_signal(&self) -> Option<Signal> {
        self.state.pending
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn data_mut(&mut self) -> Option<&mut T> {
        self.data.as_mut()
    }

    /// Attach a payload, returning the previous one.
    pub fn set_data(&mut self, data: T) -> Option<T> {
        self.data.replace(data)
    }

    pub fn take_data(&mut self) -> Option<T> {
        self.data.take()
    }

    pub(crate) fn set_pid(&mut self, pid: Pid) {
        self.pid = pid;
    }

    pub(crate) fn set_tgid(&mut self, tgid: Pid) {
        self.tgid = Some(tgid);
    }

    pub(crate) fn set_abi(&mut self, abi: Abi) {
        if self.abi != Some(abi) {
            debug!(pid = self.pid.as_raw(), old = ?self.abi, new = %abi, "tracee ABI changed");
        }

        self.abi = Some(abi);
    }

    pub(crate) fn insert_flags(&mut self, flags: ProcessFlags) {
        self.flags.insert(flags);
    }

    pub(crate) fn remove_flags(&mut self, flags: ProcessFlags) {
        self.flags.remove(flags);
    }

    pub(crate) fn toggle_flags(&mut self, flags: ProcessFlags) {
        self.flags.toggle(flags);
    }
}

/// Traced tasks, keyed and ordered by PID.
#[derive(Debug)]
pub struct ProcessRegistry<T> {
    entries: BTreeMap<Pid, ProcessEntry<T>>,
}

impl<T> Default for ProcessRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ProcessRegistry<T> {
    pub fn new() -> Self {
        let entries = BTreeMap::new();

        Self { entries }
    }

    /// Insert an entry, keyed by its PID.
    ///
    /// Returns `false` and leaves the registry unchanged if the PID is already present.
    /// A parent link to an unregistered PID is cleared.
    pub fn insert(&mut self, mut entry: ProcessEntry<T>) -> bool {
        let pid = entry.pid;

        if self.entries.contains_key(&pid) {
            warn!(pid = pid.as_raw(), "tracee already registered");
            return false;
        }

        // Links are only ever made to registered entries, so nothing registered can name
        // the new entry as its parent yet.
        entry.children.clear();

        if let Some(parent) = entry.parent {
            match self.entries.get_mut(&parent) {
                Some(parent) => {
                    parent.children.insert(pid);
                },
                None => {
                    debug!(pid = pid.as_raw(), parent = parent.as_raw(), "parent not registered");
                    entry.parent = None;
                },
            }
        }

        debug!(pid = pid.as_raw(), parent = ?entry.parent, "registering tracee");

        if let btree_map::Entry::Vacant(slot) = self.entries.entry(pid) {
            slot.insert(entry);
        }

        true
    }

    pub fn get(&self, pid: Pid) -> Option<&ProcessEntry<T>> {
        self.entries.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut ProcessEntry<T>> {
        self.entries.get_mut(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.entries.contains_key(&pid)
    }

    /// Remove and return the entry for `pid`.
    ///
    /// Its children stay registered, with no parent. The returned entry keeps its own
    /// parent link.
    pub fn remove(&mut self, pid: Pid) -> Option<ProcessEntry<T>> {
        let mut entry = self.entries.remove(&pid)?;

        debug!(pid = pid.as_raw(), "unregistering tracee");

        for child in std::mem::take(&mut entry.children) {
            if let Some(child) = self.entries.get_mut(&child) {
                child.parent = None;
            }
        }

        if let Some(parent) = entry.parent.and_then(|parent| self.entries.get_mut(&parent)) {
            parent.children.remove(&pid);
        }

        Some(entry)
    }

    /// Link `pid` to `parent`, or unlink it.
    ///
    /// Returns `false` if `pid` is not registered. A `parent` which is not registered
    /// unlinks `pid`.
    pub(crate) fn set_parent(&mut self, pid: Pid, parent: Option<Pid>) -> bool {
        let Some(old) = self.entries.get(&pid).map(|entry| entry.parent) else {
            return false;
        };

        let parent = parent.filter(|parent| *parent != pid && self.entries.contains_key(parent));

        if let Some(old) = old.and_then(|old| self.entries.get_mut(&old)) {
            old.children.remove(&pid);
        }

        if let Some(new) = parent.and_then(|parent| self.entries.get_mut(&parent)) {
            new.children.insert(pid);
        }

        if let Some(entry) = self.entries.get_mut(&pid) {
            entry.parent = parent;
        }

        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in PID order.
    pub fn iter(&self) -> impl Iterator<Item = &ProcessEntry<T>> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ProcessEntry<T>> {
        self.entries.values_mut()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.entries.keys().copied().collect()
    }

    /// Entries whose parent is `pid`, in PID order.
    pub fn children(&self, pid: Pid) -> impl Iterator<Item = &ProcessEntry<T>> + '_ {
        self.entries
            .get(&pid)
            .into_iter()
            .flat_map(|entry| entry.children.iter())
            .filter_map(|child| self.entries.get(child))
    }
}
