use std::collections::VecDeque;

use nix::unistd::Pid;

use crate::arch::Word;
use crate::proc::ProcId;

/// What happened to a traced thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The thread tripped a trap instruction. `addr` is the presumed
    /// breakpoint address (instruction pointer rewound by the trap length).
    Breakpoint { addr: Word },
    Signal { signum: i32 },
    SyscallEnter { nr: u64 },
    SyscallExit { nr: u64 },
    Exit { code: i32 },
    ExitSignal { signum: i32 },
    Exec,
    Fork { child: Pid },
    Vfork { child: Pid },
    Clone { child: Pid },
    /// Synthetic kick used to drive a handler when no kernel notification
    /// is outstanding.
    None,
}

/// One canonicalized notification about a traced thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub proc: ProcId,
    pub pid: Pid,
    pub kind: EventKind,
}

impl Event {
    pub fn new(proc: ProcId, pid: Pid, kind: EventKind) -> Self {
        Self { proc, pid, kind }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self.kind, EventKind::Exit { .. } | EventKind::ExitSignal { .. })
    }
}

/// Returns true for events that terminate a task or carry no payload;
/// these are never queued for replay.
pub(crate) fn event_exit_or_none(event: &Option<Event>) -> bool {
    match event {
        None => true,
        Some(ev) => ev.is_exit() || ev.kind == EventKind::None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    Cont,
    Yield,
}

/// FIFO of events held back while an event handler owns the process
/// group. Ordering is strict per originating thread; threads interleave
/// arbitrarily.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub fn dequeue(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Non-destructive search for the first event matching `pred`.
    pub fn scan<P>(&self, pred: P) -> Option<&Event>
    where
        P: Fn(&Event) -> bool,
    {
        self.events.iter().find(|ev| pred(ev))
    }

    /// Visits queued events in order, returning the first one for which
    /// `f` yields.
    pub fn each<F>(&self, mut f: F) -> Option<&Event>
    where
        F: FnMut(&Event) -> Scan,
    {
        self.events.iter().find(|ev| f(ev) == Scan::Yield)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Whether any queued event originates from `pid`.
    pub fn has_events_for(&self, pid: Pid) -> bool {
        self.scan(|ev| ev.pid == pid).is_some()
    }
}
