//! Event handlers temporarily own all events of one thread group. At most
//! one handler sits on a group leader; the vfork handler additionally sits
//! on the child task it shepherds. Handlers are synchronous: they may
//! consume, queue or re-emit the event, never block.

pub mod exiting;
pub mod stopping;
pub mod vfork;

pub use self::exiting::ExitingHandler;
pub use self::stopping::{StopCallbacks, StoppingHandler};
pub use self::vfork::VforkHandler;

use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::event::{event_exit_or_none, Event, EventKind};
use crate::breakpoint;
use crate::proc::{ProcId, Visit};
use crate::trace::Session;

/// Answer of a policy callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Cont,
    Stop,
    Fail,
}

/// The handler kinds, distinguished by variant rather than by callback
/// identity.
pub enum EventHandler {
    Stopping(StoppingHandler),
    Exiting(ExitingHandler),
    VFork(VforkHandler),
}

impl EventHandler {
    /// Feeds one event to the handler. `None` means the event was
    /// consumed; otherwise it is re-emitted to the next dispatch layer.
    pub fn on_event(&mut self, s: &mut Session, event: Event) -> Option<Event> {
        match self {
            EventHandler::Stopping(h) => h.on_event(s, event),
            EventHandler::Exiting(h) => h.on_event(s, event),
            EventHandler::VFork(h) => h.on_event(s, event),
        }
    }

    /// Whether the handler finished its job and should be dropped instead
    /// of being reinstalled.
    pub fn is_done(&self) -> bool {
        match self {
            EventHandler::Stopping(h) => h.is_done(),
            EventHandler::Exiting(h) => h.is_done(),
            EventHandler::VFork(h) => h.is_done(),
        }
    }
}

/// Per-thread bookkeeping for one quiescence cycle.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PidTask {
    /// Raw pid; zeroed when the thread exits mid-cycle.
    pub pid: i32,
    /// We sent SIGSTOP and expect its delivery.
    pub sigstopped: bool,
    /// The SIGSTOP was observed and consumed.
    pub delivered: bool,
    /// At least one event arrived from this thread since the cycle began.
    pub got_event: bool,
    /// Thread is a vfork parent, blocked in the kernel; never signalled.
    pub vforked: bool,
    /// Last observed event was a syscall return.
    pub sysret: bool,
}

/// The set of threads participating in a quiescence cycle, keyed by pid.
#[derive(Debug, Default)]
pub(crate) struct PidSet {
    tasks: Vec<PidTask>,
}

impl PidSet {
    pub fn get(&self, pid: i32) -> Option<&PidTask> {
        debug_assert!(pid != 0);
        self.tasks.iter().find(|t| t.pid == pid)
    }

    pub fn get_mut(&mut self, pid: i32) -> Option<&mut PidTask> {
        debug_assert!(pid != 0);
        self.tasks.iter_mut().find(|t| t.pid == pid)
    }

    /// Finds or creates the entry for `pid`.
    pub fn ensure(&mut self, pid: i32) -> &mut PidTask {
        if let Some(i) = self.tasks.iter().position(|t| t.pid == pid) {
            return &mut self.tasks[i];
        }
        self.tasks.push(PidTask {
            pid,
            ..PidTask::default()
        });
        self.tasks.last_mut().expect("just pushed")
    }

    pub fn iter(&self) -> impl Iterator<Item = &PidTask> {
        self.tasks.iter()
    }
}

/// Universal pre-filter run on every event while a quiescence protocol is
/// active: records that the thread produced an event, and sinks the one
/// SIGSTOP we are owed.
pub(crate) fn handle_stopping_event(task_info: Option<&mut PidTask>, event: &mut Option<Event>) {
    let Some(info) = task_info else { return };
    info.got_event = true;

    if let Some(ev) = *event {
        if let EventKind::Signal { signum } = ev.kind {
            if signum == libc::SIGSTOP {
                debug!(pid = info.pid, "SIGSTOP delivered");
                if info.sigstopped && !info.delivered {
                    info.delivered = true;
                    *event = None;
                } else {
                    warn!(
                        pid = info.pid,
                        sigstopped = info.sigstopped,
                        delivered = info.delivered,
                        "unexpected SIGSTOP"
                    );
                }
            }
        }
    }
}

/// Requests a stop of `task` as part of a quiescence cycle. Threads that
/// are already parked, still being created, or blocked as vfork parents
/// are recorded without being signalled.
pub(crate) fn send_sigstop(s: &mut Session, task: ProcId, pids: &mut PidSet) {
    let Some(proc) = s.registry.get(task) else { return };
    let pid = proc.pid();
    let raw = pid.as_raw();
    let being_created = proc.being_created();

    pids.ensure(raw);

    // A task we have not attached to yet will be stopped by the kernel on
    // its own.
    if being_created {
        return;
    }

    let st = s.backend.status(pid);
    if st.is_parked() {
        return;
    }

    if let Some(info) = pids.get_mut(raw) {
        // An inherited entry may carry a consumed SIGSTOP from the cycle
        // this set was handed over from; only then do we signal again.
        if info.sigstopped {
            if !info.delivered {
                return;
            }
            info.delivered = false;
        }
    }

    if st == crate::backend::ProcStatus::Sleeping && is_vfork_parent(s, task) {
        if let Some(info) = pids.get_mut(raw) {
            info.vforked = true;
        }
        return;
    }

    match s.backend.kill(pid, nix::sys::signal::Signal::SIGSTOP) {
        Ok(()) => {
            debug!(pid = raw, "sent SIGSTOP");
            if let Some(info) = pids.get_mut(raw) {
                info.sigstopped = true;
            }
        }
        Err(e) => warn!(pid = raw, error = %e, "couldn't send SIGSTOP"),
    }
}

/// Whether every thread of `leader`'s group is blocked: parked in the
/// kernel's view, or a vfork parent we will not wait for.
pub(crate) fn all_blocked(s: &Session, leader: ProcId, pids: &PidSet) -> bool {
    s.registry
        .each_task(leader, |_, proc| {
            if pids
                .get(proc.pid().as_raw())
                .map_or(false, |info| info.vforked)
            {
                return Visit::Cont;
            }
            if s.backend.status(proc.pid()).is_parked() {
                Visit::Cont
            } else {
                Visit::Stop
            }
        })
        .is_none()
}

/// Some SIGSTOPs may still sit undelivered in the kernel queue. For every
/// thread that has produced an event but not its SIGSTOP yet, resume it so
/// the signal can be delivered and caught. The thread does not run
/// userspace code before the stop.
pub(crate) fn continue_for_sigstop_delivery(backend: &mut dyn Backend, pids: &PidSet) {
    for info in pids.iter() {
        if info.pid != 0 && info.sigstopped && !info.delivered && info.got_event {
            debug!(pid = info.pid, "continue for SIGSTOP delivery");
            backend.cont_syscall(Pid::from_raw(info.pid), 0).ok();
        }
    }
}

/// Returns true once every expected SIGSTOP has arrived. A thread that
/// produced some other event while its SIGSTOP is pending is resumed so
/// the signal can land.
pub(crate) fn await_sigstop_delivery(
    backend: &mut dyn Backend,
    pids: &PidSet,
    task_pid: i32,
    event: &Option<Event>,
) -> bool {
    let info = pids.get(task_pid);
    match (event, info) {
        (Some(ev), Some(info))
            if !event_exit_or_none(&Some(*ev)) && info.sigstopped && !info.delivered =>
        {
            debug!(pid = task_pid, "continue for SIGSTOP delivery");
            backend.cont_syscall(Pid::from_raw(task_pid), 0).ok();
            false
        }
        _ => pids
            .iter()
            .all(|t| t.pid == 0 || !t.sigstopped || t.delivered),
    }
}

/// Every recorded thread has either produced an event or has one waiting
/// in the queue.
pub(crate) fn all_stops_accountable(s: &Session, pids: &PidSet) -> bool {
    pids.iter().all(|t| {
        t.pid == 0 || t.got_event || s.queue.has_events_for(Pid::from_raw(t.pid))
    })
}

/// Whether `task`'s group currently shelters a vforked child, which keeps
/// the parent blocked in the kernel.
pub(crate) fn is_vfork_parent(s: &Session, task: ProcId) -> bool {
    let leader = s.registry.leader_of(task);
    s.registry
        .each_task(leader, |_, proc| {
            if matches!(proc.handler, Some(EventHandler::VFork(_))) {
                Visit::Stop
            } else {
                Visit::Cont
            }
        })
        .is_some()
}

/// Rewinds the thread behind a breakpoint event to the breakpoint address;
/// the processor has already advanced past the trap instruction.
pub(crate) fn undo_breakpoint(s: &mut Session, event: &Event, leader: ProcId) {
    if let EventKind::Breakpoint { addr } = event.kind {
        if s.registry.leader_of(event.proc) == leader {
            s.backend.set_ip(event.pid, addr).ok();
        }
    }
}

/// IP fixup for every queued breakpoint event of the group. Without it a
/// detached thread would resume mid-instruction.
pub(crate) fn undo_queued_breakpoints(s: &mut Session, leader: ProcId) {
    let Session {
        backend,
        registry,
        queue,
        ..
    } = s;

    for ev in queue.iter() {
        if let EventKind::Breakpoint { addr } = ev.kind {
            if registry.get(ev.proc).map(|p| p.leader()) == Some(leader) {
                backend.set_ip(ev.pid, addr).ok();
            }
        }
    }
}

/// Full teardown of a quiescent group: retract every breakpoint, detach
/// every thread (leader last, and only groups we attached to externally),
/// and drop the group from the registry.
pub(crate) fn detach_process(s: &mut Session, leader: ProcId) {
    debug!("detaching process group");

    undo_queued_breakpoints(s, leader);
    breakpoint::disable_all(s, leader);
    breakpoint::retract_all(s, leader);

    let externally_attached = s.attached.iter().any(|pid| {
        s.registry
            .pid2proc(*pid)
            .map(|id| s.registry.leader_of(id) == leader)
            .unwrap_or(false)
    });

    let tasks = s.registry.tasks_of(leader);
    if externally_attached {
        for &task in tasks.iter().filter(|&&t| t != leader) {
            if let Some(pid) = s.registry.get(task).map(|p| p.pid()) {
                s.backend.detach(pid).ok();
            }
        }
        if let Some(pid) = s.registry.get(leader).map(|p| p.pid()) {
            s.backend.detach(pid).ok();
        }
    }

    for &task in tasks.iter().filter(|&&t| t != leader) {
        s.registry.remove(task);
    }
    s.registry.remove(leader);
}
