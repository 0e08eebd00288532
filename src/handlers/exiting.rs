//! Tracer shutdown. Before letting go of an externally-attached process
//! we must quiesce every thread, rewind threads sitting on consumed
//! breakpoint events, restore all patched text, and only then detach.
//! Leaving threads running would have them trip stray traps after the
//! tracer is gone.

use tracing::{debug, warn};

use crate::event::{event_exit_or_none, Event, EventKind};
use crate::proc::ProcId;
use crate::trace::Session;

use super::{
    all_stops_accountable, await_sigstop_delivery, detach_process, handle_stopping_event,
    send_sigstop, undo_breakpoint, EventHandler, PidSet,
};

/// Event handler that drives a group to quiescence and detaches it.
pub struct ExitingHandler {
    pids: PidSet,
    done: bool,
}

impl ExitingHandler {
    fn new() -> Self {
        Self {
            pids: PidSet::default(),
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn on_event(&mut self, s: &mut Session, ev: Event) -> Option<Event> {
        let task_pid = ev.pid.as_raw();
        let leader = s.registry.leader_of(ev.proc);

        debug!(pid = task_pid, kind = ?ev.kind, "exit handler event");

        let mut event = Some(ev);
        handle_stopping_event(self.pids.get_mut(task_pid), &mut event);

        if let Some(ev) = event {
            if matches!(ev.kind, EventKind::Breakpoint { .. }) {
                undo_breakpoint(s, &ev, leader);
            }
        }

        if await_sigstop_delivery(&mut *s.backend, &self.pids, task_pid, &event)
            && all_stops_accountable(s, &self.pids)
        {
            detach_process(s, leader);
            self.done = true;
        }

        // Sink everything but exits; the tracer is going away and will
        // not replay a queue.
        if event_exit_or_none(&event) {
            event
        } else {
            None
        }
    }
}

enum Slot {
    Gone,
    AlreadyExiting,
    Merged,
    VforkBusy,
    Empty,
}

/// Arranges for `proc`'s group to be detached. If a re-enablement cycle
/// is already running, it finishes first and detaches on completion.
/// Returns false if no handler could be put in place.
pub fn install(s: &mut Session, proc: ProcId) -> bool {
    let leader = s.registry.leader_of(proc);

    let slot = match s.registry.get_mut(leader) {
        None => Slot::Gone,
        Some(p) => match &mut p.handler {
            // Several externally-attached pids may share one group.
            Some(EventHandler::Exiting(_)) => Slot::AlreadyExiting,
            Some(EventHandler::Stopping(h)) => {
                h.exiting = true;
                Slot::Merged
            }
            Some(EventHandler::VFork(_)) => Slot::VforkBusy,
            None => Slot::Empty,
        },
    };

    match slot {
        Slot::Gone => false,
        Slot::AlreadyExiting => true,
        Slot::Merged => {
            debug!("exit request merged into running stop cycle");
            true
        }
        Slot::VforkBusy => {
            warn!("exit requested while a vfork is in flight");
            false
        }
        Slot::Empty => {
            let mut handler = ExitingHandler::new();
            for task in s.registry.tasks_of(leader) {
                send_sigstop(s, task, &mut handler.pids);
            }
            match s.registry.get_mut(leader) {
                Some(p) => {
                    p.handler = Some(EventHandler::Exiting(handler));
                    true
                }
                None => false,
            }
        }
    }
}
