//! vfork shepherding. A vforked child shares the parent's address space
//! and the parent stays blocked in the kernel until the child execs or
//! exits. For that window the child is treated as a thread of the
//! parent's group; the quiescence protocol then knows not to wait on the
//! blocked parent. The handler also remembers the vfork-return breakpoint
//! the child trips, and smuggles it back into the parent so the parent
//! can trip it too.

use tracing::{debug, warn};

use crate::arch::Word;
use crate::breakpoint;
use crate::event::{Event, EventKind};
use crate::proc::ProcId;
use crate::trace::Session;

use super::EventHandler;

/// Event handler installed on a vforked child until it execs or exits.
pub struct VforkHandler {
    /// Return-site breakpoint observed in the child.
    bp_addr: Option<Word>,
    done: bool,
}

impl VforkHandler {
    fn new() -> Self {
        Self {
            bp_addr: None,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn on_event(&mut self, s: &mut Session, ev: Event) -> Option<Event> {
        debug!(pid = ev.pid.as_raw(), kind = ?ev.kind, "vfork handler event");

        match ev.kind {
            EventKind::Breakpoint { addr } => {
                if self.bp_addr.is_none() {
                    self.bp_addr = Some(addr);
                }
            }
            EventKind::Exit { .. } | EventKind::ExitSignal { .. } | EventKind::Exec => {
                let parent = s.registry.get(ev.proc).and_then(|p| p.parent());

                if let (Some(addr), Some(parent)) = (self.bp_addr, parent) {
                    // Put the return breakpoint back where the parent will
                    // run. Failing this only costs one missed return.
                    breakpoint::insert(s, parent, addr, None).ok();
                }

                if let Some(parent) = parent {
                    s.continue_process(parent);
                }

                // The child stops masquerading as a sibling.
                s.registry.change_leader(ev.proc, ev.proc);
                self.done = true;
            }
            _ => {}
        }

        Some(ev)
    }
}

/// Adopts a vforked child into its parent's thread group and installs the
/// shepherding handler on it.
pub fn install(s: &mut Session, child: ProcId) {
    let Some(parent) = s.registry.get(child).and_then(|p| p.parent()) else {
        warn!("vforked child has no recorded parent");
        return;
    };
    let parent_leader = s.registry.leader_of(parent);

    debug!(
        child = s.registry.get(child).map(|p| p.pid().as_raw()),
        "adopting vforked child"
    );

    if let Some(p) = s.registry.get_mut(child) {
        p.handler = Some(EventHandler::VFork(VforkHandler::new()));
    }
    s.registry.change_leader(child, parent_leader);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ProcStatus;
    use crate::testutil::{fixture, word_at, Op};
    use crate::Pid;

    #[test]
    fn child_adopted_and_released_on_exec() {
        let (mut s, state) = fixture(&[(100, ProcStatus::Sleeping)]);
        let parent = s.registry.pid2proc(Pid::from_raw(100)).unwrap();

        let child = s.registry.add(Pid::from_raw(101), Some(parent), None);
        s.registry.get_mut(child).unwrap().set_attached();
        state.borrow_mut().status.insert(101, ProcStatus::TracingStop);

        install(&mut s, child);
        assert_eq!(s.registry.leader_of(child), parent);

        // The child trips the vfork return breakpoint, then execs.
        let ev = Event::new(child, Pid::from_raw(101), EventKind::Breakpoint { addr: 0x7700 });
        assert!(s.dispatch(ev).is_some());

        let ev = Event::new(child, Pid::from_raw(101), EventKind::Exec);
        let out = s.dispatch(ev);
        assert_eq!(out.map(|e| e.kind), Some(EventKind::Exec));

        // The return breakpoint reappears in the parent, the parent is
        // resumed, and the child leads itself again.
        assert_eq!(
            word_at(&state, 100, 0x7700) & 0xff,
            crate::arch::trap_word(0) & 0xff
        );
        assert!(state.borrow().ops_of(100).contains(&Op::ContSyscall(0)));
        assert_eq!(s.registry.leader_of(child), child);
        assert!(s.registry[child].handler.is_none());
    }

    #[test]
    fn child_exit_also_restores_parent() {
        let (mut s, state) = fixture(&[(200, ProcStatus::Sleeping)]);
        let parent = s.registry.pid2proc(Pid::from_raw(200)).unwrap();

        let child = s.registry.add(Pid::from_raw(201), Some(parent), None);
        s.registry.get_mut(child).unwrap().set_attached();
        install(&mut s, child);

        let ev = Event::new(child, Pid::from_raw(201), EventKind::Exit { code: 0 });
        let out = s.dispatch(ev);
        assert!(out.map(|e| e.is_exit()).unwrap_or(false));

        assert!(state.borrow().ops_of(200).contains(&Op::ContSyscall(0)));
        assert_eq!(s.registry.leader_of(child), child);
    }
}
