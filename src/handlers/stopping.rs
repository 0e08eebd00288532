//! Stop-the-world breakpoint re-enablement.
//!
//! Stepping one thread past a breakpoint requires restoring the original
//! instruction for the duration of the step. Any sibling thread running
//! through the unplanted site in that window would escape unnoticed, so
//! the whole group is brought to quiescence first: every thread is either
//! SIGSTOP-ed, already parked, or blocked in the kernel as a vfork parent.
//! Only then is the designated thread (`teb`) stepped, the trap re-armed,
//! and everyone resumed.

use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::arch::{SwStep, Word, MAX_SCRATCH_BREAKPOINTS};
use crate::breakpoint;
use crate::event::{event_exit_or_none, Event, EventKind};
use crate::proc::ProcId;
use crate::trace::{Error, Session};

use super::{
    all_blocked, all_stops_accountable, await_sigstop_delivery, continue_for_sigstop_delivery,
    detach_process, handle_stopping_event, send_sigstop, undo_breakpoint, Decision, EventHandler,
    PidSet,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopState {
    /// Waiting for every thread of the group to block.
    Stopping,
    /// `teb` is stepping past the disarmed breakpoint slot.
    SingleStep,
    /// Trap re-armed; draining SIGSTOPs still in flight.
    Sinking,
    /// Running to a scratch breakpoint so detach does not race the
    /// kernel's step SIGTRAP.
    UglyWorkaround,
}

/// Policy hooks customizing one re-enablement cycle.
pub struct StopCallbacks {
    /// Runs once the group is quiescent. The default disarms the
    /// breakpoint and issues the single-step.
    pub on_all_stopped: fn(&mut Session, &mut StoppingHandler),
    /// Polled after each completed step: `Cont` steps again, `Stop`
    /// re-arms, `Fail` retires the breakpoint and stops.
    pub keep_stepping_p: fn(&mut Session, &mut StoppingHandler) -> Decision,
    /// Polled when the cycle completes: `Cont` runs the detach-safety
    /// workaround before tearing down.
    pub ugly_workaround_p: fn(&mut Session, &mut StoppingHandler) -> Decision,
}

fn no(_: &mut Session, _: &mut StoppingHandler) -> Decision {
    Decision::Stop
}

impl Default for StopCallbacks {
    fn default() -> Self {
        Self {
            on_all_stopped: disable_and_singlestep,
            keep_stepping_p: no,
            ugly_workaround_p: no,
        }
    }
}

/// Event handler driving one stop-the-world cycle on a thread group.
pub struct StoppingHandler {
    state: StopState,
    /// The thread stepping over the breakpoint being re-enabled.
    teb: Option<ProcId>,
    /// Site being re-enabled; cleared once the step is over.
    bp_addr: Option<Word>,
    pub(crate) pids: PidSet,
    cbs: StopCallbacks,
    /// One-shot breakpoints planted by a software single-step.
    scratch: [Word; MAX_SCRATCH_BREAKPOINTS],
    /// Detach the group instead of resuming it when the cycle ends.
    pub(crate) exiting: bool,
    done: bool,
}

impl StoppingHandler {
    fn new(teb: ProcId, bp_addr: Word, cbs: StopCallbacks) -> Self {
        Self {
            state: StopState::Stopping,
            teb: Some(teb),
            bp_addr: Some(bp_addr),
            pids: PidSet::default(),
            cbs,
            scratch: [0; MAX_SCRATCH_BREAKPOINTS],
            exiting: false,
            done: false,
        }
    }

    pub fn state(&self) -> StopState {
        self.state
    }

    pub fn teb(&self) -> Option<ProcId> {
        self.teb
    }

    pub fn breakpoint_addr(&self) -> Option<Word> {
        self.bp_addr
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn on_event(&mut self, s: &mut Session, ev: Event) -> Option<Event> {
        let task = ev.proc;
        let task_pid = ev.pid.as_raw();
        let leader = s.registry.leader_of(task);

        debug!(
            pid = task_pid,
            state = ?self.state,
            kind = ?ev.kind,
            "stop handler event"
        );

        if self.pids.get(task_pid).is_none() && ev.kind != EventKind::None {
            warn!(pid = task_pid, "event from a task outside the pid set");
        }

        let mut event = Some(ev);
        handle_stopping_event(self.pids.get_mut(task_pid), &mut event);

        let mut event_to_queue = !event_exit_or_none(&event);

        // A task that exits mid-cycle stops participating.
        if event.map_or(false, |e| e.is_exit()) {
            if let Some(info) = self.pids.get_mut(task_pid) {
                info.pid = 0;
            }
        }

        // Syscall returns are recorded but neither queued nor replied to;
        // the task is resumed when the cycle completes.
        if let Some(EventKind::SyscallExit { .. }) = event.map(|e| e.kind) {
            event_to_queue = false;
            if let Some(info) = self.pids.get_mut(task_pid) {
                info.sysret = true;
            }
        }

        match self.state {
            StopState::Stopping => {
                if all_blocked(s, leader, &self.pids) {
                    let on_all_stopped = self.cbs.on_all_stopped;
                    on_all_stopped(s, self);
                }
            }
            StopState::SingleStep => {
                if event.is_some() && Some(task) == self.teb {
                    self.singlestep_event(s, leader, task_pid, &mut event);
                }
            }
            StopState::Sinking => {
                self.check_sinking(s, leader, task_pid, &event);
            }
            StopState::UglyWorkaround => {
                self.ugly_workaround_event(s, leader, task, &mut event);
            }
        }

        match event {
            Some(ev) if event_to_queue => {
                s.queue.enqueue(ev);
                None
            }
            other => other,
        }
    }

    /// An event from `teb` while it was supposed to be stepping.
    fn singlestep_event(
        &mut self,
        s: &mut Session,
        leader: ProcId,
        task_pid: i32,
        event: &mut Option<Event>,
    ) {
        let Some(teb) = self.teb else { return };
        let kind = match *event {
            Some(ev) => ev.kind,
            None => return,
        };

        if let EventKind::Breakpoint { .. } = kind {
            // A trap rather than a plain step completion: either one of
            // our scratch step breakpoints, or a registered breakpoint
            // whose hit hook must run before we judge the step.
            if let Some(pid) = s.registry.get(teb).map(|p| p.pid()) {
                if let Ok(ip) = s.backend.get_ip(pid) {
                    if self.scratch.iter().any(|&a| a != 0 && a == ip) {
                        self.remove_scratch_breakpoints(s);
                    } else if s
                        .registry
                        .get(leader)
                        .map_or(false, |p| p.breakpoints.contains_key(&ip))
                    {
                        breakpoint::on_hit(s, teb, ip);
                    }
                }
            }
        }

        if matches!(kind, EventKind::Signal { .. }) {
            // A queued signal landed instead of the expected trap. The
            // task may not sit on an instruction boundary, so step again
            // unconditionally.
            if !self.singlestep(s) {
                self.singlestep_error(s);
                self.finish_step(s, leader, task_pid, event);
            }
            return;
        }

        let keep_stepping_p = self.cbs.keep_stepping_p;
        match keep_stepping_p(s, self) {
            Decision::Cont => {
                if matches!(kind, EventKind::Breakpoint { .. }) {
                    *event = None; // sink the step notification
                }
                if self.singlestep(s) {
                    return;
                }
                self.singlestep_error(s);
                self.finish_step(s, leader, task_pid, event);
                return;
            }
            Decision::Fail => {
                // The policy cannot tell where the step stands; retire
                // the breakpoint instead of resuming in an unknown state.
                if let Some(addr) = self.bp_addr {
                    breakpoint::delete(s, teb, addr);
                }
            }
            Decision::Stop => {}
        }

        // Re-arm the trap we stepped over, if the site is still
        // referenced.
        if let Some(addr) = self.bp_addr {
            let referenced = s
                .registry
                .get(leader)
                .and_then(|p| p.breakpoints.get(&addr))
                .map_or(false, |bp| bp.refs() > 0);
            if referenced {
                if let Err(e) = breakpoint::enable(s, teb, addr) {
                    if !e.vanished() {
                        warn!(
                            addr = format_args!("{addr:#x}"),
                            error = %e,
                            "could not re-enable breakpoint"
                        );
                    }
                }
            }
        }

        self.finish_step(s, leader, task_pid, event);
    }

    /// Common tail of the single-step phase: release pending SIGSTOPs,
    /// drop step bookkeeping, move to the sinking phase.
    fn finish_step(
        &mut self,
        s: &mut Session,
        leader: ProcId,
        task_pid: i32,
        event: &mut Option<Event>,
    ) {
        self.post_singlestep(s, event);
        self.state = StopState::Sinking;
        self.check_sinking(s, leader, task_pid, event);
    }

    fn post_singlestep(&mut self, s: &mut Session, event: &mut Option<Event>) {
        continue_for_sigstop_delivery(&mut *s.backend, &self.pids);

        if matches!(event.map(|e| e.kind), Some(EventKind::Breakpoint { .. })) {
            *event = None; // handled
        }

        self.remove_scratch_breakpoints(s);
        self.bp_addr = None;
    }

    fn check_sinking(&mut self, s: &mut Session, leader: ProcId, task_pid: i32, event: &Option<Event>) {
        if await_sigstop_delivery(&mut *s.backend, &self.pids, task_pid, event) {
            self.stopping_done(s, leader);
        }
    }

    fn stopping_done(&mut self, s: &mut Session, leader: ProcId) {
        debug!("re-enablement cycle complete");

        if !self.exiting {
            // Resume every task we owe a resume: those whose SIGSTOP we
            // consumed and those parked on a syscall return.
            let resume: Vec<i32> = self
                .pids
                .iter()
                .filter(|t| t.pid != 0 && (t.delivered || t.sysret))
                .map(|t| t.pid)
                .collect();
            for pid in resume {
                if let Some(id) = s.registry.pid2proc(Pid::from_raw(pid)) {
                    s.continue_process(id);
                }
            }
            if let Some(teb) = self.teb {
                s.continue_process(teb);
            }
        }

        if self.exiting {
            self.state = StopState::UglyWorkaround;
            self.ugly_workaround(s);
        } else {
            let ugly_workaround_p = self.cbs.ugly_workaround_p;
            match ugly_workaround_p(s, self) {
                Decision::Cont => {
                    self.state = StopState::UglyWorkaround;
                    self.ugly_workaround(s);
                }
                Decision::Stop | Decision::Fail => {
                    self.done = true;
                }
            }
        }
    }

    /// Some kernels kill a tracee detached right after a single-step with
    /// the step's SIGTRAP. Plant a breakpoint at the current IP and let
    /// the task run to it; that trap is a safe boundary to detach from.
    fn ugly_workaround(&mut self, s: &mut Session) {
        let Some(teb) = self.teb else { return };
        let Some(pid) = s.registry.get(teb).map(|p| p.pid()) else { return };
        let Ok(ip) = s.backend.get_ip(pid) else { return };

        let leader = s.registry.leader_of(teb);
        let known = s
            .registry
            .get(leader)
            .map_or(false, |p| p.breakpoints.contains_key(&ip));
        if known {
            breakpoint::enable(s, teb, ip).ok();
        } else {
            breakpoint::insert(s, teb, ip, None).ok();
        }
        s.backend.cont(pid, 0).ok();
    }

    fn ugly_workaround_event(
        &mut self,
        s: &mut Session,
        leader: ProcId,
        task: ProcId,
        event: &mut Option<Event>,
    ) {
        let Some(ev) = *event else { return };

        if let EventKind::Breakpoint { .. } = ev.kind {
            undo_breakpoint(s, &ev, leader);
            if Some(task) == self.teb {
                self.teb = None;
            }
        }

        if self.teb.is_none() && all_stops_accountable(s, &self.pids) {
            detach_process(s, leader);
            self.done = true;
            *event = None; // handled
        }
    }

    /// Issues one single-step of `teb`, by hardware step or by scratch
    /// breakpoints when the architecture asks for the software fallback.
    /// Returns false if the step could not be issued.
    fn singlestep(&mut self, s: &mut Session) -> bool {
        let Some(teb) = self.teb else { return false };
        let Some(pid) = s.registry.get(teb).map(|p| p.pid()) else { return false };

        let mut addrs = Vec::new();
        match (s.arch.sw_singlestep)(&mut *s.backend, pid, &mut addrs) {
            SwStep::Hw => {
                self.suspend_siblings(s, teb);
                debug!(pid = pid.as_raw(), "hardware single-step");
                match s.backend.step(pid) {
                    Ok(()) => true,
                    Err(e) => {
                        if !e.vanished() {
                            warn!(pid = pid.as_raw(), error = %e, "single-step failed");
                        }
                        false
                    }
                }
            }
            SwStep::Sw => {
                for addr in addrs {
                    if !self.add_scratch(addr) {
                        // The step fans out to more sites than any real
                        // instruction can.
                        panic!("single-step scratch breakpoint overflow");
                    }
                    if let Err(e) = breakpoint::insert(s, teb, addr, None) {
                        warn!(addr = format_args!("{addr:#x}"), error = %e, "couldn't plant step breakpoint");
                    }
                }
                s.backend.cont(pid, 0).is_ok()
            }
            SwStep::Fail => false,
        }
    }

    /// Parks every sibling of `teb` for the duration of a hardware step,
    /// marking `teb` so the matching resume happens on continue.
    fn suspend_siblings(&mut self, s: &mut Session, teb: ProcId) {
        let leader = s.registry.leader_of(teb);
        let tasks = s.registry.tasks_of(leader);
        if tasks.len() == 1 {
            return;
        }

        for &task in tasks.iter().filter(|&&t| t != teb) {
            if let Some(pid) = s.registry.get(task).map(|p| p.pid()) {
                s.backend.suspend_thread(pid).ok();
            }
        }
        if let Some(p) = s.registry.get_mut(teb) {
            p.set_onstep(true);
        }
    }

    fn add_scratch(&mut self, addr: Word) -> bool {
        for slot in self.scratch.iter_mut() {
            if *slot == 0 {
                *slot = addr;
                return true;
            }
        }
        false
    }

    fn remove_scratch_breakpoints(&mut self, s: &mut Session) {
        let Some(teb) = self.teb else { return };
        for i in 0..self.scratch.len() {
            let addr = self.scratch[i];
            if addr != 0 {
                breakpoint::delete(s, teb, addr);
                self.scratch[i] = 0;
            }
        }
    }

    fn singlestep_error(&mut self, s: &mut Session) {
        let Some(teb) = self.teb else { return };
        let pid = s.registry.get(teb).map(|p| p.pid().as_raw()).unwrap_or(0);
        if let Some(addr) = self.bp_addr {
            warn!(
                pid,
                addr = format_args!("{addr:#x}"),
                "couldn't step past breakpoint; retiring it"
            );
            breakpoint::delete(s, teb, addr);
        }
    }
}

/// Default quiescence action: disarm the breakpoint being re-enabled and
/// single-step the owning thread past it.
pub fn disable_and_singlestep(s: &mut Session, h: &mut StoppingHandler) {
    if let (Some(teb), Some(addr)) = (h.teb, h.bp_addr) {
        debug!(
            addr = format_args!("{addr:#x}"),
            "all threads blocked; stepping"
        );
        let leader = s.registry.leader_of(teb);
        let enabled = s
            .registry
            .get(leader)
            .and_then(|p| p.breakpoints.get(&addr))
            .map_or(false, |bp| bp.is_enabled());
        if enabled {
            breakpoint::disable(s, teb, addr).ok();
        }
        if !h.singlestep(s) {
            h.singlestep_error(s);
        }
    }
    h.state = StopState::SingleStep;
}

/// Installs a re-enablement cycle for the breakpoint at `bp_addr`, hit by
/// `proc`. Rejected if the group already runs a handler. Every sibling is
/// asked to stop, and a synthetic kick drives the protocol forward in
/// case the group is already quiescent.
pub fn install(
    s: &mut Session,
    proc: ProcId,
    bp_addr: Word,
    cbs: StopCallbacks,
) -> Result<(), Error> {
    let leader = s.registry.leader_of(proc);
    let leader_pid = s.registry.get(leader).ok_or(Error::ProcessGone)?.pid();
    if s.registry[leader].handler.is_some() {
        return Err(Error::HandlerBusy(leader_pid));
    }

    let pid = s.registry.get(proc).ok_or(Error::ProcessGone)?.pid();
    debug!(
        pid = pid.as_raw(),
        addr = format_args!("{bp_addr:#x}"),
        "installing stop handler"
    );

    let mut handler = StoppingHandler::new(proc, bp_addr, cbs);
    for task in s.registry.tasks_of(leader) {
        send_sigstop(s, task, &mut handler.pids);
    }

    let kick = Event::new(proc, pid, EventKind::None);
    handler.on_event(s, kick);

    if !handler.done {
        if let Some(p) = s.registry.get_mut(leader) {
            p.handler = Some(EventHandler::Stopping(handler));
        }
    }
    Ok(())
}
