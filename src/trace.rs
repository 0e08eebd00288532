use nix::unistd::Pid;
use thiserror::Error as ThisError;
use tracing::{debug, warn};

use crate::arch::{Arch, Word, TRAP_LEN};
use crate::backend::{Backend, Ptrace};
use crate::breakpoint;
use crate::command::Command;
use crate::event::{Event, EventKind, EventQueue};
use crate::handlers::{exiting, stopping, vfork, EventHandler, StopCallbacks};
use crate::proc::{ProcId, Registry};
use crate::util::AsPid;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("could not attach to {0}: {1}")]
    Attach(Pid, nix::Error),
    #[error("could not detach from {0}: {1}")]
    Detach(Pid, nix::Error),
    #[error("could not resume {0}: {1}")]
    Resume(Pid, nix::Error),
    #[error("could not single-step {0}: {1}")]
    Step(Pid, nix::Error),
    #[error("could not signal {0}: {1}")]
    Kill(Pid, nix::Error),
    #[error("memory read at {0:#x} failed: {1}")]
    MemoryRead(Word, nix::Error),
    #[error("memory write at {0:#x} failed: {1}")]
    MemoryWrite(Word, nix::Error),
    #[error("could not access registers of {0}: {1}")]
    Registers(Pid, nix::Error),
    #[error("could not set trace options for {0}: {1}")]
    TraceSetOptions(Pid, nix::Error),
    #[error("could not launch tracee {0:?}: {1}")]
    Launch(Command, nix::Error),
    #[error("error waiting for tracees: {0}")]
    Wait(nix::Error),
    #[error("no breakpoint known at {0:#x}")]
    UnknownBreakpoint(Word),
    #[error("an event handler is already installed on {0}")]
    HandlerBusy(Pid),
    #[error("traced process is gone")]
    ProcessGone,
}

impl Error {
    fn errno(&self) -> Option<nix::Error> {
        match self {
            Error::Attach(_, e)
            | Error::Detach(_, e)
            | Error::Resume(_, e)
            | Error::Step(_, e)
            | Error::Kill(_, e)
            | Error::MemoryRead(_, e)
            | Error::MemoryWrite(_, e)
            | Error::Registers(_, e)
            | Error::TraceSetOptions(_, e)
            | Error::Launch(_, e)
            | Error::Wait(e) => Some(*e),
            Error::UnknownBreakpoint(_) | Error::HandlerBusy(_) | Error::ProcessGone => None,
        }
    }

    /// Whether the failure means the tracee raced us out of existence.
    pub fn vanished(&self) -> bool {
        matches!(self.errno(), Some(nix::Error::ESRCH)) || matches!(self, Error::ProcessGone)
    }
}

/// The tracer: one backend, the registry of traced tasks, and the queue
/// of events held back while a handler owns a thread group. Everything
/// runs on the caller's thread; handlers never block.
pub struct Session {
    pub(crate) backend: Box<dyn Backend>,
    pub registry: Registry,
    pub queue: EventQueue,
    pub arch: Arch,
    /// Pids attached to on request (rather than spawned); these are
    /// detached again on shutdown.
    pub(crate) attached: Vec<Pid>,
}

impl Session {
    pub fn new() -> Self {
        Self::with_backend(Box::new(Ptrace::new()))
    }

    pub fn with_backend(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            registry: Registry::new(),
            queue: EventQueue::new(),
            arch: Arch::default(),
            attached: Vec::new(),
        }
    }

    /// Launches `cmd` under trace. The child announces itself with its
    /// first stop, which completes the attach.
    pub fn spawn(&mut self, cmd: &Command) -> Result<ProcId, Error> {
        let pid = cmd.launch().map_err(|e| Error::Launch(cmd.clone(), e))?;
        debug!(pid = pid.as_raw(), "launched tracee");
        Ok(self.registry.add(pid, None, None))
    }

    /// Attaches to a running process and every thread it currently has.
    pub fn attach_process<P: AsPid>(&mut self, pid: P) -> Result<ProcId, Error> {
        let pid = pid.as_pid();
        self.backend.attach(pid)?;
        self.backend.set_tracing_options(pid)?;

        let leader = self.registry.add(pid, None, None);
        if let Some(p) = self.registry.get_mut(leader) {
            p.set_attached();
        }

        for tid in self.backend.list_threads(pid)? {
            if tid == pid {
                continue;
            }
            match self.backend.attach(tid) {
                Ok(()) => {
                    self.backend.set_tracing_options(tid).ok();
                    let task = self.registry.add(tid, Some(leader), Some(leader));
                    if let Some(p) = self.registry.get_mut(task) {
                        p.set_attached();
                    }
                }
                // The thread may have exited between the listing and the
                // attach.
                Err(e) => warn!(tid = tid.as_raw(), error = %e, "couldn't attach thread"),
            }
        }

        self.attached.push(pid);
        Ok(leader)
    }

    /// Releases a single task.
    pub fn detach_pid<P: AsPid>(&mut self, pid: P) -> Result<(), Error> {
        let pid = pid.as_pid();
        self.backend.detach(pid)?;
        if let Some(id) = self.registry.pid2proc(pid) {
            self.registry.remove(id);
        }
        Ok(())
    }

    /// Returns the next canonical event: queued replays first, then fresh
    /// kernel notifications.
    pub fn next_event(&mut self) -> Result<Event, Error> {
        loop {
            if let Some(ev) = self.queue.dequeue() {
                return Ok(ev);
            }
            let (status, raw) = self.backend.wait(Pid::from_raw(-1))?;
            if let Some(ev) = self.canonicalize(status, raw) {
                return Ok(ev);
            }
        }
    }

    /// Turns a raw wait status into a canonical event, creating processes
    /// for newly announced tasks as a side effect.
    fn canonicalize(&mut self, status: nix::sys::wait::WaitStatus, raw: i32) -> Option<Event> {
        let pid = status.pid()?;

        let proc = match self.registry.pid2proc(pid) {
            Some(id) => id,
            None => {
                // A new task can announce itself before its parent's
                // clone notification arrives.
                debug!(pid = pid.as_raw(), "stop from an unannounced task");
                self.registry.add(pid, None, None)
            }
        };

        if libc::WIFEXITED(raw) {
            return Some(Event::new(
                proc,
                pid,
                EventKind::Exit {
                    code: libc::WEXITSTATUS(raw),
                },
            ));
        }
        if libc::WIFSIGNALED(raw) {
            return Some(Event::new(
                proc,
                pid,
                EventKind::ExitSignal {
                    signum: libc::WTERMSIG(raw),
                },
            ));
        }
        if !libc::WIFSTOPPED(raw) {
            return None;
        }

        let signum = libc::WSTOPSIG(raw);
        let trace_event = (raw >> 16) & 0xff;

        // First stop of a fresh task completes its attach; nothing
        // user-visible happened yet.
        if self.registry.get(proc).map_or(false, |p| p.being_created()) {
            if let Some(p) = self.registry.get_mut(proc) {
                p.set_attached();
            }
            self.backend.set_tracing_options(pid).ok();
            return Some(Event::new(proc, pid, EventKind::None));
        }

        if trace_event != 0 {
            return self.canonicalize_trace_event(proc, pid, trace_event);
        }

        if signum == (libc::SIGTRAP | 0x80) {
            // Syscall boundary; pair entries with returns per task.
            let pending = self.registry.get(proc).and_then(|p| p.in_syscall);
            let kind = match pending {
                Some(nr) => {
                    if let Some(p) = self.registry.get_mut(proc) {
                        p.in_syscall = None;
                    }
                    EventKind::SyscallExit { nr }
                }
                None => {
                    let nr = self.backend.syscall_nr(pid).unwrap_or(0);
                    if let Some(p) = self.registry.get_mut(proc) {
                        p.in_syscall = Some(nr);
                    }
                    EventKind::SyscallEnter { nr }
                }
            };
            return Some(Event::new(proc, pid, kind));
        }

        if signum == libc::SIGTRAP {
            let addr = self
                .backend
                .get_ip(pid)
                .map(|ip| ip.wrapping_sub(TRAP_LEN))
                .unwrap_or(0);
            return Some(Event::new(proc, pid, EventKind::Breakpoint { addr }));
        }

        Some(Event::new(proc, pid, EventKind::Signal { signum }))
    }

    fn canonicalize_trace_event(&mut self, proc: ProcId, pid: Pid, trace_event: i32) -> Option<Event> {
        match trace_event {
            libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_CLONE => {
                let child = match self.backend.event_msg(pid) {
                    Ok(msg) => Pid::from_raw(msg as i32),
                    Err(e) => {
                        warn!(pid = pid.as_raw(), error = %e, "couldn't read child pid");
                        return Some(Event::new(proc, pid, EventKind::None));
                    }
                };

                if self.registry.pid2proc(child).is_none() {
                    let leader = if trace_event == libc::PTRACE_EVENT_CLONE {
                        // A clone stays in the caller's thread group.
                        Some(self.registry.leader_of(proc))
                    } else {
                        None
                    };
                    self.registry.add(child, Some(proc), leader);
                }

                let kind = match trace_event {
                    libc::PTRACE_EVENT_FORK => EventKind::Fork { child },
                    libc::PTRACE_EVENT_VFORK => EventKind::Vfork { child },
                    _ => EventKind::Clone { child },
                };
                Some(Event::new(proc, pid, kind))
            }
            libc::PTRACE_EVENT_EXEC => Some(Event::new(proc, pid, EventKind::Exec)),
            _ => {
                debug!(pid = pid.as_raw(), trace_event, "unhandled trace event");
                Some(Event::new(proc, pid, EventKind::None))
            }
        }
    }

    /// Routes an event through the installed handler: the task's own
    /// handler first, then its leader's. Returns the event if no handler
    /// consumed it.
    pub fn dispatch(&mut self, ev: Event) -> Option<Event> {
        let owner = {
            let Some(proc) = self.registry.get(ev.proc) else {
                return Some(ev);
            };
            if proc.handler.is_some() {
                ev.proc
            } else {
                let leader = proc.leader();
                if leader != ev.proc
                    && self.registry.get(leader).map_or(false, |p| p.handler.is_some())
                {
                    leader
                } else {
                    return Some(ev);
                }
            }
        };

        let mut handler = self.registry.get_mut(owner).and_then(|p| p.handler.take())?;
        let out = handler.on_event(self, ev);

        if !handler.is_done() {
            if let Some(p) = self.registry.get_mut(owner) {
                p.handler = Some(handler);
            }
        }
        out
    }

    /// The dispatch layer: handler chain first, then default policy.
    /// Breakpoint hits are resolved here; everything else that survives
    /// is returned for the embedding front end to report and resume.
    pub fn process_event(&mut self, ev: Event) -> Option<Event> {
        let ev = self.dispatch(ev)?;

        match ev.kind {
            EventKind::None => {
                self.continue_process(ev.proc);
                None
            }
            EventKind::Breakpoint { addr } => {
                let leader = self.registry.leader_of(ev.proc);
                let known = self
                    .registry
                    .get(leader)
                    .map_or(false, |p| p.breakpoints.contains_key(&addr));
                if !known {
                    return Some(ev);
                }

                // The processor has run past the trap; put the task back
                // on the breakpoint before anything else looks at it.
                self.backend.set_ip(ev.pid, addr).ok();
                breakpoint::on_hit(self, ev.proc, addr);
                breakpoint::on_continue(self, ev.proc, addr);
                None
            }
            EventKind::Exit { .. } | EventKind::ExitSignal { .. } => {
                let leader = self.registry.leader_of(ev.proc);
                if ev.proc == leader && self.registry.tasks_of(leader).len() > 1 {
                    // The leader lingers as a zombie while other threads
                    // of the group still run.
                } else {
                    self.registry.remove(ev.proc);
                }
                Some(ev)
            }
            EventKind::Vfork { child } => {
                if let Some(child) = self.registry.pid2proc(child) {
                    self.continue_after_vfork(child);
                }
                Some(ev)
            }
            _ => Some(ev),
        }
    }

    /// Resumes a task, unless events for it are still queued for replay
    /// (resuming it then would reorder its event stream).
    pub fn continue_process(&mut self, proc: ProcId) {
        let Some(p) = self.registry.get(proc) else { return };
        let pid = p.pid();

        if p.onstep() {
            self.resume_siblings(proc);
        }

        if self.queue.has_events_for(pid) {
            debug!(pid = pid.as_raw(), "deferring continue, events queued");
            return;
        }

        // Always trace to the next syscall boundary so fork, clone and
        // exec stay in view.
        if let Err(e) = self.backend.cont_syscall(pid, 0) {
            if !e.vanished() {
                warn!(pid = pid.as_raw(), error = %e, "couldn't continue");
            }
        }
    }

    fn resume_siblings(&mut self, proc: ProcId) {
        let leader = self.registry.leader_of(proc);
        for task in self.registry.tasks_of(leader) {
            if task == proc {
                continue;
            }
            if let Some(pid) = self.registry.get(task).map(|p| p.pid()) {
                self.backend.resume_thread(pid).ok();
            }
        }
        if let Some(p) = self.registry.get_mut(proc) {
            p.set_onstep(false);
        }
    }

    /// Resume policy after a breakpoint hit: a disarmed site or an
    /// architecture that cannot step safely resumes directly; otherwise
    /// the re-enablement cycle runs.
    pub fn continue_after_breakpoint(&mut self, proc: ProcId, addr: Word) {
        debug!(addr = format_args!("{addr:#x}"), "continue after breakpoint");

        if let Some(pid) = self.registry.get(proc).map(|p| p.pid()) {
            self.backend.set_ip(pid, addr).ok();
        }

        let leader = self.registry.leader_of(proc);
        let enabled = self
            .registry
            .get(leader)
            .and_then(|p| p.breakpoints.get(&addr))
            .map_or(false, |bp| bp.is_enabled());

        if !enabled || !self.arch.can_singlestep_safely {
            self.continue_process(proc);
            return;
        }

        if let Err(e) = stopping::install(self, proc, addr, StopCallbacks::default()) {
            warn!(error = %e, "couldn't install stop handler; resuming without re-enablement");
            self.continue_process(proc);
        }
    }

    /// Resumes to the next syscall boundary, re-delivering an observed
    /// signal.
    pub fn continue_after_signal(&mut self, proc: ProcId, signum: i32) {
        if let Some(pid) = self.registry.get(proc).map(|p| p.pid()) {
            if let Err(e) = self.backend.cont_syscall(pid, signum) {
                if !e.vanished() {
                    warn!(pid = pid.as_raw(), error = %e, "couldn't deliver signal");
                }
            }
        }
    }

    /// Resume policy at syscall boundaries. Syscall returns observed
    /// while a re-enablement cycle holds the group are recorded by the
    /// cycle; resuming here would let the task slip out of quiescence.
    pub fn continue_after_syscall(&mut self, proc: ProcId, _nr: u64, is_return: bool) {
        if is_return {
            let leader = self.registry.leader_of(proc);
            if self.is_mid_stopping(proc) || self.is_mid_stopping(leader) {
                debug!("mid-cycle syscall return, not continuing");
                return;
            }
        }
        self.continue_process(proc);
    }

    /// Entry point on a vfork notification: adopt the child into the
    /// parent's group until it execs or exits.
    pub fn continue_after_vfork(&mut self, child: ProcId) {
        vfork::install(self, child);
    }

    pub fn continue_after_exec(&mut self, proc: ProcId) {
        self.continue_process(proc);
    }

    fn is_mid_stopping(&self, proc: ProcId) -> bool {
        self.registry
            .get(proc)
            .map_or(false, |p| matches!(p.handler, Some(EventHandler::Stopping(_))))
    }

    /// Begins tracer shutdown: every externally-attached process gets an
    /// exit handler that quiesces, unpatches and detaches its group. A
    /// running re-enablement cycle finishes first.
    pub fn shutdown(&mut self) {
        for pid in self.attached.clone() {
            let Some(id) = self.registry.pid2proc(pid) else { continue };
            let leader = self.registry.leader_of(id);
            if !exiting::install(self, leader) {
                warn!(pid = pid.as_raw(), "couldn't install exit handler");
            }
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
