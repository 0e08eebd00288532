use std::ops::{Index, IndexMut};

use bitflags::bitflags;
use fnv::FnvHashMap as HashMap;
use nix::unistd::Pid;

use crate::arch::Word;
use crate::breakpoint::Breakpoint;
use crate::handlers::EventHandler;
use crate::plt::PltSymbol;

/// Handle to a process slot in the registry arena. Leader and parent
/// links are handles rather than references, so thread groups form no
/// ownership cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcId(u32);

impl ProcId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    struct ProcFlags: u8 {
        /// Task was announced by a fork/clone notification but has not
        /// stopped under trace yet.
        const BEING_CREATED = 0x01;
        /// Sibling threads are suspended while this task single-steps.
        const ONSTEP        = 0x02;
    }
}

/// One OS-level task. Group-wide state (breakpoints, symbols, the event
/// handler driving a stop cycle) lives on the thread-group leader.
pub struct Process {
    pid: Pid,
    parent: Option<ProcId>,
    leader: ProcId,
    flags: ProcFlags,

    pub(crate) handler: Option<EventHandler>,
    pub(crate) breakpoints: HashMap<Word, Breakpoint>,
    pub(crate) symbols: Vec<PltSymbol>,

    /// Syscall number between an observed entry and its return.
    pub(crate) in_syscall: Option<u64>,
}

impl Process {
    fn new(pid: Pid, parent: Option<ProcId>, leader: ProcId) -> Self {
        Self {
            pid,
            parent,
            leader,
            flags: ProcFlags::BEING_CREATED,
            handler: None,
            breakpoints: HashMap::default(),
            symbols: Vec::new(),
            in_syscall: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent(&self) -> Option<ProcId> {
        self.parent
    }

    pub fn leader(&self) -> ProcId {
        self.leader
    }

    pub fn being_created(&self) -> bool {
        self.flags.intersects(ProcFlags::BEING_CREATED)
    }

    pub(crate) fn set_attached(&mut self) {
        self.flags.remove(ProcFlags::BEING_CREATED);
    }

    pub fn onstep(&self) -> bool {
        self.flags.intersects(ProcFlags::ONSTEP)
    }

    pub(crate) fn set_onstep(&mut self, val: bool) {
        if val {
            self.flags.insert(ProcFlags::ONSTEP);
        } else {
            self.flags.remove(ProcFlags::ONSTEP);
        }
    }
}

/// Early-exit control for task visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Cont,
    Stop,
}

/// Arena of traced tasks, keyed by pid and by handle.
#[derive(Default)]
pub struct Registry {
    slots: Vec<Option<Process>>,
    by_pid: HashMap<i32, ProcId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task. With no explicit leader the task leads its own
    /// (initially singleton) group. New tasks start in the being-created
    /// state until their first stop is observed.
    pub fn add(&mut self, pid: Pid, parent: Option<ProcId>, leader: Option<ProcId>) -> ProcId {
        let id = ProcId::from_index(self.slots.len());
        let leader = leader.unwrap_or(id);
        self.slots.push(Some(Process::new(pid, parent, leader)));
        self.by_pid.insert(pid.as_raw(), id);
        id
    }

    pub fn remove(&mut self, id: ProcId) {
        if let Some(slot) = self.slots.get_mut(id.index()) {
            if let Some(proc) = slot.take() {
                self.by_pid.remove(&proc.pid().as_raw());
            }
        }
    }

    pub fn get(&self, id: ProcId) -> Option<&Process> {
        self.slots.get(id.index()).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: ProcId) -> Option<&mut Process> {
        self.slots.get_mut(id.index()).and_then(|s| s.as_mut())
    }

    pub fn pid2proc(&self, pid: Pid) -> Option<ProcId> {
        self.by_pid.get(&pid.as_raw()).copied()
    }

    pub fn leader_of(&self, id: ProcId) -> ProcId {
        self.get(id).map(|p| p.leader()).unwrap_or(id)
    }

    /// Snapshot of every live task in `leader`'s group, leader included.
    pub fn tasks_of(&self, leader: ProcId) -> Vec<ProcId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let proc = slot.as_ref()?;
                (proc.leader() == leader).then(|| ProcId::from_index(i))
            })
            .collect()
    }

    /// Visits every task in `leader`'s group; returns the task on which
    /// `visit` stopped, if any.
    pub fn each_task<F>(&self, leader: ProcId, mut visit: F) -> Option<ProcId>
    where
        F: FnMut(ProcId, &Process) -> Visit,
    {
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(proc) = slot.as_ref() {
                if proc.leader() == leader {
                    let id = ProcId::from_index(i);
                    if visit(id, proc) == Visit::Stop {
                        return Some(id);
                    }
                }
            }
        }
        None
    }

    /// Reassigns `id` to another thread group. Used when a vforked child
    /// is temporarily treated as a thread of its parent.
    pub fn change_leader(&mut self, id: ProcId, new_leader: ProcId) {
        if let Some(proc) = self.get_mut(id) {
            proc.leader = new_leader;
        }
    }
}

impl Index<ProcId> for Registry {
    type Output = Process;

    fn index(&self, id: ProcId) -> &Process {
        self.get(id).expect("stale process handle")
    }
}

impl IndexMut<ProcId> for Registry {
    fn index_mut(&mut self, id: ProcId) -> &mut Process {
        self.get_mut(id).expect("stale process handle")
    }
}
