//! Scripted in-memory backend for protocol tests: serves memory, IPs and
//! task states from shared mutable state and records every resume-shaped
//! request the tracer makes.

use std::cell::RefCell;
use std::mem::size_of;
use std::rc::Rc;

use fnv::FnvHashMap as HashMap;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::arch::Word;
use crate::backend::{Backend, ProcStatus};
use crate::trace::{Error, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Cont(i32),
    ContSyscall(i32),
    Step,
}

#[derive(Default)]
pub(crate) struct MockState {
    pub mem: HashMap<(i32, Word), u8>,
    pub ip: HashMap<i32, Word>,
    pub status: HashMap<i32, ProcStatus>,
    pub ops: Vec<(i32, Op)>,
    pub killed: Vec<(i32, i32)>,
    pub detached: Vec<i32>,
    pub suspended: Vec<i32>,
    pub resumed: Vec<i32>,
}

impl MockState {
    pub fn write_word(&mut self, pid: i32, addr: Word, value: Word) {
        for (i, byte) in value.to_ne_bytes().iter().enumerate() {
            self.mem.insert((pid, addr + i as Word), *byte);
        }
    }

    pub fn read_word(&self, pid: i32, addr: Word) -> Word {
        let mut buf = [0u8; size_of::<Word>()];
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = *self.mem.get(&(pid, addr + i as Word)).unwrap_or(&0);
        }
        Word::from_ne_bytes(buf)
    }

    pub fn set_ip(&mut self, pid: i32, ip: Word) {
        self.ip.insert(pid, ip);
    }

    pub fn ip_of(&self, pid: i32) -> Word {
        *self.ip.get(&pid).unwrap_or(&0)
    }

    pub fn ops_of(&self, pid: i32) -> Vec<Op> {
        self.ops
            .iter()
            .filter(|(p, _)| *p == pid)
            .map(|(_, op)| *op)
            .collect()
    }
}

pub(crate) struct MockBackend(pub Rc<RefCell<MockState>>);

impl Backend for MockBackend {
    fn attach(&mut self, _pid: Pid) -> Result<(), Error> {
        Ok(())
    }

    fn detach(&mut self, pid: Pid) -> Result<(), Error> {
        self.0.borrow_mut().detached.push(pid.as_raw());
        Ok(())
    }

    fn cont(&mut self, pid: Pid, signum: i32) -> Result<(), Error> {
        self.0.borrow_mut().ops.push((pid.as_raw(), Op::Cont(signum)));
        Ok(())
    }

    fn cont_syscall(&mut self, pid: Pid, signum: i32) -> Result<(), Error> {
        self.0
            .borrow_mut()
            .ops
            .push((pid.as_raw(), Op::ContSyscall(signum)));
        Ok(())
    }

    fn step(&mut self, pid: Pid) -> Result<(), Error> {
        self.0.borrow_mut().ops.push((pid.as_raw(), Op::Step));
        Ok(())
    }

    fn suspend_thread(&mut self, tid: Pid) -> Result<(), Error> {
        self.0.borrow_mut().suspended.push(tid.as_raw());
        Ok(())
    }

    fn resume_thread(&mut self, tid: Pid) -> Result<(), Error> {
        self.0.borrow_mut().resumed.push(tid.as_raw());
        Ok(())
    }

    fn list_threads(&self, pid: Pid) -> Result<Vec<Pid>, Error> {
        Ok(vec![pid])
    }

    fn peek(&self, pid: Pid, addr: Word, buf: &mut [u8]) -> Result<(), Error> {
        let state = self.0.borrow();
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = *state.mem.get(&(pid.as_raw(), addr + i as Word)).unwrap_or(&0);
        }
        Ok(())
    }

    fn poke(&mut self, pid: Pid, addr: Word, data: &[u8]) -> Result<(), Error> {
        let mut state = self.0.borrow_mut();
        for (i, byte) in data.iter().enumerate() {
            state.mem.insert((pid.as_raw(), addr + i as Word), *byte);
        }
        Ok(())
    }

    fn get_ip(&self, pid: Pid) -> Result<Word, Error> {
        Ok(self.0.borrow().ip_of(pid.as_raw()))
    }

    fn set_ip(&mut self, pid: Pid, addr: Word) -> Result<(), Error> {
        self.0.borrow_mut().set_ip(pid.as_raw(), addr);
        Ok(())
    }

    fn syscall_nr(&self, _pid: Pid) -> Result<u64, Error> {
        Ok(0)
    }

    fn kill(&mut self, pid: Pid, signal: Signal) -> Result<(), Error> {
        self.0
            .borrow_mut()
            .killed
            .push((pid.as_raw(), signal as i32));
        Ok(())
    }

    fn status(&self, pid: Pid) -> ProcStatus {
        *self
            .0
            .borrow()
            .status
            .get(&pid.as_raw())
            .unwrap_or(&ProcStatus::Invalid)
    }

    fn wait(&mut self, _pid: Pid) -> Result<(WaitStatus, i32), Error> {
        Err(Error::Wait(nix::Error::ECHILD))
    }

    fn event_msg(&self, _pid: Pid) -> Result<i64, Error> {
        Ok(0)
    }

    fn set_tracing_options(&mut self, _pid: Pid) -> Result<(), Error> {
        Ok(())
    }
}

/// Builds a session over the scripted backend with one thread group: the
/// first pid leads, the rest are its threads. All tasks start attached.
pub(crate) fn fixture(procs: &[(i32, ProcStatus)]) -> (Session, Rc<RefCell<MockState>>) {
    let state = Rc::new(RefCell::new(MockState::default()));
    let mut s = Session::with_backend(Box::new(MockBackend(state.clone())));

    let mut leader = None;
    for (pid, st) in procs {
        state.borrow_mut().status.insert(*pid, *st);
        let id = s.registry.add(Pid::from_raw(*pid), leader, leader);
        if let Some(p) = s.registry.get_mut(id) {
            p.set_attached();
        }
        if leader.is_none() {
            leader = Some(id);
        }
    }

    (s, state)
}

pub(crate) fn word_at(state: &Rc<RefCell<MockState>>, pid: i32, addr: Word) -> Word {
    state.borrow().read_word(pid, addr)
}
