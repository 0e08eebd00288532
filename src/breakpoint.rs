use tracing::{debug, warn};

use crate::arch::{self, Word};
use crate::proc::ProcId;
use crate::trace::{Error, Session};

/// Breakpoint hook. Receives the session, the task the event belongs to
/// and the breakpoint address.
pub type BpCallback = fn(&mut Session, ProcId, Word);

/// Per-breakpoint hooks. `on_hit` runs when the dispatcher sees a hit,
/// `on_continue` when the hit decides how to resume, `on_retract` on
/// detach-time cleanup.
#[derive(Clone, Copy, Default)]
pub struct BpCallbacks {
    pub on_hit: Option<BpCallback>,
    pub on_continue: Option<BpCallback>,
    pub on_retract: Option<BpCallback>,
}

/// A software breakpoint. `saved` holds the original text word while the
/// trap instruction is planted; the site is never left half-written. The
/// reference count tracks how many inserts share the address (shared
/// libraries map the same entry for several symbols).
pub struct Breakpoint {
    addr: Word,
    saved: Option<Word>,
    refs: u32,
    pub(crate) symbol: Option<usize>,
    pub(crate) cbs: BpCallbacks,
}

impl Breakpoint {
    fn new(addr: Word, symbol: Option<usize>) -> Self {
        Self {
            addr,
            saved: None,
            refs: 0,
            symbol,
            cbs: BpCallbacks::default(),
        }
    }

    pub fn addr(&self) -> Word {
        self.addr
    }

    /// Whether the trap instruction is currently in place in the tracee.
    pub fn is_enabled(&self) -> bool {
        self.saved.is_some()
    }

    pub fn refs(&self) -> u32 {
        self.refs
    }

    pub fn symbol(&self) -> Option<usize> {
        self.symbol
    }
}

/// Inserts a breakpoint at `addr` in `proc`'s group. Idempotent: an
/// existing breakpoint gains a reference instead. The trap is written when
/// the reference count first becomes positive.
pub fn insert(s: &mut Session, proc: ProcId, addr: Word, symbol: Option<usize>) -> Result<(), Error> {
    let leader = s.registry.leader_of(proc);
    let table = &mut s
        .registry
        .get_mut(leader)
        .ok_or(Error::ProcessGone)?
        .breakpoints;

    let bp = table.entry(addr).or_insert_with(|| Breakpoint::new(addr, symbol));
    bp.refs += 1;
    let first = bp.refs == 1;
    debug!(addr = format_args!("{addr:#x}"), refs = bp.refs, "insert breakpoint");

    if first {
        enable(s, proc, addr)?;
    }
    Ok(())
}

/// Drops one reference; the last reference restores the original word and
/// removes the table entry.
pub fn delete(s: &mut Session, proc: ProcId, addr: Word) {
    let leader = s.registry.leader_of(proc);
    let Some(table) = s.registry.get_mut(leader).map(|p| &mut p.breakpoints) else {
        return;
    };
    let Some(bp) = table.get_mut(&addr) else {
        return;
    };

    bp.refs = bp.refs.saturating_sub(1);
    if bp.refs > 0 {
        return;
    }

    if let Err(e) = disable(s, proc, addr) {
        if !e.vanished() {
            warn!(addr = format_args!("{addr:#x}"), error = %e, "could not retract breakpoint");
        }
    }
    if let Some(p) = s.registry.get_mut(leader) {
        p.breakpoints.remove(&addr);
    }
}

/// Writes the trap instruction at `addr`, saving the original word.
pub fn enable(s: &mut Session, proc: ProcId, addr: Word) -> Result<(), Error> {
    let leader = s.registry.leader_of(proc);
    let pid = s.registry.get(proc).ok_or(Error::ProcessGone)?.pid();

    let enabled = s
        .registry
        .get(leader)
        .and_then(|p| p.breakpoints.get(&addr))
        .map(|bp| bp.is_enabled())
        .ok_or(Error::UnknownBreakpoint(addr))?;
    if enabled {
        return Ok(());
    }

    let word = s.backend.peek_word(pid, addr)?;
    s.backend.poke_word(pid, addr, arch::trap_word(word))?;

    if let Some(bp) = s.registry.get_mut(leader).and_then(|p| p.breakpoints.get_mut(&addr)) {
        bp.saved = Some(word);
    }
    debug!(pid = pid.as_raw(), addr = format_args!("{addr:#x}"), "breakpoint enabled");
    Ok(())
}

/// Restores the original word at `addr`.
pub fn disable(s: &mut Session, proc: ProcId, addr: Word) -> Result<(), Error> {
    let leader = s.registry.leader_of(proc);
    let pid = s.registry.get(proc).ok_or(Error::ProcessGone)?.pid();

    let saved = s
        .registry
        .get(leader)
        .and_then(|p| p.breakpoints.get(&addr))
        .and_then(|bp| bp.saved);
    let Some(saved) = saved else {
        return Ok(());
    };

    s.backend.poke_word(pid, addr, saved)?;
    if let Some(bp) = s.registry.get_mut(leader).and_then(|p| p.breakpoints.get_mut(&addr)) {
        bp.saved = None;
    }
    debug!(pid = pid.as_raw(), addr = format_args!("{addr:#x}"), "breakpoint disabled");
    Ok(())
}

/// Restores original words for every planted breakpoint of the group.
pub fn disable_all(s: &mut Session, leader: ProcId) {
    let addrs: Vec<Word> = match s.registry.get(leader) {
        Some(p) => p
            .breakpoints
            .values()
            .filter(|bp| bp.is_enabled())
            .map(|bp| bp.addr())
            .collect(),
        None => return,
    };

    for addr in addrs {
        if let Err(e) = disable(s, leader, addr) {
            if !e.vanished() {
                warn!(addr = format_args!("{addr:#x}"), error = %e, "could not disable breakpoint");
            }
        }
    }
}

/// Runs every breakpoint's retract hook; used on detach-time cleanup.
pub fn retract_all(s: &mut Session, leader: ProcId) {
    let hooks: Vec<(Word, BpCallback)> = match s.registry.get(leader) {
        Some(p) => p
            .breakpoints
            .values()
            .filter_map(|bp| bp.cbs.on_retract.map(|cb| (bp.addr(), cb)))
            .collect(),
        None => return,
    };

    for (addr, cb) in hooks {
        cb(s, leader, addr);
    }
}

/// Installs hooks on an existing breakpoint.
pub fn set_callbacks(s: &mut Session, proc: ProcId, addr: Word, cbs: BpCallbacks) {
    let leader = s.registry.leader_of(proc);
    if let Some(bp) = s.registry.get_mut(leader).and_then(|p| p.breakpoints.get_mut(&addr)) {
        bp.cbs = cbs;
    }
}

/// Invoked by the dispatcher when a breakpoint event arrives at `addr`.
pub fn on_hit(s: &mut Session, proc: ProcId, addr: Word) {
    let leader = s.registry.leader_of(proc);
    let cb = s
        .registry
        .get(leader)
        .and_then(|p| p.breakpoints.get(&addr))
        .and_then(|bp| bp.cbs.on_hit);
    if let Some(cb) = cb {
        cb(s, proc, addr);
    }
}

/// Invoked when the hit decides how to resume. Defaults to the
/// stop-the-world re-enablement path.
pub fn on_continue(s: &mut Session, proc: ProcId, addr: Word) {
    let leader = s.registry.leader_of(proc);
    let cb = s
        .registry
        .get(leader)
        .and_then(|p| p.breakpoints.get(&addr))
        .and_then(|bp| bp.cbs.on_continue);
    match cb {
        Some(cb) => cb(s, proc, addr),
        None => s.continue_after_breakpoint(proc, addr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fixture, word_at};

    #[test]
    fn trap_planted_and_restored() {
        let (mut s, state) = fixture(&[(100, crate::backend::ProcStatus::TracingStop)]);
        let proc = s.registry.pid2proc(crate::Pid::from_raw(100)).unwrap();

        state.borrow_mut().write_word(100, 0x4000, 0x1122334455667788);
        insert(&mut s, proc, 0x4000, None).unwrap();
        assert_eq!(word_at(&state, 100, 0x4000), arch::trap_word(0x1122334455667788));

        delete(&mut s, proc, 0x4000);
        assert_eq!(word_at(&state, 100, 0x4000), 0x1122334455667788);
        assert!(s.registry[proc].breakpoints.is_empty());
    }

    #[test]
    fn insert_is_refcounted() {
        let (mut s, state) = fixture(&[(100, crate::backend::ProcStatus::TracingStop)]);
        let proc = s.registry.pid2proc(crate::Pid::from_raw(100)).unwrap();

        state.borrow_mut().write_word(100, 0x4000, 0xf00d);
        insert(&mut s, proc, 0x4000, None).unwrap();
        insert(&mut s, proc, 0x4000, None).unwrap();
        assert_eq!(s.registry[proc].breakpoints[&0x4000].refs(), 2);

        delete(&mut s, proc, 0x4000);
        // Still referenced: trap stays planted.
        assert_eq!(word_at(&state, 100, 0x4000), arch::trap_word(0xf00d));

        delete(&mut s, proc, 0x4000);
        assert_eq!(word_at(&state, 100, 0x4000), 0xf00d);
    }

    #[test]
    fn double_enable_keeps_original_word() {
        let (mut s, state) = fixture(&[(100, crate::backend::ProcStatus::TracingStop)]);
        let proc = s.registry.pid2proc(crate::Pid::from_raw(100)).unwrap();

        state.borrow_mut().write_word(100, 0x4000, 0xbeef);
        insert(&mut s, proc, 0x4000, None).unwrap();
        // A second enable must not capture the trap as "original".
        enable(&mut s, proc, 0x4000).unwrap();
        delete(&mut s, proc, 0x4000);
        assert_eq!(word_at(&state, 100, 0x4000), 0xbeef);
    }
}
