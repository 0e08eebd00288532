//! Lazy-binding PLT interception.
//!
//! A PLT entry initially routes through the dynamic resolver, which
//! overwrites the .plt slot with the real address on first call. A
//! breakpoint on the entry therefore fires at most once per symbol unless
//! we interfere: on the first hit we single-step the resolver under the
//! stop-the-world protocol until the slot changes, write the trampoline
//! address back into the slot so later calls keep tripping our
//! breakpoint, and cache the resolved target. Subsequent hits just jump
//! to the cached target.
//!
//! Where the toolchain emits per-entry stub symbols, those are reliable
//! breakpoint sites and none of this is needed.

use tracing::{debug, warn};

use crate::arch::Word;
use crate::breakpoint::{self, BpCallbacks};
use crate::handlers::{stopping, Decision, StopCallbacks, StoppingHandler};
use crate::proc::ProcId;
use crate::trace::{Error, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PltState {
    /// Breakpoint sits on a stub symbol; nothing special on hit.
    Stub,
    /// Slot still points at the trampoline (or is unfilled).
    Unresolved,
    /// Target known; hits bypass the resolver entirely.
    Resolved,
}

/// One intercepted dynamic-call symbol.
pub struct PltSymbol {
    pub name: String,
    /// Breakpoint site: the PLT entry (or stub).
    pub plt_addr: Word,
    /// The .plt slot the resolver writes the target into.
    pub slot_addr: Word,
    pub state: PltState,
    /// While unresolved this holds the trampoline address the slot is
    /// pinned to; once resolved, the real target.
    pub resolved_value: Word,
}

/// Registers a lazily-bound symbol and plants its breakpoint. The slot is
/// read from the live process image, not the file: when attaching to a
/// running (or prelinked) process the symbol may already be resolved, in
/// which case the slot is pinned back to the trampoline and the cached
/// target recorded right away.
pub fn add_plt_entry(
    s: &mut Session,
    proc: ProcId,
    name: &str,
    plt_addr: Word,
    slot_addr: Word,
) -> Result<(), Error> {
    let leader = s.registry.leader_of(proc);
    let pid = s.registry.get(leader).ok_or(Error::ProcessGone)?.pid();

    let slot_value = s.backend.peek_word(pid, slot_addr)?;

    let (state, resolved_value) = if slot_value == plt_addr || slot_value == 0 {
        (PltState::Unresolved, plt_addr)
    } else {
        // Already resolved. Pin the slot back to the trampoline; the
        // retraction on detach restores it like any other patched word.
        s.backend.poke_word(pid, slot_addr, plt_addr)?;
        (PltState::Resolved, slot_value)
    };

    debug!(
        symbol = name,
        addr = format_args!("{plt_addr:#x}"),
        ?state,
        "plt entry registered"
    );

    let symbol = PltSymbol {
        name: name.to_owned(),
        plt_addr,
        slot_addr,
        state,
        resolved_value,
    };
    let idx = {
        let p = s.registry.get_mut(leader).ok_or(Error::ProcessGone)?;
        p.symbols.push(symbol);
        p.symbols.len() - 1
    };

    breakpoint::insert(s, proc, plt_addr, Some(idx))?;
    breakpoint::set_callbacks(
        s,
        proc,
        plt_addr,
        BpCallbacks {
            on_continue: Some(plt_bp_continue),
            on_retract: Some(plt_bp_retract),
            ..BpCallbacks::default()
        },
    );
    Ok(())
}

/// Registers a stub symbol: an ordinary breakpoint site with no slot
/// tracking.
pub fn add_stub_entry(s: &mut Session, proc: ProcId, name: &str, addr: Word) -> Result<(), Error> {
    let leader = s.registry.leader_of(proc);
    let symbol = PltSymbol {
        name: name.to_owned(),
        plt_addr: addr,
        slot_addr: 0,
        state: PltState::Stub,
        resolved_value: addr,
    };
    let idx = {
        let p = s.registry.get_mut(leader).ok_or(Error::ProcessGone)?;
        p.symbols.push(symbol);
        p.symbols.len() - 1
    };
    breakpoint::insert(s, proc, addr, Some(idx))
}

/// Continue hook for PLT breakpoints.
fn plt_bp_continue(s: &mut Session, proc: ProcId, addr: Word) {
    let leader = s.registry.leader_of(proc);

    let sym = s
        .registry
        .get(leader)
        .and_then(|p| p.breakpoints.get(&addr))
        .and_then(|bp| bp.symbol())
        .and_then(|idx| {
            s.registry
                .get(leader)
                .and_then(|p| p.symbols.get(idx))
                .map(|sym| (sym.state, sym.resolved_value))
        });
    let Some((state, resolved_value)) = sym else {
        s.continue_after_breakpoint(proc, addr);
        return;
    };

    match state {
        PltState::Unresolved => {
            let cbs = StopCallbacks {
                keep_stepping_p: plt_keep_stepping,
                ..StopCallbacks::default()
            };
            if let Err(e) = stopping::install(s, proc, addr, cbs) {
                warn!(error = %e, "couldn't run the resolver under a stop handler");
                s.continue_after_breakpoint(proc, addr);
            }
        }
        PltState::Resolved => {
            // Hop straight to the cached target; no resolver, no
            // coordination.
            if let Some(pid) = s.registry.get(proc).map(|p| p.pid()) {
                s.backend.set_ip(pid, resolved_value).ok();
            }
            s.continue_process(proc);
        }
        PltState::Stub => unreachable!("stub symbols resume through the default path"),
    }
}

/// Retract hook: a detached process must dispatch through the slot
/// without us, so a pinned slot gets its real target back.
fn plt_bp_retract(s: &mut Session, proc: ProcId, addr: Word) {
    let leader = s.registry.leader_of(proc);
    let Some(pid) = s.registry.get(leader).map(|p| p.pid()) else {
        return;
    };

    let resolved = s
        .registry
        .get(leader)
        .and_then(|p| p.breakpoints.get(&addr))
        .and_then(|bp| bp.symbol())
        .and_then(|idx| s.registry.get(leader).and_then(|p| p.symbols.get(idx)))
        .filter(|sym| sym.state == PltState::Resolved && sym.slot_addr != 0)
        .map(|sym| (sym.slot_addr, sym.resolved_value));

    if let Some((slot_addr, value)) = resolved {
        s.backend.poke_word(pid, slot_addr, value).ok();
    }
}

/// Step policy while the resolver runs: keep stepping until the watched
/// slot changes, then migrate the symbol and stop.
fn plt_keep_stepping(s: &mut Session, h: &mut StoppingHandler) -> Decision {
    let (Some(teb), Some(addr)) = (h.teb(), h.breakpoint_addr()) else {
        return Decision::Fail;
    };
    let leader = s.registry.leader_of(teb);
    let Some(pid) = s.registry.get(teb).map(|p| p.pid()) else {
        return Decision::Fail;
    };

    let Some(idx) = s
        .registry
        .get(leader)
        .and_then(|p| p.breakpoints.get(&addr))
        .and_then(|bp| bp.symbol())
    else {
        return Decision::Fail;
    };
    let Some((slot_addr, pinned)) = s
        .registry
        .get(leader)
        .and_then(|p| p.symbols.get(idx))
        .map(|sym| (sym.slot_addr, sym.resolved_value))
    else {
        return Decision::Fail;
    };

    let value = match s.backend.peek_word(pid, slot_addr) {
        Ok(value) => value,
        Err(_) => return Decision::Fail,
    };

    if value == pinned {
        return Decision::Cont;
    }

    // The resolver finished. Pin the slot back so other threads keep
    // tripping the breakpoint, and remember where calls really go.
    if s.backend.poke_word(pid, slot_addr, pinned).is_err() {
        return Decision::Fail;
    }
    if let Some(sym) = s
        .registry
        .get_mut(leader)
        .and_then(|p| p.symbols.get_mut(idx))
    {
        sym.state = PltState::Resolved;
        sym.resolved_value = value;
        debug!(
            symbol = %sym.name,
            target = format_args!("{value:#x}"),
            "plt slot resolved"
        );
    }
    Decision::Stop
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ProcStatus;
    use crate::event::{Event, EventKind};
    use crate::testutil::{fixture, word_at, Op};
    use crate::Pid;

    const ENTRY: Word = 0x20000;
    const SLOT: Word = 0x10000;
    const TARGET: Word = 0x7f1234;

    fn hit(s: &Session, pid: i32, addr: Word) -> Event {
        let proc = s.registry.pid2proc(Pid::from_raw(pid)).unwrap();
        Event::new(proc, Pid::from_raw(pid), EventKind::Breakpoint { addr })
    }

    #[test]
    fn unfilled_slot_registers_unresolved() {
        let (mut s, state) = fixture(&[(5000, ProcStatus::TracingStop)]);
        let proc = s.registry.pid2proc(Pid::from_raw(5000)).unwrap();

        // Slot of zero: the dynamic linker has not run yet.
        add_plt_entry(&mut s, proc, "puts", ENTRY, SLOT).unwrap();
        let sym = &s.registry[proc].symbols[0];
        assert_eq!(sym.state, PltState::Unresolved);
        assert_eq!(sym.resolved_value, ENTRY);
        // Breakpoint planted on the entry.
        assert_eq!(word_at(&state, 5000, ENTRY) & 0xff, 0xcc);
    }

    #[test]
    fn live_slot_registers_resolved_and_pins_trampoline() {
        let (mut s, state) = fixture(&[(5100, ProcStatus::TracingStop)]);
        let proc = s.registry.pid2proc(Pid::from_raw(5100)).unwrap();

        // Attached to a running process: the slot already points at the
        // real target.
        state.borrow_mut().write_word(5100, SLOT, TARGET);
        add_plt_entry(&mut s, proc, "puts", ENTRY, SLOT).unwrap();

        let sym = &s.registry[proc].symbols[0];
        assert_eq!(sym.state, PltState::Resolved);
        assert_eq!(sym.resolved_value, TARGET);
        assert_eq!(word_at(&state, 5100, SLOT), ENTRY);
    }

    #[test]
    fn first_call_steps_resolver_then_caches_target() {
        let (mut s, state) = fixture(&[(5000, ProcStatus::TracingStop)]);
        let proc = s.registry.pid2proc(Pid::from_raw(5000)).unwrap();

        state.borrow_mut().write_word(5000, SLOT, ENTRY);
        add_plt_entry(&mut s, proc, "puts", ENTRY, SLOT).unwrap();

        // First call hits the entry; the coordinator installs and steps.
        state.borrow_mut().set_ip(5000, ENTRY + 1);
        assert!(s.process_event(hit(&s, 5000, ENTRY)).is_none());
        assert_eq!(state.borrow().ops_of(5000), vec![Op::Step]);

        // Slot unchanged: keep stepping.
        state.borrow_mut().set_ip(5000, ENTRY + 4);
        assert!(s.dispatch(hit(&s, 5000, ENTRY + 4)).is_none());
        assert_eq!(state.borrow().ops_of(5000), vec![Op::Step, Op::Step]);

        // The resolver writes the real target into the slot; the next
        // step notices, pins the slot back, and finishes the cycle.
        state.borrow_mut().write_word(5000, SLOT, TARGET);
        state.borrow_mut().set_ip(5000, ENTRY + 8);
        assert!(s.dispatch(hit(&s, 5000, ENTRY + 8)).is_none());

        assert_eq!(word_at(&state, 5000, SLOT), ENTRY);
        let sym = &s.registry[proc].symbols[0];
        assert_eq!(sym.state, PltState::Resolved);
        assert_eq!(sym.resolved_value, TARGET);
        // Trap re-armed on the entry; thread resumed.
        assert_eq!(word_at(&state, 5000, ENTRY) & 0xff, 0xcc);
        assert!(state.borrow().ops_of(5000).contains(&Op::ContSyscall(0)));
        assert!(s.registry[proc].handler.is_none());
    }

    #[test]
    fn resolved_hit_bypasses_coordination() {
        let (mut s, state) = fixture(&[(5200, ProcStatus::TracingStop)]);
        let proc = s.registry.pid2proc(Pid::from_raw(5200)).unwrap();

        state.borrow_mut().write_word(5200, SLOT, TARGET);
        add_plt_entry(&mut s, proc, "puts", ENTRY, SLOT).unwrap();

        state.borrow_mut().set_ip(5200, ENTRY + 1);
        assert!(s.process_event(hit(&s, 5200, ENTRY)).is_none());

        // Straight jump to the cached target, no stepping, no handler.
        assert_eq!(state.borrow().ip_of(5200), TARGET);
        assert_eq!(state.borrow().ops_of(5200), vec![Op::ContSyscall(0)]);
        assert!(s.registry[proc].handler.is_none());
    }

    #[test]
    fn stub_symbols_are_plain_breakpoint_sites() {
        let (mut s, state) = fixture(&[(5500, ProcStatus::TracingStop)]);
        let proc = s.registry.pid2proc(Pid::from_raw(5500)).unwrap();

        add_stub_entry(&mut s, proc, "memcpy", 0x30000).unwrap();

        let bp = &s.registry[proc].breakpoints[&0x30000];
        assert!(bp.is_enabled());
        // Stubs resume through the default re-enablement path; no slot
        // tracking hooks.
        assert!(bp.cbs.on_continue.is_none());
        assert_eq!(s.registry[proc].symbols[0].state, PltState::Stub);
        assert_eq!(word_at(&state, 5500, 0x30000) & 0xff, 0xcc);
    }

    #[test]
    fn detach_unpins_resolved_slot() {
        let (mut s, state) = fixture(&[(5400, ProcStatus::TracingStop)]);
        let proc = s.registry.pid2proc(Pid::from_raw(5400)).unwrap();
        s.attached.push(Pid::from_raw(5400));

        state.borrow_mut().write_word(5400, SLOT, TARGET);
        add_plt_entry(&mut s, proc, "puts", ENTRY, SLOT).unwrap();
        assert_eq!(word_at(&state, 5400, SLOT), ENTRY);

        assert!(crate::handlers::exiting::install(&mut s, proc));
        let ev = Event::new(
            proc,
            Pid::from_raw(5400),
            EventKind::Breakpoint { addr: ENTRY },
        );
        assert!(s.dispatch(ev).is_none());

        // Text restored, slot pointing at the real target again.
        assert_eq!(word_at(&state, 5400, ENTRY) & 0xff, 0);
        assert_eq!(word_at(&state, 5400, SLOT), TARGET);
        assert!(state.borrow().detached.contains(&5400));
    }

    #[test]
    fn resolution_is_monotonic() {
        let (mut s, state) = fixture(&[(5300, ProcStatus::TracingStop)]);
        let proc = s.registry.pid2proc(Pid::from_raw(5300)).unwrap();

        state.borrow_mut().write_word(5300, SLOT, ENTRY);
        add_plt_entry(&mut s, proc, "puts", ENTRY, SLOT).unwrap();

        state.borrow_mut().set_ip(5300, ENTRY + 1);
        assert!(s.process_event(hit(&s, 5300, ENTRY)).is_none());
        state.borrow_mut().write_word(5300, SLOT, TARGET);
        assert!(s.dispatch(hit(&s, 5300, ENTRY + 4)).is_none());
        assert_eq!(s.registry[proc].symbols[0].state, PltState::Resolved);

        // Later hits leave the cached target untouched.
        state.borrow_mut().set_ip(5300, ENTRY + 1);
        assert!(s.process_event(hit(&s, 5300, ENTRY)).is_none());
        let sym = &s.registry[proc].symbols[0];
        assert_eq!(sym.state, PltState::Resolved);
        assert_eq!(sym.resolved_value, TARGET);
    }
}
