//! Live smoke test: launch a real child under trace and follow it from
//! first stop to exit through the canonical event loop.

use calltrace::{Command, EventKind, Session};

#[test]
fn spawn_and_run_to_exit() {
    let mut s = Session::new();

    let mut cmd = Command::new("/bin/true");
    cmd.inherit_env();

    let proc = s.spawn(&cmd).expect("spawn tracee");
    let pid = s.registry[proc].pid();

    let mut exit_code = None;
    for _ in 0..100_000 {
        let ev = s.next_event().expect("wait for event");
        let Some(ev) = s.process_event(ev) else {
            continue;
        };

        match ev.kind {
            EventKind::Exit { code } => {
                exit_code = Some(code);
                break;
            }
            EventKind::ExitSignal { signum } => {
                panic!("tracee killed by signal {signum}");
            }
            EventKind::SyscallEnter { nr } => s.continue_after_syscall(ev.proc, nr, false),
            EventKind::SyscallExit { nr } => s.continue_after_syscall(ev.proc, nr, true),
            EventKind::Signal { signum } => s.continue_after_signal(ev.proc, signum),
            EventKind::Exec => s.continue_after_exec(ev.proc),
            _ => s.continue_process(ev.proc),
        }
    }

    assert_eq!(exit_code, Some(0), "tracee {pid} did not exit cleanly");
}
