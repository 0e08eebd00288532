use std::fs;
use std::mem::size_of;

use nix::sys::ptrace::{self as pt, Options, Request};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::arch::Word;
use crate::trace::Error;
use crate::util::{ptrace, waitpid};

/// Scheduler state of a task, as the kernel reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcStatus {
    /// Task is gone or unreadable.
    Invalid,
    /// Stopped for the tracer.
    TracingStop,
    /// Job-control stopped, but not for us.
    Stop,
    Sleeping,
    Zombie,
    Other,
}

impl ProcStatus {
    /// Whether the task cannot run userspace code right now as far as the
    /// re-enablement protocol is concerned.
    pub fn is_parked(self) -> bool {
        matches!(self, ProcStatus::Invalid | ProcStatus::TracingStop | ProcStatus::Zombie)
    }
}

/// The kernel trace interface, reduced to the operations the tracer
/// needs. Every call is synchronous and per-task; errors are returned,
/// never latched.
pub trait Backend {
    /// Requests tracing of `pid` and waits for the attach-induced stop.
    fn attach(&mut self, pid: Pid) -> Result<(), Error>;

    /// Releases `pid` with no pending signal.
    fn detach(&mut self, pid: Pid) -> Result<(), Error>;

    /// Resumes `pid` until the next stop, delivering `signum` (0 for none).
    fn cont(&mut self, pid: Pid, signum: i32) -> Result<(), Error>;

    /// Resumes `pid` until the next syscall boundary, delivering `signum`.
    fn cont_syscall(&mut self, pid: Pid, signum: i32) -> Result<(), Error>;

    /// Hardware single-steps one instruction.
    fn step(&mut self, pid: Pid) -> Result<(), Error>;

    /// Parks one thread without affecting its siblings. Kernel-dependent;
    /// a no-op where stopped tracees cannot be scheduled anyway.
    fn suspend_thread(&mut self, tid: Pid) -> Result<(), Error>;

    fn resume_thread(&mut self, tid: Pid) -> Result<(), Error>;

    fn list_threads(&self, pid: Pid) -> Result<Vec<Pid>, Error>;

    fn peek(&self, pid: Pid, addr: Word, buf: &mut [u8]) -> Result<(), Error>;

    fn poke(&mut self, pid: Pid, addr: Word, data: &[u8]) -> Result<(), Error>;

    fn get_ip(&self, pid: Pid) -> Result<Word, Error>;

    fn set_ip(&mut self, pid: Pid, addr: Word) -> Result<(), Error>;

    /// Number of the syscall the stopped task is entering.
    fn syscall_nr(&self, pid: Pid) -> Result<u64, Error>;

    fn kill(&mut self, pid: Pid, signal: Signal) -> Result<(), Error>;

    fn status(&self, pid: Pid) -> ProcStatus;

    /// Waits for the next raw stop notification. `pid` of -1 selects any
    /// traced task. Returns the parsed status plus the raw status word.
    fn wait(&mut self, pid: Pid) -> Result<(WaitStatus, i32), Error>;

    /// Child pid (or exit code) attached to the last trace event of `pid`.
    fn event_msg(&self, pid: Pid) -> Result<i64, Error>;

    fn set_tracing_options(&mut self, pid: Pid) -> Result<(), Error>;

    fn peek_word(&self, pid: Pid, addr: Word) -> Result<Word, Error> {
        let mut buf = [0u8; size_of::<Word>()];
        self.peek(pid, addr, &mut buf)?;
        Ok(Word::from_ne_bytes(buf))
    }

    fn poke_word(&mut self, pid: Pid, addr: Word, value: Word) -> Result<(), Error> {
        self.poke(pid, addr, &value.to_ne_bytes())
    }
}

fn sig_from_raw(signum: i32) -> Option<Signal> {
    if signum == 0 {
        None
    } else {
        Signal::try_from(signum).ok()
    }
}

/// Production backend speaking ptrace.
#[derive(Debug, Default)]
pub struct Ptrace;

impl Ptrace {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for Ptrace {
    fn attach(&mut self, pid: Pid) -> Result<(), Error> {
        pt::attach(pid).map_err(|e| Error::Attach(pid, e))?;
        waitpid(pid, Some(WaitPidFlag::__WALL)).map_err(|e| Error::Attach(pid, e))?;
        Ok(())
    }

    fn detach(&mut self, pid: Pid) -> Result<(), Error> {
        pt::detach(pid, None).map_err(|e| Error::Detach(pid, e))
    }

    fn cont(&mut self, pid: Pid, signum: i32) -> Result<(), Error> {
        pt::cont(pid, sig_from_raw(signum)).map_err(|e| Error::Resume(pid, e))
    }

    fn cont_syscall(&mut self, pid: Pid, signum: i32) -> Result<(), Error> {
        pt::syscall(pid, sig_from_raw(signum)).map_err(|e| Error::Resume(pid, e))
    }

    fn step(&mut self, pid: Pid) -> Result<(), Error> {
        pt::step(pid, None).map_err(|e| Error::Step(pid, e))
    }

    fn suspend_thread(&mut self, tid: Pid) -> Result<(), Error> {
        // Stopped tracees stay off-cpu until we continue them; there is
        // nothing extra to park.
        let _ = tid;
        Ok(())
    }

    fn resume_thread(&mut self, tid: Pid) -> Result<(), Error> {
        let _ = tid;
        Ok(())
    }

    fn list_threads(&self, pid: Pid) -> Result<Vec<Pid>, Error> {
        let path = format!("/proc/{}/task", pid);
        let dir = fs::read_dir(path).map_err(|_| Error::Attach(pid, nix::Error::ESRCH))?;

        let mut tids = Vec::new();
        for entry in dir.flatten() {
            if let Some(tid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
            {
                tids.push(Pid::from_raw(tid));
            }
        }
        Ok(tids)
    }

    fn peek(&self, pid: Pid, addr: Word, buf: &mut [u8]) -> Result<(), Error> {
        let word_size = size_of::<Word>() as Word;
        let mut word_addr = addr & !(word_size - 1);
        let mut skip = (addr - word_addr) as usize;
        let mut pos = 0;

        while pos < buf.len() {
            let raw = ptrace(Request::PTRACE_PEEKTEXT, pid, word_addr, 0)
                .map_err(|e| Error::MemoryRead(word_addr, e))?;
            let bytes = (raw as Word).to_ne_bytes();

            for &byte in &bytes[skip..] {
                if pos == buf.len() {
                    break;
                }
                buf[pos] = byte;
                pos += 1;
            }

            skip = 0;
            word_addr += word_size;
        }

        Ok(())
    }

    fn poke(&mut self, pid: Pid, addr: Word, data: &[u8]) -> Result<(), Error> {
        let word_size = size_of::<Word>();
        let mut word_addr = addr & !(word_size as Word - 1);
        let mut offset = (addr - word_addr) as usize;
        let mut pos = 0;

        while pos < data.len() {
            let count = (word_size - offset).min(data.len() - pos);

            let mut bytes = [0u8; size_of::<Word>()];
            if offset != 0 || count < word_size {
                // Partial word: preserve the bytes we are not writing.
                let raw = ptrace(Request::PTRACE_PEEKTEXT, pid, word_addr, 0)
                    .map_err(|e| Error::MemoryRead(word_addr, e))?;
                bytes = (raw as Word).to_ne_bytes();
            }
            bytes[offset..offset + count].copy_from_slice(&data[pos..pos + count]);

            ptrace(
                Request::PTRACE_POKETEXT,
                pid,
                word_addr,
                Word::from_ne_bytes(bytes),
            )
            .map_err(|e| Error::MemoryWrite(word_addr, e))?;

            pos += count;
            word_addr += word_size as Word;
            offset = 0;
        }

        Ok(())
    }

    fn get_ip(&self, pid: Pid) -> Result<Word, Error> {
        let regs = pt::getregs(pid).map_err(|e| Error::Registers(pid, e))?;
        #[cfg(target_arch = "x86_64")]
        {
            Ok(regs.rip as Word)
        }
        #[cfg(target_arch = "x86")]
        {
            Ok(regs.eip as Word)
        }
    }

    fn set_ip(&mut self, pid: Pid, addr: Word) -> Result<(), Error> {
        let mut regs = pt::getregs(pid).map_err(|e| Error::Registers(pid, e))?;
        #[cfg(target_arch = "x86_64")]
        {
            regs.rip = addr as _;
        }
        #[cfg(target_arch = "x86")]
        {
            regs.eip = addr as _;
        }
        pt::setregs(pid, regs).map_err(|e| Error::Registers(pid, e))
    }

    fn syscall_nr(&self, pid: Pid) -> Result<u64, Error> {
        let regs = pt::getregs(pid).map_err(|e| Error::Registers(pid, e))?;
        #[cfg(target_arch = "x86_64")]
        {
            Ok(regs.orig_rax as u64)
        }
        #[cfg(target_arch = "x86")]
        {
            Ok(regs.orig_eax as u64)
        }
    }

    fn kill(&mut self, pid: Pid, sig: Signal) -> Result<(), Error> {
        signal::kill(pid, sig).map_err(|e| Error::Kill(pid, e))
    }

    fn status(&self, pid: Pid) -> ProcStatus {
        let stat = match fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat,
            Err(_) => return ProcStatus::Invalid,
        };

        // The state field follows the parenthesized command name, which
        // may itself contain parentheses.
        let state = stat
            .rfind(')')
            .and_then(|end| stat[end + 1..].split_whitespace().next())
            .and_then(|field| field.chars().next());

        match state {
            Some('t') => ProcStatus::TracingStop,
            Some('T') => ProcStatus::Stop,
            Some('S') | Some('D') => ProcStatus::Sleeping,
            Some('Z') => ProcStatus::Zombie,
            Some(_) => ProcStatus::Other,
            None => ProcStatus::Invalid,
        }
    }

    fn wait(&mut self, pid: Pid) -> Result<(WaitStatus, i32), Error> {
        waitpid(pid, Some(WaitPidFlag::__WALL)).map_err(Error::Wait)
    }

    fn event_msg(&self, pid: Pid) -> Result<i64, Error> {
        pt::getevent(pid)
            .map(|msg| msg as i64)
            .map_err(|e| Error::Registers(pid, e))
    }

    fn set_tracing_options(&mut self, pid: Pid) -> Result<(), Error> {
        pt::setoptions(
            pid,
            Options::PTRACE_O_TRACEFORK
                | Options::PTRACE_O_TRACEVFORK
                | Options::PTRACE_O_TRACECLONE
                | Options::PTRACE_O_TRACEEXEC
                | Options::PTRACE_O_TRACESYSGOOD,
        )
        .map_err(|e| Error::TraceSetOptions(pid, e))
    }
}
