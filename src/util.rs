use std::os::raw::{c_long, c_void};

use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace::{Request, RequestType};
use nix::sys::wait::{WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::arch::Word;

pub trait AsPid {
    fn as_pid(self) -> Pid;
}

impl AsPid for Pid {
    fn as_pid(self) -> Pid {
        self
    }
}

impl AsPid for &Pid {
    fn as_pid(self) -> Pid {
        *self
    }
}

impl AsPid for i32 {
    fn as_pid(self) -> Pid {
        Pid::from_raw(self)
    }
}

/// Raw trace request for the few operations the typed wrappers do not
/// cover (word-granular text access with the result in-band). A peek may
/// legitimately read a word of -1, so errno decides, not the return
/// value.
pub(crate) fn ptrace(request: Request, pid: Pid, addr: Word, data: Word) -> nix::Result<c_long> {
    Errno::clear();
    let res = unsafe {
        libc::ptrace(
            request as RequestType,
            libc::pid_t::from(pid),
            addr as *mut c_void,
            data as *mut c_void,
        )
    };
    match Errno::last() {
        Errno::UnknownErrno => Ok(res),
        err if res == -1 => Err(err),
        _ => Ok(res),
    }
}

/// Waits for a state change of `pid` (-1 for any traced task), returning
/// both the parsed status and the raw status word the parse came from.
pub(crate) fn waitpid(pid: Pid, options: Option<WaitPidFlag>) -> nix::Result<(WaitStatus, i32)> {
    let mut status = 0;
    let option_bits = options.map_or(0, |bits| bits.bits());

    let res = unsafe { libc::waitpid(pid.as_raw(), &mut status, option_bits) };

    match Errno::result(res)? {
        0 => Ok((WaitStatus::StillAlive, status)),
        pid => WaitStatus::from_raw(Pid::from_raw(pid), status).map(|ws| (ws, status)),
    }
}
