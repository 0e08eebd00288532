//! A userspace dynamic tracer. Plants software breakpoints at dynamic
//! call sites of traced processes and keeps them armed across hits by
//! quiescing the whole thread group while one thread steps past the
//! disarmed slot. Lazily-bound PLT entries are resolved by stepping the
//! dynamic resolver under the same protocol.

pub mod arch;
pub mod backend;
pub mod breakpoint;
pub mod command;
pub mod event;
pub mod handlers;
pub mod plt;
pub mod proc;
pub mod trace;
mod util;

#[cfg(test)]
mod testutil;

pub use nix::unistd::Pid;
pub use nix::Error as SystemError;

pub use arch::{Arch, Word};
pub use backend::{Backend, ProcStatus, Ptrace};
pub use command::Command;
pub use event::{Event, EventKind, EventQueue};
pub use proc::{ProcId, Process, Registry};
pub use trace::{Error, Session};
pub use util::AsPid;
