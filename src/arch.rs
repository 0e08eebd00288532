use nix::unistd::Pid;

use crate::backend::Backend;

#[cfg(target_pointer_width = "64")]
pub type Word = u64;
#[cfg(target_pointer_width = "32")]
pub type Word = u32;

/// How far the processor advances past a trap instruction before the stop
/// is reported. The breakpoint address is the reported instruction pointer
/// minus this.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub const TRAP_LEN: Word = 1;
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub const TRAP_LEN: Word = 0;

/// Upper bound on scratch breakpoints planted for a software single-step:
/// one for the fall-through address, one for a branch target.
pub const MAX_SCRATCH_BREAKPOINTS: usize = 2;

/// Replaces the low instruction bytes of `word` with the trap instruction,
/// leaving the rest of the word intact.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn trap_word(word: Word) -> Word {
    (word & !0xff) | 0xcc
}

#[cfg(target_arch = "aarch64")]
pub fn trap_word(word: Word) -> Word {
    // brk #0
    (word & !0xffff_ffff) | 0xd420_0000
}

/// Outcome of the software single-step hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwStep {
    /// No software fallback; use hardware single-step.
    Hw,
    /// Next-instruction addresses were collected; plant one-shot
    /// breakpoints at each of them and continue the thread.
    Sw,
    Fail,
}

/// Collects every address the next instruction could transfer control to
/// (branch targets plus fall-through) into `addrs`.
pub type SwSinglestepFn = fn(&mut dyn Backend, Pid, &mut Vec<Word>) -> SwStep;

fn hw_singlestep(_backend: &mut dyn Backend, _pid: Pid, _addrs: &mut Vec<Word>) -> SwStep {
    SwStep::Hw
}

/// Architecture capabilities consulted by the breakpoint re-enablement
/// machinery.
pub struct Arch {
    /// Whether single-stepping over a disarmed breakpoint slot is safe on
    /// this architecture. When false, breakpoint hits resume without
    /// re-enablement coordination.
    pub can_singlestep_safely: bool,

    /// Software single-step fallback for kernels or architectures that
    /// cannot hardware single-step under trace.
    pub sw_singlestep: SwSinglestepFn,
}

impl Default for Arch {
    fn default() -> Self {
        Self {
            can_singlestep_safely: true,
            sw_singlestep: hw_singlestep,
        }
    }
}
