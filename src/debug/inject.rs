//! Injected-call task.
//!
//! Synthesizes a genuine function call inside the stopped target by
//! rewriting its saved registers: jump to the callee with a hand-built
//! stack frame whose return address is a zero sentinel, so returning from
//! the call immediately re-traps. The captured context is then restored
//! and execution resumes exactly where the original trap occurred.

use super::registers::{Absorb, RegisterContext};
use super::wire;

/// Parameter home space the x64 convention reserves above the return
/// address.
const HOME_SPACE: u64 = 32;

/// RFLAGS direction flag; must be clear at function entry.
const FLAG_DF: u64 = 0x400;

/// Progress of one injected call. Transitions happen only on line/prompt
/// events fed in by the session tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectState {
    /// Collecting the integer-register portion of the snapshot.
    SnapshottingScalars,
    /// Collecting the vector registers, one line each.
    SnapshottingVectors,
    /// Snapshot complete; the next prompt computes the frame and jumps.
    Computing,
    /// The call is running; it re-traps by returning to the zero sentinel.
    AwaitingCompletionTrap,
    /// Waiting for the return-register line.
    ReadingReturn,
    /// Restore command issued; the next prompt completes the call.
    Restoring,
    /// Return value captured, context restored.
    Done,
}

/// One in-flight injected call.
///
/// At most one exists per session: completion relies on owning the next
/// prompt after the deliberate re-trap, and nothing else may arbitrate
/// that prompt concurrently.
#[derive(Debug, Clone)]
pub struct CallInjection {
    pub target: u64,
    pub args: [u64; 3],
    pub state: InjectState,
    pub snapshot: RegisterContext,
    pub return_value: u64,
}

impl CallInjection {
    pub fn new(target: u64, args: [u64; 3]) -> Self {
        Self {
            target,
            args,
            state: InjectState::SnapshottingScalars,
            snapshot: RegisterContext::default(),
            return_value: 0,
        }
    }

    /// Fold a snapshot line in. Moves to `SnapshottingVectors` on the
    /// first vector line and to `Computing` once xmm15 has been seen.
    pub fn absorb_snapshot_line(&mut self, line: &str) {
        if let Absorb::Vector { index } = self.snapshot.absorb_line(line) {
            self.state = if index == 15 {
                InjectState::Computing
            } else {
                InjectState::SnapshottingVectors
            };
        }
    }

    /// Stack pointer for the injected frame: 16-align the base downward,
    /// push an emulated near-call return address, then reserve the home
    /// space. Aligning first keeps the frame valid even mid-prologue,
    /// where the live stack pointer is not yet 16-aligned.
    pub fn frame_pointer(&self, alt_stack: Option<u64>) -> u64 {
        let base = alt_stack.unwrap_or(self.snapshot.rsp);
        (base & !15) - 8 - HOME_SPACE
    }

    /// Flags image for the call entry: direction flag cleared, every other
    /// bit as captured.
    pub fn entry_flags(&self) -> u64 {
        self.snapshot.rflags & !FLAG_DF
    }

    /// The command that performs the jump into the callee.
    pub fn launch_command(&self, alt_stack: Option<u64>) -> String {
        wire::launch_call_command(
            self.target,
            self.frame_pointer(alt_stack),
            self.entry_flags(),
            self.args,
        )
    }

    /// The command that puts the volatile context back.
    pub fn restore_command(&self) -> String {
        wire::restore_volatile_command(&self.snapshot)
    }
}
