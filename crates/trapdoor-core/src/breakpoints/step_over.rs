//! Stepping a thread off a trap site.
//!
//! A thread halted on an armed site cannot simply be resumed: it would trap
//! again on the same instruction (software traps on AArch64/RISC-V) or, on
//! AArch64, re-fire the same watchpoint before the access ever retires. The
//! site is disarmed for exactly one instruction of that one thread:
//!
//! ```text
//! ArmedAtBreakpoint --begin()--> SteppingOver --finish()--> Rearmed
//! ```
//!
//! The engine drives the transitions; this type only records where the
//! sequence stands and refuses to skip or repeat a step.

use std::fmt;

use crate::error::{TrapdoorError, TrapdoorResult};
use crate::types::{Address, ThreadId, ThreadState};

/// What a halted thread is sitting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapSite
{
    /// A software breakpoint at this address
    Software(Address),
    /// A hardware slot that must be disabled while stepping
    Hardware
    {
        /// Global slot index
        slot: usize,
    },
}

impl fmt::Display for TrapSite
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Software(address) => write!(f, "breakpoint at {address}"),
            Self::Hardware { slot } => write!(f, "hardware slot {slot}"),
        }
    }
}

/// Progress of a step-over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase
{
    /// The thread is halted on the site and the site is armed.
    ArmedAtBreakpoint,
    /// The site is disarmed and the thread is executing one instruction.
    SteppingOver,
    /// The site is armed again.
    Rearmed,
}

/// One step-over of one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOver
{
    thread: ThreadId,
    site: TrapSite,
    phase: StepPhase,
}

impl StepOver
{
    /// Start a step-over of `thread`, halted on `site`.
    #[must_use]
    pub const fn new(thread: ThreadId, site: TrapSite) -> Self
    {
        Self {
            thread,
            site,
            phase: StepPhase::ArmedAtBreakpoint,
        }
    }

    /// Thread being stepped.
    #[must_use]
    pub const fn thread(&self) -> ThreadId
    {
        self.thread
    }

    /// Site being stepped over.
    #[must_use]
    pub const fn site(&self) -> TrapSite
    {
        self.site
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> StepPhase
    {
        self.phase
    }

    /// The site has been disarmed and the step issued.
    ///
    /// ## Errors
    ///
    /// `InvalidState` unless the step-over is in `ArmedAtBreakpoint`.
    pub fn begin(&mut self) -> TrapdoorResult<()>
    {
        self.advance(StepPhase::ArmedAtBreakpoint, StepPhase::SteppingOver, "begin a step-over")
    }

    /// The step finished (or failed) and the site has been re-armed.
    ///
    /// ## Errors
    ///
    /// `InvalidState` unless the step-over is in `SteppingOver`.
    pub fn finish(&mut self) -> TrapdoorResult<()>
    {
        self.advance(StepPhase::SteppingOver, StepPhase::Rearmed, "finish a step-over")
    }

    fn advance(&mut self, from: StepPhase, to: StepPhase, operation: &'static str) -> TrapdoorResult<()>
    {
        if self.phase != from {
            return Err(TrapdoorError::InvalidState {
                operation,
                thread: self.thread,
                actual: match self.phase {
                    StepPhase::SteppingOver => ThreadState::Running,
                    StepPhase::ArmedAtBreakpoint | StepPhase::Rearmed => ThreadState::Stopped,
                },
            });
        }
        self.phase = to;
        Ok(())
    }
}
