//! Stop events and access kinds.

use std::fmt;

use nix::sys::signal::Signal;

use super::{Address, ThreadId};

/// Memory access that arms a hardware slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind
{
    /// Data loads only.
    Read,
    /// Data stores only.
    Write,
    /// Loads and stores.
    ReadWrite,
    /// Instruction fetch (a hardware breakpoint).
    Execute,
}

impl fmt::Display for AccessKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadWrite => "read-write",
            Self::Execute => "execute",
        };
        f.write_str(name)
    }
}

/// Why a thread stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause
{
    /// The thread executed an installed software breakpoint. The program
    /// counter has already been rewound to `0`.
    BreakpointHit(Address),
    /// A hardware slot fired.
    WatchpointHit
    {
        /// Start of the watched range (the instruction address for execute slots)
        address: Address,
        /// Access kind the slot was armed for
        access: AccessKind,
        /// Global slot index
        slot: usize,
    },
    /// A single-step request completed.
    SingleStepComplete,
    /// A signal stopped the thread; it has not been delivered. Pass it to
    /// `resume_with_signal` to deliver it.
    SignalDelivered(Signal),
    /// The tracee exited with this status code.
    Exited(i32),
    /// The tracee was killed by a signal.
    Terminated(Signal),
}

impl StopCause
{
    /// Whether the tracee no longer exists after this stop.
    #[must_use]
    pub const fn is_terminal(&self) -> bool
    {
        matches!(self, Self::Exited(_) | Self::Terminated(_))
    }
}

impl fmt::Display for StopCause
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::BreakpointHit(address) => write!(f, "hit breakpoint at {address}"),
            Self::WatchpointHit { address, access, slot } => {
                write!(f, "{access} watchpoint in slot {slot} fired at {address}")
            }
            Self::SingleStepComplete => f.write_str("single-step complete"),
            Self::SignalDelivered(signal) => write!(f, "stopped by signal {signal}"),
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Terminated(signal) => write!(f, "terminated by signal {signal}"),
        }
    }
}

/// A classified stop of one tracee thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopEvent
{
    /// Thread that stopped
    pub thread: ThreadId,
    /// Classified reason
    pub cause: StopCause,
}

impl StopEvent
{
    /// Create a new event.
    #[must_use]
    pub const fn new(thread: ThreadId, cause: StopCause) -> Self
    {
        Self { thread, cause }
    }
}

impl fmt::Display for StopEvent
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "thread {}: {}", self.thread, self.cause)
    }
}
