//! # Error Types
//!
//! General error handling for the tracing engine.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and readable messages. Every variant belongs to one [`ErrorKind`], which is
//! what callers should branch on when deciding whether to retry.

use nix::errno::Errno;
use thiserror::Error;

use crate::types::{AccessKind, Address, ProcessId, ThreadId, ThreadState};

/// Why an attach (or launch) attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachFailure
{
    /// No process with that PID exists (or it exited while we were attaching).
    #[error("no such process")]
    NotFound,

    /// The kernel refused the trace request and no other tracer is present.
    ///
    /// Usually Yama (`/proc/sys/kernel/yama/ptrace_scope`) or a missing
    /// `CAP_SYS_PTRACE`.
    #[error("permission denied")]
    PermissionDenied,

    /// Another tracer (or this engine) already holds the process.
    #[error("process is already being traced")]
    AlreadyTraced,

    /// The program could not be started under trace.
    #[error("launch failed: {0}")]
    Launch(String),

    /// Any other errno from the tracing facility.
    #[error("{0}")]
    Os(Errno),
}

/// Main error type for engine operations
///
/// ## Error Categories
///
/// 1. **Attach errors**: `AttachFailed`
/// 2. **State errors**: `InvalidState`, `NothingToWait`, `UnknownTracee`, `UnknownThread`
/// 3. **Breakpoint table misuse**: `BreakpointCollision`, `BreakpointNotFound`, `WatchpointNotFound`
/// 4. **Watchpoint capacity/encoding**: `SlotExhausted`, `UnsupportedSize`,
///    `MisalignedWatchpoint`, `UnsupportedAccess`
/// 5. **Memory**: `InaccessibleMemory`
/// 6. **Registers**: `UnknownRegister`, `RegisterValueOutOfRange`
/// 7. **Terminal**: `TraceeGone`
/// 8. **Platform**: `Ptrace`, `Io`, `Unsupported`
#[derive(Error, Debug)]
pub enum TrapdoorError
{
    /// Attaching to (or launching) a process failed
    ///
    /// Fatal to this attempt only; the caller may retry.
    #[error("Failed to attach to process {pid}: {reason}")]
    AttachFailed
    {
        /// Target process
        pid: ProcessId,
        /// What went wrong
        reason: AttachFailure,
    },

    /// The operation is not valid for the thread's current state
    ///
    /// Typical causes:
    /// - Resuming or stepping a thread that is already running
    /// - Reading registers of a running thread
    /// - Installing a breakpoint while any thread of the tracee runs
    #[error("Cannot {operation}: thread {thread} is {actual}")]
    InvalidState
    {
        /// The rejected operation
        operation: &'static str,
        /// Thread whose state blocked the operation
        thread: ThreadId,
        /// State the thread was in
        actual: ThreadState,
    },

    /// `wait_for_stop` was called but no thread of the tracee is running,
    /// so the wait could never return.
    #[error("No running thread to wait for in process {0}")]
    NothingToWait(ProcessId),

    /// The handle does not refer to a tracee held by this engine.
    #[error("Process {0} is not traced by this engine")]
    UnknownTracee(ProcessId),

    /// The thread does not belong to the tracee (or has already exited).
    #[error("Thread {0} is not part of the tracee")]
    UnknownThread(ThreadId),

    /// A breakpoint is already installed at this address
    ///
    /// Re-installing is a hard error rather than a silent no-op.
    #[error("Breakpoint already installed at {0}")]
    BreakpointCollision(Address),

    /// No breakpoint is installed at this address.
    #[error("No breakpoint at {0}")]
    BreakpointNotFound(Address),

    /// No watchpoint occupies this hardware slot.
    #[error("No watchpoint in hardware slot {0}")]
    WatchpointNotFound(usize),

    /// Every hardware slot able to hold the requested watchpoint is in use
    ///
    /// ## Solution
    ///
    /// Remove a watchpoint, or fall back to a software breakpoint for
    /// execute-only traps.
    #[error("All {capacity} hardware slots are in use")]
    SlotExhausted
    {
        /// Number of usable slots for the requested access kind
        capacity: usize,
    },

    /// The size cannot be encoded by the debug registers.
    #[error("Watch size {size} is not supported (maximum {max})")]
    UnsupportedSize
    {
        /// Requested size in bytes
        size: usize,
        /// Largest size the profile can encode
        max: usize,
    },

    /// The address/size pair breaks the architecture's placement rule
    /// (natural alignment on x86-64, one doubleword on AArch64).
    #[error("Watch range {address} (+{size}) is misaligned")]
    MisalignedWatchpoint
    {
        /// Start of the watched range
        address: Address,
        /// Requested size in bytes
        size: usize,
    },

    /// The access kind cannot be expressed on this architecture
    /// (for example read-only watches on x86-64).
    #[error("{access} watchpoints are not supported on {architecture}")]
    UnsupportedAccess
    {
        /// Requested access kind
        access: AccessKind,
        /// Profile name
        architecture: &'static str,
    },

    /// Part of the requested range is not mapped in the tracee
    ///
    /// `address`/`length` describe the first inaccessible sub-range, not the
    /// whole request.
    #[error("Memory at {address} (+{length} bytes) is not accessible")]
    InaccessibleMemory
    {
        /// First byte that could not be accessed
        address: Address,
        /// Length of the inaccessible sub-range
        length: usize,
    },

    /// The register name is not in the architecture's catalog.
    #[error("Unknown register: {0}")]
    UnknownRegister(String),

    /// The value does not fit in the named register.
    #[error("Value 0x{value:x} does not fit in register {name}")]
    RegisterValueOutOfRange
    {
        /// Register name as given by the caller
        name: String,
        /// Rejected value
        value: u64,
    },

    /// The tracee disappeared while being traced
    ///
    /// Terminal: every later operation on the same handle fails this way.
    #[error("Process {0} is gone")]
    TraceeGone(ProcessId),

    /// The architecture cannot perform this operation at all.
    #[error("{operation} is not supported on {architecture}")]
    Unsupported
    {
        /// Operation name
        operation: &'static str,
        /// Profile name
        architecture: &'static str,
    },

    /// A ptrace or wait call failed
    #[error("{operation} failed: {source}")]
    Ptrace
    {
        /// The failing request
        operation: &'static str,
        /// Errno reported by the kernel
        #[source]
        source: Errno,
    },

    /// I/O error (procfs access and the like)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error category, one per failure family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind
{
    /// Attach or launch failed.
    Attach,
    /// Operation invalid for the current run state.
    State,
    /// Breakpoint already present.
    Collision,
    /// Breakpoint or watchpoint absent.
    NotFound,
    /// No hardware slot left.
    SlotExhausted,
    /// Size, placement or access not encodable.
    UnsupportedSize,
    /// Memory range not mapped.
    InaccessibleMemory,
    /// Register name or value mismatch.
    UnknownRegister,
    /// Tracee vanished.
    TraceeGone,
    /// Architecture lacks the facility.
    Unsupported,
    /// Raw OS failure.
    Os,
}

impl TrapdoorError
{
    /// Category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind
    {
        match self {
            Self::AttachFailed { .. } => ErrorKind::Attach,
            Self::InvalidState { .. } | Self::NothingToWait(_) | Self::UnknownTracee(_) | Self::UnknownThread(_) => ErrorKind::State,
            Self::BreakpointCollision(_) => ErrorKind::Collision,
            Self::BreakpointNotFound(_) | Self::WatchpointNotFound(_) => ErrorKind::NotFound,
            Self::SlotExhausted { .. } => ErrorKind::SlotExhausted,
            Self::UnsupportedSize { .. } | Self::MisalignedWatchpoint { .. } | Self::UnsupportedAccess { .. } => {
                ErrorKind::UnsupportedSize
            }
            Self::InaccessibleMemory { .. } => ErrorKind::InaccessibleMemory,
            Self::UnknownRegister(_) | Self::RegisterValueOutOfRange { .. } => ErrorKind::UnknownRegister,
            Self::TraceeGone(_) => ErrorKind::TraceeGone,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Ptrace { .. } | Self::Io(_) => ErrorKind::Os,
        }
    }

    /// Everything except a vanished tracee can be retried or worked around.
    #[must_use]
    pub fn is_recoverable(&self) -> bool
    {
        self.kind() != ErrorKind::TraceeGone
    }

    /// Whether the kernel answered `ESRCH`, i.e. the thread is gone or not
    /// in a ptrace-stop.
    #[must_use]
    pub fn is_no_such_process(&self) -> bool
    {
        matches!(self, Self::Ptrace { source: Errno::ESRCH, .. })
    }

    pub(crate) fn ptrace(operation: &'static str, source: Errno) -> Self
    {
        Self::Ptrace { operation, source }
    }
}

/// Convenience type alias for `Result<T, TrapdoorError>`
///
/// ```rust
/// use trapdoor_core::error::TrapdoorResult;
/// fn foo() -> TrapdoorResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type TrapdoorResult<T> = std::result::Result<T, TrapdoorError>;
