//! # Trace Backend
//!
//! The narrow set of kernel requests the engine needs from a tracing facility.
//!
//! A backend owns exactly one tracee. It knows nothing about breakpoints,
//! watchpoints or architectures: it moves bytes in and out of threads and
//! reports raw wait results. Everything above it (event classification,
//! trap bookkeeping, debug slot encoding) is written once against this trait.
//!
//! [`LinuxPtrace`](crate::platform::linux::LinuxPtrace) is the production
//! implementation. Tests drive the engine with an in-memory fake.

use nix::sys::signal::Signal;

use crate::error::TrapdoorResult;
use crate::types::{Address, MemoryRegion, ProcessId, ThreadId};

/// How long `wait_event` may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode
{
    /// Wait until some traced thread changes state.
    Block,
    /// Return `None` immediately if nothing is pending.
    Poll,
}

/// An unclassified wait result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEvent
{
    /// A thread entered a signal-delivery stop.
    Stopped
    {
        /// Thread that stopped
        thread: ThreadId,
        /// Signal that stopped it
        signal: Signal,
    },
    /// A thread exited normally. For the leader this is the process exit.
    Exited
    {
        /// Thread that exited
        thread: ThreadId,
        /// Exit status
        code: i32,
    },
    /// A thread was killed by a signal.
    Terminated
    {
        /// Thread that died
        thread: ThreadId,
        /// Fatal signal
        signal: Signal,
    },
    /// A traced thread cloned a new thread, which is already traced.
    ThreadCreated
    {
        /// Thread that called `clone`
        parent: ThreadId,
        /// The new thread
        child: ThreadId,
    },
}

impl RawEvent
{
    /// Thread the event is about (the parent for clone events).
    #[must_use]
    pub const fn thread(&self) -> ThreadId
    {
        match *self {
            Self::Stopped { thread, .. } | Self::Exited { thread, .. } | Self::Terminated { thread, .. } => thread,
            Self::ThreadCreated { parent, .. } => parent,
        }
    }
}

/// `si_code` of a completed single-step (`TRAP_TRACE`)
pub const TRAP_TRACE: i32 = 2;

/// The parts of `siginfo_t` the classifier looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapInfo
{
    /// `si_signo`
    pub signal: Signal,
    /// `si_code`
    pub code: i32,
    /// `si_addr` (the triggering data address for watchpoint hits)
    pub fault_address: Address,
}

/// Kernel facility used to trace one process
///
/// All thread-addressed requests require the thread to be in a ptrace-stop,
/// except [`interrupt`](Self::interrupt) and [`kill`](Self::kill). A thread
/// that vanished answers `ESRCH` (see
/// [`TrapdoorError::is_no_such_process`](crate::error::TrapdoorError::is_no_such_process)).
pub trait TraceBackend
{
    /// The traced process.
    fn pid(&self) -> ProcessId;

    /// Threads currently traced, leader first.
    fn list_threads(&mut self) -> TrapdoorResult<Vec<ThreadId>>;

    /// Continue a stopped thread, optionally delivering a signal.
    fn resume(&mut self, thread: ThreadId, signal: Option<Signal>) -> TrapdoorResult<()>;

    /// Execute exactly one instruction, optionally delivering a signal first.
    fn single_step(&mut self, thread: ThreadId, signal: Option<Signal>) -> TrapdoorResult<()>;

    /// Collect the next wait result for any traced thread.
    fn wait_event(&mut self, mode: WaitMode) -> TrapdoorResult<Option<RawEvent>>;

    /// Signal details of the last stop of `thread`.
    fn siginfo(&mut self, thread: ThreadId) -> TrapdoorResult<TrapInfo>;

    /// Read a regset into `buffer`, returning the number of bytes filled.
    fn read_regset(&mut self, thread: ThreadId, note: u32, buffer: &mut [u8]) -> TrapdoorResult<usize>;

    /// Write a regset from `data`.
    fn write_regset(&mut self, thread: ThreadId, note: u32, data: &[u8]) -> TrapdoorResult<()>;

    /// Read one word of the thread's user area.
    fn peek_user(&mut self, thread: ThreadId, offset: usize) -> TrapdoorResult<u64>;

    /// Write one word of the thread's user area.
    fn poke_user(&mut self, thread: ThreadId, offset: usize, value: u64) -> TrapdoorResult<()>;

    /// Read tracee memory; fails if any byte is unreadable.
    fn read_memory(&mut self, thread: ThreadId, address: Address, buffer: &mut [u8]) -> TrapdoorResult<()>;

    /// Write tracee memory, including read-only text.
    fn write_memory(&mut self, thread: ThreadId, address: Address, data: &[u8]) -> TrapdoorResult<()>;

    /// Current address-space layout.
    fn memory_regions(&mut self) -> TrapdoorResult<Vec<MemoryRegion>>;

    /// Ask a running thread to stop; the stop arrives through `wait_event`.
    fn interrupt(&mut self, thread: ThreadId) -> TrapdoorResult<()>;

    /// Stop tracing one thread, letting it run freely.
    fn detach_thread(&mut self, thread: ThreadId, signal: Option<Signal>) -> TrapdoorResult<()>;

    /// Kill the whole process.
    fn kill(&mut self) -> TrapdoorResult<()>;

    /// Whether the process still exists.
    fn is_alive(&self) -> bool;
}
