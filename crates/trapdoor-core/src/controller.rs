//! # Process Controller
//!
//! Lifecycle, per-thread run state and stop classification for one tracee.
//!
//! The controller owns the tracee's [`TraceBackend`] and is the only place
//! where threads change state:
//!
//! ```text
//! Detached -> Running -> Stopped -> {Running | Exited}
//! ```
//!
//! Attach enters at `Stopped`; detach leaves from `Stopped` only after every
//! patched byte and debug slot has been restored.
//!
//! ## Classification
//!
//! Every `SIGTRAP` stop is classified against the thread's fresh registers
//! and `siginfo`, in this order:
//!
//! 1. a hardware slot fired → [`StopCause::WatchpointHit`]
//! 2. the thread was single-stepping and the kernel reports `TRAP_TRACE`
//!    → [`StopCause::SingleStepComplete`]
//! 3. the trap address holds an enabled breakpoint → [`StopCause::BreakpointHit`]
//! 4. any other stop of a stepping thread → [`StopCause::SingleStepComplete`]
//! 5. anything else → [`StopCause::SignalDelivered`]
//!
//! A step that lands on a patched instruction reports the same program
//! counter as a hit on it on AArch64, so the `si_code` decides: `TRAP_TRACE`
//! means the step retired, anything else means the stepped instruction was
//! itself a trap.
//!
//! ## Internal events
//!
//! Some wait results never reach the caller: clone notifications, the first
//! `SIGSTOP` of a new thread (its debug slots are programmed and it is
//! resumed) and exits of non-leader threads.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tracing::{debug, info, trace, warn};

use crate::arch::{ArchitectureProfile, HitResume};
use crate::backend::{RawEvent, TraceBackend, WaitMode, TRAP_TRACE};
use crate::breakpoints::{BreakpointManager, TrapSite};
use crate::config::EngineConfig;
use crate::error::{TrapdoorError, TrapdoorResult};
use crate::events::EngineEvent;
use crate::memory::MemoryAccessor;
use crate::registers::RegisterFile;
use crate::types::{Address, MemoryRegion, ProcessId, StopCause, StopEvent, ThreadId, ThreadState};
use crate::watchpoints::WatchpointManager;

/// Lifecycle of the tracee as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceeState
{
    /// Traced; at least the leader is alive.
    Attached,
    /// The process exited or was killed.
    Exited,
    /// The engine let go of the process.
    Detached,
}

impl fmt::Display for TraceeState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            Self::Attached => "attached",
            Self::Exited => "exited",
            Self::Detached => "detached",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
struct ThreadRecord
{
    state: ThreadState,
    stepping: bool,
    halted_at: Option<TrapSite>,
    snapshot: Option<RegisterFile>,
    /// Created after attach; its first `SIGSTOP` is internal.
    nascent: bool,
}

impl ThreadRecord
{
    fn stopped() -> Self
    {
        Self {
            state: ThreadState::Stopped,
            stepping: false,
            halted_at: None,
            snapshot: None,
            nascent: false,
        }
    }

    fn nascent() -> Self
    {
        Self {
            state: ThreadState::Running,
            nascent: true,
            ..Self::stopped()
        }
    }

    fn set_running(&mut self, stepping: bool)
    {
        self.state = ThreadState::Running;
        self.stepping = stepping;
        self.halted_at = None;
        self.snapshot = None;
    }
}

/// Drives one tracee through its backend
pub struct ProcessController<B: TraceBackend>
{
    backend: B,
    pid: ProcessId,
    profile: &'static ArchitectureProfile,
    state: TraceeState,
    threads: BTreeMap<ThreadId, ThreadRecord>,
    config: EngineConfig,
    queued: VecDeque<StopEvent>,
    notices: Vec<EngineEvent>,
    launched: bool,
}

impl<B: TraceBackend> fmt::Debug for ProcessController<B>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("ProcessController")
            .field("pid", &self.pid)
            .field("architecture", &self.profile.architecture)
            .field("state", &self.state)
            .field("threads", &self.threads.len())
            .field("queued", &self.queued.len())
            .finish_non_exhaustive()
    }
}

impl<B: TraceBackend> ProcessController<B>
{
    /// Take over a freshly attached (or launched) tracee whose threads are
    /// all in a ptrace-stop.
    pub fn new(mut backend: B, profile: &'static ArchitectureProfile, config: EngineConfig, launched: bool) -> TrapdoorResult<Self>
    {
        let pid = backend.pid();
        let threads = backend
            .list_threads()?
            .into_iter()
            .map(|thread| (thread, ThreadRecord::stopped()))
            .collect::<BTreeMap<_, _>>();
        info!(pid = pid.0, threads = threads.len(), architecture = %profile.architecture, "Tracee attached");
        Ok(Self {
            backend,
            pid,
            profile,
            state: TraceeState::Attached,
            threads,
            config,
            queued: VecDeque::new(),
            notices: Vec::new(),
            launched,
        })
    }

    /// Tracee process id.
    #[must_use]
    pub fn pid(&self) -> ProcessId
    {
        self.pid
    }

    /// Architecture profile selected at attach.
    #[must_use]
    pub fn profile(&self) -> &'static ArchitectureProfile
    {
        self.profile
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> TraceeState
    {
        self.state
    }

    /// Whether the engine started this process.
    #[must_use]
    pub fn is_launched(&self) -> bool
    {
        self.launched
    }

    /// Known threads and their states, leader first.
    #[must_use]
    pub fn threads(&self) -> Vec<(ThreadId, ThreadState)>
    {
        self.threads.iter().map(|(thread, record)| (*thread, record.state)).collect()
    }

    /// Run state of one thread.
    pub fn thread_state(&self, thread: ThreadId) -> TrapdoorResult<ThreadState>
    {
        self.ensure_live()?;
        self.threads
            .get(&thread)
            .map(|record| record.state)
            .ok_or(TrapdoorError::UnknownThread(thread))
    }

    /// Threads currently in a ptrace-stop.
    #[must_use]
    pub fn stopped_threads(&self) -> Vec<ThreadId>
    {
        self.threads
            .iter()
            .filter(|(_, record)| record.state == ThreadState::Stopped)
            .map(|(thread, _)| *thread)
            .collect()
    }

    /// Trap site `thread` is halted on, if it must be stepped off before resuming.
    #[must_use]
    pub fn halted_at(&self, thread: ThreadId) -> Option<TrapSite>
    {
        self.threads.get(&thread).and_then(|record| record.halted_at)
    }

    /// Events collected for subscribers since the last call.
    pub fn drain_notices(&mut self) -> Vec<EngineEvent>
    {
        std::mem::take(&mut self.notices)
    }

    /// Fail unless the tracee can still be operated on.
    pub fn ensure_live(&self) -> TrapdoorResult<()>
    {
        match self.state {
            TraceeState::Attached => Ok(()),
            TraceeState::Exited => Err(TrapdoorError::TraceeGone(self.pid)),
            TraceeState::Detached => Err(TrapdoorError::UnknownTracee(self.pid)),
        }
    }

    /// Fail unless `thread` is in a ptrace-stop.
    pub fn require_stopped(&self, thread: ThreadId, operation: &'static str) -> TrapdoorResult<()>
    {
        match self.thread_state(thread)? {
            ThreadState::Stopped => Ok(()),
            actual => Err(TrapdoorError::InvalidState { operation, thread, actual }),
        }
    }

    /// Fail unless every live thread is stopped (trap table mutation).
    pub fn require_all_stopped(&self, operation: &'static str) -> TrapdoorResult<()>
    {
        self.ensure_live()?;
        match self.threads.iter().find(|(_, record)| record.state != ThreadState::Stopped) {
            Some((thread, record)) => Err(TrapdoorError::InvalidState {
                operation,
                thread: *thread,
                actual: record.state,
            }),
            None => Ok(()),
        }
    }

    /// A stopped thread to perform memory access through.
    pub fn any_stopped(&self, operation: &'static str) -> TrapdoorResult<ThreadId>
    {
        self.ensure_live()?;
        self.stopped_threads()
            .first()
            .copied()
            .ok_or(TrapdoorError::InvalidState {
                operation,
                thread: self.pid.leader(),
                actual: ThreadState::Running,
            })
    }

    /// Continue a stopped thread, optionally delivering `signal`
    ///
    /// ## Errors
    ///
    /// `InvalidState` if the thread is not stopped.
    pub fn resume(&mut self, thread: ThreadId, signal: Option<Signal>) -> TrapdoorResult<()>
    {
        self.require_stopped(thread, "resume")?;
        if let Err(error) = self.backend.resume(thread, signal) {
            return Err(self.os_error(thread, error));
        }
        if let Some(record) = self.threads.get_mut(&thread) {
            record.set_running(false);
        }
        trace!(pid = self.pid.0, tid = thread.0, ?signal, "Resumed thread");
        self.notices.push(EngineEvent::Resumed { pid: self.pid, thread });
        Ok(())
    }

    /// Execute one instruction of a stopped thread
    ///
    /// The completion is reported by a later wait as
    /// [`StopCause::SingleStepComplete`] (unless something else, such as a
    /// watchpoint, stops the thread first).
    ///
    /// ## Errors
    ///
    /// - `Unsupported` on profiles without hardware single-step
    /// - `InvalidState` if the thread is not stopped
    pub fn single_step(&mut self, thread: ThreadId, signal: Option<Signal>) -> TrapdoorResult<()>
    {
        if !self.profile.single_step {
            return Err(TrapdoorError::Unsupported {
                operation: "single-step",
                architecture: self.profile.name(),
            });
        }
        self.require_stopped(thread, "single-step")?;
        if let Err(error) = self.backend.single_step(thread, signal) {
            return Err(self.os_error(thread, error));
        }
        if let Some(record) = self.threads.get_mut(&thread) {
            record.set_running(true);
        }
        trace!(pid = self.pid.0, tid = thread.0, "Stepping thread");
        self.notices.push(EngineEvent::Resumed { pid: self.pid, thread });
        Ok(())
    }

    /// Ask a running thread to stop. The stop is reported by a later wait as
    /// `SignalDelivered(SIGSTOP)`; resume without a signal to discard it.
    pub fn interrupt(&mut self, thread: ThreadId) -> TrapdoorResult<()>
    {
        match self.thread_state(thread)? {
            ThreadState::Running => {}
            actual => {
                return Err(TrapdoorError::InvalidState {
                    operation: "interrupt",
                    thread,
                    actual,
                })
            }
        }
        if let Err(error) = self.backend.interrupt(thread) {
            return Err(self.os_error(thread, error));
        }
        debug!(pid = self.pid.0, tid = thread.0, "Interrupt requested");
        Ok(())
    }

    /// Registers of a stopped thread (fetched once per stop).
    pub fn registers(&mut self, thread: ThreadId) -> TrapdoorResult<&RegisterFile>
    {
        self.require_stopped(thread, "read registers")?;
        let cached = self.threads.get(&thread).is_some_and(|record| record.snapshot.is_some());
        if !cached {
            let registers = self.fetch_registers(thread)?;
            if let Some(record) = self.threads.get_mut(&thread) {
                record.snapshot = Some(registers);
            }
        }
        self.threads
            .get(&thread)
            .and_then(|record| record.snapshot.as_ref())
            .ok_or(TrapdoorError::UnknownThread(thread))
    }

    /// Read one register by name.
    pub fn read_register(&mut self, thread: ThreadId, name: &str) -> TrapdoorResult<u64>
    {
        self.registers(thread)?.read(name)
    }

    /// Write one register by name, straight through to the thread
    ///
    /// ## Errors
    ///
    /// `UnknownRegister`, `RegisterValueOutOfRange`, or `InvalidState` if
    /// the thread is running. The cached snapshot only changes on success.
    pub fn write_register(&mut self, thread: ThreadId, name: &str, value: u64) -> TrapdoorResult<()>
    {
        let mut updated = self.registers(thread)?.clone();
        updated.write(name, value)?;
        self.store_registers(thread, updated)
    }

    /// Program counter of a stopped thread.
    pub fn program_counter(&mut self, thread: ThreadId) -> TrapdoorResult<Address>
    {
        Ok(self.registers(thread)?.pc())
    }

    /// Memory accessor through some stopped thread.
    pub fn memory(&mut self) -> TrapdoorResult<MemoryAccessor<'_, B>>
    {
        let thread = self.any_stopped("access memory")?;
        Ok(MemoryAccessor::new(&mut self.backend, thread))
    }

    /// Current memory map.
    pub fn memory_regions(&mut self) -> TrapdoorResult<Vec<MemoryRegion>>
    {
        self.ensure_live()?;
        match self.backend.memory_regions() {
            Ok(regions) => Ok(regions),
            Err(error) if !self.backend.is_alive() => {
                debug!(%error, "Memory map unreadable, tracee is gone");
                self.forget_tracee();
                Err(TrapdoorError::TraceeGone(self.pid))
            }
            Err(error) => Err(error),
        }
    }

    /// Live thread ids, for programming debug slots.
    #[must_use]
    pub fn live_threads(&self) -> Vec<ThreadId>
    {
        self.threads
            .iter()
            .filter(|(_, record)| !record.state.is_terminal())
            .map(|(thread, _)| *thread)
            .collect()
    }

    /// Split borrow: the backend together with the live thread list.
    pub(crate) fn backend_and_threads(&mut self) -> (&mut B, Vec<ThreadId>)
    {
        let threads = self.live_threads();
        (&mut self.backend, threads)
    }

    /// Backend, for operations the managers perform on one thread.
    pub(crate) fn backend_mut(&mut self) -> &mut B
    {
        &mut self.backend
    }

    /// Put a stop back at the head of the queue; the next wait returns it.
    pub fn requeue(&mut self, event: StopEvent)
    {
        self.queued.push_front(event);
    }

    /// Wait for the next stop of any thread
    ///
    /// Queued stops are returned first. With a timeout the backend is polled
    /// at the configured interval; `Ok(None)` means the deadline passed and
    /// nothing changed.
    ///
    /// ## Errors
    ///
    /// - `NothingToWait` if no thread is running
    /// - `TraceeGone` if the tracee already exited
    pub fn wait_for_stop(
        &mut self,
        breakpoints: &mut BreakpointManager,
        watchpoints: &mut WatchpointManager,
        timeout: Option<Duration>,
    ) -> TrapdoorResult<Option<StopEvent>>
    {
        if let Some(event) = self.queued.pop_front() {
            return Ok(Some(self.deliver(event)));
        }
        self.ensure_live()?;
        self.require_running()?;

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let mode = if deadline.is_some() { WaitMode::Poll } else { WaitMode::Block };
            let raw = match self.backend.wait_event(mode) {
                Ok(raw) => raw,
                Err(error) => return Err(self.os_error(self.pid.leader(), error)),
            };

            match raw {
                Some(raw) => {
                    if let Some(event) = self.absorb(raw, breakpoints, watchpoints)? {
                        return Ok(Some(self.deliver(event)));
                    }
                    self.require_running()?;
                }
                None => {
                    let Some(deadline) = deadline else { continue };
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(self.config.wait_poll_interval.min(deadline - now));
                }
            }
        }
    }

    /// Wait until `thread` stops, queueing stops of other threads in
    /// arrival order
    ///
    /// The exit of the whole tracee is returned even though it is not a stop
    /// of `thread`.
    ///
    /// ## Errors
    ///
    /// `UnknownThread` if the thread exits while waiting.
    pub fn wait_for_thread(
        &mut self,
        thread: ThreadId,
        breakpoints: &mut BreakpointManager,
        watchpoints: &mut WatchpointManager,
    ) -> TrapdoorResult<StopEvent>
    {
        if let Some(position) = self.queued.iter().position(|event| event.thread == thread) {
            if let Some(event) = self.queued.remove(position) {
                return Ok(event);
            }
        }
        self.ensure_live()?;

        loop {
            match self.thread_state(thread)? {
                ThreadState::Running => {}
                actual => {
                    return Err(TrapdoorError::InvalidState {
                        operation: "wait for thread",
                        thread,
                        actual,
                    })
                }
            }

            let raw = match self.backend.wait_event(WaitMode::Block) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(error) => return Err(self.os_error(thread, error)),
            };
            if let Some(event) = self.absorb(raw, breakpoints, watchpoints)? {
                if event.thread == thread || event.cause.is_terminal() {
                    return Ok(event);
                }
                trace!(tid = event.thread.0, "Queueing stop of another thread");
                self.queued.push_back(event);
            }
        }
    }

    /// Send `SIGKILL`; the termination is reported by the next wait.
    pub fn kill(&mut self) -> TrapdoorResult<()>
    {
        self.ensure_live()?;
        if let Err(error) = self.backend.kill() {
            return Err(self.os_error(self.pid.leader(), error));
        }
        info!(pid = self.pid.0, "Killed tracee");
        self.queued.clear();
        for record in self.threads.values_mut() {
            record.set_running(false);
        }
        Ok(())
    }

    /// Stop tracing the process, leaving it running with memory and debug
    /// registers exactly as they were before attach
    ///
    /// Running threads are interrupted first. Signals that stopped a thread
    /// and were never delivered are handed back on detach.
    pub fn detach(&mut self, breakpoints: &mut BreakpointManager, watchpoints: &mut WatchpointManager) -> TrapdoorResult<()>
    {
        if self.state == TraceeState::Exited {
            self.state = TraceeState::Detached;
            breakpoints.clear();
            watchpoints.clear();
            self.notices.push(EngineEvent::Detached { pid: self.pid });
            return Ok(());
        }
        self.ensure_live()?;

        let running: Vec<ThreadId> = self
            .threads
            .iter()
            .filter(|(_, record)| record.state == ThreadState::Running)
            .map(|(thread, _)| *thread)
            .collect();
        for thread in &running {
            if let Err(error) = self.backend.interrupt(*thread) {
                debug!(tid = thread.0, %error, "Interrupt before detach failed");
            }
        }
        for thread in running {
            match self.wait_for_thread(thread, breakpoints, watchpoints) {
                Ok(event) if event.cause.is_terminal() => {
                    self.state = TraceeState::Detached;
                    self.notices.push(EngineEvent::Detached { pid: self.pid });
                    return Ok(());
                }
                Ok(event) => {
                    if event.cause != StopCause::SignalDelivered(Signal::SIGSTOP) {
                        self.queued.push_back(event);
                    }
                }
                Err(TrapdoorError::UnknownThread(_)) => {}
                Err(error) => return Err(error),
            }
        }

        let mut pending: BTreeMap<ThreadId, Signal> = BTreeMap::new();
        for event in self.queued.drain(..) {
            if let StopCause::SignalDelivered(signal) = event.cause {
                if signal != Signal::SIGTRAP && signal != Signal::SIGSTOP {
                    pending.insert(event.thread, signal);
                }
            }
        }

        let mut first_error = None;
        if let Ok(thread) = self.any_stopped("detach") {
            let mut memory = MemoryAccessor::new(&mut self.backend, thread);
            if let Err(error) = breakpoints.restore_all(&mut memory) {
                first_error.get_or_insert(error);
            }
        }
        let threads = self.live_threads();
        if let Err(error) = watchpoints.release_all(&mut self.backend, &threads) {
            first_error.get_or_insert(error);
        }

        for thread in threads {
            let signal = pending.get(&thread).copied();
            match self.backend.detach_thread(thread, signal) {
                Ok(()) => {}
                Err(error) if error.is_no_such_process() => {}
                Err(error) => {
                    warn!(tid = thread.0, %error, "Detach failed");
                    first_error.get_or_insert(error);
                }
            }
            if let Some(record) = self.threads.get_mut(&thread) {
                record.state = ThreadState::Detached;
                record.snapshot = None;
            }
        }

        self.state = TraceeState::Detached;
        info!(pid = self.pid.0, "Detached from tracee");
        self.notices.push(EngineEvent::Detached { pid: self.pid });
        first_error.map_or(Ok(()), Err)
    }

    fn require_running(&self) -> TrapdoorResult<()>
    {
        if self.threads.values().any(|record| record.state == ThreadState::Running) {
            Ok(())
        } else {
            Err(TrapdoorError::NothingToWait(self.pid))
        }
    }

    fn deliver(&mut self, event: StopEvent) -> StopEvent
    {
        debug!(pid = self.pid.0, %event, "Stop");
        self.notices.push(EngineEvent::Stopped { pid: self.pid, event });
        event
    }

    /// Apply one wait result to the bookkeeping. Returns the stop to report,
    /// or `None` for internal events.
    fn absorb(
        &mut self,
        raw: RawEvent,
        breakpoints: &mut BreakpointManager,
        watchpoints: &mut WatchpointManager,
    ) -> TrapdoorResult<Option<StopEvent>>
    {
        trace!(pid = self.pid.0, ?raw, "Wait result");
        match raw {
            RawEvent::ThreadCreated { parent, child } => {
                if !self.threads.contains_key(&child) {
                    self.threads.insert(child, ThreadRecord::nascent());
                }
                self.notices.push(EngineEvent::ThreadCreated { pid: self.pid, thread: child });
                debug!(pid = self.pid.0, parent = parent.0, child = child.0, "New thread");

                if let Some(record) = self.threads.get_mut(&parent) {
                    record.state = ThreadState::Stopped;
                    record.snapshot = None;
                }
                if let Err(error) = self.backend.resume(parent, None) {
                    return Err(self.os_error(parent, error));
                }
                if let Some(record) = self.threads.get_mut(&parent) {
                    record.state = ThreadState::Running;
                }
                Ok(None)
            }
            RawEvent::Stopped { thread, signal } => {
                let record = self.threads.entry(thread).or_insert_with(ThreadRecord::nascent);
                record.state = ThreadState::Stopped;
                record.snapshot = None;

                if record.nascent && signal == Signal::SIGSTOP {
                    record.nascent = false;
                    if let Err(error) = watchpoints.arm_thread(&mut self.backend, thread) {
                        warn!(tid = thread.0, %error, "Could not program debug slots into new thread");
                    }
                    if let Err(error) = self.backend.resume(thread, None) {
                        return Err(self.os_error(thread, error));
                    }
                    if let Some(record) = self.threads.get_mut(&thread) {
                        record.state = ThreadState::Running;
                    }
                    return Ok(None);
                }

                let cause = if signal == Signal::SIGTRAP {
                    self.classify(thread, breakpoints, watchpoints)?
                } else {
                    if let Some(record) = self.threads.get_mut(&thread) {
                        record.stepping = false;
                    }
                    StopCause::SignalDelivered(signal)
                };
                Ok(Some(StopEvent::new(thread, cause)))
            }
            RawEvent::Exited { thread, code } => Ok(self.thread_gone(thread, StopCause::Exited(code), breakpoints, watchpoints)),
            RawEvent::Terminated { thread, signal } => {
                Ok(self.thread_gone(thread, StopCause::Terminated(signal), breakpoints, watchpoints))
            }
        }
    }

    fn thread_gone(
        &mut self,
        thread: ThreadId,
        cause: StopCause,
        breakpoints: &mut BreakpointManager,
        watchpoints: &mut WatchpointManager,
    ) -> Option<StopEvent>
    {
        if thread == self.pid.leader() {
            info!(pid = self.pid.0, %cause, "Tracee ended");
            self.forget_tracee();
            breakpoints.clear();
            watchpoints.clear();
            Some(StopEvent::new(thread, cause))
        } else {
            self.threads.remove(&thread);
            self.queued.retain(|event| event.thread != thread);
            debug!(pid = self.pid.0, tid = thread.0, "Thread exited");
            self.notices.push(EngineEvent::ThreadExited { pid: self.pid, thread });
            None
        }
    }

    fn classify(&mut self, thread: ThreadId, breakpoints: &mut BreakpointManager, watchpoints: &mut WatchpointManager) -> TrapdoorResult<StopCause>
    {
        let info = match self.backend.siginfo(thread) {
            Ok(info) => info,
            Err(error) => return Err(self.os_error(thread, error)),
        };
        let stepping = self
            .threads
            .get_mut(&thread)
            .map_or(false, |record| std::mem::replace(&mut record.stepping, false));

        if let Some(hit) = watchpoints.match_hit(&mut self.backend, thread, &info)? {
            let watchpoint = hit.watchpoint;
            if hit.resume == HitResume::StepWithSlotDisabled {
                self.set_halted(thread, TrapSite::Hardware { slot: watchpoint.slot });
            }
            return Ok(StopCause::WatchpointHit {
                address: watchpoint.address,
                access: watchpoint.access,
                slot: watchpoint.slot,
            });
        }

        // A step that executed a trap instruction reports the trap's si_code
        if stepping && info.code == TRAP_TRACE {
            return Ok(StopCause::SingleStepComplete);
        }

        let pc = self.registers(thread)?.pc();
        if let Some(trap_address) = pc.checked_sub(self.profile.trap.pc_offset) {
            if breakpoints.is_armed(trap_address) {
                if trap_address != pc {
                    let mut rewound = self.registers(thread)?.clone();
                    rewound.set_pc(trap_address);
                    self.store_registers(thread, rewound)?;
                }
                breakpoints.record_hit(trap_address);
                self.set_halted(thread, TrapSite::Software(trap_address));
                return Ok(StopCause::BreakpointHit(trap_address));
            }
        }

        // x86 reports a step over `syscall` as TRAP_BRKPT
        if stepping {
            return Ok(StopCause::SingleStepComplete);
        }
        Ok(StopCause::SignalDelivered(Signal::SIGTRAP))
    }

    fn set_halted(&mut self, thread: ThreadId, site: TrapSite)
    {
        if let Some(record) = self.threads.get_mut(&thread) {
            record.halted_at = Some(site);
        }
    }

    fn fetch_registers(&mut self, thread: ThreadId) -> TrapdoorResult<RegisterFile>
    {
        let block = self.profile.register_block;
        let mut bytes = vec![0u8; block.size];
        match self.backend.read_regset(thread, block.note, &mut bytes) {
            Ok(length) => {
                bytes.truncate(length);
                Ok(RegisterFile::from_bytes(self.profile, bytes))
            }
            Err(error) => Err(self.os_error(thread, error)),
        }
    }

    fn store_registers(&mut self, thread: ThreadId, registers: RegisterFile) -> TrapdoorResult<()>
    {
        let note = self.profile.register_block.note;
        if let Err(error) = self.backend.write_regset(thread, note, registers.as_bytes()) {
            return Err(self.os_error(thread, error));
        }
        if let Some(record) = self.threads.get_mut(&thread) {
            record.snapshot = Some(registers);
        }
        Ok(())
    }

    /// Translate a backend failure, noticing a vanished tracee or thread.
    fn os_error(&mut self, thread: ThreadId, error: TrapdoorError) -> TrapdoorError
    {
        if !error.is_no_such_process() {
            return error;
        }
        if !self.backend.is_alive() {
            warn!(pid = self.pid.0, "Tracee vanished");
            self.forget_tracee();
            return TrapdoorError::TraceeGone(self.pid);
        }
        if thread != self.pid.leader() {
            if let Some(record) = self.threads.get_mut(&thread) {
                debug!(tid = thread.0, "Thread vanished");
                record.state = ThreadState::Exited;
                return TrapdoorError::UnknownThread(thread);
            }
        }
        error
    }

    fn forget_tracee(&mut self)
    {
        self.state = TraceeState::Exited;
        self.threads.clear();
        self.queued.clear();
    }
}
