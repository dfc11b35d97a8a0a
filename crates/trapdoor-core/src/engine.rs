//! # Engine
//!
//! The composition root: one [`ProcessController`] per tracee, wired to its
//! breakpoint and watchpoint tables, behind explicit [`TraceeHandle`]s.
//!
//! There is no ambient "current tracee". Every call names the tracee it acts
//! on, and a handle that no longer refers to a traced process fails with
//! `UnknownTracee`.
//!
//! ## Stepping off trap sites
//!
//! A thread whose PC sits on an armed breakpoint (or that halted, on AArch64,
//! on a watchpoint that has to be replayed) is stepped off transparently by
//! [`resume`](Engine::resume) and [`single_step`](Engine::single_step): the
//! site is disarmed for that one instruction and armed again before the call
//! returns.
//!
//! ## Threads
//!
//! ptrace requests must come from the OS thread that attached. An `Engine`
//! is therefore `Send` but meant to be driven from one thread at a time;
//! trace several processes concurrently with one engine per thread.
//!
//! ## Example
//!
//! ```rust,no_run
//! use trapdoor_core::prelude::*;
//!
//! # fn main() -> TrapdoorResult<()> {
//! let mut engine: Engine = Engine::new(EngineConfig::from_env());
//! let tracee = engine.attach(ProcessId(4242))?;
//!
//! let pc = engine.program_counter(tracee, tracee.leader())?;
//! engine.install_breakpoint(tracee, pc + 0x10)?;
//! engine.resume(tracee, tracee.leader())?;
//!
//! let stop = engine.wait_for_stop(tracee)?;
//! println!("{stop}");
//! engine.detach(tracee)?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::arch::ArchitectureProfile;
use crate::backend::TraceBackend;
use crate::breakpoints::{Breakpoint, BreakpointManager, StepOver, TrapSite};
use crate::config::{EngineConfig, LaunchOptions};
use crate::controller::{ProcessController, TraceeState};
use crate::error::{AttachFailure, TrapdoorError, TrapdoorResult};
use crate::events::{EngineEventReceiver, EventHub};
use crate::memory;
use crate::platform::linux::LinuxPtrace;
use crate::registers::RegisterFile;
use crate::types::{AccessKind, Address, Architecture, MemoryRegion, ProcessId, StopCause, StopEvent, ThreadId, ThreadState};
use crate::unwind::{self, StackFrame};
use crate::watchpoints::{Watchpoint, WatchpointManager};

/// Opaque reference to a tracee held by an [`Engine`]
///
/// Cheap to copy. A handle outlives its tracee harmlessly: once the process
/// is detached, every call with it fails with `UnknownTracee`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceeHandle
{
    pid: ProcessId,
}

impl TraceeHandle
{
    /// Process id of the tracee.
    #[must_use]
    pub const fn pid(self) -> ProcessId
    {
        self.pid
    }

    /// Leader thread of the tracee.
    #[must_use]
    pub const fn leader(self) -> ThreadId
    {
        self.pid.leader()
    }
}

impl fmt::Display for TraceeHandle
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "tracee {}", self.pid)
    }
}

/// Everything the engine keeps for one tracee.
struct Session<B: TraceBackend>
{
    controller: ProcessController<B>,
    breakpoints: BreakpointManager,
    watchpoints: WatchpointManager,
}

impl<B: TraceBackend> Session<B>
{
    /// The trap site `thread` still has to be stepped off, if any
    ///
    /// Besides the site the thread halted on, any armed breakpoint under the
    /// current PC counts: the thread may have stepped onto it, or the caller
    /// may have moved the PC there.
    fn armed_site(&mut self, thread: ThreadId) -> TrapdoorResult<Option<TrapSite>>
    {
        if let Some(TrapSite::Hardware { slot }) = self.controller.halted_at(thread) {
            if self.watchpoints.get(slot).is_some() {
                return Ok(Some(TrapSite::Hardware { slot }));
            }
        }
        let pc = self.controller.program_counter(thread)?;
        Ok(self.breakpoints.is_armed(pc).then_some(TrapSite::Software(pc)))
    }

    fn resume(&mut self, thread: ThreadId, signal: Option<Signal>) -> TrapdoorResult<()>
    {
        self.controller.require_stopped(thread, "resume")?;
        let Some(site) = self.armed_site(thread)? else {
            return self.controller.resume(thread, signal);
        };

        let profile = self.controller.profile();
        if !profile.single_step {
            return Err(TrapdoorError::Unsupported {
                operation: "resuming from an armed breakpoint",
                architecture: profile.name(),
            });
        }

        let event = self.step_over(thread, site, signal)?;
        if event.thread != thread || event.cause != StopCause::SingleStepComplete {
            // something else stopped the thread first; report it on the next wait
            debug!(tid = thread.0, %event, "Step-over interrupted");
            self.controller.requeue(event);
            return Ok(());
        }
        self.controller.resume(thread, None)
    }

    fn single_step(&mut self, thread: ThreadId) -> TrapdoorResult<()>
    {
        self.controller.require_stopped(thread, "single-step")?;
        match self.armed_site(thread)? {
            Some(site) if self.controller.profile().single_step => {
                let event = self.step_over(thread, site, None)?;
                self.controller.requeue(event);
                Ok(())
            }
            _ => self.controller.single_step(thread, None),
        }
    }

    /// Disarm `site` for one instruction of `thread`, step, and arm it again.
    fn step_over(&mut self, thread: ThreadId, site: TrapSite, signal: Option<Signal>) -> TrapdoorResult<StopEvent>
    {
        let mut step = StepOver::new(thread, site);
        self.disarm(thread, site)?;
        step.begin()?;
        debug!(tid = thread.0, %site, "Stepping over trap site");

        let stepped = self
            .controller
            .single_step(thread, signal)
            .and_then(|()| self.controller.wait_for_thread(thread, &mut self.breakpoints, &mut self.watchpoints));

        let rearmed = self.rearm(thread, site);
        step.finish()?;

        match (stepped, rearmed) {
            (Ok(event), Ok(())) => Ok(event),
            (Ok(event), Err(error)) => {
                self.controller.requeue(event);
                Err(error)
            }
            (Err(error), rearmed) => {
                if let Err(rearm_error) = rearmed {
                    warn!(tid = thread.0, %site, %rearm_error, "Could not re-arm trap site");
                }
                Err(error)
            }
        }
    }

    fn disarm(&mut self, thread: ThreadId, site: TrapSite) -> TrapdoorResult<()>
    {
        match site {
            TrapSite::Software(address) => {
                let mut memory = self.controller.memory()?;
                self.breakpoints.disable(&mut memory, address)
            }
            TrapSite::Hardware { slot } => self.watchpoints.suspend_slot(self.controller.backend_mut(), thread, slot),
        }
    }

    fn rearm(&mut self, thread: ThreadId, site: TrapSite) -> TrapdoorResult<()>
    {
        if self.controller.state() != TraceeState::Attached {
            return Ok(());
        }
        match site {
            TrapSite::Software(address) => {
                if !self.breakpoints.contains(address) {
                    return Ok(());
                }
                let mut memory = self.controller.memory()?;
                self.breakpoints.enable(&mut memory, address)
            }
            TrapSite::Hardware { slot } => {
                match self.watchpoints.restore_slot(self.controller.backend_mut(), thread, slot) {
                    // the stepped thread exited; nothing left to re-arm
                    Err(error) if error.is_no_such_process() => Ok(()),
                    other => other,
                }
            }
        }
    }

    fn wait(&mut self, timeout: Option<Duration>) -> TrapdoorResult<Option<StopEvent>>
    {
        self.controller
            .wait_for_stop(&mut self.breakpoints, &mut self.watchpoints, timeout)
    }

    fn detach(&mut self) -> TrapdoorResult<()>
    {
        self.controller.detach(&mut self.breakpoints, &mut self.watchpoints)
    }
}

/// Tracing engine holding any number of tracees
///
/// Generic over the [`TraceBackend`] so the whole engine can be driven
/// against a scripted backend; production code uses the default,
/// [`LinuxPtrace`].
///
/// Dropping the engine detaches every tracee (restoring patched memory and
/// debug registers) and kills launched ones when
/// [`EngineConfig::kill_on_drop`] is set.
pub struct Engine<B: TraceBackend = LinuxPtrace>
{
    config: EngineConfig,
    sessions: HashMap<ProcessId, Session<B>>,
    hub: EventHub,
}

impl<B: TraceBackend> fmt::Debug for Engine<B>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let mut tracees: Vec<&ProcessId> = self.sessions.keys().collect();
        tracees.sort();
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("tracees", &tracees)
            .finish_non_exhaustive()
    }
}

impl Engine<LinuxPtrace>
{
    /// Attach to a running process and all of its threads
    ///
    /// Every thread is stopped when this returns.
    ///
    /// ## Errors
    ///
    /// - `AttachFailed{reason: AlreadyTraced}` if this engine already holds
    ///   the process, or another tracer does
    /// - `AttachFailed{reason: NotFound | PermissionDenied | Os(..)}`
    /// - `Unsupported` if the executable's ISA has no profile
    pub fn attach(&mut self, pid: ProcessId) -> TrapdoorResult<TraceeHandle>
    {
        self.ensure_not_held(pid)?;
        let profile = ArchitectureProfile::detect(pid)?;
        let backend = LinuxPtrace::attach(pid, &self.config)?;
        self.adopt(backend, profile, false)
    }

    /// Start `program` with `args` under trace, inheriting this process's
    /// environment
    ///
    /// The new process is stopped at its first instruction after `exec`.
    ///
    /// ## Errors
    ///
    /// `AttachFailed{reason: Launch(..)}` if the program cannot be started.
    pub fn launch(&mut self, program: impl AsRef<Path>, args: &[&str]) -> TrapdoorResult<TraceeHandle>
    {
        self.launch_with(program, args, &LaunchOptions::default())
    }

    /// Start `program` under trace with an explicit environment and/or
    /// address-space randomization turned off.
    pub fn launch_with(&mut self, program: impl AsRef<Path>, args: &[&str], options: &LaunchOptions) -> TrapdoorResult<TraceeHandle>
    {
        let mut backend = LinuxPtrace::launch(program.as_ref(), args, options, &self.config)?;
        let pid = backend.pid();
        let profile = match ArchitectureProfile::detect(pid) {
            Ok(profile) => profile,
            Err(error) => {
                if let Err(kill_error) = backend.kill() {
                    warn!(pid = pid.0, %kill_error, "Could not kill unsupported tracee");
                }
                return Err(error);
            }
        };
        self.adopt(backend, profile, true)
    }
}

impl<B: TraceBackend> Engine<B>
{
    /// Engine with no tracees.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self
    {
        Self {
            config,
            sessions: HashMap::new(),
            hub: EventHub::default(),
        }
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &EngineConfig
    {
        &self.config
    }

    /// Take over a backend whose threads are all stopped
    ///
    /// `launched` marks processes the engine started itself (killed rather
    /// than detached on drop when configured).
    pub fn adopt(&mut self, mut backend: B, profile: &'static ArchitectureProfile, launched: bool) -> TrapdoorResult<TraceeHandle>
    {
        let pid = backend.pid();
        self.ensure_not_held(pid)?;

        let mut watchpoints = WatchpointManager::new(profile);
        watchpoints.probe_capacity(&mut backend, pid.leader());
        let controller = ProcessController::new(backend, profile, self.config, launched)?;

        self.sessions.insert(
            pid,
            Session {
                controller,
                breakpoints: BreakpointManager::new(profile),
                watchpoints,
            },
        );
        Ok(TraceeHandle { pid })
    }

    /// Handles of every tracee currently held.
    #[must_use]
    pub fn tracees(&self) -> Vec<TraceeHandle>
    {
        let mut handles: Vec<TraceeHandle> = self.sessions.keys().map(|pid| TraceeHandle { pid: *pid }).collect();
        handles.sort_by_key(|handle| handle.pid);
        handles
    }

    /// Receive every [`EngineEvent`](crate::events::EngineEvent) from now on.
    pub fn subscribe(&mut self) -> EngineEventReceiver
    {
        self.hub.subscribe()
    }

    /// Stop tracing, restoring every patched byte and debug slot.
    ///
    /// The handle is invalid afterwards, even if restoring partially failed.
    pub fn detach(&mut self, handle: TraceeHandle) -> TrapdoorResult<()>
    {
        let result = self.with_session(handle, Session::detach);
        let released = self
            .sessions
            .get(&handle.pid)
            .map_or(false, |session| session.controller.state() != TraceeState::Attached);
        if released {
            self.sessions.remove(&handle.pid);
        }
        result
    }

    /// Kill the tracee. The termination is reported by the next wait.
    pub fn kill(&mut self, handle: TraceeHandle) -> TrapdoorResult<()>
    {
        self.with_session(handle, |session| session.controller.kill())
    }

    /// Lifecycle state of the tracee.
    pub fn state(&self, handle: TraceeHandle) -> TrapdoorResult<TraceeState>
    {
        Ok(self.session(handle)?.controller.state())
    }

    /// ISA of the tracee.
    pub fn architecture(&self, handle: TraceeHandle) -> TrapdoorResult<Architecture>
    {
        Ok(self.profile(handle)?.architecture)
    }

    /// Architecture profile selected at attach.
    pub fn profile(&self, handle: TraceeHandle) -> TrapdoorResult<&'static ArchitectureProfile>
    {
        Ok(self.session(handle)?.controller.profile())
    }

    /// Known threads with their run states, leader first.
    pub fn threads(&self, handle: TraceeHandle) -> TrapdoorResult<Vec<(ThreadId, ThreadState)>>
    {
        let session = self.session(handle)?;
        session.controller.ensure_live()?;
        Ok(session.controller.threads())
    }

    /// Continue a stopped thread.
    ///
    /// ## Errors
    ///
    /// - `InvalidState` if the thread is running
    /// - `Unsupported` when the thread sits on an armed breakpoint and the
    ///   ISA cannot single-step (RISC-V); disable the breakpoint first
    pub fn resume(&mut self, handle: TraceeHandle, thread: ThreadId) -> TrapdoorResult<()>
    {
        self.resume_with_signal(handle, thread, None)
    }

    /// Continue a stopped thread, delivering `signal` (or suppressing the
    /// pending one with `None`).
    pub fn resume_with_signal(&mut self, handle: TraceeHandle, thread: ThreadId, signal: Option<Signal>) -> TrapdoorResult<()>
    {
        self.with_session(handle, |session| session.resume(thread, signal))
    }

    /// Continue every stopped thread.
    pub fn resume_all(&mut self, handle: TraceeHandle) -> TrapdoorResult<()>
    {
        self.with_session(handle, |session| {
            session.controller.ensure_live()?;
            for thread in session.controller.stopped_threads() {
                session.resume(thread, None)?;
            }
            Ok(())
        })
    }

    /// Execute one instruction; the completion is reported by the next wait.
    pub fn single_step(&mut self, handle: TraceeHandle, thread: ThreadId) -> TrapdoorResult<()>
    {
        self.with_session(handle, |session| session.single_step(thread))
    }

    /// Block until some thread of the tracee stops.
    pub fn wait_for_stop(&mut self, handle: TraceeHandle) -> TrapdoorResult<StopEvent>
    {
        let pid = handle.pid;
        self.with_session(handle, |session| session.wait(None))?
            .ok_or(TrapdoorError::NothingToWait(pid))
    }

    /// Wait at most `timeout` for a stop
    ///
    /// `Ok(None)` means the deadline passed; the tracee and all bookkeeping
    /// are exactly as before the call.
    pub fn wait_for_stop_timeout(&mut self, handle: TraceeHandle, timeout: Duration) -> TrapdoorResult<Option<StopEvent>>
    {
        self.with_session(handle, |session| session.wait(Some(timeout)))
    }

    /// Ask a running thread to stop.
    pub fn interrupt(&mut self, handle: TraceeHandle, thread: ThreadId) -> TrapdoorResult<()>
    {
        self.with_session(handle, |session| session.controller.interrupt(thread))
    }

    /// Full register snapshot of a stopped thread.
    pub fn registers(&mut self, handle: TraceeHandle, thread: ThreadId) -> TrapdoorResult<RegisterFile>
    {
        self.with_session(handle, |session| session.controller.registers(thread).cloned())
    }

    /// Read a register by name.
    pub fn read_register(&mut self, handle: TraceeHandle, thread: ThreadId, name: &str) -> TrapdoorResult<u64>
    {
        self.with_session(handle, |session| session.controller.read_register(thread, name))
    }

    /// Write a register by name.
    pub fn write_register(&mut self, handle: TraceeHandle, thread: ThreadId, name: &str, value: u64) -> TrapdoorResult<()>
    {
        self.with_session(handle, |session| session.controller.write_register(thread, name, value))
    }

    /// Program counter of a stopped thread.
    pub fn program_counter(&mut self, handle: TraceeHandle, thread: ThreadId) -> TrapdoorResult<Address>
    {
        self.with_session(handle, |session| session.controller.program_counter(thread))
    }

    /// Read `length` bytes of tracee memory (all or nothing).
    pub fn read_memory(&mut self, handle: TraceeHandle, address: Address, length: usize) -> TrapdoorResult<Vec<u8>>
    {
        self.with_session(handle, |session| session.controller.memory()?.read(address, length))
    }

    /// Write bytes into tracee memory (all or nothing).
    pub fn write_memory(&mut self, handle: TraceeHandle, address: Address, data: &[u8]) -> TrapdoorResult<()>
    {
        self.with_session(handle, |session| session.controller.memory()?.write(address, data))
    }

    /// The tracee's memory map.
    pub fn memory_regions(&mut self, handle: TraceeHandle) -> TrapdoorResult<Vec<MemoryRegion>>
    {
        self.with_session(handle, |session| session.controller.memory_regions())
    }

    /// Load base of the tracee (its lowest mapping)
    ///
    /// ## Errors
    ///
    /// `InaccessibleMemory` if nothing is mapped.
    pub fn base_address(&mut self, handle: TraceeHandle) -> TrapdoorResult<Address>
    {
        let regions = self.memory_regions(handle)?;
        memory::base_address(&regions).ok_or(TrapdoorError::InaccessibleMemory {
            address: Address::ZERO,
            length: 1,
        })
    }

    /// Turn an offset from the load base into an absolute address; mapped
    /// absolute addresses pass through unchanged
    ///
    /// Handy for placing breakpoints in position-independent executables:
    ///
    /// ```rust,no_run
    /// # use trapdoor_core::prelude::*;
    /// # fn main() -> TrapdoorResult<()> {
    /// # let mut engine: Engine = Engine::new(EngineConfig::default());
    /// let tracee = engine.launch("/usr/bin/true", &[])?;
    /// let main = engine.resolve_address(tracee, Address::new(0x1139))?;
    /// engine.install_breakpoint(tracee, main)?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// ## Errors
    ///
    /// `InaccessibleMemory` if the result is not mapped.
    pub fn resolve_address(&mut self, handle: TraceeHandle, address: Address) -> TrapdoorResult<Address>
    {
        let regions = self.memory_regions(handle)?;
        memory::resolve_address(&regions, address)
    }

    /// Frame-pointer backtrace of a stopped thread, innermost frame first
    ///
    /// Links are only followed through mapped memory; see [`unwind`] for
    /// where the walk stops.
    pub fn backtrace(&mut self, handle: TraceeHandle, thread: ThreadId) -> TrapdoorResult<Vec<StackFrame>>
    {
        self.with_session(handle, |session| {
            let registers = session.controller.registers(thread)?.clone();
            let mut memory = session.controller.memory()?;
            unwind::backtrace(&registers, &mut memory, unwind::MAX_FRAMES)
        })
    }

    /// Patch a software breakpoint at `address`
    ///
    /// ## Errors
    ///
    /// - `InvalidState` unless every thread is stopped
    /// - `BreakpointCollision` if one is already installed there
    /// - `InaccessibleMemory` if the address is not mapped
    pub fn install_breakpoint(&mut self, handle: TraceeHandle, address: Address) -> TrapdoorResult<()>
    {
        self.with_session(handle, |session| {
            session.controller.require_all_stopped("install breakpoint")?;
            let mut memory = session.controller.memory()?;
            session.breakpoints.install(&mut memory, address)
        })
    }

    /// Remove the breakpoint at `address`, restoring the original bytes.
    pub fn uninstall_breakpoint(&mut self, handle: TraceeHandle, address: Address) -> TrapdoorResult<()>
    {
        self.with_session(handle, |session| {
            session.controller.require_all_stopped("remove breakpoint")?;
            let mut memory = session.controller.memory()?;
            session.breakpoints.uninstall(&mut memory, address)
        })
    }

    /// Re-patch a disabled breakpoint.
    pub fn enable_breakpoint(&mut self, handle: TraceeHandle, address: Address) -> TrapdoorResult<()>
    {
        self.with_session(handle, |session| {
            session.controller.require_all_stopped("enable breakpoint")?;
            let mut memory = session.controller.memory()?;
            session.breakpoints.enable(&mut memory, address)
        })
    }

    /// Restore the original bytes but keep the breakpoint in the table.
    pub fn disable_breakpoint(&mut self, handle: TraceeHandle, address: Address) -> TrapdoorResult<()>
    {
        self.with_session(handle, |session| {
            session.controller.require_all_stopped("disable breakpoint")?;
            let mut memory = session.controller.memory()?;
            session.breakpoints.disable(&mut memory, address)
        })
    }

    /// Installed breakpoints, ordered by address.
    pub fn breakpoints(&self, handle: TraceeHandle) -> TrapdoorResult<Vec<Breakpoint>>
    {
        let mut breakpoints: Vec<Breakpoint> = self.session(handle)?.breakpoints.iter().cloned().collect();
        breakpoints.sort_by_key(|breakpoint| breakpoint.address);
        Ok(breakpoints)
    }

    /// Program a hardware watchpoint into every thread; returns its slot
    ///
    /// [`AccessKind::Execute`] installs a hardware execute breakpoint, which
    /// patches no memory.
    ///
    /// ## Errors
    ///
    /// - `InvalidState` unless every thread is stopped
    /// - `SlotExhausted`, `UnsupportedSize`, `MisalignedWatchpoint`,
    ///   `UnsupportedAccess`
    pub fn install_watchpoint(&mut self, handle: TraceeHandle, address: Address, size: usize, access: AccessKind) -> TrapdoorResult<usize>
    {
        self.with_session(handle, |session| {
            session.controller.require_all_stopped("install watchpoint")?;
            let (backend, threads) = session.controller.backend_and_threads();
            session.watchpoints.install(backend, &threads, address, size, access)
        })
    }

    /// Free a hardware slot.
    pub fn uninstall_watchpoint(&mut self, handle: TraceeHandle, slot: usize) -> TrapdoorResult<()>
    {
        self.with_session(handle, |session| {
            session.controller.require_all_stopped("remove watchpoint")?;
            let (backend, threads) = session.controller.backend_and_threads();
            session.watchpoints.uninstall(backend, &threads, slot)
        })
    }

    /// Active watchpoints in slot order.
    pub fn watchpoints(&self, handle: TraceeHandle) -> TrapdoorResult<Vec<Watchpoint>>
    {
        Ok(self.session(handle)?.watchpoints.iter().copied().collect())
    }

    /// Usable hardware slots for `access` on this tracee.
    pub fn watchpoint_capacity(&self, handle: TraceeHandle, access: AccessKind) -> TrapdoorResult<usize>
    {
        Ok(self.session(handle)?.watchpoints.capacity(access))
    }

    fn ensure_not_held(&self, pid: ProcessId) -> TrapdoorResult<()>
    {
        if self.sessions.contains_key(&pid) {
            return Err(TrapdoorError::AttachFailed {
                pid,
                reason: AttachFailure::AlreadyTraced,
            });
        }
        Ok(())
    }

    fn session(&self, handle: TraceeHandle) -> TrapdoorResult<&Session<B>>
    {
        self.sessions
            .get(&handle.pid)
            .ok_or(TrapdoorError::UnknownTracee(handle.pid))
    }

    /// Run `operation` on the tracee's session, then publish whatever the
    /// controller noticed, whether or not the operation succeeded.
    fn with_session<T>(&mut self, handle: TraceeHandle, operation: impl FnOnce(&mut Session<B>) -> TrapdoorResult<T>) -> TrapdoorResult<T>
    {
        let session = self
            .sessions
            .get_mut(&handle.pid)
            .ok_or(TrapdoorError::UnknownTracee(handle.pid))?;
        let result = operation(session);
        for event in session.controller.drain_notices() {
            self.hub.publish(&event);
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn backend_mut(&mut self, handle: TraceeHandle) -> &mut B
    {
        match self.sessions.get_mut(&handle.pid) {
            Some(session) => session.controller.backend_mut(),
            None => panic!("{handle} is not held"),
        }
    }
}

impl<B: TraceBackend> Drop for Engine<B>
{
    fn drop(&mut self)
    {
        let kill_on_drop = self.config.kill_on_drop;
        for (pid, mut session) in self.sessions.drain() {
            if session.controller.state() != TraceeState::Attached {
                continue;
            }
            if kill_on_drop && session.controller.is_launched() {
                info!(pid = pid.0, "Killing launched tracee");
                if let Err(error) = session.controller.kill() {
                    warn!(pid = pid.0, %error, "Kill on drop failed");
                    continue;
                }
                // reap it so no zombie is left behind
                loop {
                    match session.wait(None) {
                        Ok(Some(event)) if event.cause.is_terminal() => break,
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            } else if let Err(error) = session.detach() {
                warn!(pid = pid.0, %error, "Detach on drop failed");
            }
        }
    }
}
