//! # Linux ptrace Backend
//!
//! [`TraceBackend`] implementation on top of `ptrace(2)` and `/proc`.
//!
//! ## Kernel interfaces used
//!
//! - `PTRACE_ATTACH`, `PTRACE_DETACH`, `PTRACE_TRACEME`: enter and leave tracing
//! - `PTRACE_CONT`, `PTRACE_SINGLESTEP`: run control
//! - `PTRACE_SETOPTIONS` (`TRACECLONE`, `EXITKILL`), `PTRACE_GETEVENTMSG`:
//!   thread following
//! - `PTRACE_GETSIGINFO`: trap classification
//! - `PTRACE_GETREGSET`/`SETREGSET`: register blocks and AArch64 debug slots
//! - `PTRACE_PEEKUSER`/`POKEUSER`: x86 debug registers
//! - `/proc/<pid>/mem` (`PTRACE_PEEKDATA`/`POKEDATA` as fallback): memory
//! - `waitpid(__WALL)`, `tgkill`, `kill`
//!
//! ## Waiting
//!
//! Waits are issued per traced thread id, never with `-1`: another engine in
//! the same process may be tracing other children, and their events must not
//! be reaped here. With a single traced thread the wait blocks in the kernel;
//! otherwise every thread is polled with `WNOHANG` in turn.
//!
//! ## Attach stops
//!
//! A signal may reach a thread before the `SIGSTOP` sent by `PTRACE_ATTACH`.
//! It is held back, the thread is let run until the attach stop arrives, and
//! the held signal is delivered with the thread's next resume (or detach)
//! that does not carry a signal of its own.
//!
//! ## Threading
//!
//! The kernel only accepts requests from the OS thread that attached, so a
//! `LinuxPtrace` must stay on that thread.

mod launch;
mod procfs;
mod ptrace;

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::ptrace::{self as nix_ptrace, Event, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use crate::backend::{RawEvent, TraceBackend, TrapInfo, WaitMode};
use crate::config::{EngineConfig, LaunchOptions};
use crate::error::{AttachFailure, TrapdoorError, TrapdoorResult};
use crate::types::{Address, MemoryRegion, ProcessId, ThreadId};

/// ptrace-based backend for one tracee
#[derive(Debug)]
pub struct LinuxPtrace
{
    pid: ProcessId,
    threads: Vec<ThreadId>,
    /// Next thread to poll, so a busy thread cannot starve the others
    cursor: usize,
    poll_interval: Duration,
    mem: Option<File>,
    /// Signals that preempted an attach stop, owed to their threads
    held_signals: HashMap<ThreadId, VecDeque<Signal>>,
}

/// Outcome of attaching one thread
#[derive(Debug, Clone, PartialEq, Eq)]
enum AttachStop
{
    /// In its attach stop; `held` arrived first and was suppressed
    Stopped
    {
        held: Vec<Signal>
    },
    /// Exited before it could be stopped
    Gone,
}

impl LinuxPtrace
{
    /// Attach to every thread of `pid`
    ///
    /// Threads are enumerated from `/proc/<pid>/task` and attached until no
    /// new ones appear, so threads spawned during the attach are not missed.
    /// Every attached thread is stopped when this returns.
    ///
    /// ## Errors
    ///
    /// `AttachFailed` with:
    /// - `NotFound` if the process does not exist
    /// - `AlreadyTraced` if another tracer holds it
    /// - `PermissionDenied` if the kernel refuses (Yama, capabilities)
    ///
    /// Threads attached before the failure are detached again.
    pub fn attach(pid: ProcessId, config: &EngineConfig) -> TrapdoorResult<Self>
    {
        let mut attached: Vec<ThreadId> = Vec::new();
        let mut held_signals = HashMap::new();
        loop {
            let tasks = procfs::tasks(pid).map_err(|error| {
                rollback(&attached);
                attach_io_error(pid, &error)
            })?;
            let fresh: Vec<ThreadId> = tasks.into_iter().filter(|thread| !attached.contains(thread)).collect();
            if fresh.is_empty() {
                break;
            }
            for thread in fresh {
                match attach_thread(thread) {
                    Ok(AttachStop::Stopped { held }) => {
                        attached.push(thread);
                        if !held.is_empty() {
                            held_signals.insert(thread, VecDeque::from(held));
                        }
                    }
                    // exited between listing and attaching
                    Ok(AttachStop::Gone) => {}
                    Err(Errno::ESRCH) if thread != pid.leader() => {}
                    Err(errno) => {
                        rollback(&attached);
                        return Err(attach_errno(pid, errno));
                    }
                }
            }
        }
        if !attached.contains(&pid.leader()) {
            rollback(&attached);
            return Err(TrapdoorError::AttachFailed {
                pid,
                reason: AttachFailure::NotFound,
            });
        }

        let mut backend = Self::new(pid, attached, config);
        backend.held_signals = held_signals;
        let options = trace_options(config, false);
        for thread in backend.threads.clone() {
            if let Err(errno) = nix_ptrace::setoptions(thread.as_pid(), options) {
                warn!(tid = thread.0, %errno, "PTRACE_SETOPTIONS failed");
            }
        }
        backend.threads.sort_by_key(|thread| (*thread != pid.leader(), thread.0));
        debug!(pid = pid.0, threads = backend.threads.len(), "Attached");
        Ok(backend)
    }

    /// Start `program` under trace, stopped before its first instruction.
    pub fn launch(program: &Path, args: &[&str], options: &LaunchOptions, config: &EngineConfig) -> TrapdoorResult<Self>
    {
        let pid = launch::spawn_traced(program, args, options)?;
        if let Err(errno) = nix_ptrace::setoptions(pid.as_pid(), trace_options(config, true)) {
            warn!(pid = pid.0, %errno, "PTRACE_SETOPTIONS failed on launched child");
            reap_after_kill(pid.as_pid());
            return Err(TrapdoorError::AttachFailed {
                pid,
                reason: AttachFailure::Os(errno),
            });
        }
        Ok(Self::new(pid, vec![pid.leader()], config))
    }

    fn new(pid: ProcessId, threads: Vec<ThreadId>, config: &EngineConfig) -> Self
    {
        Self {
            pid,
            threads,
            cursor: 0,
            poll_interval: config.wait_poll_interval,
            mem: None,
            held_signals: HashMap::new(),
        }
    }

    /// Signal to deliver with a resume of `thread`: the caller's, or else
    /// one held back during attach.
    fn outgoing_signal(&mut self, thread: ThreadId, signal: Option<Signal>) -> Option<Signal>
    {
        if signal.is_some() {
            return signal;
        }
        let queue = self.held_signals.get_mut(&thread)?;
        let held = queue.pop_front();
        if queue.is_empty() {
            self.held_signals.remove(&thread);
        }
        if let Some(held) = held {
            debug!(tid = thread.0, %held, "Delivering signal held since attach");
        }
        held
    }

    fn mem_file(&mut self) -> Option<&File>
    {
        if self.mem.is_none() {
            match OpenOptions::new().read(true).write(true).open(procfs::mem_path(self.pid)) {
                Ok(file) => self.mem = Some(file),
                Err(error) => {
                    trace!(pid = self.pid.0, %error, "Falling back to PEEKDATA/POKEDATA");
                    return None;
                }
            }
        }
        self.mem.as_ref()
    }

    fn forget_thread(&mut self, thread: ThreadId)
    {
        self.threads.retain(|known| *known != thread);
        self.held_signals.remove(&thread);
        if thread == self.pid.leader() {
            self.threads.clear();
            self.mem = None;
        }
    }

    /// One non-blocking pass over the traced threads.
    fn poll_threads(&mut self) -> TrapdoorResult<Option<RawEvent>>
    {
        let count = self.threads.len();
        for step in 0..count {
            let Some(thread) = self.threads.get((self.cursor + step) % count).copied() else {
                break;
            };
            match waitpid(thread.as_pid(), Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => {
                    self.cursor = (self.cursor + step + 1) % count.max(1);
                    if let Some(event) = self.translate(status)? {
                        return Ok(Some(event));
                    }
                    return self.poll_threads();
                }
                Err(Errno::ECHILD) => {
                    debug!(tid = thread.0, "Thread is no longer waitable");
                    self.forget_thread(thread);
                    return self.poll_threads();
                }
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(TrapdoorError::ptrace("waitpid", errno)),
            }
        }
        Ok(None)
    }

    fn translate(&mut self, status: WaitStatus) -> TrapdoorResult<Option<RawEvent>>
    {
        trace!(?status, "waitpid");
        let event = match status {
            WaitStatus::Exited(tid, code) => {
                let thread = ThreadId::from(tid);
                self.forget_thread(thread);
                RawEvent::Exited { thread, code }
            }
            WaitStatus::Signaled(tid, signal, _) => {
                let thread = ThreadId::from(tid);
                self.forget_thread(thread);
                RawEvent::Terminated { thread, signal }
            }
            WaitStatus::Stopped(tid, signal) => RawEvent::Stopped {
                thread: ThreadId::from(tid),
                signal,
            },
            WaitStatus::PtraceEvent(tid, _, event) if event == Event::PTRACE_EVENT_CLONE as i32 => {
                let parent = ThreadId::from(tid);
                let message = nix_ptrace::getevent(tid).map_err(|errno| TrapdoorError::ptrace("PTRACE_GETEVENTMSG", errno))?;
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let child = ThreadId(message as u32);
                if !self.threads.contains(&child) {
                    self.threads.push(child);
                }
                RawEvent::ThreadCreated { parent, child }
            }
            WaitStatus::PtraceEvent(tid, signal, _) => RawEvent::Stopped {
                thread: ThreadId::from(tid),
                signal,
            },
            WaitStatus::PtraceSyscall(tid) => RawEvent::Stopped {
                thread: ThreadId::from(tid),
                signal: Signal::SIGTRAP,
            },
            WaitStatus::Continued(_) | WaitStatus::StillAlive => return Ok(None),
        };
        Ok(Some(event))
    }
}

impl TraceBackend for LinuxPtrace
{
    fn pid(&self) -> ProcessId
    {
        self.pid
    }

    fn list_threads(&mut self) -> TrapdoorResult<Vec<ThreadId>>
    {
        Ok(self.threads.clone())
    }

    fn resume(&mut self, thread: ThreadId, signal: Option<Signal>) -> TrapdoorResult<()>
    {
        let signal = self.outgoing_signal(thread, signal);
        nix_ptrace::cont(thread.as_pid(), signal).map_err(|errno| TrapdoorError::ptrace("PTRACE_CONT", errno))
    }

    fn single_step(&mut self, thread: ThreadId, signal: Option<Signal>) -> TrapdoorResult<()>
    {
        let signal = self.outgoing_signal(thread, signal);
        nix_ptrace::step(thread.as_pid(), signal).map_err(|errno| TrapdoorError::ptrace("PTRACE_SINGLESTEP", errno))
    }

    fn wait_event(&mut self, mode: WaitMode) -> TrapdoorResult<Option<RawEvent>>
    {
        loop {
            if let Some(event) = self.poll_threads()? {
                return Ok(Some(event));
            }
            if mode == WaitMode::Poll {
                return Ok(None);
            }
            match self.threads.len() {
                0 => return Err(TrapdoorError::ptrace("waitpid", Errno::ECHILD)),
                1 => {
                    let only = self.threads[0];
                    match waitpid(only.as_pid(), Some(WaitPidFlag::__WALL)) {
                        Ok(status) => {
                            if let Some(event) = self.translate(status)? {
                                return Ok(Some(event));
                            }
                        }
                        Err(Errno::EINTR) => {}
                        Err(Errno::ECHILD) => self.forget_thread(only),
                        Err(errno) => return Err(TrapdoorError::ptrace("waitpid", errno)),
                    }
                }
                _ => thread::sleep(self.poll_interval),
            }
        }
    }

    fn siginfo(&mut self, thread: ThreadId) -> TrapdoorResult<TrapInfo>
    {
        ptrace::trap_info(thread).map_err(|errno| TrapdoorError::ptrace("PTRACE_GETSIGINFO", errno))
    }

    fn read_regset(&mut self, thread: ThreadId, note: u32, buffer: &mut [u8]) -> TrapdoorResult<usize>
    {
        ptrace::get_regset(thread, note, buffer).map_err(|errno| TrapdoorError::ptrace("PTRACE_GETREGSET", errno))
    }

    fn write_regset(&mut self, thread: ThreadId, note: u32, data: &[u8]) -> TrapdoorResult<()>
    {
        ptrace::set_regset(thread, note, data).map_err(|errno| TrapdoorError::ptrace("PTRACE_SETREGSET", errno))
    }

    fn peek_user(&mut self, thread: ThreadId, offset: usize) -> TrapdoorResult<u64>
    {
        ptrace::peek_user(thread, offset).map_err(|errno| TrapdoorError::ptrace("PTRACE_PEEKUSER", errno))
    }

    fn poke_user(&mut self, thread: ThreadId, offset: usize, value: u64) -> TrapdoorResult<()>
    {
        ptrace::poke_user(thread, offset, value).map_err(|errno| TrapdoorError::ptrace("PTRACE_POKEUSER", errno))
    }

    fn read_memory(&mut self, thread: ThreadId, address: Address, buffer: &mut [u8]) -> TrapdoorResult<()>
    {
        if let Some(file) = self.mem_file() {
            return file
                .read_exact_at(buffer, address.value())
                .map_err(|error| mem_error("read /proc/pid/mem", &error));
        }
        ptrace::peek_data(thread, address, buffer).map_err(|errno| TrapdoorError::ptrace("PTRACE_PEEKDATA", errno))
    }

    fn write_memory(&mut self, thread: ThreadId, address: Address, data: &[u8]) -> TrapdoorResult<()>
    {
        if let Some(file) = self.mem_file() {
            return file
                .write_all_at(data, address.value())
                .map_err(|error| mem_error("write /proc/pid/mem", &error));
        }
        ptrace::poke_data(thread, address, data).map_err(|errno| TrapdoorError::ptrace("PTRACE_POKEDATA", errno))
    }

    fn memory_regions(&mut self) -> TrapdoorResult<Vec<MemoryRegion>>
    {
        Ok(procfs::maps(self.pid)?)
    }

    fn interrupt(&mut self, thread: ThreadId) -> TrapdoorResult<()>
    {
        // SAFETY: tgkill takes plain integers.
        let result = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                self.pid.as_pid().as_raw(),
                thread.as_pid().as_raw(),
                libc::SIGSTOP,
            )
        };
        if result == -1 {
            return Err(TrapdoorError::ptrace("tgkill", Errno::last()));
        }
        Ok(())
    }

    fn detach_thread(&mut self, thread: ThreadId, signal: Option<Signal>) -> TrapdoorResult<()>
    {
        let signal = self.outgoing_signal(thread, signal);
        nix_ptrace::detach(thread.as_pid(), signal).map_err(|errno| TrapdoorError::ptrace("PTRACE_DETACH", errno))?;
        self.threads.retain(|known| *known != thread);
        self.held_signals.remove(&thread);
        Ok(())
    }

    fn kill(&mut self) -> TrapdoorResult<()>
    {
        signal::kill(self.pid.as_pid(), Signal::SIGKILL).map_err(|errno| TrapdoorError::ptrace("kill", errno))
    }

    fn is_alive(&self) -> bool
    {
        match signal::kill(self.pid.as_pid(), None) {
            Ok(()) | Err(Errno::EPERM) => !procfs::is_zombie(self.pid),
            Err(_) => false,
        }
    }
}

fn trace_options(config: &EngineConfig, launched: bool) -> Options
{
    let mut options = Options::empty();
    if config.follow_threads {
        options |= Options::PTRACE_O_TRACECLONE;
    }
    if launched && config.kill_on_drop {
        options |= Options::PTRACE_O_EXITKILL;
    }
    options
}

/// Attach one thread and wait until its `SIGSTOP` attach stop is consumed.
fn attach_thread(thread: ThreadId) -> Result<AttachStop, Errno>
{
    nix_ptrace::attach(thread.as_pid())?;
    let mut held = Vec::new();
    loop {
        match waitpid(thread.as_pid(), Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => return Ok(AttachStop::Stopped { held }),
            Ok(WaitStatus::Stopped(_, signal)) => {
                // the SIGSTOP is still pending; run on to it without this one
                debug!(tid = thread.0, %signal, "Attach stop preempted, holding signal");
                held.push(signal);
                match nix_ptrace::cont(thread.as_pid(), None) {
                    Ok(()) => {}
                    Err(Errno::ESRCH) => return Ok(AttachStop::Gone),
                    Err(errno) => return Err(errno),
                }
            }
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => return Ok(AttachStop::Gone),
            Ok(_) | Err(Errno::EINTR) => {}
            Err(errno) => return Err(errno),
        }
    }
}

/// Kill a child that is of no use and reap it. Failures only mean it is
/// already gone.
pub(super) fn reap_after_kill(child: Pid)
{
    if let Err(errno) = signal::kill(child, Signal::SIGKILL) {
        debug!(pid = child.as_raw(), %errno, "Kill of abandoned child failed");
    }
    if let Err(errno) = waitpid(child, Some(WaitPidFlag::__WALL)) {
        debug!(pid = child.as_raw(), %errno, "Reaping abandoned child failed");
    }
}

fn rollback(attached: &[ThreadId])
{
    for thread in attached {
        if let Err(errno) = nix_ptrace::detach(thread.as_pid(), None) {
            warn!(tid = thread.0, %errno, "Could not detach during attach rollback");
        }
    }
}

fn attach_errno(pid: ProcessId, errno: Errno) -> TrapdoorError
{
    let reason = match errno {
        Errno::ESRCH => AttachFailure::NotFound,
        Errno::EPERM => match procfs::tracer_pid(pid) {
            Ok(tracer) if tracer != 0 => AttachFailure::AlreadyTraced,
            _ => AttachFailure::PermissionDenied,
        },
        other => AttachFailure::Os(other),
    };
    TrapdoorError::AttachFailed { pid, reason }
}

fn attach_io_error(pid: ProcessId, error: &io::Error) -> TrapdoorError
{
    let reason = match error.kind() {
        io::ErrorKind::NotFound => AttachFailure::NotFound,
        io::ErrorKind::PermissionDenied => AttachFailure::PermissionDenied,
        _ => AttachFailure::Os(error.raw_os_error().map_or(Errno::EIO, Errno::from_raw)),
    };
    TrapdoorError::AttachFailed { pid, reason }
}

/// `/proc/<pid>/mem` failures carry the errno the ptrace path would report.
fn mem_error(operation: &'static str, error: &io::Error) -> TrapdoorError
{
    match error.raw_os_error() {
        Some(raw) => TrapdoorError::ptrace(operation, Errno::from_raw(raw)),
        // short read or write: the range ends in an unmapped page
        None => TrapdoorError::ptrace(operation, Errno::EIO),
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_trace_options()
    {
        let config = EngineConfig::default();
        assert_eq!(
            trace_options(&config, true),
            Options::PTRACE_O_TRACECLONE | Options::PTRACE_O_EXITKILL
        );
        assert_eq!(trace_options(&config, false), Options::PTRACE_O_TRACECLONE);
        let quiet = config.with_follow_threads(false).with_kill_on_drop(false);
        assert_eq!(trace_options(&quiet, true), Options::empty());
    }

    #[test]
    fn test_attach_missing_process()
    {
        // pid_max never exceeds 2^22
        let error = LinuxPtrace::attach(ProcessId(1 << 23), &EngineConfig::default()).unwrap_err();
        assert!(matches!(
            error,
            TrapdoorError::AttachFailed {
                reason: AttachFailure::NotFound,
                ..
            }
        ));
    }

    #[test]
    fn test_held_signals_ride_on_plain_resumes()
    {
        let pid = ProcessId(1 << 23);
        let mut backend = LinuxPtrace::new(pid, vec![pid.leader()], &EngineConfig::default());
        backend
            .held_signals
            .insert(pid.leader(), VecDeque::from([Signal::SIGUSR1, Signal::SIGCHLD]));

        // an explicit signal wins and leaves the held ones queued
        assert_eq!(backend.outgoing_signal(pid.leader(), Some(Signal::SIGINT)), Some(Signal::SIGINT));
        assert_eq!(backend.outgoing_signal(pid.leader(), None), Some(Signal::SIGUSR1));
        assert_eq!(backend.outgoing_signal(pid.leader(), None), Some(Signal::SIGCHLD));
        assert_eq!(backend.outgoing_signal(pid.leader(), None), None);
        assert!(backend.held_signals.is_empty());
        assert_eq!(backend.outgoing_signal(ThreadId(7), None), None);
    }

    #[test]
    fn test_forgotten_thread_drops_held_signals()
    {
        let pid = ProcessId(1 << 23);
        let worker = ThreadId(pid.0 + 1);
        let mut backend = LinuxPtrace::new(pid, vec![pid.leader(), worker], &EngineConfig::default());
        backend.held_signals.insert(worker, VecDeque::from([Signal::SIGUSR2]));
        backend.forget_thread(worker);
        assert_eq!(backend.outgoing_signal(worker, None), None);
    }

    #[test]
    fn test_mem_error_keeps_errno()
    {
        let error = mem_error("read /proc/pid/mem", &io::Error::from_raw_os_error(libc::EIO));
        assert!(matches!(error, TrapdoorError::Ptrace { source: Errno::EIO, .. }));
        let short = mem_error("read /proc/pid/mem", &io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(short, TrapdoorError::Ptrace { source: Errno::EIO, .. }));
    }
}
