//! In-memory [`TraceBackend`] used by unit tests.
//!
//! Emulates a tracee with scripted wait events, flat memory regions, one
//! register block per thread, an x86 user area and the AArch64 debug
//! regsets. Requests against a running or unknown thread answer `ESRCH`,
//! like the kernel.

use std::collections::{BTreeMap, HashMap, VecDeque};

use nix::errno::Errno;
use nix::sys::signal::Signal;

use crate::arch::{ArchitectureProfile, SlotTransport, X86_64};
use crate::backend::{RawEvent, TraceBackend, TrapInfo, WaitMode, TRAP_TRACE};
use crate::error::{TrapdoorError, TrapdoorResult};
use crate::types::{Address, MemoryRegion, ProcessId, ThreadId};

pub(crate) const FAKE_PID: u32 = 4242;

#[derive(Debug, Clone)]
struct FakeThread
{
    running: bool,
    registers: Vec<u8>,
    user: HashMap<usize, u64>,
    regsets: HashMap<u32, Vec<u8>>,
    siginfo: TrapInfo,
}

#[derive(Debug)]
pub(crate) struct FakeBackend
{
    pid: ProcessId,
    profile: &'static ArchitectureProfile,
    threads: BTreeMap<ThreadId, FakeThread>,
    memory: BTreeMap<u64, Vec<u8>>,
    events: VecDeque<RawEvent>,
    step_outcomes: VecDeque<(Address, i32)>,
    partial_write: Option<usize>,
    gone: bool,
    pub resumed: Vec<(ThreadId, Option<Signal>)>,
    pub stepped: Vec<ThreadId>,
    pub detached: Vec<ThreadId>,
    pub killed: bool,
}

impl FakeBackend
{
    pub fn new() -> Self
    {
        Self::with_profile(&X86_64)
    }

    pub fn with_profile(profile: &'static ArchitectureProfile) -> Self
    {
        let mut backend = Self {
            pid: ProcessId(FAKE_PID),
            profile,
            threads: BTreeMap::new(),
            memory: BTreeMap::new(),
            events: VecDeque::new(),
            step_outcomes: VecDeque::new(),
            partial_write: None,
            gone: false,
            resumed: Vec::new(),
            stepped: Vec::new(),
            detached: Vec::new(),
            killed: false,
        };
        backend.add_thread(ThreadId(FAKE_PID));
        backend
    }

    pub fn leader(&self) -> ThreadId
    {
        self.pid.leader()
    }

    /// Add a stopped thread with zeroed registers and debug state.
    pub fn add_thread(&mut self, thread: ThreadId)
    {
        let mut regsets = HashMap::new();
        for bank in self.profile.slot_banks {
            if let SlotTransport::RegisterSet { note, header, stride, max_slots } = bank.transport {
                let mut block = vec![0; header + stride * max_slots];
                // debug architecture 8.0 in bits 8..16, slot count in bits 0..8
                block[0] = bank.count as u8;
                block[1] = 0x06;
                regsets.insert(note, block);
            }
        }
        self.threads.insert(
            thread,
            FakeThread {
                running: false,
                registers: vec![0; self.profile.register_block.size],
                user: HashMap::new(),
                regsets,
                siginfo: TrapInfo {
                    signal: Signal::SIGSTOP,
                    code: 0,
                    fault_address: Address::ZERO,
                },
            },
        );
    }

    /// Map `bytes` at `start`.
    pub fn map(&mut self, start: Address, bytes: Vec<u8>)
    {
        self.memory.insert(start.value(), bytes);
    }

    /// Current contents of mapped memory.
    pub fn bytes(&self, address: Address, length: usize) -> Vec<u8>
    {
        let (start, region) = self.region_for(address.value(), length).unwrap_or_else(|| panic!("{address} is not mapped"));
        let offset = (address.value() - start) as usize;
        region[offset..offset + length].to_vec()
    }

    /// Queue a raw wait result.
    pub fn push_event(&mut self, event: RawEvent)
    {
        self.events.push_back(event);
    }

    /// Queue a `SIGTRAP` stop of `thread` with the given program counter and siginfo.
    pub fn push_trap(&mut self, thread: ThreadId, pc: Address, code: i32, fault_address: Address)
    {
        self.set_register(thread, self.profile.program_counter, pc.value());
        if let Some(state) = self.threads.get_mut(&thread) {
            state.siginfo = TrapInfo {
                signal: Signal::SIGTRAP,
                code,
                fault_address,
            };
        }
        self.push_event(RawEvent::Stopped {
            thread,
            signal: Signal::SIGTRAP,
        });
    }

    /// The next single-step stops at `pc` with `code` instead of retiring in
    /// place with `TRAP_TRACE`.
    pub fn script_step(&mut self, pc: Address, code: i32)
    {
        self.step_outcomes.push_back((pc, code));
    }

    /// Queue a clone of `parent` followed by the child's initial `SIGSTOP`.
    pub fn push_clone(&mut self, parent: ThreadId, child: ThreadId)
    {
        self.push_event(RawEvent::ThreadCreated { parent, child });
        self.push_event(RawEvent::Stopped {
            thread: child,
            signal: Signal::SIGSTOP,
        });
    }

    pub fn set_register(&mut self, thread: ThreadId, name: &str, value: u64)
    {
        let Ok(info) = self.profile.register_info(name) else {
            panic!("no register {name}");
        };
        if let Some(state) = self.threads.get_mut(&thread) {
            state.registers[info.offset..info.offset + info.width].copy_from_slice(&value.to_le_bytes()[..info.width]);
        }
    }

    pub fn register(&self, thread: ThreadId, name: &str) -> u64
    {
        let info = self.profile.register_info(name).unwrap_or_else(|_| panic!("no register {name}"));
        let state = &self.threads[&thread];
        let mut raw = [0u8; 8];
        raw[..info.width].copy_from_slice(&state.registers[info.offset..info.offset + info.width]);
        u64::from_le_bytes(raw)
    }

    /// A user-area word (x86 debug registers).
    pub fn user_word(&self, thread: ThreadId, offset: usize) -> u64
    {
        self.threads[&thread].user.get(&offset).copied().unwrap_or(0)
    }

    pub fn set_user_word(&mut self, thread: ThreadId, offset: usize, value: u64)
    {
        if let Some(state) = self.threads.get_mut(&thread) {
            state.user.insert(offset, value);
        }
    }

    /// `(addr, ctrl)` of slot `index` in a debug regset.
    pub fn regset_slot(&self, thread: ThreadId, note: u32, index: usize) -> (u64, u32)
    {
        let block = &self.threads[&thread].regsets[&note];
        let at = 8 + 16 * index;
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&block[at..at + 8]);
        let mut ctrl = [0u8; 4];
        ctrl.copy_from_slice(&block[at + 8..at + 12]);
        (u64::from_le_bytes(addr), u32::from_le_bytes(ctrl))
    }

    /// Report fewer slots in a debug regset's `dbg_info`.
    pub fn set_regset_capacity(&mut self, note: u32, count: u8)
    {
        for state in self.threads.values_mut() {
            if let Some(block) = state.regsets.get_mut(&note) {
                block[0] = count;
            }
        }
    }

    pub fn is_running(&self, thread: ThreadId) -> bool
    {
        self.threads.get(&thread).is_some_and(|state| state.running)
    }

    /// The next write copies only `bytes` bytes, then fails with `EIO`.
    pub fn fail_next_write_after(&mut self, bytes: usize)
    {
        self.partial_write = Some(bytes);
    }

    /// Make the process disappear: every request answers `ESRCH`.
    pub fn vanish(&mut self)
    {
        self.gone = true;
    }

    fn region_for(&self, start: u64, length: usize) -> Option<(u64, &Vec<u8>)>
    {
        let (base, bytes) = self.memory.range(..=start).next_back()?;
        let end = start.checked_add(length as u64)?;
        (end <= base + bytes.len() as u64).then_some((*base, bytes))
    }

    fn stopped(&mut self, thread: ThreadId, operation: &'static str) -> TrapdoorResult<&mut FakeThread>
    {
        if self.gone {
            return Err(TrapdoorError::ptrace(operation, Errno::ESRCH));
        }
        match self.threads.get_mut(&thread) {
            Some(state) if !state.running => Ok(state),
            _ => Err(TrapdoorError::ptrace(operation, Errno::ESRCH)),
        }
    }
}

impl TraceBackend for FakeBackend
{
    fn pid(&self) -> ProcessId
    {
        self.pid
    }

    fn list_threads(&mut self) -> TrapdoorResult<Vec<ThreadId>>
    {
        Ok(self.threads.keys().copied().collect())
    }

    fn resume(&mut self, thread: ThreadId, signal: Option<Signal>) -> TrapdoorResult<()>
    {
        self.stopped(thread, "PTRACE_CONT")?.running = true;
        self.resumed.push((thread, signal));
        Ok(())
    }

    fn single_step(&mut self, thread: ThreadId, _signal: Option<Signal>) -> TrapdoorResult<()>
    {
        self.stopped(thread, "PTRACE_SINGLESTEP")?;
        let code = match self.step_outcomes.pop_front() {
            Some((pc, code)) => {
                self.set_register(thread, self.profile.program_counter, pc.value());
                code
            }
            None => TRAP_TRACE,
        };
        let state = self.stopped(thread, "PTRACE_SINGLESTEP")?;
        state.running = true;
        state.siginfo = TrapInfo {
            signal: Signal::SIGTRAP,
            code,
            fault_address: Address::ZERO,
        };
        self.stepped.push(thread);
        self.events.push_front(RawEvent::Stopped {
            thread,
            signal: Signal::SIGTRAP,
        });
        Ok(())
    }

    fn wait_event(&mut self, mode: WaitMode) -> TrapdoorResult<Option<RawEvent>>
    {
        let Some(event) = self.events.pop_front() else {
            return match mode {
                WaitMode::Poll => Ok(None),
                WaitMode::Block => Err(TrapdoorError::ptrace("waitpid", Errno::ECHILD)),
            };
        };
        match event {
            RawEvent::Stopped { thread, .. } => {
                if let Some(state) = self.threads.get_mut(&thread) {
                    state.running = false;
                }
            }
            RawEvent::ThreadCreated { parent, child } => {
                if let Some(state) = self.threads.get_mut(&parent) {
                    state.running = false;
                }
                self.add_thread(child);
                if let Some(state) = self.threads.get_mut(&child) {
                    state.running = true;
                }
            }
            RawEvent::Exited { thread, .. } | RawEvent::Terminated { thread, .. } => {
                if thread == self.pid.leader() {
                    self.threads.clear();
                    self.gone = true;
                } else {
                    self.threads.remove(&thread);
                }
            }
        }
        Ok(Some(event))
    }

    fn siginfo(&mut self, thread: ThreadId) -> TrapdoorResult<TrapInfo>
    {
        Ok(self.stopped(thread, "PTRACE_GETSIGINFO")?.siginfo)
    }

    fn read_regset(&mut self, thread: ThreadId, note: u32, buffer: &mut [u8]) -> TrapdoorResult<usize>
    {
        let prstatus = self.profile.register_block.note;
        let state = self.stopped(thread, "PTRACE_GETREGSET")?;
        let source = if note == prstatus {
            &state.registers
        } else {
            state
                .regsets
                .get(&note)
                .ok_or(TrapdoorError::ptrace("PTRACE_GETREGSET", Errno::EINVAL))?
        };
        let length = source.len().min(buffer.len());
        buffer[..length].copy_from_slice(&source[..length]);
        Ok(length)
    }

    fn write_regset(&mut self, thread: ThreadId, note: u32, data: &[u8]) -> TrapdoorResult<()>
    {
        let prstatus = self.profile.register_block.note;
        let state = self.stopped(thread, "PTRACE_SETREGSET")?;
        let target = if note == prstatus {
            &mut state.registers
        } else {
            state
                .regsets
                .get_mut(&note)
                .ok_or(TrapdoorError::ptrace("PTRACE_SETREGSET", Errno::EINVAL))?
        };
        let length = target.len().min(data.len());
        // dbg_info is read-only
        let skip = if note == prstatus { 0 } else { 8 };
        target[skip..length].copy_from_slice(&data[skip..length]);
        Ok(())
    }

    fn peek_user(&mut self, thread: ThreadId, offset: usize) -> TrapdoorResult<u64>
    {
        Ok(self.stopped(thread, "PTRACE_PEEKUSER")?.user.get(&offset).copied().unwrap_or(0))
    }

    fn poke_user(&mut self, thread: ThreadId, offset: usize, value: u64) -> TrapdoorResult<()>
    {
        self.stopped(thread, "PTRACE_POKEUSER")?.user.insert(offset, value);
        Ok(())
    }

    fn read_memory(&mut self, thread: ThreadId, address: Address, buffer: &mut [u8]) -> TrapdoorResult<()>
    {
        self.stopped(thread, "read /proc/pid/mem")?;
        let (start, region) = self
            .region_for(address.value(), buffer.len())
            .ok_or(TrapdoorError::ptrace("read /proc/pid/mem", Errno::EIO))?;
        let offset = (address.value() - start) as usize;
        buffer.copy_from_slice(&region[offset..offset + buffer.len()]);
        Ok(())
    }

    fn write_memory(&mut self, thread: ThreadId, address: Address, data: &[u8]) -> TrapdoorResult<()>
    {
        self.stopped(thread, "write /proc/pid/mem")?;
        let (start, _) = self
            .region_for(address.value(), data.len())
            .ok_or(TrapdoorError::ptrace("write /proc/pid/mem", Errno::EIO))?;
        let partial = self.partial_write.take();
        let length = partial.map_or(data.len(), |bytes| bytes.min(data.len()));
        let offset = (address.value() - start) as usize;
        if let Some(region) = self.memory.get_mut(&start) {
            region[offset..offset + length].copy_from_slice(&data[..length]);
        }
        match partial {
            Some(_) => Err(TrapdoorError::ptrace("write /proc/pid/mem", Errno::EIO)),
            None => Ok(()),
        }
    }

    fn memory_regions(&mut self) -> TrapdoorResult<Vec<MemoryRegion>>
    {
        if self.gone {
            return Err(TrapdoorError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)));
        }
        Ok(self
            .memory
            .iter()
            .map(|(start, bytes)| {
                MemoryRegion::new(
                    Address::new(*start),
                    Address::new(start + bytes.len() as u64),
                    "rwxp".to_string(),
                    None,
                )
            })
            .collect())
    }

    fn interrupt(&mut self, thread: ThreadId) -> TrapdoorResult<()>
    {
        if self.gone || !self.threads.contains_key(&thread) {
            return Err(TrapdoorError::ptrace("tgkill", Errno::ESRCH));
        }
        self.push_event(RawEvent::Stopped {
            thread,
            signal: Signal::SIGSTOP,
        });
        Ok(())
    }

    fn detach_thread(&mut self, thread: ThreadId, _signal: Option<Signal>) -> TrapdoorResult<()>
    {
        self.stopped(thread, "PTRACE_DETACH")?.running = true;
        self.detached.push(thread);
        Ok(())
    }

    fn kill(&mut self) -> TrapdoorResult<()>
    {
        if self.gone {
            return Err(TrapdoorError::ptrace("kill", Errno::ESRCH));
        }
        self.killed = true;
        for state in self.threads.values_mut() {
            state.running = true;
        }
        self.push_event(RawEvent::Terminated {
            thread: self.pid.leader(),
            signal: Signal::SIGKILL,
        });
        Ok(())
    }

    fn is_alive(&self) -> bool
    {
        !self.gone
    }
}
