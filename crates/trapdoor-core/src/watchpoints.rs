//! # Hardware Watchpoints
//!
//! Allocation of the CPU's debug slots, programming them into every thread of
//! a tracee, and matching trap stops back to the slot that fired.
//!
//! Debug registers are per thread, so an active watchpoint is written into
//! every live thread and into each thread created later
//! ([`WatchpointManager::arm_thread`]). Slot numbers are global: slot `n` is
//! the `n`-th slot of the profile's banks laid end to end, so on AArch64
//! slots 0-3 are data watchpoints and 4 onwards are execute breakpoints.
//!
//! How a slot is encoded and reached is entirely described by the profile's
//! [`SlotBank`] tables; this module contains no per-ISA branches.

use tracing::{debug, trace, warn};

use crate::arch::{ArchitectureProfile, HitDetection, HitResume, Placement, SlotBank, SlotProgram, SlotTransport};
use crate::backend::{TraceBackend, TrapInfo};
use crate::error::{TrapdoorError, TrapdoorResult};
use crate::types::{AccessKind, Address, ThreadId};

/// An active hardware watchpoint (or execute breakpoint)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchpoint
{
    /// Start of the watched range
    pub address: Address,
    /// Length of the watched range in bytes
    pub size: usize,
    /// Access that triggers it
    pub access: AccessKind,
    /// Global slot index
    pub slot: usize,
    /// Number of hits observed
    pub hit_count: u64,
}

/// A trap attributed to a watchpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchHit
{
    /// The watchpoint, with its hit count already incremented
    pub watchpoint: Watchpoint,
    /// What has to happen before the thread may resume
    pub resume: HitResume,
}

/// Per-tracee allocation table of hardware debug slots
#[derive(Debug)]
pub struct WatchpointManager
{
    profile: &'static ArchitectureProfile,
    slots: Vec<Option<Watchpoint>>,
    capacity: Vec<usize>,
}

impl WatchpointManager
{
    /// Empty table; every bank starts at its profile default capacity.
    #[must_use]
    pub fn new(profile: &'static ArchitectureProfile) -> Self
    {
        Self {
            profile,
            slots: vec![None; profile.hardware_slot_count()],
            capacity: profile.slot_banks.iter().map(|bank| bank.count).collect(),
        }
    }

    /// Learn how many slots the hardware really has
    ///
    /// Register-set transports report the count in the low byte of
    /// `dbg_info`. A kernel without hardware debug support reports nothing,
    /// which leaves the bank with zero slots.
    pub fn probe_capacity<B: TraceBackend + ?Sized>(&mut self, backend: &mut B, thread: ThreadId)
    {
        for (position, bank) in self.profile.slot_banks.iter().enumerate() {
            let SlotTransport::RegisterSet {
                note,
                header,
                stride,
                max_slots,
            } = bank.transport
            else {
                continue;
            };
            let mut block = vec![0u8; header + stride * max_slots];
            let reported = match backend.read_regset(thread, note, &mut block) {
                Ok(length) if length >= 1 => usize::from(block[0]),
                Ok(_) => 0,
                Err(error) => {
                    debug!(bank = bank.name, %error, "Debug regset unavailable");
                    0
                }
            };
            self.capacity[position] = reported.min(bank.count).min(max_slots);
            debug!(bank = bank.name, slots = self.capacity[position], "Probed hardware slots");
        }
    }

    /// Usable slots for an access kind.
    #[must_use]
    pub fn capacity(&self, access: AccessKind) -> usize
    {
        self.profile
            .bank_for(access)
            .map_or(0, |(position, _)| self.capacity[position])
    }

    /// Allocate a slot for `[address, address + size)` and program it into
    /// every thread in `threads`
    ///
    /// ## Errors
    ///
    /// - `SlotExhausted{capacity: 0}` on profiles without debug slots
    /// - `UnsupportedAccess`, `UnsupportedSize`, `MisalignedWatchpoint` if the
    ///   request cannot be encoded
    /// - `SlotExhausted{capacity}` if every suitable slot is taken
    /// - the backend's error if a thread cannot be programmed; threads
    ///   already programmed are rolled back
    pub fn install<B: TraceBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        threads: &[ThreadId],
        address: Address,
        size: usize,
        access: AccessKind,
    ) -> TrapdoorResult<usize>
    {
        let architecture = self.profile.name();
        if self.profile.slot_banks.is_empty() {
            return Err(TrapdoorError::SlotExhausted { capacity: 0 });
        }
        let (position, bank) = self
            .profile
            .bank_for(access)
            .ok_or(TrapdoorError::UnsupportedAccess { access, architecture })?;

        // validate before looking for a free slot
        bank.encode(0, address, size, access, architecture)?;

        let first = self.profile.first_slot(position);
        let capacity = self.capacity[position];
        let local = (0..capacity)
            .find(|local| self.slots[first + local].is_none())
            .ok_or(TrapdoorError::SlotExhausted { capacity })?;
        let program = bank.encode(local, address, size, access, architecture)?;

        for (done, thread) in threads.iter().enumerate() {
            if let Err(error) = write_slot(backend, *thread, bank, local, Some(program)) {
                warn!(tid = thread.0, slot = first + local, %error, "Programming debug slot failed, rolling back");
                for programmed in &threads[..done] {
                    if let Err(rollback) = write_slot(backend, *programmed, bank, local, None) {
                        warn!(tid = programmed.0, %rollback, "Rollback of debug slot failed");
                    }
                }
                return Err(error);
            }
        }

        let slot = first + local;
        self.slots[slot] = Some(Watchpoint {
            address,
            size,
            access,
            slot,
            hit_count: 0,
        });
        debug!(%address, size, %access, slot, bank = bank.name, "Installed hardware watchpoint");
        Ok(slot)
    }

    /// Disable `slot` in every thread and free it
    ///
    /// ## Errors
    ///
    /// `WatchpointNotFound` if the slot is free. Threads that vanished are
    /// skipped; any other backend error is returned after the slot is freed.
    pub fn uninstall<B: TraceBackend + ?Sized>(&mut self, backend: &mut B, threads: &[ThreadId], slot: usize) -> TrapdoorResult<()>
    {
        if self.slots.get(slot).and_then(Option::as_ref).is_none() {
            return Err(TrapdoorError::WatchpointNotFound(slot));
        }
        let (bank, local) = self.locate(slot)?;

        let mut first_error = None;
        for thread in threads {
            match write_slot(backend, *thread, bank, local, None) {
                Ok(()) => {}
                Err(error) if error.is_no_such_process() => {}
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }
        self.slots[slot] = None;
        debug!(slot, "Removed hardware watchpoint");
        first_error.map_or(Ok(()), Err)
    }

    /// Program every active slot into a newly created thread.
    pub fn arm_thread<B: TraceBackend + ?Sized>(&self, backend: &mut B, thread: ThreadId) -> TrapdoorResult<()>
    {
        for watchpoint in self.iter() {
            let (bank, local) = self.locate(watchpoint.slot)?;
            let program = self.program(bank, local, watchpoint)?;
            write_slot(backend, thread, bank, local, Some(program))?;
            trace!(tid = thread.0, slot = watchpoint.slot, "Armed debug slot in new thread");
        }
        Ok(())
    }

    /// Disable `slot` in one thread only (step-over).
    pub fn suspend_slot<B: TraceBackend + ?Sized>(&self, backend: &mut B, thread: ThreadId, slot: usize) -> TrapdoorResult<()>
    {
        if self.get(slot).is_none() {
            return Err(TrapdoorError::WatchpointNotFound(slot));
        }
        let (bank, local) = self.locate(slot)?;
        write_slot(backend, thread, bank, local, None)
    }

    /// Re-enable `slot` in one thread after [`suspend_slot`](Self::suspend_slot).
    /// A slot uninstalled in the meantime stays disabled.
    pub fn restore_slot<B: TraceBackend + ?Sized>(&self, backend: &mut B, thread: ThreadId, slot: usize) -> TrapdoorResult<()>
    {
        let Some(watchpoint) = self.get(slot) else {
            return Ok(());
        };
        let (bank, local) = self.locate(slot)?;
        let program = self.program(bank, local, watchpoint)?;
        write_slot(backend, thread, bank, local, Some(program))
    }

    /// Attribute a `SIGTRAP` stop of `thread` to an active slot
    ///
    /// Status-bit transports are read (and cleared on a match) through the
    /// user area. Fault-address transports match `si_addr` against the active
    /// ranges; if none contains it, the nearest data watchpoint wins, since
    /// the kernel may report any address touched by the faulting access.
    pub fn match_hit<B: TraceBackend + ?Sized>(&mut self, backend: &mut B, thread: ThreadId, info: &TrapInfo) -> TrapdoorResult<Option<WatchHit>>
    {
        if self.is_empty() {
            return Ok(None);
        }

        let mut matched = None;
        let mut nearest: Option<(u64, usize)> = None;
        for (position, bank) in self.profile.slot_banks.iter().enumerate() {
            let first = self.profile.first_slot(position);
            let active = (first..first + bank.count).filter(|slot| self.slots[*slot].is_some());
            match (bank.detection, bank.transport) {
                (HitDetection::StatusBits, SlotTransport::UserArea { status, .. }) => {
                    let bits = backend.peek_user(thread, status)?;
                    if let Some(slot) = active.clone().find(|slot| bits & (1 << (slot - first)) != 0) {
                        backend.poke_user(thread, status, 0)?;
                        matched = Some(slot);
                    }
                }
                (HitDetection::FaultAddress { code }, _) if info.code == code => {
                    for slot in active {
                        let Some(watchpoint) = &self.slots[slot] else { continue };
                        let start = match watchpoint.access {
                            // the slot value register holds the aligned address
                            AccessKind::Execute => watchpoint.address,
                            _ => watchpoint.address.align_down(bank_granule(bank)),
                        };
                        let end = watchpoint.address + watchpoint.size as u64;
                        if start <= info.fault_address && info.fault_address < end {
                            matched = Some(slot);
                            break;
                        }
                        if watchpoint.access != AccessKind::Execute {
                            let distance = watchpoint.address.distance(info.fault_address);
                            if nearest.map_or(true, |(best, _)| distance < best) {
                                nearest = Some((distance, slot));
                            }
                        }
                    }
                }
                _ => {}
            }
            if matched.is_some() {
                break;
            }
        }

        let Some(slot) = matched.or(nearest.map(|(_, slot)| slot)) else {
            return Ok(None);
        };
        let (bank, _) = self.locate(slot)?;
        let Some(watchpoint) = self.slots[slot].as_mut() else {
            return Ok(None);
        };
        watchpoint.hit_count = watchpoint.hit_count.saturating_add(1);
        let resume = bank
            .rule(watchpoint.access)
            .map_or(HitResume::Direct, |rule| rule.resume);
        trace!(tid = thread.0, slot, address = %watchpoint.address, "Hardware slot fired");
        Ok(Some(WatchHit {
            watchpoint: *watchpoint,
            resume,
        }))
    }

    /// Disable every active slot in every thread and free them all
    ///
    /// Best effort; returns the first error other than a vanished thread.
    pub fn release_all<B: TraceBackend + ?Sized>(&mut self, backend: &mut B, threads: &[ThreadId]) -> TrapdoorResult<()>
    {
        let mut first_error = None;
        let active: Vec<usize> = self.iter().map(|watchpoint| watchpoint.slot).collect();
        for slot in active {
            if let Err(error) = self.uninstall(backend, threads, slot) {
                warn!(slot, %error, "Could not release debug slot");
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Forget every slot without touching the threads (the tracee is gone).
    pub fn clear(&mut self)
    {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    /// Watchpoint in `slot`, if active.
    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&Watchpoint>
    {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Active watchpoints in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Watchpoint>
    {
        self.slots.iter().flatten()
    }

    /// Whether no slot is in use.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.slots.iter().all(Option::is_none)
    }

    fn locate(&self, slot: usize) -> TrapdoorResult<(&'static SlotBank, usize)>
    {
        let banks: &'static [SlotBank] = self.profile.slot_banks;
        self.profile
            .locate_slot(slot)
            .map(|(position, local)| (&banks[position], local))
            .ok_or(TrapdoorError::WatchpointNotFound(slot))
    }

    fn program(&self, bank: &SlotBank, local: usize, watchpoint: &Watchpoint) -> TrapdoorResult<SlotProgram>
    {
        bank.encode(local, watchpoint.address, watchpoint.size, watchpoint.access, self.profile.name())
    }
}

fn bank_granule(bank: &SlotBank) -> u64
{
    match bank.placement {
        Placement::ByteSelect { granule } => granule,
        Placement::Natural => 1,
    }
}

/// Load (`Some`) or clear (`None`) one slot of one thread through the bank's transport.
fn write_slot<B: TraceBackend + ?Sized>(
    backend: &mut B,
    thread: ThreadId,
    bank: &SlotBank,
    local: usize,
    program: Option<SlotProgram>,
) -> TrapdoorResult<()>
{
    match bank.transport {
        SlotTransport::UserArea { values, stride, control, .. } => {
            let mut word = backend.peek_user(thread, control)? & !bank.control_mask(local);
            if let Some(program) = program {
                backend.poke_user(thread, values + stride * local, program.value)?;
                word |= program.control;
            }
            backend.poke_user(thread, control, word)
        }
        SlotTransport::RegisterSet {
            note,
            header,
            stride,
            max_slots,
        } => {
            let mut block = vec![0u8; header + stride * max_slots];
            let length = backend.read_regset(thread, note, &mut block)?;
            let at = header + stride * local;
            block.truncate(length.max(at + stride));

            let (value, control) = program.map_or((0, 0), |program| (program.value, program.control));
            #[allow(clippy::cast_possible_truncation)]
            let control = control as u32;
            block[at..at + 8].copy_from_slice(&value.to_le_bytes());
            block[at + 8..at + 12].copy_from_slice(&control.to_le_bytes());
            backend.write_regset(thread, note, &block)
        }
    }
}

#[cfg(test)]
mod tests
{
    use nix::sys::signal::Signal;

    use super::*;
    use crate::arch::{AARCH64, NT_ARM_HW_BREAK, NT_ARM_HW_WATCH, RISCV64, X86_64};
    use crate::testing::FakeBackend;

    const DR7: usize = 904;
    const DR6: usize = 896;
    const TRAP_HWBKPT: i32 = 4;

    fn traced_threads(backend: &mut FakeBackend) -> Vec<ThreadId>
    {
        backend.list_threads().unwrap()
    }

    #[test]
    fn test_x86_programs_every_thread()
    {
        let mut backend = FakeBackend::new();
        backend.add_thread(ThreadId(4243));
        let threads = traced_threads(&mut backend);
        let mut manager = WatchpointManager::new(&X86_64);

        let first = manager.install(&mut backend, &threads, Address::new(0x6000), 8, AccessKind::Write).unwrap();
        let second = manager.install(&mut backend, &threads, Address::new(0x6010), 4, AccessKind::ReadWrite).unwrap();
        assert_eq!((first, second), (0, 1));

        for thread in &threads {
            assert_eq!(backend.user_word(*thread, 848), 0x6000);
            assert_eq!(backend.user_word(*thread, 856), 0x6010);
            assert_eq!(backend.user_word(*thread, DR7), 0b0101 | (0b1001 << 16) | (0b1111 << 20));
        }

        manager.uninstall(&mut backend, &threads, 0).unwrap();
        for thread in &threads {
            assert_eq!(backend.user_word(*thread, DR7), 0b0100 | (0b1111 << 20));
        }
        assert!(matches!(
            manager.uninstall(&mut backend, &threads, 0),
            Err(TrapdoorError::WatchpointNotFound(0))
        ));
    }

    #[test]
    fn test_exhaustion_at_capacity_plus_one()
    {
        let mut backend = FakeBackend::new();
        let threads = traced_threads(&mut backend);
        let mut manager = WatchpointManager::new(&X86_64);

        for index in 0..X86_64.hardware_slot_count() {
            let address = Address::new(0x7000 + 8 * index as u64);
            assert_eq!(manager.install(&mut backend, &threads, address, 8, AccessKind::Write).unwrap(), index);
        }
        assert!(matches!(
            manager.install(&mut backend, &threads, Address::new(0x8000), 8, AccessKind::Write),
            Err(TrapdoorError::SlotExhausted { capacity: 4 })
        ));
    }

    #[test]
    fn test_arm_exhaustion_is_per_bank()
    {
        let mut backend = FakeBackend::with_profile(&AARCH64);
        let threads = traced_threads(&mut backend);
        let mut manager = WatchpointManager::new(&AARCH64);
        manager.probe_capacity(&mut backend, threads[0]);

        for index in 0..4u64 {
            manager
                .install(&mut backend, &threads, Address::new(0x9000 + 8 * index), 8, AccessKind::Read)
                .unwrap();
        }
        assert!(matches!(
            manager.install(&mut backend, &threads, Address::new(0xa000), 4, AccessKind::Write),
            Err(TrapdoorError::SlotExhausted { capacity: 4 })
        ));
        // the execute bank is independent
        let slot = manager
            .install(&mut backend, &threads, Address::new(0x40_0000), 4, AccessKind::Execute)
            .unwrap();
        assert_eq!(slot, 4);
        assert_eq!(backend.regset_slot(threads[0], NT_ARM_HW_BREAK, 0).0, 0x40_0000);
    }

    #[test]
    fn test_arm_probed_capacity()
    {
        let mut backend = FakeBackend::with_profile(&AARCH64);
        backend.set_regset_capacity(NT_ARM_HW_WATCH, 2);
        let threads = traced_threads(&mut backend);
        let mut manager = WatchpointManager::new(&AARCH64);
        manager.probe_capacity(&mut backend, threads[0]);

        assert_eq!(manager.capacity(AccessKind::Write), 2);
        manager.install(&mut backend, &threads, Address::new(0x9000), 8, AccessKind::Write).unwrap();
        manager.install(&mut backend, &threads, Address::new(0x9008), 8, AccessKind::Write).unwrap();
        assert!(matches!(
            manager.install(&mut backend, &threads, Address::new(0x9010), 8, AccessKind::Write),
            Err(TrapdoorError::SlotExhausted { capacity: 2 })
        ));
    }

    #[test]
    fn test_arm_regset_slot_contents()
    {
        let mut backend = FakeBackend::with_profile(&AARCH64);
        let threads = traced_threads(&mut backend);
        let mut manager = WatchpointManager::new(&AARCH64);

        manager.install(&mut backend, &threads, Address::new(0x9004), 2, AccessKind::Write).unwrap();
        let (addr, ctrl) = backend.regset_slot(threads[0], NT_ARM_HW_WATCH, 0);
        assert_eq!(addr, 0x9000);
        assert_eq!(ctrl, 0x1 | (0b10 << 1) | (0b10 << 3) | (0b11_0000 << 5));

        manager.suspend_slot(&mut backend, threads[0], 0).unwrap();
        assert_eq!(backend.regset_slot(threads[0], NT_ARM_HW_WATCH, 0), (0, 0));
        manager.restore_slot(&mut backend, threads[0], 0).unwrap();
        assert_eq!(backend.regset_slot(threads[0], NT_ARM_HW_WATCH, 0).0, 0x9000);
    }

    #[test]
    fn test_rejections()
    {
        let mut backend = FakeBackend::new();
        let threads = traced_threads(&mut backend);
        let mut manager = WatchpointManager::new(&X86_64);

        assert!(matches!(
            manager.install(&mut backend, &threads, Address::new(0x6000), 16, AccessKind::Write),
            Err(TrapdoorError::UnsupportedSize { size: 16, max: 8 })
        ));
        assert!(matches!(
            manager.install(&mut backend, &threads, Address::new(0x6002), 4, AccessKind::Write),
            Err(TrapdoorError::MisalignedWatchpoint { .. })
        ));
        assert!(matches!(
            manager.install(&mut backend, &threads, Address::new(0x6000), 4, AccessKind::Read),
            Err(TrapdoorError::UnsupportedAccess { .. })
        ));
        assert!(manager.is_empty());

        let mut backend = FakeBackend::with_profile(&RISCV64);
        let threads = traced_threads(&mut backend);
        let mut manager = WatchpointManager::new(&RISCV64);
        assert!(matches!(
            manager.install(&mut backend, &threads, Address::new(0x6000), 8, AccessKind::Write),
            Err(TrapdoorError::SlotExhausted { capacity: 0 })
        ));
    }

    #[test]
    fn test_failed_thread_rolls_back()
    {
        let mut backend = FakeBackend::new();
        let mut threads = traced_threads(&mut backend);
        threads.push(ThreadId(9999)); // not traced: answers ESRCH
        let mut manager = WatchpointManager::new(&X86_64);

        assert!(manager.install(&mut backend, &threads, Address::new(0x6000), 8, AccessKind::Write).is_err());
        assert_eq!(backend.user_word(threads[0], DR7), 0);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_match_x86_status_bits()
    {
        let mut backend = FakeBackend::new();
        let threads = traced_threads(&mut backend);
        let mut manager = WatchpointManager::new(&X86_64);
        manager.install(&mut backend, &threads, Address::new(0x6000), 8, AccessKind::Write).unwrap();
        manager.install(&mut backend, &threads, Address::new(0x6008), 8, AccessKind::Write).unwrap();

        let info = TrapInfo {
            signal: Signal::SIGTRAP,
            code: TRAP_HWBKPT,
            fault_address: Address::ZERO,
        };
        backend.set_user_word(threads[0], DR6, 0b10);
        let hit = manager.match_hit(&mut backend, threads[0], &info).unwrap().unwrap();
        assert_eq!(hit.watchpoint.slot, 1);
        assert_eq!(hit.watchpoint.hit_count, 1);
        assert_eq!(hit.resume, HitResume::Direct);
        assert_eq!(backend.user_word(threads[0], DR6), 0);

        assert_eq!(manager.match_hit(&mut backend, threads[0], &info).unwrap(), None);
    }

    #[test]
    fn test_match_arm_fault_address()
    {
        let mut backend = FakeBackend::with_profile(&AARCH64);
        let threads = traced_threads(&mut backend);
        let mut manager = WatchpointManager::new(&AARCH64);
        manager.install(&mut backend, &threads, Address::new(0x9000), 8, AccessKind::Write).unwrap();
        manager.install(&mut backend, &threads, Address::new(0x9010), 8, AccessKind::Write).unwrap();

        let trap = |address: u64, code: i32| TrapInfo {
            signal: Signal::SIGTRAP,
            code,
            fault_address: Address::new(address),
        };
        let hit = manager.match_hit(&mut backend, threads[0], &trap(0x9014, TRAP_HWBKPT)).unwrap().unwrap();
        assert_eq!(hit.watchpoint.slot, 1);
        assert_eq!(hit.resume, HitResume::StepWithSlotDisabled);

        // a wide store reported below the range still lands on the nearest slot
        let hit = manager.match_hit(&mut backend, threads[0], &trap(0x8ff8, TRAP_HWBKPT)).unwrap().unwrap();
        assert_eq!(hit.watchpoint.slot, 0);

        // a plain brk is not a hardware hit
        assert_eq!(manager.match_hit(&mut backend, threads[0], &trap(0x9000, 1)).unwrap(), None);
    }

    #[test]
    fn test_new_thread_gets_active_slots()
    {
        let mut backend = FakeBackend::new();
        let threads = traced_threads(&mut backend);
        let mut manager = WatchpointManager::new(&X86_64);
        manager.install(&mut backend, &threads, Address::new(0x6008), 8, AccessKind::ReadWrite).unwrap();

        backend.add_thread(ThreadId(5000));
        manager.arm_thread(&mut backend, ThreadId(5000)).unwrap();
        assert_eq!(backend.user_word(ThreadId(5000), 848), 0x6008);
        assert_eq!(backend.user_word(ThreadId(5000), DR7), 0b01 | (0b1011 << 16));

        manager.release_all(&mut backend, &[threads[0], ThreadId(5000)]).unwrap();
        assert!(manager.is_empty());
        assert_eq!(backend.user_word(ThreadId(5000), DR7), 0);
    }
}
