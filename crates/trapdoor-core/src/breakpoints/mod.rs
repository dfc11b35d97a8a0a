//! # Software Breakpoints
//!
//! Bookkeeping and memory patching for trap-instruction breakpoints.
//!
//! Installing a breakpoint reads the instruction bytes at the address, keeps
//! them in the table and writes the profile's trap in their place. While an
//! entry is enabled, tracee memory holds the trap; while it is disabled (or
//! after it is uninstalled), memory holds exactly the original bytes again.
//!
//! The manager is per tracee and owns no backend: every patching operation
//! borrows a [`MemoryAccessor`] for the duration of the call.
//!
//! Stepping a thread off a trap site is modeled separately by [`StepOver`].

mod step_over;

use std::collections::HashMap;

use smallvec::SmallVec;
use tracing::{debug, warn};

pub use self::step_over::{StepOver, StepPhase, TrapSite};
use crate::arch::ArchitectureProfile;
use crate::backend::TraceBackend;
use crate::error::{TrapdoorError, TrapdoorResult};
use crate::memory::MemoryAccessor;
use crate::types::Address;

/// An installed software breakpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint
{
    /// Address of the patched instruction
    pub address: Address,
    /// Bytes displaced by the trap
    pub original: SmallVec<[u8; 4]>,
    /// Whether the trap is currently written to memory
    pub enabled: bool,
    /// Number of times a thread stopped on this breakpoint
    pub hit_count: u64,
}

impl Breakpoint
{
    /// Trap bytes written over `original`.
    #[must_use]
    pub fn trap(&self, profile: &ArchitectureProfile) -> &'static [u8]
    {
        profile.trap_for(&self.original)
    }
}

/// Per-tracee table of software breakpoints, keyed by address
#[derive(Debug)]
pub struct BreakpointManager
{
    profile: &'static ArchitectureProfile,
    table: HashMap<Address, Breakpoint>,
}

impl BreakpointManager
{
    /// Empty table for a tracee of the given architecture.
    #[must_use]
    pub fn new(profile: &'static ArchitectureProfile) -> Self
    {
        Self {
            profile,
            table: HashMap::new(),
        }
    }

    /// Install and enable a breakpoint at `address`
    ///
    /// On RISC-V the displaced parcel decides between `ebreak` and
    /// `c.ebreak`, so a compressed instruction is never overwritten past its
    /// end.
    ///
    /// ## Errors
    ///
    /// - `BreakpointCollision` if any entry (enabled or not) exists at `address`
    /// - `InaccessibleMemory` if the instruction bytes are not mapped
    pub fn install<B: TraceBackend + ?Sized>(&mut self, memory: &mut MemoryAccessor<'_, B>, address: Address) -> TrapdoorResult<()>
    {
        if self.table.contains_key(&address) {
            return Err(TrapdoorError::BreakpointCollision(address));
        }

        let probe = memory.read(address, self.profile.trap.probe_len())?;
        let trap = self.profile.trap_for(&probe);
        let original: SmallVec<[u8; 4]> = if trap.len() <= probe.len() {
            SmallVec::from_slice(&probe[..trap.len()])
        } else {
            SmallVec::from_vec(memory.read(address, trap.len())?)
        };

        memory.write(address, trap)?;
        debug!(%address, len = trap.len(), "Installed software breakpoint");

        self.table.insert(
            address,
            Breakpoint {
                address,
                original,
                enabled: true,
                hit_count: 0,
            },
        );
        Ok(())
    }

    /// Remove the breakpoint at `address`, restoring the original bytes
    ///
    /// ## Errors
    ///
    /// `BreakpointNotFound` if nothing is installed there. The entry is kept
    /// if the restoring write fails.
    pub fn uninstall<B: TraceBackend + ?Sized>(&mut self, memory: &mut MemoryAccessor<'_, B>, address: Address) -> TrapdoorResult<()>
    {
        let breakpoint = self
            .table
            .get(&address)
            .ok_or(TrapdoorError::BreakpointNotFound(address))?;
        if breakpoint.enabled {
            memory.write(address, &breakpoint.original)?;
        }
        self.table.remove(&address);
        debug!(%address, "Removed software breakpoint");
        Ok(())
    }

    /// Write the trap back; a no-op when already enabled.
    ///
    /// ## Errors
    ///
    /// `BreakpointNotFound` if nothing is installed there.
    pub fn enable<B: TraceBackend + ?Sized>(&mut self, memory: &mut MemoryAccessor<'_, B>, address: Address) -> TrapdoorResult<()>
    {
        let profile = self.profile;
        let breakpoint = self
            .table
            .get_mut(&address)
            .ok_or(TrapdoorError::BreakpointNotFound(address))?;
        if !breakpoint.enabled {
            memory.write(address, breakpoint.trap(profile))?;
            breakpoint.enabled = true;
        }
        Ok(())
    }

    /// Restore the original bytes but keep the entry; a no-op when already
    /// disabled.
    ///
    /// ## Errors
    ///
    /// `BreakpointNotFound` if nothing is installed there.
    pub fn disable<B: TraceBackend + ?Sized>(&mut self, memory: &mut MemoryAccessor<'_, B>, address: Address) -> TrapdoorResult<()>
    {
        let breakpoint = self
            .table
            .get_mut(&address)
            .ok_or(TrapdoorError::BreakpointNotFound(address))?;
        if breakpoint.enabled {
            memory.write(address, &breakpoint.original)?;
            breakpoint.enabled = false;
        }
        Ok(())
    }

    /// Whether an enabled breakpoint sits at `address`.
    #[must_use]
    pub fn is_armed(&self, address: Address) -> bool
    {
        self.table.get(&address).is_some_and(|breakpoint| breakpoint.enabled)
    }

    /// Count a stop on the breakpoint at `address`.
    pub fn record_hit(&mut self, address: Address) -> Option<u64>
    {
        let breakpoint = self.table.get_mut(&address)?;
        breakpoint.hit_count = breakpoint.hit_count.saturating_add(1);
        Some(breakpoint.hit_count)
    }

    /// Whether any entry exists at `address`.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        self.table.contains_key(&address)
    }

    /// Entry at `address`.
    #[must_use]
    pub fn get(&self, address: Address) -> Option<&Breakpoint>
    {
        self.table.get(&address)
    }

    /// All entries, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint>
    {
        self.table.values()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.table.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.table.is_empty()
    }

    /// Put the original bytes back everywhere and forget every entry
    ///
    /// Best effort: a failing write is logged and the rest are still
    /// restored. Returns the first error.
    pub fn restore_all<B: TraceBackend + ?Sized>(&mut self, memory: &mut MemoryAccessor<'_, B>) -> TrapdoorResult<()>
    {
        let mut first_error = None;
        for (address, breakpoint) in self.table.drain() {
            if !breakpoint.enabled {
                continue;
            }
            if let Err(error) = memory.write(address, &breakpoint.original) {
                warn!(%address, %error, "Could not restore original bytes");
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Forget every entry without touching memory (the tracee is gone).
    pub fn clear(&mut self)
    {
        self.table.clear();
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::arch::{AARCH64, RISCV64, X86_64};
    use crate::testing::FakeBackend;

    const TEXT: Address = Address::new(0x40_1000);

    fn text_backend(profile: &'static ArchitectureProfile, bytes: Vec<u8>) -> FakeBackend
    {
        let mut backend = FakeBackend::with_profile(profile);
        backend.map(TEXT, bytes);
        backend
    }

    #[test]
    fn test_install_uninstall_restores_bytes()
    {
        let code = vec![0x55, 0x48, 0x89, 0xe5, 0x90, 0x90, 0xc3, 0x90];
        let mut backend = text_backend(&X86_64, code.clone());
        let thread = backend.leader();
        let mut manager = BreakpointManager::new(&X86_64);

        {
            let mut memory = MemoryAccessor::new(&mut backend, thread);
            manager.install(&mut memory, TEXT + 1).unwrap();
        }
        assert_eq!(backend.bytes(TEXT, 3), vec![0x55, 0xcc, 0x89]);
        assert_eq!(manager.get(TEXT + 1).unwrap().original.as_slice(), &[0x48]);

        let mut memory = MemoryAccessor::new(&mut backend, thread);
        manager.uninstall(&mut memory, TEXT + 1).unwrap();
        assert!(manager.is_empty());
        assert_eq!(backend.bytes(TEXT, code.len()), code);
    }

    #[test]
    fn test_reinstall_is_a_collision()
    {
        let mut backend = text_backend(&AARCH64, vec![0x1f, 0x20, 0x03, 0xd5, 0xc0, 0x03, 0x5f, 0xd6]);
        let thread = backend.leader();
        let mut manager = BreakpointManager::new(&AARCH64);
        let mut memory = MemoryAccessor::new(&mut backend, thread);

        manager.install(&mut memory, TEXT).unwrap();
        assert!(matches!(manager.install(&mut memory, TEXT), Err(TrapdoorError::BreakpointCollision(a)) if a == TEXT));

        manager.disable(&mut memory, TEXT).unwrap();
        assert!(matches!(manager.install(&mut memory, TEXT), Err(TrapdoorError::BreakpointCollision(_))));
    }

    #[test]
    fn test_enable_disable_are_idempotent()
    {
        let code = vec![0x1f, 0x20, 0x03, 0xd5];
        let mut backend = text_backend(&AARCH64, code.clone());
        let thread = backend.leader();
        let mut manager = BreakpointManager::new(&AARCH64);

        {
            let mut memory = MemoryAccessor::new(&mut backend, thread);
            manager.install(&mut memory, TEXT).unwrap();
            manager.disable(&mut memory, TEXT).unwrap();
            manager.disable(&mut memory, TEXT).unwrap();
        }
        assert_eq!(backend.bytes(TEXT, 4), code);
        assert!(!manager.is_armed(TEXT));

        {
            let mut memory = MemoryAccessor::new(&mut backend, thread);
            manager.enable(&mut memory, TEXT).unwrap();
            manager.enable(&mut memory, TEXT).unwrap();
        }
        assert_eq!(backend.bytes(TEXT, 4), AARCH64.trap_bytes());
        assert_eq!(manager.get(TEXT).unwrap().original.as_slice(), code.as_slice());
    }

    #[test]
    fn test_riscv_compressed_site_gets_short_trap()
    {
        // c.addi sp,-16 ; addi a0,zero,1
        let code = vec![0x41, 0x11, 0x13, 0x05, 0x10, 0x00];
        let mut backend = text_backend(&RISCV64, code.clone());
        let thread = backend.leader();
        let mut manager = BreakpointManager::new(&RISCV64);

        {
            let mut memory = MemoryAccessor::new(&mut backend, thread);
            manager.install(&mut memory, TEXT).unwrap();
            manager.install(&mut memory, TEXT + 2).unwrap();
        }
        assert_eq!(backend.bytes(TEXT, 6), vec![0x02, 0x90, 0x73, 0x00, 0x10, 0x00]);

        let mut memory = MemoryAccessor::new(&mut backend, thread);
        manager.restore_all(&mut memory).unwrap();
        assert!(manager.is_empty());
        assert_eq!(backend.bytes(TEXT, 6), code);
    }

    #[test]
    fn test_unknown_address()
    {
        let mut backend = text_backend(&X86_64, vec![0x90; 4]);
        let thread = backend.leader();
        let mut manager = BreakpointManager::new(&X86_64);
        let mut memory = MemoryAccessor::new(&mut backend, thread);

        assert!(matches!(manager.uninstall(&mut memory, TEXT), Err(TrapdoorError::BreakpointNotFound(_))));
        assert!(matches!(manager.enable(&mut memory, TEXT), Err(TrapdoorError::BreakpointNotFound(_))));
        assert!(matches!(
            manager.install(&mut memory, Address::new(0x10)),
            Err(TrapdoorError::InaccessibleMemory { .. })
        ));
        assert!(manager.is_empty());
        assert_eq!(manager.record_hit(TEXT), None);
    }
}
