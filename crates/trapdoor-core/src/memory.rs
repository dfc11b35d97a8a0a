//! # Tracee Memory
//!
//! Range-checked reads and writes of a stopped tracee's address space.
//!
//! Every request is validated against the current memory map before any byte
//! moves, so a partially mapped range fails as a whole and reports the first
//! unmapped hole. Writes go through the kernel's forced-write path and may
//! therefore patch read-only text; if a write fails midway, the bytes that
//! were there before are put back.
//!
//! Position-independent tracees load at a randomized base; [`base_address`]
//! and [`resolve_address`] turn image-relative offsets into absolute
//! addresses.

use tracing::{trace, warn};

use crate::backend::TraceBackend;
use crate::error::{TrapdoorError, TrapdoorResult};
use crate::types::{Address, MemoryRegion, ThreadId};

/// Reads and writes memory through a stopped thread of the tracee
///
/// ## Example
///
/// ```rust,ignore
/// let mut memory = MemoryAccessor::new(&mut backend, thread);
/// let word = memory.read_u64(Address::new(0x7fff_0000))?;
/// memory.write(Address::new(0x7fff_0000), &(word + 1).to_le_bytes())?;
/// ```
pub struct MemoryAccessor<'a, B: TraceBackend + ?Sized>
{
    backend: &'a mut B,
    thread: ThreadId,
}

impl<'a, B: TraceBackend + ?Sized> MemoryAccessor<'a, B>
{
    /// Access memory through `thread`, which must be stopped.
    pub fn new(backend: &'a mut B, thread: ThreadId) -> Self
    {
        Self { backend, thread }
    }

    /// Read `length` bytes starting at `address`
    ///
    /// ## Errors
    ///
    /// `InaccessibleMemory` naming the first unmapped sub-range.
    pub fn read(&mut self, address: Address, length: usize) -> TrapdoorResult<Vec<u8>>
    {
        let mut buffer = vec![0; length];
        self.read_into(address, &mut buffer)?;
        Ok(buffer)
    }

    /// Fill `buffer` from `address`.
    pub fn read_into(&mut self, address: Address, buffer: &mut [u8]) -> TrapdoorResult<()>
    {
        if buffer.is_empty() {
            return Ok(());
        }
        self.check_range(address, buffer.len())?;
        self.backend
            .read_memory(self.thread, address, buffer)
            .map_err(|error| inaccessible_on_fault(error, address, buffer.len()))
    }

    /// Read a little-endian 64-bit word.
    pub fn read_u64(&mut self, address: Address) -> TrapdoorResult<u64>
    {
        let mut word = [0u8; 8];
        self.read_into(address, &mut word)?;
        Ok(u64::from_le_bytes(word))
    }

    /// Write `data` at `address`
    ///
    /// The write either lands completely or leaves memory as it was.
    ///
    /// ## Errors
    ///
    /// `InaccessibleMemory` naming the first unmapped sub-range; nothing is
    /// written in that case.
    pub fn write(&mut self, address: Address, data: &[u8]) -> TrapdoorResult<()>
    {
        if data.is_empty() {
            return Ok(());
        }
        self.check_range(address, data.len())?;

        let mut previous = vec![0; data.len()];
        self.backend
            .read_memory(self.thread, address, &mut previous)
            .map_err(|error| inaccessible_on_fault(error, address, data.len()))?;

        trace!(thread = self.thread.0, %address, len = data.len(), "Writing tracee memory");
        if let Err(error) = self.backend.write_memory(self.thread, address, data) {
            if let Err(restore) = self.backend.write_memory(self.thread, address, &previous) {
                warn!(%address, %restore, "Could not restore memory after a failed write");
            }
            return Err(inaccessible_on_fault(error, address, data.len()));
        }
        Ok(())
    }

    /// Current memory map of the tracee.
    pub fn regions(&mut self) -> TrapdoorResult<Vec<MemoryRegion>>
    {
        self.backend.memory_regions()
    }

    /// Verify that `[address, address + length)` is fully mapped.
    fn check_range(&mut self, address: Address, length: usize) -> TrapdoorResult<()>
    {
        let end = address
            .checked_add(length as u64)
            .ok_or(TrapdoorError::InaccessibleMemory { address, length })?;
        let regions = self.backend.memory_regions()?;
        first_gap(&regions, address, end).map_or(Ok(()), |(gap, gap_length)| {
            Err(TrapdoorError::InaccessibleMemory {
                address: gap,
                length: gap_length,
            })
        })
    }
}

/// Load base of the tracee: the lowest mapped address.
#[must_use]
pub fn base_address(regions: &[MemoryRegion]) -> Option<Address>
{
    regions.iter().map(|region| region.start).min()
}

/// Resolve `address` against the load base
///
/// An address below the base is taken as an offset from it; anything else
/// is already absolute.
///
/// ## Errors
///
/// `InaccessibleMemory` if the resolved address is not mapped (or nothing is
/// mapped at all).
pub fn resolve_address(regions: &[MemoryRegion], address: Address) -> TrapdoorResult<Address>
{
    let base = base_address(regions).ok_or_else(|| unmapped_at(address))?;
    let resolved = if address < base {
        base.checked_add(address.value()).ok_or_else(|| unmapped_at(address))?
    } else {
        address
    };
    if regions.iter().any(|region| region.contains(resolved)) {
        Ok(resolved)
    } else {
        Err(unmapped_at(resolved))
    }
}

fn unmapped_at(address: Address) -> TrapdoorError
{
    TrapdoorError::InaccessibleMemory { address, length: 1 }
}

/// First unmapped sub-range of `[start, end)`, if any.
pub(crate) fn first_gap(regions: &[MemoryRegion], start: Address, end: Address) -> Option<(Address, usize)>
{
    let mut cursor = start;
    while cursor < end {
        match regions.iter().find(|region| region.contains(cursor)) {
            Some(region) => cursor = region.end,
            None => {
                let hole_end = regions
                    .iter()
                    .map(|region| region.start)
                    .filter(|region_start| *region_start > cursor)
                    .min()
                    .map_or(end, |next| next.min(end));
                #[allow(clippy::cast_possible_truncation)]
                return Some((cursor, (hole_end - cursor) as usize));
            }
        }
    }
    None
}

fn inaccessible_on_fault(error: TrapdoorError, address: Address, length: usize) -> TrapdoorError
{
    match error {
        TrapdoorError::Ptrace {
            source: nix::errno::Errno::EIO | nix::errno::Errno::EFAULT,
            ..
        } => TrapdoorError::InaccessibleMemory { address, length },
        other => other,
    }
}
