//! Hardware debug slot tables.
//!
//! Every architecture exposes a small, fixed set of debug registers. The
//! bit layout of their control words, the sizes they can watch, how they are
//! reached through ptrace and how a hit is reported all differ, so each
//! profile describes its slots as one or more [`SlotBank`]s. The watchpoint
//! manager only ever talks to these tables.

use crate::error::{TrapdoorError, TrapdoorResult};
use crate::types::{AccessKind, Address};

/// What the engine must do before resuming a thread stopped by a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitResume
{
    /// The access already retired (or the kernel arranges to skip the trap).
    Direct,
    /// The trap fires before the access; the slot must be disabled for one
    /// single-step, then re-enabled.
    StepWithSlotDisabled,
}

/// Encoding of one access kind within a bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRule
{
    /// Access kind this rule encodes
    pub access: AccessKind,
    /// Value of the access/type field
    pub code: u64,
    /// Watch sizes the hardware accepts for this access
    pub sizes: &'static [usize],
    /// Resume requirement after a hit
    pub resume: HitResume,
}

/// Where a watched range may sit relative to the address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement
{
    /// The address must be a multiple of the size.
    Natural,
    /// The value register holds a `granule`-aligned address and a byte-select
    /// mask picks bytes inside it; the range may not cross the granule.
    ByteSelect
    {
        /// Alignment of the value register
        granule: u64,
    },
}

/// Bit layout of the control word(s)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLayout
{
    /// One control word shared by all slots (x86 DR7). Slot `i` owns the
    /// enable bits at `enable_stride * i` and a 4-bit field at
    /// `field_base + field_stride * i`: access code in the low two bits,
    /// length code in the high two bits.
    Shared
    {
        /// Distance between consecutive slots' enable bits
        enable_stride: u32,
        /// Bit position of slot 0's access/length field
        field_base: u32,
        /// Distance between consecutive slots' fields
        field_stride: u32,
        /// Watch size to length code
        length_codes: &'static [(usize, u64)],
    },
    /// One control word per slot (AArch64 `DBGWCR`/`DBGBCR`).
    PerSlot
    {
        /// Enable bit value
        enable: u64,
        /// Privilege field value (EL0 only)
        privilege: u64,
        /// Shift of the privilege field
        privilege_shift: u32,
        /// Shift of the access (load/store) field
        access_shift: u32,
        /// Shift of the byte-address-select field
        select_shift: u32,
    },
}

/// How ptrace reaches the slot registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotTransport
{
    /// Words of `struct user` accessed with `PTRACE_PEEKUSER`/`POKEUSER`.
    UserArea
    {
        /// Offset of slot 0's address register
        values: usize,
        /// Distance between address registers
        stride: usize,
        /// Offset of the shared control word
        control: usize,
        /// Offset of the status word
        status: usize,
    },
    /// A regset read and written whole with `PTRACE_GETREGSET`/`SETREGSET`.
    RegisterSet
    {
        /// Regset note type
        note: u32,
        /// Bytes before slot 0 (`dbg_info` and padding)
        header: usize,
        /// Bytes per slot (`addr`, `ctrl`, padding)
        stride: usize,
        /// Maximum slots the regset can describe
        max_slots: usize,
    },
}

/// How the kernel reports which slot fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitDetection
{
    /// Sticky per-slot bits in the transport's status word (x86 DR6).
    StatusBits,
    /// `siginfo.si_code` equals `code` and `si_addr` is the triggering address.
    FaultAddress
    {
        /// Expected `si_code` (`TRAP_HWBKPT`)
        code: i32,
    },
}

/// Values to load into one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotProgram
{
    /// Address register contents
    pub value: u64,
    /// Control bits for this slot
    pub control: u64,
    /// Bits of the control word the slot owns; everything else belongs to
    /// other slots and must be preserved
    pub mask: u64,
}

/// A group of interchangeable debug slots with one encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotBank
{
    /// Human-readable name for logs
    pub name: &'static str,
    /// Default number of slots (the backend may report fewer)
    pub count: usize,
    /// Access kinds this bank can hold
    pub rules: &'static [AccessRule],
    /// Address placement rule
    pub placement: Placement,
    /// Control word layout
    pub control: ControlLayout,
    /// Transport used to program the slots
    pub transport: SlotTransport,
    /// How hits are reported
    pub detection: HitDetection,
}

impl SlotBank
{
    /// Encoding rule for `access`, if this bank supports it.
    #[must_use]
    pub fn rule(&self, access: AccessKind) -> Option<&'static AccessRule>
    {
        let rules: &'static [AccessRule] = self.rules;
        rules.iter().find(|rule| rule.access == access)
    }

    /// Largest size any rule of this bank accepts.
    #[must_use]
    pub fn max_size(&self) -> usize
    {
        self.rules.iter().flat_map(|rule| rule.sizes.iter().copied()).max().unwrap_or(0)
    }

    /// Bits of the control word owned by slot `index`.
    #[must_use]
    pub fn control_mask(&self, index: usize) -> u64
    {
        match self.control {
            ControlLayout::Shared {
                enable_stride,
                field_base,
                field_stride,
                ..
            } => {
                let slot = slot_shift(index);
                (0b11 << (enable_stride * slot)) | (0b1111 << (field_base + field_stride * slot))
            }
            ControlLayout::PerSlot { .. } => u64::from(u32::MAX),
        }
    }

    /// Validate and encode a watch request for slot `index`
    ///
    /// ## Errors
    ///
    /// - `UnsupportedAccess` if the bank has no rule for `access`
    /// - `UnsupportedSize` if the rule does not list `size`
    /// - `MisalignedWatchpoint` if the range violates the placement rule
    ///
    /// ## Example
    ///
    /// ```rust
    /// use trapdoor_core::arch::X86_64;
    /// use trapdoor_core::types::{AccessKind, Address};
    ///
    /// let bank = &X86_64.slot_banks[0];
    /// let program = bank.encode(1, Address::new(0x1000), 8, AccessKind::Write, "x86_64").unwrap();
    /// // L1 enable, RW1 = write (01), LEN1 = 8 bytes (10)
    /// assert_eq!(program.control, (1 << 2) | (0b1001 << 20));
    /// ```
    pub fn encode(&self, index: usize, address: Address, size: usize, access: AccessKind, architecture: &'static str) -> TrapdoorResult<SlotProgram>
    {
        let rule = self
            .rule(access)
            .ok_or(TrapdoorError::UnsupportedAccess { access, architecture })?;
        if !rule.sizes.contains(&size) {
            return Err(TrapdoorError::UnsupportedSize {
                size,
                max: rule.sizes.iter().copied().max().unwrap_or(0),
            });
        }

        let width = size as u64;
        let placed = match self.placement {
            Placement::Natural => address.is_aligned(width),
            Placement::ByteSelect { granule } => address.value() % granule + width <= granule,
        };
        if !placed {
            return Err(TrapdoorError::MisalignedWatchpoint { address, size });
        }

        match self.control {
            ControlLayout::Shared {
                enable_stride,
                field_base,
                field_stride,
                length_codes,
            } => {
                let length = length_codes
                    .iter()
                    .find(|(bytes, _)| *bytes == size)
                    .map(|(_, code)| *code)
                    .ok_or(TrapdoorError::UnsupportedSize { size, max: self.max_size() })?;
                let slot = slot_shift(index);
                let field = (rule.code | (length << 2)) << (field_base + field_stride * slot);
                Ok(SlotProgram {
                    value: address.value(),
                    control: (1 << (enable_stride * slot)) | field,
                    mask: self.control_mask(index),
                })
            }
            ControlLayout::PerSlot {
                enable,
                privilege,
                privilege_shift,
                access_shift,
                select_shift,
            } => {
                let granule = match self.placement {
                    Placement::ByteSelect { granule } => granule,
                    Placement::Natural => width,
                };
                let select = ((1u64 << width) - 1) << (address.value() % granule);
                Ok(SlotProgram {
                    value: address.align_down(granule).value(),
                    control: enable | (privilege << privilege_shift) | (rule.code << access_shift) | (select << select_shift),
                    mask: self.control_mask(index),
                })
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn slot_shift(index: usize) -> u32
{
    index as u32
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::arch::{AARCH64, X86_64};

    #[test]
    fn test_dr7_fields_for_every_slot()
    {
        let bank = &X86_64.slot_banks[0];
        for index in 0..bank.count {
            let program = bank.encode(index, Address::new(0x4000), 4, AccessKind::ReadWrite, "x86_64").unwrap();
            let shift = 16 + 4 * index as u32;
            assert_eq!(program.control, (1 << (2 * index)) | (0b1111 << shift));
            assert_eq!(program.control & !program.mask, 0);
        }
    }

    #[test]
    fn test_dr7_length_codes()
    {
        let bank = &X86_64.slot_banks[0];
        let len = |size: usize| {
            let program = bank.encode(0, Address::new(0x4000), size, AccessKind::Write, "x86_64").unwrap();
            (program.control >> 18) & 0b11
        };
        assert_eq!(len(1), 0b00);
        assert_eq!(len(2), 0b01);
        assert_eq!(len(8), 0b10);
        assert_eq!(len(4), 0b11);
    }

    #[test]
    fn test_x86_rejects_bad_requests()
    {
        let bank = &X86_64.slot_banks[0];
        assert!(matches!(
            bank.encode(0, Address::new(0x4000), 3, AccessKind::Write, "x86_64"),
            Err(TrapdoorError::UnsupportedSize { size: 3, max: 8 })
        ));
        assert!(matches!(
            bank.encode(0, Address::new(0x4004), 8, AccessKind::Write, "x86_64"),
            Err(TrapdoorError::MisalignedWatchpoint { size: 8, .. })
        ));
        assert!(matches!(
            bank.encode(0, Address::new(0x4000), 4, AccessKind::Read, "x86_64"),
            Err(TrapdoorError::UnsupportedAccess { access: AccessKind::Read, .. })
        ));
        assert!(matches!(
            bank.encode(0, Address::new(0x4000), 4, AccessKind::Execute, "x86_64"),
            Err(TrapdoorError::UnsupportedSize { size: 4, max: 1 })
        ));
    }

    #[test]
    fn test_arm_watch_control_word()
    {
        let bank = &AARCH64.slot_banks[0];
        let program = bank.encode(0, Address::new(0x1_0004), 4, AccessKind::Write, "aarch64").unwrap();
        assert_eq!(program.value, 0x1_0000);
        // enable | EL0 | store | BAS 0b1111_0000
        assert_eq!(program.control, 0x1 | (0b10 << 1) | (0b10 << 3) | (0xf0 << 5));

        let program = bank.encode(3, Address::new(0x2000), 8, AccessKind::ReadWrite, "aarch64").unwrap();
        assert_eq!(program.control, 0x1 | (0b10 << 1) | (0b11 << 3) | (0xff << 5));
    }

    #[test]
    fn test_arm_watch_may_not_cross_doubleword()
    {
        let bank = &AARCH64.slot_banks[0];
        assert!(matches!(
            bank.encode(0, Address::new(0x2006), 4, AccessKind::Read, "aarch64"),
            Err(TrapdoorError::MisalignedWatchpoint { .. })
        ));
    }

    #[test]
    fn test_arm_break_control_word()
    {
        let (position, bank) = AARCH64.bank_for(AccessKind::Execute).unwrap();
        assert_eq!(position, 1);
        let program = bank.encode(0, Address::new(0x40_1000), 4, AccessKind::Execute, "aarch64").unwrap();
        assert_eq!(program.value, 0x40_1000);
        assert_eq!(program.control, 0x1 | (0b10 << 1) | (0xf << 5));
        assert!(bank.encode(0, Address::new(0x40_1002), 4, AccessKind::Execute, "aarch64").is_err());
    }
}
