//! # Register Files
//!
//! A [`RegisterFile`] is a copy of one thread's general-purpose register
//! block, exactly as the kernel lays it out for `NT_PRSTATUS`, paired with the
//! architecture profile that knows where each named register lives inside it.
//!
//! Reads and writes are by name. Narrow aliases (`eax`, `w3`, `a0`) resolve to
//! a byte range inside their parent; what happens to the parent's other bytes
//! on a narrow write is the profile's [`NarrowWritePolicy`].
//!
//! ## Example
//!
//! ```rust
//! use trapdoor_core::arch::X86_64;
//! use trapdoor_core::registers::RegisterFile;
//!
//! let mut regs = RegisterFile::zeroed(&X86_64);
//! regs.write("rax", 0x1122_3344_5566_7788).unwrap();
//! regs.write("al", 0xff).unwrap();
//! assert_eq!(regs.read("rax").unwrap(), 0x1122_3344_5566_77ff);
//! assert_eq!(regs.read("ax").unwrap(), 0x77ff);
//! ```

use std::fmt;

use crate::arch::{ArchitectureProfile, NarrowWritePolicy, RegisterInfo};
use crate::error::{TrapdoorError, TrapdoorResult};
use crate::types::Address;

/// Snapshot of a thread's general-purpose registers
#[derive(Clone)]
pub struct RegisterFile
{
    profile: &'static ArchitectureProfile,
    bytes: Vec<u8>,
}

impl RegisterFile
{
    /// Wrap a raw register block
    ///
    /// A block shorter than the profile's size (older kernels) is padded with
    /// zeroes; a longer one is truncated.
    #[must_use]
    pub fn from_bytes(profile: &'static ArchitectureProfile, mut bytes: Vec<u8>) -> Self
    {
        bytes.resize(profile.register_block.size, 0);
        Self { profile, bytes }
    }

    /// All-zero register file.
    #[must_use]
    pub fn zeroed(profile: &'static ArchitectureProfile) -> Self
    {
        Self {
            profile,
            bytes: vec![0; profile.register_block.size],
        }
    }

    /// Profile describing this block.
    #[must_use]
    pub fn profile(&self) -> &'static ArchitectureProfile
    {
        self.profile
    }

    /// Raw block, suitable for `PTRACE_SETREGSET`.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8]
    {
        &self.bytes
    }

    /// Read a register by name
    ///
    /// ## Errors
    ///
    /// `UnknownRegister` if the profile has no register of that name.
    pub fn read(&self, name: &str) -> TrapdoorResult<u64>
    {
        let info = self.profile.register_info(name)?;
        Ok(self.read_info(info))
    }

    /// Write a register by name
    ///
    /// Writing a narrow alias follows the profile's narrow-write policy:
    /// x86-64 and RISC-V keep the rest of the parent register, AArch64 clears
    /// the upper half of `xN` when `wN` is written.
    ///
    /// ## Errors
    ///
    /// - `UnknownRegister` if the profile has no register of that name
    /// - `RegisterValueOutOfRange` if `value` does not fit the register's width
    pub fn write(&mut self, name: &str, value: u64) -> TrapdoorResult<()>
    {
        let info = self.profile.register_info(name)?;
        if value > info.max_value() {
            return Err(TrapdoorError::RegisterValueOutOfRange {
                name: name.to_string(),
                value,
            });
        }

        if info.is_alias() && self.profile.narrow_writes == NarrowWritePolicy::ZeroExtend {
            let parent = self.profile.parent_of(info);
            self.write_info(parent, 0);
        }
        self.write_info(info, value);
        Ok(())
    }

    /// Program counter.
    #[must_use]
    pub fn pc(&self) -> Address
    {
        Address::new(self.read_named(self.profile.program_counter))
    }

    /// Overwrite the program counter.
    pub fn set_pc(&mut self, pc: Address)
    {
        if let Ok(info) = self.profile.register_info(self.profile.program_counter) {
            self.write_info(info, pc.value());
        }
    }

    /// Stack pointer.
    #[must_use]
    pub fn sp(&self) -> Address
    {
        Address::new(self.read_named(self.profile.stack_pointer))
    }

    /// Iterate over the full-width registers and their values, in block order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_
    {
        self.profile
            .registers
            .iter()
            .filter(|info| !info.is_alias())
            .map(move |info| (info.name, self.read_info(info)))
    }

    fn read_named(&self, name: &str) -> u64
    {
        self.profile.register_info(name).map_or(0, |info| self.read_info(info))
    }

    fn read_info(&self, info: &RegisterInfo) -> u64
    {
        let mut raw = [0u8; 8];
        raw[..info.width].copy_from_slice(&self.bytes[info.offset..info.offset + info.width]);
        u64::from_le_bytes(raw)
    }

    fn write_info(&mut self, info: &RegisterInfo, value: u64)
    {
        self.bytes[info.offset..info.offset + info.width].copy_from_slice(&value.to_le_bytes()[..info.width]);
    }
}

impl PartialEq for RegisterFile
{
    fn eq(&self, other: &Self) -> bool
    {
        self.profile.architecture == other.profile.architecture && self.bytes == other.bytes
    }
}

impl Eq for RegisterFile {}

impl fmt::Debug for RegisterFile
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let mut map = f.debug_map();
        for (name, value) in self.iter() {
            map.entry(&name, &format_args!("0x{value:016x}"));
        }
        map.finish()
    }
}
