//! # Architecture Profiles
//!
//! Static, immutable descriptions of the instruction sets the engine can
//! trace. A profile carries everything that differs between ISAs:
//!
//! - The register catalog, as byte offsets into the kernel's `NT_PRSTATUS`
//!   register block, including narrow aliases and the policy for writing them
//! - The software trap instruction and where the program counter lands after
//!   it fires
//! - The hardware debug slot banks and their bit-level encoding tables
//!   (see [`slots`])
//!
//! The rest of the engine never branches on the ISA; it looks things up here.
//! Adding an architecture means adding a profile.
//!
//! ## Supported profiles
//!
//! - [`X86_64`]: `user_regs_struct`, `int3`, DR0-DR3 via the user area
//! - [`AARCH64`]: `user_pt_regs`, `BRK #0`, `NT_ARM_HW_WATCH` / `NT_ARM_HW_BREAK`
//! - [`RISCV64`]: `user_regs_struct`, `ebreak` / `c.ebreak`, no debug slots

mod aarch64;
mod riscv64;
pub mod slots;
mod x86_64;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

pub use aarch64::{AARCH64, NT_ARM_HW_BREAK, NT_ARM_HW_WATCH};
use object::read::elf::FileHeader;
use once_cell::sync::Lazy;
pub use riscv64::RISCV64;
pub use slots::{AccessRule, ControlLayout, HitDetection, HitResume, Placement, SlotBank, SlotProgram, SlotTransport};
pub use x86_64::X86_64;

use crate::error::{TrapdoorError, TrapdoorResult};
use crate::types::{AccessKind, Architecture, ProcessId};

/// `NT_PRSTATUS` regset note: the general-purpose register block.
pub const NT_PRSTATUS: u32 = 1;

/// One entry of a register catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterInfo
{
    /// Name as accepted by `RegisterFile::read`
    pub name: &'static str,
    /// Byte offset inside the register block
    pub offset: usize,
    /// Width in bytes
    pub width: usize,
    /// Full register this name is an alias of, if any
    pub parent: Option<&'static str>,
}

impl RegisterInfo
{
    pub(crate) const fn full(name: &'static str, offset: usize) -> Self
    {
        Self {
            name,
            offset,
            width: 8,
            parent: None,
        }
    }

    pub(crate) const fn alias(name: &'static str, parent: &'static str, offset: usize, width: usize) -> Self
    {
        Self {
            name,
            offset,
            width,
            parent: Some(parent),
        }
    }

    /// Whether this entry names a sub-range (or synonym) of another register.
    #[must_use]
    pub const fn is_alias(&self) -> bool
    {
        self.parent.is_some()
    }

    /// Largest value the register can hold.
    #[must_use]
    pub const fn max_value(&self) -> u64
    {
        if self.width >= 8 {
            u64::MAX
        } else {
            (1u64 << (self.width * 8)) - 1
        }
    }
}

/// What happens to the rest of a parent register when a narrow alias is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NarrowWritePolicy
{
    /// Only the alias bytes change (x86 `al`, `ax`, `eax`).
    PreserveUpper,
    /// The parent is cleared first, as A64 does for `w` registers.
    ZeroExtend,
}

/// Layout of the general-purpose register block fetched with `PTRACE_GETREGSET`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBlock
{
    /// Regset note type
    pub note: u32,
    /// Size of the block in bytes
    pub size: usize,
}

/// Software breakpoint instruction for an ISA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapEncoding
{
    /// Full-size trap instruction, little-endian
    pub bytes: &'static [u8],
    /// Short form patched over compressed (16-bit) instructions, if the ISA
    /// has them
    pub compressed: Option<&'static [u8]>,
    /// How far past the trap address the program counter sits when the trap
    /// is reported
    pub pc_offset: u64,
}

impl TrapEncoding
{
    /// Bytes to read before choosing between the full and compressed trap.
    #[must_use]
    pub fn probe_len(&self) -> usize
    {
        self.compressed.map_or(self.bytes.len(), <[u8]>::len)
    }

    /// Pick the trap to patch over an instruction starting with `prefix`
    ///
    /// A RISC-V instruction whose low two bits are not `0b11` is a 16-bit
    /// compressed instruction and gets `c.ebreak`.
    #[must_use]
    pub fn select(&self, prefix: &[u8]) -> &'static [u8]
    {
        match (self.compressed, prefix.first()) {
            (Some(short), Some(first)) if first & 0b11 != 0b11 => short,
            _ => self.bytes,
        }
    }
}

/// Where a frame-pointer chain keeps its links
///
/// Offsets are relative to the value of the frame pointer register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout
{
    /// Register holding the current frame address
    pub frame_pointer: &'static str,
    /// Register holding the return address of the innermost call, if any
    pub link_register: Option<&'static str>,
    /// Offset of the caller's saved frame pointer
    pub saved_frame_pointer: i64,
    /// Offset of the saved return address
    pub saved_return_address: i64,
}

/// Static description of one instruction set
pub struct ArchitectureProfile
{
    /// Which ISA this profile describes
    pub architecture: Architecture,
    /// Pointer / word width in bytes
    pub pointer_width: usize,
    /// Register catalog in block order; aliases follow their parents
    pub registers: &'static [RegisterInfo],
    /// Name of the program counter entry
    pub program_counter: &'static str,
    /// Name of the stack pointer entry
    pub stack_pointer: &'static str,
    /// General-purpose regset
    pub register_block: RegisterBlock,
    /// Narrow alias write semantics
    pub narrow_writes: NarrowWritePolicy,
    /// Software breakpoint encoding
    pub trap: TrapEncoding,
    /// Whether the kernel implements `PTRACE_SINGLESTEP` here
    pub single_step: bool,
    /// Hardware debug slot banks, in global slot order
    pub slot_banks: &'static [SlotBank],
    /// Frame-pointer chain layout for backtraces
    pub frame: FrameLayout,
    index: Lazy<HashMap<&'static str, usize>>,
}

impl fmt::Debug for ArchitectureProfile
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("ArchitectureProfile")
            .field("architecture", &self.architecture)
            .field("registers", &self.registers.len())
            .field("hardware_slots", &self.hardware_slot_count())
            .finish_non_exhaustive()
    }
}

fn build_index(registers: &'static [RegisterInfo]) -> HashMap<&'static str, usize>
{
    registers.iter().enumerate().map(|(position, info)| (info.name, position)).collect()
}

impl ArchitectureProfile
{
    /// Profile for an architecture.
    #[must_use]
    pub fn for_architecture(architecture: Architecture) -> &'static Self
    {
        match architecture {
            Architecture::X86_64 => &X86_64,
            Architecture::Aarch64 => &AARCH64,
            Architecture::Riscv64 => &RISCV64,
        }
    }

    /// Every profile, in a fixed order.
    #[must_use]
    pub fn all() -> [&'static Self; 3]
    {
        [&X86_64, &AARCH64, &RISCV64]
    }

    /// Profile name (`x86_64`, `aarch64`, `riscv64`).
    #[must_use]
    pub fn name(&self) -> &'static str
    {
        self.architecture.name()
    }

    /// Look up a register by name (case-insensitive)
    ///
    /// ## Errors
    ///
    /// `UnknownRegister` if the name is not in the catalog.
    ///
    /// ## Example
    ///
    /// ```rust
    /// use trapdoor_core::arch::X86_64;
    ///
    /// let eax = X86_64.register_info("eax").unwrap();
    /// assert_eq!(eax.width, 4);
    /// assert_eq!(eax.parent, Some("rax"));
    /// ```
    pub fn register_info(&self, name: &str) -> TrapdoorResult<&'static RegisterInfo>
    {
        let registers: &'static [RegisterInfo] = self.registers;
        let position = match self.index.get(name) {
            Some(position) => Some(*position),
            None => self.index.get(name.to_ascii_lowercase().as_str()).copied(),
        };
        position
            .map(|position| &registers[position])
            .ok_or_else(|| TrapdoorError::UnknownRegister(name.to_string()))
    }

    /// The full-width entry an alias maps onto (itself for full registers).
    #[must_use]
    pub fn parent_of(&self, info: &'static RegisterInfo) -> &'static RegisterInfo
    {
        let registers: &'static [RegisterInfo] = self.registers;
        info.parent
            .and_then(|parent| self.index.get(parent))
            .map_or(info, |position| &registers[*position])
    }

    /// Full-size trap instruction bytes.
    #[must_use]
    pub fn trap_bytes(&self) -> &'static [u8]
    {
        self.trap.bytes
    }

    /// Trap to patch over an instruction beginning with `prefix`.
    #[must_use]
    pub fn trap_for(&self, prefix: &[u8]) -> &'static [u8]
    {
        self.trap.select(prefix)
    }

    /// Total number of hardware debug slots across all banks.
    #[must_use]
    pub fn hardware_slot_count(&self) -> usize
    {
        self.slot_banks.iter().map(|bank| bank.count).sum()
    }

    /// Largest watch size any data bank can encode (0 without debug slots).
    #[must_use]
    pub fn max_watch_size(&self) -> usize
    {
        self.slot_banks
            .iter()
            .flat_map(|bank| bank.rules.iter())
            .filter(|rule| rule.access != AccessKind::Execute)
            .flat_map(|rule| rule.sizes.iter().copied())
            .max()
            .unwrap_or(0)
    }

    /// First bank able to hold `access`, with its index.
    #[must_use]
    pub fn bank_for(&self, access: AccessKind) -> Option<(usize, &'static SlotBank)>
    {
        self.slot_banks
            .iter()
            .enumerate()
            .find(|(_, bank)| bank.rule(access).is_some())
    }

    /// Global index of the first slot of bank `bank`.
    #[must_use]
    pub fn first_slot(&self, bank: usize) -> usize
    {
        self.slot_banks.iter().take(bank).map(|bank| bank.count).sum()
    }

    /// Split a global slot index into `(bank index, index inside the bank)`.
    #[must_use]
    pub fn locate_slot(&self, slot: usize) -> Option<(usize, usize)>
    {
        let mut first = 0;
        for (position, bank) in self.slot_banks.iter().enumerate() {
            if slot < first + bank.count {
                return Some((position, slot - first));
            }
            first += bank.count;
        }
        None
    }

    /// Identify the ISA of a running process from the ELF header of its
    /// executable, falling back to the host architecture
    ///
    /// ## Errors
    ///
    /// `Unsupported` when the executable targets an ISA without a profile,
    /// or when neither the file nor the host yields one.
    pub fn detect(pid: ProcessId) -> TrapdoorResult<&'static Self>
    {
        let exe = Path::new("/proc").join(pid.0.to_string()).join("exe");
        match elf_architecture(&exe) {
            Ok(Some(architecture)) => Ok(Self::for_architecture(architecture)),
            Ok(None) => Err(TrapdoorError::Unsupported {
                operation: "tracing this executable's instruction set",
                architecture: "unknown",
            }),
            Err(error) => {
                tracing::debug!(pid = pid.0, %error, "Could not read ELF header, assuming host architecture");
                Architecture::current()
                    .map(Self::for_architecture)
                    .ok_or(TrapdoorError::Unsupported {
                        operation: "tracing",
                        architecture: std::env::consts::ARCH,
                    })
            }
        }
    }
}

/// Read enough of an ELF file to learn its machine type.
fn elf_architecture(path: &Path) -> std::io::Result<Option<Architecture>>
{
    use std::io::Read;

    let mut header = [0u8; ELF64_HEADER_SIZE];
    std::fs::File::open(path)?.read_exact(&mut header)?;
    Ok(architecture_from_elf_header(&header))
}

/// `object` reads headers in place, so they must be 8-byte aligned.
#[repr(C, align(8))]
struct AlignedHeader([u8; ELF64_HEADER_SIZE]);

const ELF64_HEADER_SIZE: usize = 64;

/// Map a 64-bit ELF header to a profile architecture.
///
/// `header` may start at any alignment; bytes past the header are ignored.
#[must_use]
pub fn architecture_from_elf_header(header: &[u8]) -> Option<Architecture>
{
    let mut aligned = AlignedHeader([0; ELF64_HEADER_SIZE]);
    aligned.0.copy_from_slice(header.get(..ELF64_HEADER_SIZE)?);
    let parsed = object::elf::FileHeader64::<object::Endianness>::parse(&aligned.0[..]).ok()?;
    let endian = parsed.endian().ok()?;
    match parsed.e_machine(endian) {
        object::elf::EM_X86_64 => Some(Architecture::X86_64),
        object::elf::EM_AARCH64 => Some(Architecture::Aarch64),
        object::elf::EM_RISCV => Some(Architecture::Riscv64),
        _ => None,
    }
}
