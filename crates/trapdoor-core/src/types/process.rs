//! Process, thread, architecture and memory region types.

use std::fmt;

use nix::unistd::Pid;

use super::Address;

/// Process identifier (PID)
///
/// The thread-group id of a tracee. Also the id of its leader thread.
///
/// ## Example
///
/// ```rust
/// use trapdoor_core::types::ProcessId;
///
/// let pid = ProcessId::from(12345);
/// assert_eq!(pid.0, 12345);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl ProcessId
{
    /// The id as a nix `Pid`.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn as_pid(self) -> Pid
    {
        Pid::from_raw(self.0 as i32)
    }

    /// The leader thread of this process.
    #[must_use]
    pub const fn leader(self) -> ThreadId
    {
        ThreadId(self.0)
    }
}

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl From<Pid> for ProcessId
{
    #[allow(clippy::cast_sign_loss)]
    fn from(pid: Pid) -> Self
    {
        ProcessId(pid.as_raw() as u32)
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier (Linux TID)
///
/// Every ptrace request addresses one thread; the leader's TID equals the PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl ThreadId
{
    /// Raw numeric value.
    #[must_use]
    pub const fn raw(self) -> u32
    {
        self.0
    }

    /// The id as a nix `Pid` (ptrace takes TIDs in the PID slot).
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn as_pid(self) -> Pid
    {
        Pid::from_raw(self.0 as i32)
    }
}

impl From<u32> for ThreadId
{
    fn from(value: u32) -> Self
    {
        Self(value)
    }
}

impl From<Pid> for ThreadId
{
    #[allow(clippy::cast_sign_loss)]
    fn from(pid: Pid) -> Self
    {
        ThreadId(pid.as_raw() as u32)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of one tracee thread
///
/// `Detached -> Running -> Stopped -> {Running | Exited}`. A freshly attached
/// thread starts out `Stopped`; `Exited` and `Detached` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState
{
    /// Not (or no longer) traced.
    Detached,
    /// Executing; registers are not observable.
    Running,
    /// In a ptrace-stop; registers and debug slots may be accessed.
    Stopped,
    /// The thread has exited.
    Exited,
}

impl ThreadState
{
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool
    {
        matches!(self, Self::Detached | Self::Exited)
    }
}

impl fmt::Display for ThreadState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            Self::Detached => "detached",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
        };
        f.write_str(name)
    }
}

/// Instruction set of a tracee
///
/// Closed set: every variant has a static
/// [`ArchitectureProfile`](crate::arch::ArchitectureProfile).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// x86-64 (AMD64)
    X86_64,
    /// AArch64 (ARMv8-A, 64-bit)
    Aarch64,
    /// RISC-V RV64
    Riscv64,
}

impl Architecture
{
    /// Architecture this crate was compiled for, if it has a profile.
    #[must_use]
    pub const fn current() -> Option<Self>
    {
        if cfg!(target_arch = "x86_64") {
            Some(Self::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Self::Aarch64)
        } else if cfg!(target_arch = "riscv64") {
            Some(Self::Riscv64)
        } else {
            None
        }
    }

    /// Short lowercase name (`x86_64`, `aarch64`, `riscv64`).
    #[must_use]
    pub const fn name(self) -> &'static str
    {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
            Self::Riscv64 => "riscv64",
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.name())
    }
}

/// One mapping of the tracee's address space, as listed in `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion
{
    /// First mapped address
    pub start: Address,
    /// One past the last mapped address
    pub end: Address,
    /// Permission string, e.g. `r-xp`
    pub permissions: String,
    /// Offset into the backing file
    pub offset: u64,
    /// Backing path or pseudo name (`[heap]`, `[stack]`), if any
    pub name: Option<String>,
}

impl MemoryRegion
{
    /// Create a new region.
    #[must_use]
    pub fn new(start: Address, end: Address, permissions: String, name: Option<String>) -> Self
    {
        Self {
            start,
            end,
            permissions,
            offset: 0,
            name,
        }
    }

    /// Parse one line of `/proc/<pid>/maps`
    ///
    /// ```rust
    /// use trapdoor_core::types::MemoryRegion;
    ///
    /// let region = MemoryRegion::from_maps_line("55d4a000-55d4b000 r-xp 00001000 08:01 42 /usr/bin/true").unwrap();
    /// assert_eq!(region.size(), 0x1000);
    /// assert!(region.is_executable());
    /// ```
    #[must_use]
    pub fn from_maps_line(line: &str) -> Option<Self>
    {
        let mut fields = line.split_whitespace();
        let (start, end) = fields.next()?.split_once('-')?;
        let permissions = fields.next()?.to_string();
        let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
        // device and inode
        fields.next()?;
        fields.next()?;
        let name = fields.collect::<Vec<_>>().join(" ");

        Some(Self {
            start: Address::new(u64::from_str_radix(start, 16).ok()?),
            end: Address::new(u64::from_str_radix(end, 16).ok()?),
            permissions,
            offset,
            name: (!name.is_empty()).then_some(name),
        })
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64
    {
        self.end.value().saturating_sub(self.start.value())
    }

    /// Whether `address` lies inside the region.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        self.start <= address && address < self.end
    }

    /// Readable mapping.
    #[must_use]
    pub fn is_readable(&self) -> bool
    {
        self.permissions.starts_with('r')
    }

    /// Writable mapping.
    #[must_use]
    pub fn is_writable(&self) -> bool
    {
        self.permissions.as_bytes().get(1) == Some(&b'w')
    }

    /// Executable mapping.
    #[must_use]
    pub fn is_executable(&self) -> bool
    {
        self.permissions.as_bytes().get(2) == Some(&b'x')
    }
}
