//! Forked tracee fixtures for the Linux integration tests
//!
//! A fixture is a `fork` of the test binary, so every function, static and
//! pre-fork heap allocation sits at the same address in the child as in the
//! test. The child blocks on a pipe until [`Fixture::release`], runs its body
//! and exits with the body's return value. Bodies must not allocate (the
//! parent is multi-threaded).

#![allow(dead_code)]

use std::fs::File;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, pipe, ForkResult, Pid};
use trapdoor_core::arch::ArchitectureProfile;
use trapdoor_core::types::{Address, Architecture, ProcessId};

/// Target of the breakpoint tests. Returns `tag ^ value` so the child's exit
/// code shows what the registers held at the call.
#[inline(never)]
pub extern "C" fn checkpoint(tag: u64, value: u64) -> u64
{
    std::hint::black_box(tag ^ value)
}

/// Address of [`checkpoint`].
pub fn checkpoint_address() -> Address
{
    Address::new(checkpoint as usize as u64)
}

/// Call [`checkpoint`] through an opaque pointer so it is never inlined away.
pub fn call_checkpoint(tag: u64, value: u64) -> u64
{
    let function: extern "C" fn(u64, u64) -> u64 = std::hint::black_box(checkpoint);
    function(tag, value)
}

/// Word the watchpoint tests watch.
pub static WATCHED: AtomicU64 = AtomicU64::new(0);

/// Address of [`WATCHED`].
pub fn watched_address() -> Address
{
    Address::new(std::ptr::addr_of!(WATCHED) as u64)
}

/// Store to [`WATCHED`].
pub fn touch_watched(value: u64)
{
    WATCHED.store(value, Ordering::SeqCst);
}

/// Registers holding the first two integer arguments on function entry.
pub fn argument_registers(profile: &ArchitectureProfile) -> [&'static str; 2]
{
    match profile.architecture {
        Architecture::X86_64 => ["rdi", "rsi"],
        Architecture::Aarch64 => ["x0", "x1"],
        Architecture::Riscv64 => ["a0", "a1"],
    }
}

/// Exit the child without running the parent's destructors.
pub fn exit_child(code: u64) -> !
{
    #[allow(clippy::cast_possible_truncation)]
    let status = (code & 0x7f) as i32;
    // SAFETY: `_exit` never returns and touches no Rust state.
    unsafe { libc::_exit(status) }
}

/// Loads every register listed in [`LOADED_REGISTERS`] with
/// [`loaded_value`], in list order, and passes through [`registers_loaded`]
/// before returning. Callee-saved registers are preserved.
#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    ".text",
    ".globl trapdoor_load_registers",
    ".type trapdoor_load_registers, %function",
    "trapdoor_load_registers:",
    "push rbx",
    "push rbp",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "movabs rax, 0x5a5a000000000000",
    "movabs rbx, 0x5a5a000000000001",
    "movabs rcx, 0x5a5a000000000002",
    "movabs rdx, 0x5a5a000000000003",
    "movabs rsi, 0x5a5a000000000004",
    "movabs rdi, 0x5a5a000000000005",
    "movabs rbp, 0x5a5a000000000006",
    "movabs r8, 0x5a5a000000000007",
    "movabs r9, 0x5a5a000000000008",
    "movabs r10, 0x5a5a000000000009",
    "movabs r11, 0x5a5a00000000000a",
    "movabs r12, 0x5a5a00000000000b",
    "movabs r13, 0x5a5a00000000000c",
    "movabs r14, 0x5a5a00000000000d",
    "movabs r15, 0x5a5a00000000000e",
    ".globl trapdoor_registers_loaded",
    "trapdoor_registers_loaded:",
    "nop",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbp",
    "pop rbx",
    "ret",
);

#[cfg(target_arch = "x86_64")]
pub const LOADED_REGISTERS: &[&str] = &[
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    ".text",
    ".globl trapdoor_load_registers",
    ".type trapdoor_load_registers, %function",
    "trapdoor_load_registers:",
    "movz x0, #0x5a5a, lsl #48",
    "movk x0, #0",
    "movz x1, #0x5a5a, lsl #48",
    "movk x1, #1",
    "movz x2, #0x5a5a, lsl #48",
    "movk x2, #2",
    "movz x3, #0x5a5a, lsl #48",
    "movk x3, #3",
    "movz x4, #0x5a5a, lsl #48",
    "movk x4, #4",
    "movz x5, #0x5a5a, lsl #48",
    "movk x5, #5",
    "movz x6, #0x5a5a, lsl #48",
    "movk x6, #6",
    "movz x7, #0x5a5a, lsl #48",
    "movk x7, #7",
    "movz x8, #0x5a5a, lsl #48",
    "movk x8, #8",
    "movz x9, #0x5a5a, lsl #48",
    "movk x9, #9",
    "movz x10, #0x5a5a, lsl #48",
    "movk x10, #10",
    "movz x11, #0x5a5a, lsl #48",
    "movk x11, #11",
    "movz x12, #0x5a5a, lsl #48",
    "movk x12, #12",
    "movz x13, #0x5a5a, lsl #48",
    "movk x13, #13",
    "movz x14, #0x5a5a, lsl #48",
    "movk x14, #14",
    ".globl trapdoor_registers_loaded",
    "trapdoor_registers_loaded:",
    "nop",
    "ret",
);

#[cfg(target_arch = "aarch64")]
pub const LOADED_REGISTERS: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
];

#[cfg(target_arch = "riscv64")]
std::arch::global_asm!(
    ".text",
    ".globl trapdoor_load_registers",
    ".type trapdoor_load_registers, %function",
    "trapdoor_load_registers:",
    "li t0, 0x5a5a000000000000",
    "li t1, 0x5a5a000000000001",
    "li t2, 0x5a5a000000000002",
    "li t3, 0x5a5a000000000003",
    "li t4, 0x5a5a000000000004",
    "li t5, 0x5a5a000000000005",
    "li t6, 0x5a5a000000000006",
    "li a0, 0x5a5a000000000007",
    "li a1, 0x5a5a000000000008",
    "li a2, 0x5a5a000000000009",
    "li a3, 0x5a5a00000000000a",
    "li a4, 0x5a5a00000000000b",
    "li a5, 0x5a5a00000000000c",
    "li a6, 0x5a5a00000000000d",
    "li a7, 0x5a5a00000000000e",
    ".globl trapdoor_registers_loaded",
    "trapdoor_registers_loaded:",
    "nop",
    "ret",
);

#[cfg(target_arch = "riscv64")]
pub const LOADED_REGISTERS: &[&str] = &[
    "t0", "t1", "t2", "t3", "t4", "t5", "t6", "a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7",
];

extern "C" {
    fn trapdoor_load_registers();
    fn trapdoor_registers_loaded();
}

/// Value the fixture loads into `LOADED_REGISTERS[index]`.
pub fn loaded_value(index: usize) -> u64
{
    0x5a5a_0000_0000_0000 | index as u64
}

/// Entry of the register-loading routine.
pub fn load_registers_address() -> Address
{
    Address::new(trapdoor_load_registers as usize as u64)
}

/// The instruction right after the last load.
pub fn registers_loaded() -> Address
{
    Address::new(trapdoor_registers_loaded as usize as u64)
}

/// Run the register-loading routine.
pub fn load_registers()
{
    // SAFETY: the routine only clobbers caller-saved registers and returns.
    unsafe { trapdoor_load_registers() }
}

/// A forked child waiting to run `body`
pub struct Fixture
{
    pub pid: ProcessId,
    gate: Option<File>,
    reaped: bool,
}

impl Fixture
{
    pub fn spawn(body: impl FnOnce() -> u64) -> Self
    {
        let (read_end, write_end) = pipe().expect("pipe");
        // SAFETY: the child only reads the pipe and runs `body`, neither of
        // which allocates.
        match unsafe { fork() }.expect("fork") {
            ForkResult::Child => {
                drop(write_end);
                let mut gate = File::from(read_end);
                let mut byte = [0u8; 1];
                if gate.read_exact(&mut byte).is_err() {
                    exit_child(126);
                }
                exit_child(body())
            }
            ForkResult::Parent { child } => {
                drop(read_end);
                Self {
                    pid: ProcessId::from(child),
                    gate: Some(File::from(write_end)),
                    reaped: false,
                }
            }
        }
    }

    /// Let the child run its body.
    pub fn release(&mut self)
    {
        if let Some(mut gate) = self.gate.take() {
            gate.write_all(&[1]).expect("release fixture");
        }
    }

    /// Wait for the (untraced) child to finish.
    pub fn wait(&mut self) -> WaitStatus
    {
        let status = waitpid(self.pid(), None).expect("waitpid");
        self.reaped = true;
        status
    }

    /// The tracer already collected the exit status.
    pub fn mark_reaped(&mut self)
    {
        self.reaped = true;
    }

    fn pid(&self) -> Pid
    {
        self.pid.as_pid()
    }
}

impl Drop for Fixture
{
    fn drop(&mut self)
    {
        if !self.reaped {
            let _ = kill(self.pid(), Signal::SIGKILL);
            let _ = waitpid(self.pid(), None);
        }
    }
}
