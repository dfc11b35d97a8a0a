//! RISC-V RV64 profile: `user_regs_struct`, `ebreak` / `c.ebreak`.
//!
//! Linux exposes neither `PTRACE_SINGLESTEP` nor the debug triggers to
//! ptrace on RISC-V, so the profile has no slot banks and stepping is
//! reported as unsupported.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::{build_index, ArchitectureProfile, FrameLayout, NarrowWritePolicy, RegisterBlock, RegisterInfo, TrapEncoding, NT_PRSTATUS};
use crate::types::Architecture;

const fn abi(name: &'static str, number: usize) -> RegisterInfo
{
    RegisterInfo::alias(name, NUMERIC[number], number * 8, 8)
}

const NUMERIC: [&str; 32] = [
    "pc", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14", "x15", "x16", "x17", "x18",
    "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27", "x28", "x29", "x30", "x31",
];

const fn numeric() -> [RegisterInfo; 32]
{
    let mut out = [RegisterInfo::full("pc", 0); 32];
    let mut i = 1;
    while i < 32 {
        out[i] = RegisterInfo::full(NUMERIC[i], i * 8);
        i += 1;
    }
    out
}

const NUMBERED: [RegisterInfo; 32] = numeric();

// ABI names in register order; `x0` is hardwired to zero and not in the block.
const NAMED: [RegisterInfo; 32] = [
    abi("ra", 1),
    abi("sp", 2),
    abi("gp", 3),
    abi("tp", 4),
    abi("t0", 5),
    abi("t1", 6),
    abi("t2", 7),
    abi("s0", 8),
    abi("fp", 8),
    abi("s1", 9),
    abi("a0", 10),
    abi("a1", 11),
    abi("a2", 12),
    abi("a3", 13),
    abi("a4", 14),
    abi("a5", 15),
    abi("a6", 16),
    abi("a7", 17),
    abi("s2", 18),
    abi("s3", 19),
    abi("s4", 20),
    abi("s5", 21),
    abi("s6", 22),
    abi("s7", 23),
    abi("s8", 24),
    abi("s9", 25),
    abi("s10", 26),
    abi("s11", 27),
    abi("t3", 28),
    abi("t4", 29),
    abi("t5", 30),
    abi("t6", 31),
];

const fn catalog() -> [RegisterInfo; 64]
{
    let mut out = [RegisterInfo::full("pc", 0); 64];
    let mut i = 0;
    while i < 32 {
        out[i] = NUMBERED[i];
        out[32 + i] = NAMED[i];
        i += 1;
    }
    out
}

static REGISTERS: [RegisterInfo; 64] = catalog();

fn index() -> HashMap<&'static str, usize>
{
    build_index(&REGISTERS)
}

/// RISC-V RV64 profile
pub static RISCV64: ArchitectureProfile = ArchitectureProfile {
    architecture: Architecture::Riscv64,
    pointer_width: 8,
    registers: &REGISTERS,
    program_counter: "pc",
    stack_pointer: "sp",
    register_block: RegisterBlock {
        note: NT_PRSTATUS,
        size: 256,
    },
    narrow_writes: NarrowWritePolicy::PreserveUpper,
    trap: TrapEncoding {
        bytes: &[0x73, 0x00, 0x10, 0x00],
        compressed: Some(&[0x02, 0x90]),
        pc_offset: 0,
    },
    single_step: false,
    slot_banks: &[],
    // s0 points at the top of the frame, above the saved pair
    frame: FrameLayout {
        frame_pointer: "s0",
        link_register: Some("ra"),
        saved_frame_pointer: -16,
        saved_return_address: -8,
    },
    index: Lazy::new(index),
};
