//! x86-64 profile: `user_regs_struct`, `int3` and DR0-DR3.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::slots::{AccessRule, ControlLayout, HitDetection, HitResume, Placement, SlotBank, SlotTransport};
use super::{build_index, ArchitectureProfile, FrameLayout, NarrowWritePolicy, RegisterBlock, RegisterInfo, TrapEncoding, NT_PRSTATUS};
use crate::types::{AccessKind, Architecture};

const fn reg(name: &'static str, offset: usize) -> RegisterInfo
{
    RegisterInfo::full(name, offset)
}

const fn sub(name: &'static str, parent: &'static str, offset: usize, width: usize) -> RegisterInfo
{
    RegisterInfo::alias(name, parent, offset, width)
}

// Offsets into `struct user_regs_struct` (arch/x86/include/asm/user_64.h).
const RAX: usize = 80;
const RBX: usize = 40;
const RCX: usize = 88;
const RDX: usize = 96;
const RSI: usize = 104;
const RDI: usize = 112;
const RBP: usize = 32;
const RSP: usize = 152;

static REGISTERS: &[RegisterInfo] = &[
    reg("r15", 0),
    sub("r15d", "r15", 0, 4),
    sub("r15w", "r15", 0, 2),
    sub("r15b", "r15", 0, 1),
    reg("r14", 8),
    sub("r14d", "r14", 8, 4),
    sub("r14w", "r14", 8, 2),
    sub("r14b", "r14", 8, 1),
    reg("r13", 16),
    sub("r13d", "r13", 16, 4),
    sub("r13w", "r13", 16, 2),
    sub("r13b", "r13", 16, 1),
    reg("r12", 24),
    sub("r12d", "r12", 24, 4),
    sub("r12w", "r12", 24, 2),
    sub("r12b", "r12", 24, 1),
    reg("rbp", RBP),
    sub("ebp", "rbp", RBP, 4),
    sub("bp", "rbp", RBP, 2),
    sub("bpl", "rbp", RBP, 1),
    reg("rbx", RBX),
    sub("ebx", "rbx", RBX, 4),
    sub("bx", "rbx", RBX, 2),
    sub("bl", "rbx", RBX, 1),
    sub("bh", "rbx", RBX + 1, 1),
    reg("r11", 48),
    sub("r11d", "r11", 48, 4),
    sub("r11w", "r11", 48, 2),
    sub("r11b", "r11", 48, 1),
    reg("r10", 56),
    sub("r10d", "r10", 56, 4),
    sub("r10w", "r10", 56, 2),
    sub("r10b", "r10", 56, 1),
    reg("r9", 64),
    sub("r9d", "r9", 64, 4),
    sub("r9w", "r9", 64, 2),
    sub("r9b", "r9", 64, 1),
    reg("r8", 72),
    sub("r8d", "r8", 72, 4),
    sub("r8w", "r8", 72, 2),
    sub("r8b", "r8", 72, 1),
    reg("rax", RAX),
    sub("eax", "rax", RAX, 4),
    sub("ax", "rax", RAX, 2),
    sub("al", "rax", RAX, 1),
    sub("ah", "rax", RAX + 1, 1),
    reg("rcx", RCX),
    sub("ecx", "rcx", RCX, 4),
    sub("cx", "rcx", RCX, 2),
    sub("cl", "rcx", RCX, 1),
    sub("ch", "rcx", RCX + 1, 1),
    reg("rdx", RDX),
    sub("edx", "rdx", RDX, 4),
    sub("dx", "rdx", RDX, 2),
    sub("dl", "rdx", RDX, 1),
    sub("dh", "rdx", RDX + 1, 1),
    reg("rsi", RSI),
    sub("esi", "rsi", RSI, 4),
    sub("si", "rsi", RSI, 2),
    sub("sil", "rsi", RSI, 1),
    reg("rdi", RDI),
    sub("edi", "rdi", RDI, 4),
    sub("di", "rdi", RDI, 2),
    sub("dil", "rdi", RDI, 1),
    reg("orig_rax", 120),
    reg("rip", 128),
    reg("cs", 136),
    reg("eflags", 144),
    reg("rsp", RSP),
    sub("esp", "rsp", RSP, 4),
    sub("sp", "rsp", RSP, 2),
    sub("spl", "rsp", RSP, 1),
    reg("ss", 160),
    reg("fs_base", 168),
    reg("gs_base", 176),
    reg("ds", 184),
    reg("es", 192),
    reg("fs", 200),
    reg("gs", 208),
];

const DATA_SIZES: &[usize] = &[1, 2, 4, 8];

static DEBUG_RULES: &[AccessRule] = &[
    AccessRule {
        access: AccessKind::Write,
        code: 0b01,
        sizes: DATA_SIZES,
        resume: HitResume::Direct,
    },
    AccessRule {
        access: AccessKind::ReadWrite,
        code: 0b11,
        sizes: DATA_SIZES,
        resume: HitResume::Direct,
    },
    // The kernel sets RF on the way out, so execute slots do not re-fire.
    AccessRule {
        access: AccessKind::Execute,
        code: 0b00,
        sizes: &[1],
        resume: HitResume::Direct,
    },
];

// offsetof(struct user, u_debugreg)
const USER_DEBUGREG: usize = 848;

static SLOT_BANKS: &[SlotBank] = &[SlotBank {
    name: "dr0-dr3",
    count: 4,
    rules: DEBUG_RULES,
    placement: Placement::Natural,
    control: ControlLayout::Shared {
        enable_stride: 2,
        field_base: 16,
        field_stride: 4,
        length_codes: &[(1, 0b00), (2, 0b01), (8, 0b10), (4, 0b11)],
    },
    transport: SlotTransport::UserArea {
        values: USER_DEBUGREG,
        stride: 8,
        control: USER_DEBUGREG + 7 * 8,
        status: USER_DEBUGREG + 6 * 8,
    },
    detection: HitDetection::StatusBits,
}];

fn index() -> HashMap<&'static str, usize>
{
    build_index(REGISTERS)
}

/// x86-64 (AMD64) profile
pub static X86_64: ArchitectureProfile = ArchitectureProfile {
    architecture: Architecture::X86_64,
    pointer_width: 8,
    registers: REGISTERS,
    program_counter: "rip",
    stack_pointer: "rsp",
    register_block: RegisterBlock {
        note: NT_PRSTATUS,
        size: 216,
    },
    narrow_writes: NarrowWritePolicy::PreserveUpper,
    trap: TrapEncoding {
        bytes: &[0xcc],
        compressed: None,
        pc_offset: 1,
    },
    single_step: true,
    slot_banks: SLOT_BANKS,
    frame: FrameLayout {
        frame_pointer: "rbp",
        link_register: None,
        saved_frame_pointer: 0,
        saved_return_address: 8,
    },
    index: Lazy::new(index),
};
