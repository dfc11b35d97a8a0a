//! AArch64 profile: `user_pt_regs`, `BRK #0` and the ptrace hardware
//! breakpoint/watchpoint regsets.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::slots::{AccessRule, ControlLayout, HitDetection, HitResume, Placement, SlotBank, SlotTransport};
use super::{build_index, ArchitectureProfile, FrameLayout, NarrowWritePolicy, RegisterBlock, RegisterInfo, TrapEncoding, NT_PRSTATUS};
use crate::types::{AccessKind, Architecture};

/// `NT_ARM_HW_BREAK` regset note
pub const NT_ARM_HW_BREAK: u32 = 0x402;
/// `NT_ARM_HW_WATCH` regset note
pub const NT_ARM_HW_WATCH: u32 = 0x403;

/// `si_code` reported for hardware breakpoint and watchpoint hits
const TRAP_HWBKPT: i32 = 4;

macro_rules! xw {
    ($($n:literal),* $(,)?) => {
        [$(
            RegisterInfo::full(concat!("x", $n), $n * 8),
            RegisterInfo::alias(concat!("w", $n), concat!("x", $n), $n * 8, 4),
        )*]
    };
}

const GENERAL: [RegisterInfo; 62] = xw!(
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30
);

const fn catalog() -> [RegisterInfo; 67]
{
    let mut out = [RegisterInfo::full("sp", 248); 67];
    let mut i = 0;
    while i < GENERAL.len() {
        out[i] = GENERAL[i];
        i += 1;
    }
    out[62] = RegisterInfo::alias("fp", "x29", 29 * 8, 8);
    out[63] = RegisterInfo::alias("lr", "x30", 30 * 8, 8);
    out[64] = RegisterInfo::full("sp", 248);
    out[65] = RegisterInfo::full("pc", 256);
    out[66] = RegisterInfo::full("pstate", 264);
    out
}

static REGISTERS: [RegisterInfo; 67] = catalog();

const DATA_SIZES: &[usize] = &[1, 2, 4, 8];

static WATCH_RULES: &[AccessRule] = &[
    AccessRule {
        access: AccessKind::Read,
        code: 0b01,
        sizes: DATA_SIZES,
        resume: HitResume::StepWithSlotDisabled,
    },
    AccessRule {
        access: AccessKind::Write,
        code: 0b10,
        sizes: DATA_SIZES,
        resume: HitResume::StepWithSlotDisabled,
    },
    AccessRule {
        access: AccessKind::ReadWrite,
        code: 0b11,
        sizes: DATA_SIZES,
        resume: HitResume::StepWithSlotDisabled,
    },
];

static BREAK_RULES: &[AccessRule] = &[AccessRule {
    access: AccessKind::Execute,
    code: 0b00,
    sizes: &[4],
    resume: HitResume::StepWithSlotDisabled,
}];

// DBGWCR/DBGBCR: E (bit 0), PAC = EL0 (bits 1-2), LSC (bits 3-4), BAS (bits 5-12).
const CONTROL: ControlLayout = ControlLayout::PerSlot {
    enable: 0b1,
    privilege: 0b10,
    privilege_shift: 1,
    access_shift: 3,
    select_shift: 5,
};

// struct user_hwdebug_state: u32 dbg_info, u32 pad, then { u64 addr; u32 ctrl; u32 pad }[16]
const fn regset(note: u32) -> SlotTransport
{
    SlotTransport::RegisterSet {
        note,
        header: 8,
        stride: 16,
        max_slots: 16,
    }
}

static SLOT_BANKS: &[SlotBank] = &[
    SlotBank {
        name: "watch",
        count: 4,
        rules: WATCH_RULES,
        placement: Placement::ByteSelect { granule: 8 },
        control: CONTROL,
        transport: regset(NT_ARM_HW_WATCH),
        detection: HitDetection::FaultAddress { code: TRAP_HWBKPT },
    },
    SlotBank {
        name: "break",
        count: 6,
        rules: BREAK_RULES,
        placement: Placement::ByteSelect { granule: 4 },
        control: CONTROL,
        transport: regset(NT_ARM_HW_BREAK),
        detection: HitDetection::FaultAddress { code: TRAP_HWBKPT },
    },
];

fn index() -> HashMap<&'static str, usize>
{
    build_index(&REGISTERS)
}

/// AArch64 (ARMv8-A) profile
pub static AARCH64: ArchitectureProfile = ArchitectureProfile {
    architecture: Architecture::Aarch64,
    pointer_width: 8,
    registers: &REGISTERS,
    program_counter: "pc",
    stack_pointer: "sp",
    register_block: RegisterBlock {
        note: NT_PRSTATUS,
        size: 272,
    },
    narrow_writes: NarrowWritePolicy::ZeroExtend,
    trap: TrapEncoding {
        bytes: &[0x00, 0x00, 0x20, 0xd4],
        compressed: None,
        pc_offset: 0,
    },
    single_step: true,
    slot_banks: SLOT_BANKS,
    frame: FrameLayout {
        frame_pointer: "x29",
        link_register: Some("x30"),
        saved_frame_pointer: 0,
        saved_return_address: 8,
    },
    index: Lazy::new(index),
};
