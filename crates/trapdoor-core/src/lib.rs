//! # trapdoor-core
//!
//! Process control, breakpoint and watchpoint engine for Linux tracees.
//!
//! This crate attaches to (or launches) processes through `ptrace`, reads and
//! mutates their registers and memory, installs software traps and hardware
//! debug-register traps, and reports classified stop events:
//! - Process attachment, launch, detach and kill
//! - Per-thread run control: resume, single-step, interrupt, wait
//! - Register access by name, including narrow aliases
//! - All-or-nothing memory reads and writes
//! - Software breakpoints with transparent step-over
//! - Hardware watchpoints and execute breakpoints
//! - Frame-pointer backtraces and load-base address resolution
//!
//! ## Architecture Support
//!
//! Everything that differs between instruction sets lives in static
//! [`arch::ArchitectureProfile`] tables selected at attach time:
//!
//! - **x86-64**: `int3`, DR0-DR3
//! - **AArch64**: `BRK #0`, `NT_ARM_HW_WATCH`/`NT_ARM_HW_BREAK`
//! - **RISC-V 64**: `ebreak`/`c.ebreak`, no hardware slots or single-step
//!
//! ## Why unsafe code is needed
//!
//! A few ptrace requests (`GETREGSET`/`SETREGSET`, `PEEKUSER`/`POKEUSER`)
//! and `fork` have no safe wrapper. They are confined to
//! `platform::linux` and wrapped in safe functions there.

#![allow(unsafe_code)] // Required for raw ptrace requests and fork

pub mod arch;
pub mod backend;
pub mod breakpoints;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod memory;
pub mod platform;
pub mod prelude;
pub mod registers;
pub mod types;
pub mod unwind;
pub mod watchpoints;

#[cfg(test)]
mod testing;

pub use engine::{Engine, TraceeHandle};
// Re-export commonly used types
pub use error::{TrapdoorError, TrapdoorResult};
pub use platform::linux::LinuxPtrace;
pub use types::{Address, ProcessId, ThreadId};
