//! Common module for library exports

pub use crate::arch::{ArchitectureProfile, AARCH64, RISCV64, X86_64};
pub use crate::breakpoints::{Breakpoint, TrapSite};
pub use crate::config::{EngineConfig, LaunchOptions};
pub use crate::controller::TraceeState;
pub use crate::engine::{Engine, TraceeHandle};
pub use crate::error::{AttachFailure, ErrorKind, TrapdoorError, TrapdoorResult};
pub use crate::events::EngineEvent;
pub use crate::registers::RegisterFile;
pub use crate::types::{AccessKind, Address, Architecture, MemoryRegion, ProcessId, StopCause, StopEvent, ThreadId, ThreadState};
pub use crate::unwind::{FrameSource, StackFrame};
pub use crate::watchpoints::Watchpoint;
