//! # Types
//!
//! Architecture-independent types used throughout the engine.
//!
//! Everything here is plain data: identifiers, addresses, memory regions and
//! the classified stop events the controller hands back to callers.

pub mod address;
pub mod process;
pub mod stop;

// Re-export all public types
pub use address::Address;
pub use process::{Architecture, MemoryRegion, ProcessId, ThreadId, ThreadState};
pub use stop::{AccessKind, StopCause, StopEvent};
