//! # Platform-Specific Implementations
//!
//! Implementations of [`TraceBackend`](crate::backend::TraceBackend) on top
//! of each operating system's native tracing facility.
//!
//! - **Linux**: `ptrace(2)` plus `/proc`
//!   - See: [ptrace(2) man page](https://man7.org/linux/man-pages/man2/ptrace.2.html)
//!
//! The engine itself is written once against the trait; only this module
//! talks to the kernel.

pub mod linux;
