//! # Stack Unwinding
//!
//! Frame-pointer backtraces of a stopped thread.
//!
//! No debug information is consulted: the chain of saved frame pointers is
//! followed through tracee memory, as laid out by the profile's
//! [`FrameLayout`](crate::arch::FrameLayout). Code built without frame
//! pointers yields a short or partial trace.
//!
//! The walk stops at a null or misaligned frame pointer, a null return
//! address, an unmapped link, a caller frame that is not above the current
//! one (the stack grows down), or after `max_frames` frames.
//!
//! On ISAs with a link register the innermost return address may still live
//! in that register (a leaf call that has not saved it yet). It is reported
//! as its own frame unless the chain already contains it.

use std::fmt;

use tracing::trace;

use crate::backend::TraceBackend;
use crate::error::{ErrorKind, TrapdoorResult};
use crate::memory::MemoryAccessor;
use crate::registers::RegisterFile;
use crate::types::Address;

/// Default depth limit for [`backtrace`].
pub const MAX_FRAMES: usize = 256;

/// Where a frame's address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource
{
    /// The thread's program counter
    ProgramCounter,
    /// The link register
    LinkRegister,
    /// A return address saved in the frame-pointer chain
    FrameChain,
}

/// One entry of a backtrace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackFrame
{
    /// Code address: the PC for the innermost frame, a return address otherwise
    pub pc: Address,
    /// How the address was found
    pub source: FrameSource,
}

impl fmt::Display for StackFrame
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self.source {
            FrameSource::ProgramCounter => write!(f, "{} (pc)", self.pc),
            FrameSource::LinkRegister => write!(f, "{} (link register)", self.pc),
            FrameSource::FrameChain => write!(f, "{}", self.pc),
        }
    }
}

/// Walk the frame-pointer chain of a thread
///
/// `registers` must be the thread's current registers; `memory` reads the
/// tracee's address space.
///
/// ## Errors
///
/// Only failures other than unmapped memory (which just ends the walk) are
/// reported, e.g. `TraceeGone`.
pub fn backtrace<B: TraceBackend + ?Sized>(
    registers: &RegisterFile,
    memory: &mut MemoryAccessor<'_, B>,
    max_frames: usize,
) -> TrapdoorResult<Vec<StackFrame>>
{
    let layout = registers.profile().frame;
    let mut frames = vec![StackFrame {
        pc: registers.pc(),
        source: FrameSource::ProgramCounter,
    }];

    let mut chain: Vec<Address> = Vec::new();
    let mut frame = registers.read(layout.frame_pointer)?;
    while frame != 0 && frame % 8 == 0 && chain.len() < max_frames {
        let (Some(return_slot), Some(caller_slot)) = (
            frame.checked_add_signed(layout.saved_return_address),
            frame.checked_add_signed(layout.saved_frame_pointer),
        ) else {
            break;
        };
        let Some(return_address) = read_link(memory, return_slot)? else {
            break;
        };
        let Some(caller) = read_link(memory, caller_slot)? else {
            break;
        };
        if return_address == 0 {
            break;
        }
        chain.push(Address::new(return_address));
        if caller <= frame {
            break;
        }
        frame = caller;
    }

    if let Some(link_register) = layout.link_register {
        let link = Address::new(registers.read(link_register)?);
        if link != Address::ZERO && !chain.contains(&link) {
            frames.push(StackFrame {
                pc: link,
                source: FrameSource::LinkRegister,
            });
        }
    }
    frames.extend(chain.into_iter().map(|pc| StackFrame {
        pc,
        source: FrameSource::FrameChain,
    }));
    frames.truncate(max_frames.max(1));
    trace!(frames = frames.len(), "Unwound stack");
    Ok(frames)
}

/// One saved word of the chain; `None` if it is not mapped.
fn read_link<B: TraceBackend + ?Sized>(memory: &mut MemoryAccessor<'_, B>, slot: u64) -> TrapdoorResult<Option<u64>>
{
    match memory.read_u64(Address::new(slot)) {
        Ok(word) => Ok(Some(word)),
        Err(error) if error.kind() == ErrorKind::InaccessibleMemory => Ok(None),
        Err(error) => Err(error),
    }
}
