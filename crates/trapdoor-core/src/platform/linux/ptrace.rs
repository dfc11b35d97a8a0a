//! Raw ptrace requests nix does not wrap.
//!
//! `PTRACE_GETREGSET`/`SETREGSET` take an `iovec` and `PTRACE_PEEKUSER`
//! returns data in-band, so these go through the variadic `libc::ptrace`.
//! Everything else uses `nix::sys::ptrace`.

use std::ffi::c_void;
use std::ptr;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::backend::TrapInfo;
use crate::types::{Address, ThreadId};

fn pid_of(thread: ThreadId) -> libc::pid_t
{
    thread.as_pid().as_raw()
}

/// `PTRACE_GETREGSET`: fill `buffer` from regset `note`, returning the
/// number of bytes the kernel wrote.
pub(crate) fn get_regset(thread: ThreadId, note: u32, buffer: &mut [u8]) -> Result<usize, Errno>
{
    let mut iov = libc::iovec {
        iov_base: buffer.as_mut_ptr().cast::<c_void>(),
        iov_len: buffer.len(),
    };
    // SAFETY: `iov` describes `buffer`, which outlives the call; the kernel
    // writes at most `iov_len` bytes and updates `iov_len`.
    let result = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid_of(thread),
            note as usize as *mut c_void,
            ptr::addr_of_mut!(iov).cast::<c_void>(),
        )
    };
    if result == -1 {
        return Err(Errno::last());
    }
    Ok(iov.iov_len)
}

/// `PTRACE_SETREGSET`: write regset `note` from `data`.
pub(crate) fn set_regset(thread: ThreadId, note: u32, data: &[u8]) -> Result<(), Errno>
{
    let mut iov = libc::iovec {
        iov_base: data.as_ptr().cast_mut().cast::<c_void>(),
        iov_len: data.len(),
    };
    // SAFETY: the kernel only reads through `iov` for SETREGSET.
    let result = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            pid_of(thread),
            note as usize as *mut c_void,
            ptr::addr_of_mut!(iov).cast::<c_void>(),
        )
    };
    if result == -1 {
        return Err(Errno::last());
    }
    Ok(())
}

/// `PTRACE_PEEKUSER`. The word is returned in-band, so `-1` is only an
/// error when `errno` was set.
#[allow(clippy::cast_sign_loss)]
pub(crate) fn peek_user(thread: ThreadId, offset: usize) -> Result<u64, Errno>
{
    Errno::clear();
    // SAFETY: PEEKUSER reads a word at a kernel-checked offset; no pointers
    // are dereferenced in this process.
    let value = unsafe {
        libc::ptrace(
            libc::PTRACE_PEEKUSER,
            pid_of(thread),
            offset as *mut c_void,
            ptr::null_mut::<c_void>(),
        )
    };
    if value == -1 {
        let errno = Errno::last();
        if errno != Errno::UnknownErrno {
            return Err(errno);
        }
    }
    Ok(value as u64)
}

/// `PTRACE_POKEUSER`.
pub(crate) fn poke_user(thread: ThreadId, offset: usize, value: u64) -> Result<(), Errno>
{
    // SAFETY: POKEUSER passes `value` by value; the kernel validates `offset`.
    let result = unsafe {
        libc::ptrace(
            libc::PTRACE_POKEUSER,
            pid_of(thread),
            offset as *mut c_void,
            value as usize as *mut c_void,
        )
    };
    if result == -1 {
        return Err(Errno::last());
    }
    Ok(())
}

/// `PTRACE_GETSIGINFO`, reduced to what classification needs.
pub(crate) fn trap_info(thread: ThreadId) -> Result<TrapInfo, Errno>
{
    let info = ptrace::getsiginfo(thread.as_pid())?;
    let signal = Signal::try_from(info.si_signo).unwrap_or(Signal::SIGTRAP);
    // SAFETY: `si_addr` is valid to read for SIGTRAP/SIGSEGV/SIGBUS; for
    // other signals it aliases unrelated union members and is ignored.
    let fault_address = unsafe { info.si_addr() } as u64;
    Ok(TrapInfo {
        signal,
        code: info.si_code,
        fault_address: Address::new(fault_address),
    })
}

/// Read `buffer.len()` bytes word by word with `PTRACE_PEEKDATA`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn peek_data(thread: ThreadId, address: Address, buffer: &mut [u8]) -> Result<(), Errno>
{
    const WORD: usize = std::mem::size_of::<libc::c_long>();
    let pid = thread.as_pid();
    let base = address.align_down(WORD as u64);
    let skip = (address - base) as usize;
    let mut filled = 0;
    let mut word_address = base;
    while filled < buffer.len() {
        let word = read_word(pid, word_address)?.to_ne_bytes();
        let start = if filled == 0 { skip } else { 0 };
        let take = (WORD - start).min(buffer.len() - filled);
        buffer[filled..filled + take].copy_from_slice(&word[start..start + take]);
        filled += take;
        word_address = word_address + WORD as u64;
    }
    Ok(())
}

/// Write `data` word by word with `PTRACE_POKEDATA`, merging partial words
/// with the bytes already there.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn poke_data(thread: ThreadId, address: Address, data: &[u8]) -> Result<(), Errno>
{
    const WORD: usize = std::mem::size_of::<libc::c_long>();
    let pid = thread.as_pid();
    let base = address.align_down(WORD as u64);
    let skip = (address - base) as usize;
    let mut written = 0;
    let mut word_address = base;
    while written < data.len() {
        let start = if written == 0 { skip } else { 0 };
        let take = (WORD - start).min(data.len() - written);
        let mut word = if start == 0 && take == WORD {
            [0u8; WORD]
        } else {
            read_word(pid, word_address)?.to_ne_bytes()
        };
        word[start..start + take].copy_from_slice(&data[written..written + take]);
        ptrace::write(pid, word_address.value() as ptrace::AddressType, libc::c_long::from_ne_bytes(word))?;
        written += take;
        word_address = word_address + WORD as u64;
    }
    Ok(())
}

fn read_word(pid: Pid, address: Address) -> Result<libc::c_long, Errno>
{
    ptrace::read(pid, address.value() as ptrace::AddressType)
}
