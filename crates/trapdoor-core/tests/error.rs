//! Tests for error handling

use nix::errno::Errno;
use trapdoor_core::error::{AttachFailure, ErrorKind, TrapdoorError, TrapdoorResult};
use trapdoor_core::types::{AccessKind, Address, ProcessId, ThreadId, ThreadState};

#[test]
fn test_attach_failed_display()
{
    let error = TrapdoorError::AttachFailed {
        pid: ProcessId(42),
        reason: AttachFailure::AlreadyTraced,
    };
    assert_eq!(error.to_string(), "Failed to attach to process 42: process is already being traced");
    assert_eq!(error.kind(), ErrorKind::Attach);
    assert!(error.is_recoverable());
}

#[test]
fn test_invalid_state_display()
{
    let error = TrapdoorError::InvalidState {
        operation: "read registers",
        thread: ThreadId(7),
        actual: ThreadState::Running,
    };
    assert_eq!(error.to_string(), "Cannot read registers: thread 7 is running");
    assert_eq!(error.kind(), ErrorKind::State);
}

#[test]
fn test_error_kinds()
{
    let cases = [
        (TrapdoorError::NothingToWait(ProcessId(1)), ErrorKind::State),
        (TrapdoorError::UnknownTracee(ProcessId(1)), ErrorKind::State),
        (TrapdoorError::UnknownThread(ThreadId(2)), ErrorKind::State),
        (TrapdoorError::BreakpointCollision(Address::new(0x10)), ErrorKind::Collision),
        (TrapdoorError::BreakpointNotFound(Address::new(0x10)), ErrorKind::NotFound),
        (TrapdoorError::WatchpointNotFound(3), ErrorKind::NotFound),
        (TrapdoorError::SlotExhausted { capacity: 4 }, ErrorKind::SlotExhausted),
        (TrapdoorError::UnsupportedSize { size: 16, max: 8 }, ErrorKind::UnsupportedSize),
        (
            TrapdoorError::MisalignedWatchpoint {
                address: Address::new(0x11),
                size: 4,
            },
            ErrorKind::UnsupportedSize,
        ),
        (
            TrapdoorError::UnsupportedAccess {
                access: AccessKind::Read,
                architecture: "x86_64",
            },
            ErrorKind::UnsupportedSize,
        ),
        (
            TrapdoorError::InaccessibleMemory {
                address: Address::new(0),
                length: 8,
            },
            ErrorKind::InaccessibleMemory,
        ),
        (TrapdoorError::UnknownRegister("r99".to_string()), ErrorKind::UnknownRegister),
        (
            TrapdoorError::RegisterValueOutOfRange {
                name: "eax".to_string(),
                value: 1 << 40,
            },
            ErrorKind::UnknownRegister,
        ),
        (
            TrapdoorError::Unsupported {
                operation: "single-step",
                architecture: "riscv64",
            },
            ErrorKind::Unsupported,
        ),
        (
            TrapdoorError::Ptrace {
                operation: "PTRACE_CONT",
                source: Errno::ESRCH,
            },
            ErrorKind::Os,
        ),
    ];
    for (error, kind) in cases {
        assert_eq!(error.kind(), kind, "{error}");
        assert!(error.is_recoverable());
    }
}

#[test]
fn test_tracee_gone_is_terminal()
{
    let error = TrapdoorError::TraceeGone(ProcessId(99));
    assert_eq!(error.to_string(), "Process 99 is gone");
    assert_eq!(error.kind(), ErrorKind::TraceeGone);
    assert!(!error.is_recoverable());
}

#[test]
fn test_no_such_process()
{
    let gone = TrapdoorError::Ptrace {
        operation: "PTRACE_GETREGSET",
        source: Errno::ESRCH,
    };
    assert!(gone.is_no_such_process());
    let denied = TrapdoorError::Ptrace {
        operation: "PTRACE_ATTACH",
        source: Errno::EPERM,
    };
    assert!(!denied.is_no_such_process());
}

#[test]
fn test_io_error_conversion()
{
    fn read_maps() -> TrapdoorResult<String>
    {
        Ok(std::fs::read_to_string("/definitely/not/here")?)
    }
    let error = read_maps().unwrap_err();
    assert!(matches!(error, TrapdoorError::Io(_)));
    assert_eq!(error.kind(), ErrorKind::Os);
}

#[test]
fn test_value_out_of_range_display()
{
    let error = TrapdoorError::RegisterValueOutOfRange {
        name: "w3".to_string(),
        value: 0x1_0000_0000,
    };
    assert_eq!(error.to_string(), "Value 0x100000000 does not fit in register w3");
}
