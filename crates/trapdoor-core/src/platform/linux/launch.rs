//! # Linux Process Launch
//!
//! Starting a program under trace with `fork` + `PTRACE_TRACEME` + `execve`.
//!
//! The child requests tracing and execs; the kernel stops it with `SIGTRAP`
//! right after the new image is loaded, before its first instruction. A child
//! that cannot exec exits with status 127, which the parent reports as a
//! launch failure.
//!
//! Everything the child needs (paths, argument and environment arrays) is
//! built before `fork`. Between `fork` and `execve` the child only issues
//! raw system calls: the parent may be multithreaded, and another thread
//! could hold the allocator lock at the moment of the fork.
//!
//! ## References
//!
//! - [ptrace(2) man page](https://man7.org/linux/man-pages/man2/ptrace.2.html)
//! - [execve(2) man page](https://man7.org/linux/man-pages/man2/execve.2.html)
//! - [personality(2) man page](https://man7.org/linux/man-pages/man2/personality.2.html)

use std::env;
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use libc::c_char;
use nix::sys::personality::{self, Persona};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, info, warn};

use crate::config::LaunchOptions;
use crate::error::{AttachFailure, TrapdoorError, TrapdoorResult};
use crate::types::ProcessId;

/// Exit status of a child that could not exec.
const EXEC_FAILED: i32 = 127;

fn launch_error(pid: ProcessId, message: String) -> TrapdoorError
{
    TrapdoorError::AttachFailed {
        pid,
        reason: AttachFailure::Launch(message),
    }
}

fn c_string(bytes: &[u8], what: &str) -> TrapdoorResult<CString>
{
    CString::new(bytes).map_err(|_| launch_error(ProcessId(0), format!("{what} contains a NUL byte")))
}

/// `execve` arguments, owned by the parent and only borrowed by the child.
#[derive(Debug)]
struct ExecImage
{
    path: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    disable_aslr: bool,
}

impl ExecImage
{
    fn new(program: &Path, args: &[&str], options: &LaunchOptions) -> TrapdoorResult<Self>
    {
        let path = c_string(program.as_os_str().as_bytes(), &program.display().to_string())?;
        let mut argv = vec![path.clone()];
        for arg in args {
            argv.push(c_string(arg.as_bytes(), &format!("argument {arg:?}"))?);
        }

        let mut envp = Vec::new();
        match &options.env {
            Some(vars) => {
                for (key, value) in vars {
                    envp.push(env_entry(OsStr::new(key), OsStr::new(value))?);
                }
            }
            None => {
                for (key, value) in env::vars_os() {
                    envp.push(env_entry(&key, &value)?);
                }
            }
        }

        Ok(Self {
            path,
            argv,
            envp,
            disable_aslr: options.disable_aslr,
        })
    }
}

fn env_entry(key: &OsStr, value: &OsStr) -> TrapdoorResult<CString>
{
    if key.is_empty() || key.as_bytes().contains(&b'=') {
        return Err(launch_error(ProcessId(0), format!("invalid environment variable name {key:?}")));
    }
    let mut entry = key.as_bytes().to_vec();
    entry.push(b'=');
    entry.extend_from_slice(value.as_bytes());
    c_string(&entry, &format!("environment variable {key:?}"))
}

/// NULL-terminated pointer array over `strings`; valid while `strings` lives.
fn pointers(strings: &[CString]) -> Vec<*const c_char>
{
    strings.iter().map(|string| string.as_ptr()).chain([ptr::null()]).collect()
}

/// Fork and exec `program` under trace. Returns the child's pid, stopped at
/// the exec trap.
pub(crate) fn spawn_traced(program: &Path, args: &[&str], options: &LaunchOptions) -> TrapdoorResult<ProcessId>
{
    let image = ExecImage::new(program, args, options)?;
    let argv = pointers(&image.argv);
    let envp = pointers(&image.envp);

    // SAFETY: the child only issues system calls (personality, ptrace,
    // execve, _exit) over data prepared above; it never allocates.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            if image.disable_aslr {
                if let Ok(persona) = personality::get() {
                    let _ = personality::set(persona | Persona::ADDR_NO_RANDOMIZE);
                }
            }
            if ptrace::traceme().is_ok() {
                // SAFETY: both arrays are NULL-terminated and point into
                // `image`, which outlives the call.
                unsafe { libc::execve(image.path.as_ptr(), argv.as_ptr(), envp.as_ptr()) };
            }
            // SAFETY: terminate the forked child without running the parent's
            // atexit handlers or destructors.
            unsafe { libc::_exit(EXEC_FAILED) }
        }
        Ok(ForkResult::Parent { child }) => {
            let pid = ProcessId::from(child);
            debug!(pid = pid.0, program = %program.display(), aslr = !image.disable_aslr, "Forked tracee");
            wait_for_exec(pid, child, program)?;
            info!(pid = pid.0, program = %program.display(), "Launched tracee");
            Ok(pid)
        }
        Err(errno) => Err(launch_error(ProcessId(0), format!("fork failed: {errno}"))),
    }
}

fn wait_for_exec(pid: ProcessId, child: Pid, program: &Path) -> TrapdoorResult<()>
{
    match waitpid(child, Some(WaitPidFlag::__WALL)) {
        Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => Ok(()),
        Ok(WaitStatus::Exited(_, EXEC_FAILED)) => Err(launch_error(pid, format!("could not execute {}", program.display()))),
        Ok(WaitStatus::Exited(_, code)) => Err(launch_error(pid, format!("exited with status {code} before exec"))),
        Ok(WaitStatus::Signaled(_, signal, _)) => Err(launch_error(pid, format!("killed by {signal} before exec"))),
        Ok(status) => {
            super::reap_after_kill(child);
            Err(launch_error(pid, format!("unexpected initial stop {status:?}")))
        }
        Err(errno) => {
            warn!(pid = pid.0, %errno, "Lost the launched child before its exec stop");
            Err(TrapdoorError::AttachFailed {
                pid,
                reason: AttachFailure::Os(errno),
            })
        }
    }
}

#[cfg(test)]
mod tests
{
    use std::ffi::CStr;

    use super::*;

    fn strings(values: &[CString]) -> Vec<&str>
    {
        values.iter().map(|value| value.to_str().unwrap()).collect()
    }

    #[test]
    fn test_exec_image_with_explicit_environment()
    {
        let options = LaunchOptions::default()
            .with_env_var("TRAPDOOR_MARK", "1")
            .with_env_var("EMPTY", "");
        let image = ExecImage::new(Path::new("/bin/true"), &["-x", "two words"], &options).unwrap();

        assert_eq!(image.path.to_str().unwrap(), "/bin/true");
        assert_eq!(strings(&image.argv), vec!["/bin/true", "-x", "two words"]);
        assert_eq!(strings(&image.envp), vec!["TRAPDOOR_MARK=1", "EMPTY="]);
        assert!(!image.disable_aslr);
    }

    #[test]
    fn test_exec_image_inherits_environment()
    {
        let image = ExecImage::new(Path::new("/bin/true"), &[], &LaunchOptions::default()).unwrap();
        assert_eq!(image.envp.len(), env::vars_os().count());
    }

    #[test]
    fn test_exec_image_rejections()
    {
        assert!(ExecImage::new(Path::new("/bin/tr\0ue"), &[], &LaunchOptions::default()).is_err());
        assert!(ExecImage::new(Path::new("/bin/true"), &["a\0b"], &LaunchOptions::default()).is_err());
        let bad_name = LaunchOptions::default().with_env_var("A=B", "c");
        assert!(matches!(
            ExecImage::new(Path::new("/bin/true"), &[], &bad_name),
            Err(TrapdoorError::AttachFailed {
                reason: AttachFailure::Launch(_),
                ..
            })
        ));
    }

    #[test]
    fn test_pointer_arrays_are_null_terminated()
    {
        let strings = vec![CString::new("a").unwrap(), CString::new("bc").unwrap()];
        let array = pointers(&strings);
        assert_eq!(array.len(), 3);
        assert!(array[2].is_null());
        // SAFETY: the pointers come from `strings`, still alive here.
        let second = unsafe { CStr::from_ptr(array[1]) };
        assert_eq!(second.to_bytes(), b"bc");
    }
}
