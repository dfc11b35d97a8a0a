//! `/proc` readers: threads, memory map, tracer and run state.

use std::fs;
use std::io;
use std::path::PathBuf;

use crate::types::{MemoryRegion, ProcessId, ThreadId};

fn proc_path(pid: ProcessId, entry: &str) -> PathBuf
{
    PathBuf::from("/proc").join(pid.0.to_string()).join(entry)
}

/// Thread ids listed under `/proc/<pid>/task`, leader first.
pub(crate) fn tasks(pid: ProcessId) -> io::Result<Vec<ThreadId>>
{
    let mut threads: Vec<ThreadId> = fs::read_dir(proc_path(pid, "task"))?
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .map(ThreadId)
        .collect();
    threads.sort_by_key(|thread| (thread.0 != pid.0, thread.0));
    Ok(threads)
}

/// Parsed `/proc/<pid>/maps`.
pub(crate) fn maps(pid: ProcessId) -> io::Result<Vec<MemoryRegion>>
{
    let contents = fs::read_to_string(proc_path(pid, "maps"))?;
    Ok(contents.lines().filter_map(MemoryRegion::from_maps_line).collect())
}

/// `TracerPid` from `/proc/<pid>/status` (0 when untraced).
pub(crate) fn tracer_pid(pid: ProcessId) -> io::Result<u32>
{
    let status = fs::read_to_string(proc_path(pid, "status"))?;
    Ok(status_field(&status, "TracerPid")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0))
}

/// Whether the process is a zombie (exited, not yet reaped).
pub(crate) fn is_zombie(pid: ProcessId) -> bool
{
    fs::read_to_string(proc_path(pid, "status"))
        .ok()
        .and_then(|status| status_field(&status, "State").map(|state| state.starts_with('Z')))
        .unwrap_or(false)
}

/// Path of `/proc/<pid>/mem`.
pub(crate) fn mem_path(pid: ProcessId) -> PathBuf
{
    proc_path(pid, "mem")
}

fn status_field<'a>(status: &'a str, name: &str) -> Option<&'a str>
{
    status.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key == name).then(|| value.trim())
    })
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_status_field()
    {
        let status = "Name:\tcat\nState:\tt (tracing stop)\nTracerPid:\t1234\n";
        assert_eq!(status_field(status, "TracerPid"), Some("1234"));
        assert_eq!(status_field(status, "State"), Some("t (tracing stop)"));
        assert_eq!(status_field(status, "Tgid"), None);
    }

    #[test]
    fn test_own_process()
    {
        let pid = ProcessId(std::process::id());
        let threads = tasks(pid).unwrap();
        assert_eq!(threads[0], pid.leader());
        assert!(!maps(pid).unwrap().is_empty());
        assert!(!is_zombie(pid));
    }
}
