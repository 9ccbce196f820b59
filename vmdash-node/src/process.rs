//! Thin layer over the OS process table.

use std::path::Path;
use std::process::Stdio;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

fn to_pid(pid: u32) -> Option<Pid> {
    // 0 and negative values address process groups, never a single process.
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// Deliver `signal` to `pid`. `None` probes without delivering anything.
pub fn signal(pid: u32, signal: impl Into<Option<Signal>>) -> Result<(), Errno> {
    let pid = to_pid(pid).ok_or(Errno::ESRCH)?;
    kill(pid, signal.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub state: char,
    /// Field 22 of `/proc/<pid>/stat`, clock ticks since boot.
    pub start_time: u64,
}

#[cfg(target_os = "linux")]
pub fn proc_stat(pid: u32) -> Option<ProcStat> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat(&stat)
}

#[cfg(not(target_os = "linux"))]
pub fn proc_stat(_pid: u32) -> Option<ProcStat> {
    None
}

fn parse_stat(stat: &str) -> Option<ProcStat> {
    // comm may contain spaces and parens; everything after the last ')' is fixed.
    let rparen = stat.rfind(')')?;
    let fields: Vec<&str> = stat.get(rparen + 2..)?.split_whitespace().collect();
    let state = fields.first()?.chars().next()?;
    // fields[0] is field 3, so starttime (field 22) is index 19.
    let start_time = fields.get(19)?.parse().ok()?;
    Some(ProcStat { state, start_time })
}

/// Start time to record next to a freshly spawned pid.
pub fn start_time(pid: u32) -> Option<u64> {
    proc_stat(pid).map(|s| s.start_time)
}

/// True if `pid` names a live, non-zombie process that started at
/// `recorded_start` (when both sides know the start time).
pub fn is_alive(pid: u32, recorded_start: Option<u64>) -> bool {
    if signal(pid, None).is_err() {
        return false;
    }
    match proc_stat(pid) {
        Some(stat) if matches!(stat.state, 'Z' | 'X') => false,
        Some(stat) => recorded_start.is_none_or(|t| t == stat.start_time),
        None => true,
    }
}

/// Spawn `binary` in its own process group so it outlives the supervisor.
/// stdout and stderr are appended to `log_path`.
pub fn spawn_detached(binary: &Path, args: &[String], log_path: &Path) -> std::io::Result<Child> {
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .process_group(0)
        .kill_on_drop(false)
        .spawn()
}
