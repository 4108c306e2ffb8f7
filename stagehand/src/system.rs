//! Thin OS helpers: user database lookups, process queries, diagnostic
//! captures.
//!
//! Everything here is a small blocking wrapper over the platform; policy
//! (classification, retries, journey bookkeeping) lives with the callers.

use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Gid, Group, Pid, Uid, User};

/// Looks up a user by name. `Ok(None)` means: no such entry.
pub(crate) fn lookup_user(name: &str) -> nix::Result<Option<User>> {
    User::from_name(name)
}

/// Looks up a group by name. `Ok(None)` means: no such entry.
pub(crate) fn lookup_group(name: &str) -> nix::Result<Option<Group>> {
    Group::from_name(name)
}

/// Login shell of the current (effective) user, `/bin/sh` when the user
/// database has no entry for it.
pub(crate) fn current_user_shell() -> PathBuf {
    match User::from_uid(Uid::effective()) {
        Ok(Some(user)) => user.shell,
        _ => PathBuf::from("/bin/sh"),
    }
}

/// Name of the current (effective) user, or the numeric uid as a string.
pub(crate) fn current_user_name() -> String {
    match User::from_uid(Uid::effective()) {
        Ok(Some(user)) => user.name,
        _ => Uid::effective().to_string(),
    }
}

/// Name of a group, or the numeric gid as a string.
pub(crate) fn group_name(gid: u32) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}

/// Whether a process with this pid currently exists (signal 0 probe).
pub(crate) fn os_process_exists(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Real uid of an arbitrary process.
///
/// `Ok(None)` means the process does not exist. `Err` means the process
/// table could not be queried at all (the moral equivalent of `ps` being
/// broken or `/proc` unmounted).
#[cfg(target_os = "linux")]
pub(crate) fn process_uid(pid: i32) -> io::Result<Option<u32>> {
    let status = match std::fs::read_to_string(format!("/proc/{pid}/status")) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            let real = rest.split_whitespace().next().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "malformed Uid line in process status")
            })?;
            return real
                .parse::<u32>()
                .map(Some)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "unparseable uid"));
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "no Uid line in process status",
    ))
}

/// Real uid of an arbitrary process, via the process table.
#[cfg(not(target_os = "linux"))]
pub(crate) fn process_uid(pid: i32) -> io::Result<Option<u32>> {
    use sysinfo::{Pid as SysPid, System};

    let mut sys = System::new();
    let sys_pid = SysPid::from_u32(pid as u32);
    sys.refresh_process(sys_pid);
    match sys.process(sys_pid) {
        Some(process) => match process.user_id() {
            Some(uid) => uid
                .to_string()
                .parse::<u32>()
                .map(Some)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "unparseable uid")),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "process table has no uid for this process",
            )),
        },
        None => Ok(None),
    }
}

/// Waits up to `timeout` for a child to exit, polling without blocking.
///
/// Returns `true` when the child was reaped (or is not ours to reap),
/// `false` when it is still running after the timeout.
pub(crate) fn timed_waitpid(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::EINTR) => {}
            Ok(_) => return true,
            // Not our child (already reaped, or spawned by someone else).
            Err(_) => return true,
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// SIGKILLs a process and reaps it, ignoring every failure.
///
/// Used from unwind guards; by the time this runs there is nothing useful
/// left to do with an error.
pub(crate) fn kill_and_waitpid(pid: i32) {
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    while let Err(nix::errno::Errno::EINTR) = waitpid(Pid::from_raw(pid), None) {}
}

/// Captures `ulimit -a` output for diagnostics.
pub(crate) fn capture_ulimits() -> String {
    run_and_capture("ulimit -a")
}

/// Captures `id` output for diagnostics.
pub(crate) fn capture_user_info() -> String {
    run_and_capture("id")
}

fn run_and_capture(command: &str) -> String {
    match Command::new("/bin/sh").arg("-c").arg(command).output() {
        Ok(output) => String::from_utf8_lossy(&output.stdout).into_owned(),
        Err(e) => format!("(error running {command:?}: {e})"),
    }
}

/// The current process environment as `KEY=value` lines.
pub(crate) fn environment_dump() -> String {
    let mut dump = String::new();
    for (key, value) in std::env::vars() {
        dump.push_str(&key);
        dump.push('=');
        dump.push_str(&value);
        dump.push('\n');
    }
    dump
}

/// A human-readable snapshot of system resource usage, embedded into
/// diagnostic reports.
pub(crate) fn system_metrics_snapshot() -> String {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();

    let mut snapshot = String::new();
    snapshot.push_str(&format!(
        "RAM: {:.1} MiB used of {:.1} MiB\n",
        sys.used_memory() as f64 / 1048576.0,
        sys.total_memory() as f64 / 1048576.0,
    ));
    snapshot.push_str(&format!(
        "Swap: {:.1} MiB used of {:.1} MiB\n",
        sys.used_swap() as f64 / 1048576.0,
        sys.total_swap() as f64 / 1048576.0,
    ));
    snapshot.push_str(&format!("CPUs: {}\n", sys.cpus().len()));
    if let Ok(loadavg) = std::fs::read_to_string("/proc/loadavg") {
        if let Some(fields) = loadavg.split_whitespace().collect::<Vec<_>>().get(0..3) {
            snapshot.push_str(&format!("Load average: {}\n", fields.join(" ")));
        }
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_exists_and_has_our_uid() {
        let pid = std::process::id() as i32;
        assert!(os_process_exists(pid));
        assert_eq!(
            process_uid(pid).unwrap(),
            Some(Uid::current().as_raw()),
        );
    }

    #[test]
    fn nonexistent_process_reports_none() {
        // Very high pids are effectively never allocated.
        assert!(!os_process_exists(999_999_999));
        assert_eq!(process_uid(999_999_999).unwrap(), None);
    }

    #[test]
    fn environment_dump_contains_path() {
        // PATH is set in any sane test environment.
        assert!(environment_dump().lines().any(|l| l.starts_with("PATH=")));
    }

    #[test]
    fn metrics_snapshot_mentions_ram() {
        assert!(system_metrics_snapshot().contains("RAM:"));
    }

    #[test]
    fn timed_waitpid_reaps_a_fast_child() {
        let child = Command::new("/bin/true").spawn().unwrap();
        assert!(timed_waitpid(child.id() as i32, Duration::from_secs(5)));
    }
}
