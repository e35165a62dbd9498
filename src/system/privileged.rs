//! Privileged filesystem and process helpers
//!
//! cgroup root creation, ownership handoff, and membership-file writes need
//! elevated rights even when the node itself is delegated. Rather than run
//! the whole sweep as root, these helpers shell out to a small fixed set of
//! sudo-able utilities. A sudoers entry like
//!
//! ```text
//! ${USER} ALL=(root:root) NOPASSWD:/usr/bin/tee, NOPASSWD:/usr/bin/mkdir, \
//!     NOPASSWD:/usr/bin/chown, NOPASSWD:/usr/bin/perf, NOPASSWD:/usr/bin/kill
//! ```
//!
//! keeps them prompt-free, which the sweep assumes.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::warn;

use crate::error::{Result, SweepError};

/// Run one sudo-wrapped utility to completion, surfacing a failure status
fn run_sudo(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new("sudo")
        .arg(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| SweepError::command(format!("sudo {}", program), e.to_string()))?;

    if !output.status.success() {
        return Err(SweepError::command(
            format!("sudo {} {}", program, args.join(" ")),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

/// `sudo mkdir -p <path>`
pub fn mkdir(path: &Path, parents: bool) -> Result<()> {
    let path_str = path.to_string_lossy();
    if parents {
        run_sudo("/usr/bin/mkdir", &["-p", &path_str])
    } else {
        run_sudo("/usr/bin/mkdir", &[&path_str])
    }
}

/// `sudo chown [-R] <uid>:<gid> <path>`, defaulting to the invoking user.
///
/// The uid/gid are re-read on every call rather than captured once at
/// startup, so the handoff target stays correct even under setuid games.
pub fn chown_to_invoker(path: &Path, recursive: bool) -> Result<()> {
    let owner = format!("{}:{}", nix::unistd::getuid(), nix::unistd::getgid());
    let path_str = path.to_string_lossy();
    if recursive {
        run_sudo("/usr/bin/chown", &["-R", &owner, &path_str])
    } else {
        run_sudo("/usr/bin/chown", &[&owner, &path_str])
    }
}

/// `echo <input> | sudo tee <path>`
///
/// The only portable way to write a root-owned control file from an
/// unprivileged sweep. tee's stdout is discarded; its stderr is logged since
/// cgroup interface files reject bad writes there.
pub fn tee(path: &Path, input: &str) -> Result<()> {
    let mut child = Command::new("sudo")
        .arg("/usr/bin/tee")
        .arg(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| SweepError::command("sudo tee", e.to_string()))?;

    child
        .stdin
        .take()
        .ok_or_else(|| SweepError::command("sudo tee", "stdin unavailable"))?
        .write_all(input.as_bytes())
        .map_err(|e| SweepError::command("sudo tee", e.to_string()))?;

    let output = child
        .wait_with_output()
        .map_err(|e| SweepError::command("sudo tee", e.to_string()))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        warn!(path = %path.display(), stderr = %stderr.trim(), "sudo tee reported errors");
    }
    if !output.status.success() {
        return Err(SweepError::command(
            format!("sudo tee {}", path.display()),
            stderr.trim().to_string(),
        ));
    }
    Ok(())
}

/// `sudo kill -<signal> <pid>` for companion processes we started via sudo
/// (their real pid belongs to root, so an unprivileged signal bounces)
pub fn kill(pid: u32, signal: &str) -> Result<()> {
    run_sudo("/usr/bin/kill", &[&format!("-{}", signal), &pid.to_string()])
}

/// Kernel thread ids of a live process, via /proc/<pid>/task
#[cfg(target_os = "linux")]
pub fn tids_of_pid(pid: i32) -> Result<Vec<i32>> {
    let process =
        procfs::process::Process::new(pid).map_err(|_| SweepError::ProcessNotFound(pid))?;
    let mut tids = Vec::new();
    for task in process
        .tasks()
        .map_err(|_| SweepError::ProcessNotFound(pid))?
    {
        // A task may exit between the readdir and the stat; skip it.
        if let Ok(task) = task {
            tids.push(task.tid);
        }
    }
    Ok(tids)
}

/// Stub for platforms without procfs
#[cfg(not(target_os = "linux"))]
pub fn tids_of_pid(_pid: i32) -> Result<Vec<i32>> {
    Err(SweepError::UnsupportedPlatform(
        "thread enumeration requires /proc".to_string(),
    ))
}

/// Signal-probe liveness check: delivers no signal, only checks existence
/// and permission to signal.
pub fn pid_is_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}
