//! Daemon process inspection and termination
//!
//! Liveness comes from `sysinfo`; signals go through the `kill` utility so the
//! whole process group can be addressed without unsafe libc calls.

use crate::errors::{CommandError, Result};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Whether `pid` refers to a live (non-zombie) process
pub fn is_running(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    match system.process(pid) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// Process group recorded in a `/proc/<pid>/stat` line, unless the process
/// is a zombie or dead
///
/// The command name may contain spaces and parentheses, so fields are counted
/// from the last `)`: state, ppid, pgrp.
fn live_group_from_stat(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?;
    if matches!(state, "Z" | "X" | "x") {
        return None;
    }
    fields.nth(1)?.parse().ok()
}

/// Whether any live process belongs to group `pgid`
///
/// The group leader may exit while its children keep running, so the leader's
/// pid alone says nothing about the group. Without `/proc` this falls back to
/// checking the leader.
pub fn group_is_alive(pgid: u32) -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return is_running(pgid);
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()))
        })
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
        .any(|stat| live_group_from_stat(&stat) == Some(pgid))
}

/// Send `signal` to every process in group `pgid`
///
/// Returns `Ok(false)` when the group no longer exists.
async fn signal_group(pgid: u32, signal: &str) -> Result<bool> {
    let command = format!("kill -{} -- -{}", signal, pgid);
    let output = Command::new("kill")
        .arg(format!("-{}", signal))
        .arg("--")
        .arg(format!("-{}", pgid))
        .output()
        .await
        .map_err(|e| CommandError::Spawn {
            command: command.clone(),
            reason: e.to_string(),
        })?;
    if output.status.success() {
        return Ok(true);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("No such process") || !group_is_alive(pgid) {
        debug!(pgid, "Process group already gone");
        return Ok(false);
    }
    Err(CommandError::Failed {
        command,
        code: output.status.code().unwrap_or(-1),
    }
    .into())
}

/// Terminate a process group: SIGTERM, wait up to `grace`, then SIGKILL
///
/// The group is signalled even when its leader has exited. Returns whether
/// any member was still running. A group that is already gone is not an
/// error.
#[instrument]
pub async fn terminate_group(pgid: u32, grace: Duration) -> Result<bool> {
    let alive = group_is_alive(pgid);
    if !signal_group(pgid, "TERM").await? {
        return Ok(false);
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !group_is_alive(pgid) {
            debug!(pgid, "Process group exited after SIGTERM");
            return Ok(alive);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    warn!(pgid, "Process group did not exit within {:?}, sending SIGKILL", grace);
    signal_group(pgid, "KILL").await?;
    Ok(true)
}
