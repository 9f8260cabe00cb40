//! Process Handle Resolver.
//!
//! Maps a port to the live server process by scanning the process table
//! (`ps -eo pid=,args=`). No child handle survives between invocations, so
//! this is the only way a later `stop` can find what an earlier `start`
//! spawned.
//!
//! Matching rule: the command itself (or the script run by a shell
//! interpreter, as ps shows for `#!/bin/sh` servers) has the configured
//! binary's file name, plus `--port <port>` or `--port=<port>`. Wrappers such
//! as `sh -c "mongod ..."` and `grep mongod --port N` do not match. Arguments
//! are split on whitespace, so a server path containing spaces will not match.
//! When several processes match, the lowest PID wins and the ambiguity is
//! logged at `warn`.

use crate::core::error::{SignalError, VisorError};
use regex::Regex;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

pub type ProcessId = u32;

pub trait ProcessResolver {
    /// Every live process serving `port`, ascending by PID.
    fn find_processes(&self, port: u16) -> Result<Vec<ProcessId>, VisorError>;

    /// Exists and is not a zombie.
    fn is_running(&self, pid: ProcessId) -> Result<bool, VisorError>;

    /// Graceful termination (SIGTERM).
    fn signal_terminate(&self, pid: ProcessId) -> Result<(), SignalError>;

    /// Forced termination (SIGKILL).
    fn force_kill(&self, pid: ProcessId) -> Result<(), SignalError>;

    fn find_process(&self, port: u16) -> Result<Option<ProcessId>, VisorError> {
        let pids = self.find_processes(port)?;
        if pids.len() > 1 {
            tracing::warn!(
                port,
                pids = ?pids,
                chosen = pids[0],
                "multiple server processes match port; using the lowest pid"
            );
        }
        Ok(pids.first().copied())
    }
}

impl<T: ProcessResolver + ?Sized> ProcessResolver for &T {
    fn find_processes(&self, port: u16) -> Result<Vec<ProcessId>, VisorError> {
        (**self).find_processes(port)
    }

    fn is_running(&self, pid: ProcessId) -> Result<bool, VisorError> {
        (**self).is_running(pid)
    }

    fn signal_terminate(&self, pid: ProcessId) -> Result<(), SignalError> {
        (**self).signal_terminate(pid)
    }

    fn force_kill(&self, pid: ProcessId) -> Result<(), SignalError> {
        (**self).force_kill(pid)
    }

    fn find_process(&self, port: u16) -> Result<Option<ProcessId>, VisorError> {
        (**self).find_process(port)
    }
}

/// Resolver backed by `ps` and kill(2).
#[derive(Debug, Clone)]
pub struct PsResolver {
    binary_name: String,
}

impl PsResolver {
    /// `binary` may be a bare command or a path; only its file name is matched.
    pub fn new(binary: &str) -> Self {
        let binary_name = Path::new(binary)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| binary.to_string());
        Self { binary_name }
    }

    pub fn binary_name(&self) -> &str {
        &self.binary_name
    }

    fn process_table(&self) -> Result<String, VisorError> {
        let out = Command::new("ps")
            .args(["-eo", "pid=,args="])
            .output()
            .map_err(VisorError::IoError)?;
        if !out.status.success() {
            return Err(VisorError::IoError(std::io::Error::other(format!(
                "ps exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ))));
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }
}

impl ProcessResolver for PsResolver {
    fn find_processes(&self, port: u16) -> Result<Vec<ProcessId>, VisorError> {
        let table = self.process_table()?;
        let own = std::process::id();
        let mut pids = matching_pids(&table, &self.binary_name, port);
        pids.retain(|pid| *pid != own);
        tracing::debug!(port, pids = ?pids, "resolved server processes");
        Ok(pids)
    }

    fn is_running(&self, pid: ProcessId) -> Result<bool, VisorError> {
        let out = Command::new("ps")
            .args(["-o", "stat=", "-p", &pid.to_string()])
            .output()
            .map_err(VisorError::IoError)?;
        if !out.status.success() {
            return Ok(false);
        }
        let stat = String::from_utf8_lossy(&out.stdout);
        let stat = stat.trim();
        Ok(!stat.is_empty() && !stat.starts_with('Z'))
    }

    fn signal_terminate(&self, pid: ProcessId) -> Result<(), SignalError> {
        send_signal(pid, false)
    }

    fn force_kill(&self, pid: ProcessId) -> Result<(), SignalError> {
        send_signal(pid, true)
    }
}

#[cfg(unix)]
fn send_signal(pid: ProcessId, force: bool) -> Result<(), SignalError> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    // 0 and negative values address process groups.
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Err(SignalError::Os(format!("invalid pid {}", pid))),
    };
    let signal = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(SignalError::ProcessGone),
        Err(Errno::EPERM) => Err(SignalError::PermissionDenied),
        Err(e) => Err(SignalError::Os(e.to_string())),
    }
}

#[cfg(not(unix))]
fn send_signal(pid: ProcessId, _force: bool) -> Result<(), SignalError> {
    Err(SignalError::Os(format!(
        "signals are not supported on this platform (pid {})",
        pid
    )))
}

fn ps_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d+)\s+(.+?)\s*$").expect("static regex"))
}

/// Split one `pid=,args=` line into its pid and argument tokens.
pub fn parse_ps_line(line: &str) -> Option<(ProcessId, Vec<&str>)> {
    let caps = ps_line_regex().captures(line)?;
    let pid = caps.get(1)?.as_str().parse::<ProcessId>().ok()?;
    let args = caps.get(2)?.as_str().split_whitespace().collect();
    Some((pid, args))
}

const SCRIPT_INTERPRETERS: &[&str] = &["sh", "bash", "dash", "ksh", "zsh"];

fn file_name_is(arg: &str, name: &str) -> bool {
    Path::new(arg)
        .file_name()
        .map(|n| n.to_string_lossy() == name)
        .unwrap_or(false)
}

/// Does this argument list look like our server bound to `port`?
pub fn command_matches(args: &[&str], binary_name: &str, port: u16) -> bool {
    let Some(command) = args.first() else {
        return false;
    };
    let runs_binary = file_name_is(command, binary_name)
        || (SCRIPT_INTERPRETERS.iter().any(|sh| file_name_is(command, sh))
            && args.get(1).is_some_and(|script| file_name_is(script, binary_name)));
    if !runs_binary {
        return false;
    }
    let port_str = port.to_string();
    let joined_flag = format!("--port={}", port_str);
    args.iter().enumerate().any(|(i, arg)| {
        *arg == joined_flag || (*arg == "--port" && args.get(i + 1) == Some(&port_str.as_str()))
    })
}

/// All PIDs in a `ps -eo pid=,args=` listing matching `binary_name` and `port`, ascending.
pub fn matching_pids(table: &str, binary_name: &str, port: u16) -> Vec<ProcessId> {
    let mut pids: Vec<ProcessId> = table
        .lines()
        .filter_map(parse_ps_line)
        .filter(|(_, args)| command_matches(args, binary_name, port))
        .map(|(pid, _)| pid)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}
