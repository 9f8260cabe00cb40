//! Server spawning and the bounded readiness protocol.
//!
//! The server runs in its own process group with stdout/stderr appended to
//! `logs/<name>.log`, so it outlives the supervisor invocation that started
//! it. Readiness is the configured marker showing up in output written after
//! the spawn, or (optionally) the port accepting TCP connections. Anything
//! else within the deadline is a failure and the child is killed.
//!
//! A successful launch leaves the pid tracked in [`interrupt`]; the caller
//! untracks it once the server's record is committed.

use crate::core::config::SupervisorConfig;
use crate::core::error::VisorError;
use crate::core::time;
use crate::plugins::interrupt;
use crate::plugins::resolver::ProcessId;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const TCP_PROBE_TIMEOUT_MS: u64 = 200;
/// Bytes of recent server output kept for error reports.
const TAIL_WINDOW_BYTES: usize = 4096;
const TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub instance: String,
    pub data_directory: PathBuf,
    pub port: u16,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedServer {
    pub pid: ProcessId,
    pub ready_after: Duration,
}

pub trait ServerLauncher {
    /// Spawn the server and block until it is ready or the attempt has failed.
    /// On failure no process started by this call is left running, including
    /// when an [`InterruptGuard`](crate::plugins::interrupt::InterruptGuard)
    /// is installed and the supervisor is interrupted mid-wait.
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedServer, VisorError>;
}

impl<T: ServerLauncher + ?Sized> ServerLauncher for &T {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedServer, VisorError> {
        (**self).launch(spec)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: String,
    extra_args: Vec<String>,
    marker: String,
    tcp_probe: bool,
    timeout: Duration,
    poll_interval: Duration,
}

impl ProcessLauncher {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            binary: config.server.binary.clone(),
            extra_args: config.server.extra_args.clone(),
            marker: config.readiness.marker.clone(),
            tcp_probe: config.readiness.tcp_probe,
            timeout: config.ready_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    /// `--port <port> --dbpath <dir>` followed by configured extras.
    pub fn server_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "--port".to_string(),
            spec.port.to_string(),
            "--dbpath".to_string(),
            spec.data_directory.to_string_lossy().to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn spawn(&self, spec: &LaunchSpec, log: File) -> Result<Child, VisorError> {
        let stderr_log = log.try_clone()?;
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.server_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr_log));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Keep terminal signals aimed at the supervisor away from the server.
            cmd.process_group(0);
        }

        cmd.spawn().map_err(|source| VisorError::ProcessSpawn {
            instance: spec.instance.clone(),
            source,
        })
    }

    fn wait_ready(
        &self,
        spec: &LaunchSpec,
        child: &mut Child,
        output: &mut OutputWatcher,
    ) -> Result<Duration, VisorError> {
        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                output.poll()?;
                return Err(VisorError::ServerExited {
                    instance: spec.instance.clone(),
                    status: status.to_string(),
                    log_tail: output.tail(),
                });
            }
            if output.poll()? {
                tracing::debug!(instance = %spec.instance, "readiness marker seen");
                return Ok(start.elapsed());
            }
            if self.tcp_probe && port_accepts(spec.port) {
                tracing::debug!(instance = %spec.instance, port = spec.port, "tcp probe succeeded");
                return Ok(start.elapsed());
            }
            if start.elapsed() >= self.timeout {
                return Err(VisorError::ReadinessTimeout {
                    instance: spec.instance.clone(),
                    port: spec.port,
                    waited_ms: start.elapsed().as_millis(),
                });
            }
            thread::sleep(self.poll_interval);
        }
    }
}

impl ServerLauncher for ProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedServer, VisorError> {
        if port_accepts(spec.port) {
            return Err(VisorError::PortInUse {
                instance: spec.instance.clone(),
                port: spec.port,
            });
        }

        let mut log = open_server_log(&spec.log_path)?;
        writeln!(
            log,
            "--- mongovisor: starting '{}' on port {} at {} ---",
            spec.instance,
            spec.port,
            time::now_epoch_z()
        )?;
        let offset = log.metadata()?.len();
        let mut output = OutputWatcher::new(&spec.log_path, offset, &self.marker);

        // A signal arriving mid-spawn waits until the pid is tracked.
        let held = interrupt::hold_signals()?;
        let mut child = self.spawn(spec, log)?;
        let pid = child.id();
        interrupt::track(pid);
        drop(held);
        tracing::info!(instance = %spec.instance, pid, port = spec.port, "server spawned");

        match self.wait_ready(spec, &mut child, &mut output) {
            Ok(ready_after) => {
                reap_in_background(child, &spec.instance);
                Ok(LaunchedServer { pid, ready_after })
            }
            Err(e) => {
                // Never leave an untracked server behind.
                let _ = child.kill();
                let _ = child.wait();
                interrupt::untrack(pid);
                tracing::warn!(instance = %spec.instance, pid, error = %e, "server launch failed");
                Err(e)
            }
        }
    }
}

fn open_server_log(path: &Path) -> Result<File, VisorError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// The server keeps running after the supervisor exits; a waiter thread only
/// matters when the supervisor lives on (embedding, tests) and must reap it.
fn reap_in_background(mut child: Child, instance: &str) {
    let spawned = thread::Builder::new()
        .name(format!("reap-{}", instance))
        .spawn(move || {
            let _ = child.wait();
        });
    if let Err(e) = spawned {
        tracing::debug!(instance, error = %e, "could not start reaper thread");
    }
}

pub fn port_accepts(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, Duration::from_millis(TCP_PROBE_TIMEOUT_MS)).is_ok()
}

/// Incrementally reads server output appended after `cursor`, looking for the marker.
struct OutputWatcher {
    path: PathBuf,
    cursor: u64,
    marker: Vec<u8>,
    window: Vec<u8>,
}

impl OutputWatcher {
    fn new(path: &Path, cursor: u64, marker: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            cursor,
            marker: marker.as_bytes().to_vec(),
            window: Vec::new(),
        }
    }

    /// Read new output; true once the marker has been seen.
    fn poll(&mut self) -> Result<bool, VisorError> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.cursor))?;
        let mut fresh = Vec::new();
        file.read_to_end(&mut fresh)?;
        self.cursor += fresh.len() as u64;

        // Search across the boundary with the previous chunk.
        let overlap = self.marker.len().saturating_sub(1).min(self.window.len());
        let mut haystack = self.window[self.window.len() - overlap..].to_vec();
        haystack.extend_from_slice(&fresh);
        let found = contains(&haystack, &self.marker);

        self.window.extend_from_slice(&fresh);
        if self.window.len() > TAIL_WINDOW_BYTES {
            let excess = self.window.len() - TAIL_WINDOW_BYTES;
            self.window.drain(..excess);
        }
        Ok(found)
    }

    fn tail(&self) -> String {
        let text = String::from_utf8_lossy(&self.window);
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(TAIL_LINES);
        let tail = lines[start..].join("\n");
        if tail.trim().is_empty() {
            "(no output)".to_string()
        } else {
            tail
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}
