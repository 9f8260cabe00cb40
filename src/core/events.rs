//! Append-only lifecycle event log (`lifecycle.events.jsonl`).
//!
//! Each operation writes a `pending` line before touching any process and a
//! terminal line (`success`, `noop`, `error`) afterwards. A `pending` with no
//! terminal line marks an interrupted invocation.

use crate::core::error::VisorError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub ts: String,
    pub event_id: String,
    pub op: String,
    pub instance: Option<String>,
    pub port: Option<u16>,
    pub status: String,
    pub pid: Option<u32>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(
        &self,
        op: &str,
        instance: Option<&str>,
        port: Option<u16>,
        status: &str,
        pid: Option<u32>,
        detail: Option<&str>,
    ) -> Result<(), VisorError> {
        let ev = LifecycleEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            op: op.to_string(),
            instance: instance.map(str::to_string),
            port,
            status: status.to_string(),
            pid,
            detail: detail.map(str::to_string),
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let line = serde_json::to_string(&ev).map_err(|e| {
            VisorError::IoError(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(f, "{}", line)?;
        Ok(())
    }

    /// Best-effort variant: a failing audit write is logged, never fatal.
    pub fn note(
        &self,
        op: &str,
        instance: Option<&str>,
        port: Option<u16>,
        status: &str,
        pid: Option<u32>,
        detail: Option<&str>,
    ) {
        if let Err(e) = self.record(op, instance, port, status, pid, detail) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to append lifecycle event");
        }
    }

    pub fn read_all(&self) -> Result<Vec<LifecycleEvent>, VisorError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VisorError::IoError(e)),
        };
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}
