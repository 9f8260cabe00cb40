//! Durable instance collection.
//!
//! The whole collection is one JSON array in `instances.json`. Reads never
//! fail on a missing file; writes replace the file atomically through a
//! temporary sibling and `rename`. Mutations go through [`InstanceStore::transact`],
//! which holds an advisory `fs2` lock for the read-modify-write cycle.

use crate::core::error::VisorError;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Base delay for lock backoff (milliseconds).
const LOCK_BASE_DELAY_MS: u64 = 10;
/// Maximum lock backoff delay (milliseconds).
const LOCK_MAX_DELAY_MS: u64 = 250;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Stopped,
    Running,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Stopped => write!(f, "stopped"),
            InstanceStatus::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub name: String,
    pub data_directory: PathBuf,
    pub port: u16,
    pub status: InstanceStatus,
}

impl InstanceRecord {
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }
}

/// Reject ids outside `[0, len)`.
pub fn check_id(records: &[InstanceRecord], id: usize) -> Result<(), VisorError> {
    if id < records.len() {
        Ok(())
    } else {
        Err(VisorError::NotFound {
            id,
            len: records.len(),
        })
    }
}

/// Position of the record called `name`.
pub fn position_by_name(records: &[InstanceRecord], name: &str) -> Result<usize, VisorError> {
    records
        .iter()
        .position(|r| r.name == name)
        .ok_or_else(|| VisorError::InstanceMissing {
            name: name.to_string(),
        })
}

#[derive(Debug, Clone)]
pub struct InstanceStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl InstanceStore {
    pub fn new(path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_path: lock_path.into(),
            lock_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted collection. A missing file is an empty collection.
    pub fn load(&self) -> Result<Vec<InstanceRecord>, VisorError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VisorError::IoError(e)),
        };
        serde_json::from_str(&raw).map_err(|source| VisorError::StateCorruption {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the persisted collection as a whole.
    pub fn save(&self, records: &[InstanceRecord]) -> Result<(), VisorError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut bytes = serde_json::to_vec_pretty(records).map_err(|e| {
            VisorError::ValidationError(format!("failed to serialize instances: {}", e))
        })?;
        bytes.push(b'\n');

        let tmp_path = self.tmp_path();
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Acquire the advisory lock, polling with backoff until the lock timeout.
    pub fn lock(&self) -> Result<StateLock, VisorError> {
        if let Some(parent) = self.lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;

        let start = Instant::now();
        let mut attempt = 0u32;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    tracing::trace!(path = %self.lock_path.display(), "state lock acquired");
                    return Ok(StateLock { _file: file });
                }
                Err(e) if is_contended(&e) => {
                    if start.elapsed() >= self.lock_timeout {
                        return Err(VisorError::LockTimeout {
                            path: self.lock_path.clone(),
                            waited_ms: start.elapsed().as_millis(),
                        });
                    }
                    let delay_ms = (LOCK_BASE_DELAY_MS << attempt.min(5)).min(LOCK_MAX_DELAY_MS);
                    attempt += 1;
                    thread::sleep(Duration::from_millis(delay_ms));
                }
                Err(e) => return Err(VisorError::IoError(e)),
            }
        }
    }

    /// Run `f` on the collection under the lock; persist only if it changed.
    pub fn transact<T, F>(&self, f: F) -> Result<T, VisorError>
    where
        F: FnOnce(&mut Vec<InstanceRecord>) -> Result<T, VisorError>,
    {
        let _lock = self.lock()?;
        let before = self.load()?;
        let mut records = before.clone();
        let out = f(&mut records)?;
        if records != before {
            self.save(&records)?;
        }
        Ok(out)
    }

    /// Consistent snapshot read under the lock.
    pub fn snapshot(&self) -> Result<Vec<InstanceRecord>, VisorError> {
        let _lock = self.lock()?;
        self.load()
    }

    fn tmp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "instances.json".to_string());
        self.path.with_file_name(format!(".{}.tmp", file_name))
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Held advisory lock on the state file; released on drop.
pub struct StateLock {
    _file: File,
}
