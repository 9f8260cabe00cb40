//! Supervisor home directory and the files it contains.
//!
//! Every invocation resolves one root directory. All persisted state, the
//! advisory lock, configuration, the lifecycle event log and server output
//! live underneath it.

use crate::core::error::VisorError;
use std::path::{Path, PathBuf};

/// Environment variable overriding the supervisor root.
pub const ROOT_ENV: &str = "MONGOVISOR_ROOT";
/// Directory name used under the working directory when nothing else is set.
pub const DEFAULT_ROOT_DIR: &str = ".mongovisor";

/// Store handle representing a supervisor home.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute or caller-relative path to the supervisor root
    pub root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the root: explicit flag, then `MONGOVISOR_ROOT`, then `<cwd>/.mongovisor`.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, VisorError> {
        if let Some(root) = explicit {
            return Ok(Self::new(root));
        }
        if let Ok(root) = std::env::var(ROOT_ENV) {
            if !root.trim().is_empty() {
                return Ok(Self::new(root));
            }
        }
        let cwd = std::env::current_dir()?;
        Ok(Self::new(cwd.join(DEFAULT_ROOT_DIR)))
    }

    /// Create the root and the logs directory if missing.
    pub fn ensure(&self) -> Result<(), VisorError> {
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }

    pub fn instances_path(&self) -> PathBuf {
        self.root.join("instances.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("instances.lock")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join("lifecycle.events.jsonl")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn server_log_path(&self, instance: &str) -> PathBuf {
        self.logs_dir().join(format!("{}.log", sanitize_file_stem(instance)))
    }
}

fn sanitize_file_stem(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "instance".to_string()
    } else {
        cleaned
    }
}
