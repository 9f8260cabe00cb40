//! Supervisor configuration from `<root>/config.toml`.
//!
//! Every key has a default; a missing file means defaults. A handful of
//! environment variables override the file for ad-hoc runs.

use crate::core::error::VisorError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const SERVER_BIN_ENV: &str = "MONGOVISOR_SERVER_BIN";
pub const READY_TIMEOUT_ENV: &str = "MONGOVISOR_READY_TIMEOUT_SECS";
pub const STOP_TIMEOUT_ENV: &str = "MONGOVISOR_STOP_TIMEOUT_SECS";

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub server: ServerConfig,
    pub readiness: ReadinessConfig,
    pub shutdown: ShutdownConfig,
    pub state: StateConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Server executable, resolved through `PATH` when not absolute.
    pub binary: String,
    /// Appended after `--port <port> --dbpath <dir>`.
    pub extra_args: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary: "mongod".to_string(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Substring in server output that signals readiness. Empty disables it.
    pub marker: String,
    pub timeout_secs: u64,
    /// Treat a successful TCP connect to the port as readiness.
    pub tcp_probe: bool,
    pub poll_interval_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            marker: "Waiting for connections".to_string(),
            timeout_secs: 30,
            tcp_probe: true,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    pub timeout_secs: u64,
    /// Escalate to SIGKILL once `timeout_secs` elapses.
    pub force_kill: bool,
    pub kill_grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            force_kill: true,
            kill_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StateConfig {
    pub lock_timeout_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 10,
        }
    }
}

impl SupervisorConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness.poll_interval_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown.kill_grace_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.state.lock_timeout_secs)
    }

    fn validate(&self) -> Result<(), VisorError> {
        if self.server.binary.trim().is_empty() {
            return Err(VisorError::ConfigError(
                "server.binary must not be empty".to_string(),
            ));
        }
        if self.readiness.marker.is_empty() && !self.readiness.tcp_probe {
            return Err(VisorError::ConfigError(
                "readiness needs a marker or tcp_probe = true".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), VisorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bin) = lookup(SERVER_BIN_ENV) {
            self.server.binary = bin;
        }
        if let Some(raw) = lookup(READY_TIMEOUT_ENV) {
            self.readiness.timeout_secs = parse_secs(READY_TIMEOUT_ENV, &raw)?;
        }
        if let Some(raw) = lookup(STOP_TIMEOUT_ENV) {
            self.shutdown.timeout_secs = parse_secs(STOP_TIMEOUT_ENV, &raw)?;
        }
        Ok(())
    }
}

fn parse_secs(key: &str, raw: &str) -> Result<u64, VisorError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| VisorError::ConfigError(format!("{}='{}': {}", key, raw, e)))
}

/// Load `config.toml` from `path`; a missing file yields defaults.
pub fn load_config_file(path: &Path) -> Result<SupervisorConfig, VisorError> {
    if !path.exists() {
        return Ok(SupervisorConfig::default());
    }
    let content = fs::read_to_string(path).map_err(VisorError::IoError)?;
    let config: SupervisorConfig = toml::from_str(&content)
        .map_err(|e| VisorError::ConfigError(format!("{}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

/// File config plus process environment overrides.
pub fn load_config(path: &Path) -> Result<SupervisorConfig, VisorError> {
    let mut config = load_config_file(path)?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}
