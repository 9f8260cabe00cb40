use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisorError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Instance not found: id {id} is out of range (0..{len})")]
    NotFound { id: usize, len: usize },
    #[error("Instance '{name}' is no longer present in the state file")]
    InstanceMissing { name: String },
    #[error("Failed to spawn server for instance '{instance}': {source}")]
    ProcessSpawn {
        instance: String,
        #[source]
        source: io::Error,
    },
    #[error("Server for instance '{instance}' exited before becoming ready ({status}): {log_tail}")]
    ServerExited {
        instance: String,
        status: String,
        log_tail: String,
    },
    #[error("Data directory {} of instance '{instance}' {reason}", path.display())]
    DataDirectory {
        instance: String,
        path: PathBuf,
        reason: String,
    },
    #[error("Port {port} is already accepting connections; refusing to start instance '{instance}'")]
    PortInUse { instance: String, port: u16 },
    #[error("Instance '{instance}' did not become ready on port {port} within {waited_ms}ms")]
    ReadinessTimeout {
        instance: String,
        port: u16,
        waited_ms: u128,
    },
    #[error("Failed to signal pid {pid} of instance '{instance}': {source}")]
    Signal {
        instance: String,
        pid: u32,
        #[source]
        source: SignalError,
    },
    #[error("Instance '{instance}' (pid {pid}) did not exit within {waited_ms}ms")]
    ShutdownTimeout {
        instance: String,
        pid: u32,
        waited_ms: u128,
    },
    #[error("State file {} is corrupt: {source}", path.display())]
    StateCorruption {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Timed out after {waited_ms}ms waiting for state lock {}", path.display())]
    LockTimeout { path: PathBuf, waited_ms: u128 },
}

/// Why a termination signal could not be delivered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("process no longer exists")]
    ProcessGone,
    #[error("permission denied")]
    PermissionDenied,
    #[error("os error: {0}")]
    Os(String),
}

impl VisorError {
    /// Name of the instance the error concerns, when there is one.
    pub fn instance(&self) -> Option<&str> {
        match self {
            VisorError::InstanceMissing { name } => Some(name),
            VisorError::ProcessSpawn { instance, .. }
            | VisorError::DataDirectory { instance, .. }
            | VisorError::ServerExited { instance, .. }
            | VisorError::PortInUse { instance, .. }
            | VisorError::ReadinessTimeout { instance, .. }
            | VisorError::Signal { instance, .. }
            | VisorError::ShutdownTimeout { instance, .. } => Some(instance),
            _ => None,
        }
    }
}
