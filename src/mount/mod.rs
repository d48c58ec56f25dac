//! Mount Backend Module
//!
//! The remote filesystem itself is served by an external mount process. This
//! module defines the seam the connection registry talks to:
//!
//! - [`MountBackend`] spawns and terminates that process, probes its
//!   liveness and runs a one-shot directory listing for connection tests
//! - [`drive`] allocates drive letters and reads the host mount table
//! - [`rclone`] is the production backend built on `rclone mount`

pub mod drive;
pub mod rclone;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{CacheMode, ConnectionConfig};

pub use drive::{DriveError, MountPoint, MountTable, SystemMountTable};
pub use rclone::RcloneBackend;

/// Mount backend errors
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("Failed to start mount process: {0}")]
    Spawn(String),

    #[error("Unknown mount process {0}")]
    UnknownProcess(u32),

    #[error("Failed to stop mount process {pid}: {reason}")]
    Terminate { pid: u32, reason: String },

    #[error("Liveness probe failed: {0}")]
    Probe(String),

    #[error("Liveness probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("Remote listing failed: {0}")]
    List(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque handle for a spawned mount process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ProcessHandle(pub u32);

impl ProcessHandle {
    pub fn pid(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// Result of a successful spawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountProcess {
    pub handle: ProcessHandle,
    /// Port of the backend's control channel, used by the liveness probe
    pub control_port: u16,
}

/// Cache settings forwarded to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    pub mode: CacheMode,
    pub idle_timeout: String,
    pub refresh_interval: Option<Duration>,
}

impl CacheOptions {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            mode: config.cache_mode,
            idle_timeout: config.idle_timeout.clone(),
            refresh_interval: (config.refresh_interval > 0)
                .then(|| Duration::from_secs(config.refresh_interval)),
        }
    }
}

/// Everything a backend needs to mount one connection
#[derive(Debug, Clone)]
pub struct MountSpec {
    /// Connection name, also used as the volume label
    pub name: String,
    pub remote: ConnectionConfig,
    pub password: String,
    pub mount_point: MountPoint,
    pub cache: CacheOptions,
}

impl MountSpec {
    pub fn new(config: &ConnectionConfig, password: &str, mount_point: MountPoint) -> Self {
        Self {
            name: config.name.clone(),
            remote: config.without_password(),
            password: password.to_string(),
            mount_point,
            cache: CacheOptions::from_config(config),
        }
    }
}

/// External mount process adapter
#[async_trait]
pub trait MountBackend: Send + Sync {
    /// Start the mount process; returns once the process is running,
    /// not once the mount is ready
    async fn spawn(&self, spec: &MountSpec) -> Result<MountProcess, MountError>;

    /// Round-trip the control channel within `timeout`
    async fn probe(&self, control_port: u16, timeout: Duration) -> Result<(), MountError>;

    /// Stop the process behind `handle`
    async fn terminate(&self, handle: ProcessHandle) -> Result<(), MountError>;

    /// List the remote root without mounting; used to test a connection
    async fn list_dir(
        &self,
        config: &ConnectionConfig,
        password: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, MountError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use std::path::PathBuf;

    #[test]
    fn test_spec_strips_embedded_password() {
        let mut config = ConnectionConfig::new("a", Protocol::Ftps, "h", "u");
        config.password = Some("inline".into());
        config.refresh_interval = 30;
        let mp = MountPoint {
            letter: 'Z',
            path: PathBuf::from("Z:"),
        };

        let spec = MountSpec::new(&config, "resolved", mp);
        assert!(spec.remote.password.is_none());
        assert_eq!(spec.password, "resolved");
        assert_eq!(spec.cache.refresh_interval, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_cache_refresh_disabled() {
        let config = ConnectionConfig::new("a", Protocol::Ftp, "h", "u");
        assert_eq!(CacheOptions::from_config(&config).refresh_interval, None);
    }
}
