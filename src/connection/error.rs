//! Connection registry error types

use thiserror::Error;

use super::state::ConnectionStatus;
use crate::config::{ConfigValidationError, KeychainError, Scope, StorageError};
use crate::mount::{DriveError, MountError};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("No password available for connection '{0}'")]
    Credential(String),

    #[error("No free mount point: {0}")]
    ResourceExhausted(#[from] DriveError),

    #[error("Mount for '{name}' did not become ready within {timeout_secs}s")]
    MountTimeout { name: String, timeout_secs: u64 },

    #[error("Failed to start mount backend: {0}")]
    BackendSpawn(MountError),

    #[error("Connection lost")]
    HealthCheckLost,

    #[error("Config storage error: {0}")]
    ConfigIo(#[from] StorageError),

    #[error("Connection not found: {0}")]
    NotFound(String),

    #[error("Invalid connection config: {0}")]
    InvalidConfig(#[from] ConfigValidationError),

    #[error("Connection '{0}' already exists")]
    AlreadyExists(String),

    #[error("No {0} configuration store available")]
    NoStore(Scope),

    #[error("Connection '{name}' is busy ({status})")]
    Busy {
        name: String,
        status: ConnectionStatus,
    },

    #[error("Connection '{0}' is not connected")]
    NotConnected(String),

    #[error("Connect for '{0}' was cancelled by a newer operation")]
    Cancelled(String),

    #[error("Credential vault error: {0}")]
    Vault(#[from] KeychainError),

    #[error("Failed to stop mount: {0}")]
    Terminate(MountError),

    #[error("Connection test failed: {0}")]
    TestFailed(MountError),

    #[error("Path escapes the mount root: {0}")]
    InvalidPath(String),

    #[error(
        "Moved '{name}' to {to} scope but could not remove it from {from} scope: {source}"
    )]
    ScopeMoveIncomplete {
        name: String,
        from: Scope,
        to: Scope,
        source: StorageError,
    },
}

// Serialize as the display string for consumers
impl serde::Serialize for RegistryError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_lost_message() {
        assert_eq!(RegistryError::HealthCheckLost.to_string(), "Connection lost");
    }

    #[test]
    fn test_serialize_as_string() {
        let err = RegistryError::NotFound("x".into());
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            "\"Connection not found: x\""
        );
    }
}
