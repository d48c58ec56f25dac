//! RemoteDrive - mount FTP/FTPS/SFTP servers as local drives
//!
//! The crate is headless: a host application (editor extension, tray app,
//! CLI) builds a [`ConnectionRegistry`], loads the configured connections
//! and drives them through connect/disconnect while the registry keeps
//! mounts healthy and reports every change as a [`ConnectionEvent`].

pub mod config;
pub mod connection;
pub mod mount;
pub mod tracking;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{ConnectionConfig, PasswordSource, Protocol, Scope};
pub use connection::{
    Connection, ConnectionEvent, ConnectionRegistry, ConnectionStatus, FrontendHooks,
    RegistryError, RegistryOptions,
};
pub use tracking::{SyncStatus, TrackedFile};

/// Install the global tracing subscriber (`RUST_LOG`, default `info`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
