//! Connection Management Module
//!
//! The connection registry owns every configured remote drive and drives
//! it through its lifecycle:
//!
//! - Loading definitions from the project and global stores
//! - Mounting and unmounting through a [`crate::mount::MountBackend`]
//! - Periodic liveness checks of connected mounts
//! - Change notifications for UI consumers

pub mod error;
pub mod events;
pub mod health;
pub mod hooks;
pub mod registry;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use error::RegistryError;
pub use events::{ConnectionEvent, ConnectionEventEmitter};
pub use health::HealthMonitor;
pub use hooks::{FrontendHooks, NoopFrontend};
pub use registry::{
    Connection, ConnectionRegistry, RegistryBuilder, RegistryOptions, CONNECTION_LOST,
};
pub use state::ConnectionStatus;
