//! Frontend callbacks
//!
//! The registry needs three things from whatever UI hosts it: a password
//! prompt, a way to close editors on files inside a mount before it goes
//! away, and a reconnect affordance when the health monitor drops a mount.

use std::path::Path;

use async_trait::async_trait;

use crate::config::ConnectionConfig;

#[async_trait]
pub trait FrontendHooks: Send + Sync {
    /// Ask the user for a password; `None` when cancelled
    async fn prompt_password(&self, _config: &ConnectionConfig) -> Option<String> {
        None
    }

    /// Close editors bound to files below `mount_path`
    async fn close_editors_under(&self, _mount_path: &Path) -> Result<(), String> {
        Ok(())
    }

    /// A connected mount was lost; offer to reconnect
    async fn connection_lost(&self, _name: &str, _reason: &str) {}
}

/// Headless frontend: never prompts, nothing to close
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFrontend;

#[async_trait]
impl FrontendHooks for NoopFrontend {}
