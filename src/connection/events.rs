//! Connection change notifications
//!
//! Consumers subscribe to a broadcast stream. Events are sent only after the
//! table has been updated, so a receiver that reads the registry on an event
//! always sees the state the event describes (or a newer one).

use serde::Serialize;
use tokio::sync::broadcast;

use super::state::ConnectionStatus;
use crate::config::Scope;

/// Broadcast capacity; slow receivers observe `Lagged` and should re-read the table
const EVENT_CAPACITY: usize = 256;

/// Connection event types
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConnectionEvent {
    StatusChanged {
        name: String,
        status: ConnectionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Added {
        name: String,
        scope: Scope,
    },
    Updated {
        old_name: String,
        name: String,
        scope: Scope,
    },
    Removed {
        name: String,
    },
    /// Health monitor gave up on a mount; consumers offer a reconnect
    ConnectionLost {
        name: String,
    },
    /// The whole table was re-read from the config stores
    Reloaded {
        count: usize,
    },
}

impl ConnectionEvent {
    /// Connection name the event refers to, if any
    pub fn name(&self) -> Option<&str> {
        match self {
            ConnectionEvent::StatusChanged { name, .. }
            | ConnectionEvent::Added { name, .. }
            | ConnectionEvent::Updated { name, .. }
            | ConnectionEvent::Removed { name }
            | ConnectionEvent::ConnectionLost { name } => Some(name),
            ConnectionEvent::Reloaded { .. } => None,
        }
    }
}

/// Event emitter for the connection registry
#[derive(Clone)]
pub struct ConnectionEventEmitter {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionEventEmitter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ConnectionEvent) {
        tracing::debug!("Connection event: {:?}", event);
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn emit_status(&self, name: &str, status: ConnectionStatus, error: Option<String>) {
        self.emit(ConnectionEvent::StatusChanged {
            name: name.to_string(),
            status,
            error,
        });
    }
}

impl Default for ConnectionEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
