//! Connection state machine
//!
//! ```text
//!                 ┌──────────── lost (health monitor) ─────────────┐
//!                 ▼                                                │
//! Disconnected ──► Connecting ──► Connected ──► Disconnecting ──► Disconnected
//!      ▲              │  │                          │
//!      │              │  └──────► Disconnecting     │
//!      │              ▼                             ▼
//!      └─────────── Error ◄─────────────────────────┘
//!                     │
//!                     └──► Connecting / Disconnecting
//! ```

use serde::{Deserialize, Serialize};

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Last connect/disconnect failed; retryable
    Error,
}

impl ConnectionStatus {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                // Forced by the health monitor when the mount died silently
                | (Connected, Disconnected)
                | (Disconnecting, Disconnected)
                | (Disconnecting, Error)
                | (Error, Connecting)
                | (Error, Disconnecting)
        )
    }

    /// Connecting or Disconnecting
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Disconnecting
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnecting => "disconnecting",
            ConnectionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionStatus::*;
    use super::*;

    const ALL: [ConnectionStatus; 5] = [Disconnected, Connecting, Connected, Disconnecting, Error];

    #[test]
    fn test_no_direct_connect_or_disconnect_jump() {
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Error.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Disconnecting));
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Error));
        assert!(Disconnecting.can_transition_to(Error));
        assert!(!Connected.can_transition_to(Error));
    }

    #[test]
    fn test_no_self_transitions() {
        for status in ALL {
            assert!(!status.can_transition_to(status), "{status} -> {status}");
        }
    }

    #[test]
    fn test_every_state_reaches_disconnected() {
        for status in ALL {
            let reachable = status == Disconnected
                || status.can_transition_to(Disconnected)
                || ALL
                    .iter()
                    .any(|mid| status.can_transition_to(*mid) && mid.can_transition_to(Disconnected));
            assert!(reachable, "{status} cannot reach disconnected");
        }
    }

    #[test]
    fn test_serialize() {
        assert_eq!(
            serde_json::to_string(&Disconnecting).unwrap(),
            "\"disconnecting\""
        );
        assert!(Connecting.is_in_flight());
        assert!(!Error.is_in_flight());
    }
}
