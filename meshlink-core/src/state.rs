use serde::Serialize;
use strum::Display;

/// Connectivity of the transport as shown to the host UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum TransportStatus {
    Uninitialized,
    Discovering,
    Ready,
    Error(String),
}

impl TransportStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, TransportStatus::Error(_))
    }
}

/// Lifecycle of a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Constructed, endpoints not yet resolved
    Idle,
    /// Service discovery requested
    Connecting,
    /// Requesting the read/write/notify/log endpoints
    ResolvingEndpoints,
    /// Steady state, I/O allowed
    Ready,
    Disconnected,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(TransportStatus::Error("Bluetooth is powered off".into()))
            .unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "Bluetooth is powered off");
        assert!(TransportStatus::Error(String::new()).is_error());
        assert!(!TransportStatus::Ready.is_error());
    }

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(!ConnectionState::Ready.is_terminal());
        assert_eq!(ConnectionState::ResolvingEndpoints.to_string(), "ResolvingEndpoints");
    }
}
