//! Error types for the meshlink transport
//!
//! Two layers: [`HardwareError`] is what the radio stack reports for a single
//! I/O operation, [`TransportError`] is what callers of the core see. The
//! reconnect policy lives in exactly one place, [`should_reconnect`].

use strum::{Display, EnumIter};
use thiserror::Error;

/// Error codes reported by the Bluetooth stack.
///
/// The numeric values follow the radio stack's own numbering so a backend can
/// translate raw codes with [`HardwareErrorKind::from_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum HardwareErrorKind {
    Unknown,
    InvalidParameters,
    InvalidHandle,
    NotConnected,
    OutOfSpace,
    OperationCancelled,
    ConnectionTimeout,
    PeripheralDisconnected,
    UuidNotAllowed,
    AlreadyAdvertising,
    ConnectionFailed,
    ConnectionLimitReached,
    UnknownDevice,
    OperationNotSupported,
    PeerRemovedPairingInformation,
    EncryptionTimedOut,
    TooManyPairedDevices,
    /// ATT insufficient authentication
    AttAuthentication,
    /// ATT insufficient authorization
    AttAuthorization,
    /// ATT insufficient encryption
    AttEncryption,
    /// Any other ATT protocol error, carrying the ATT code
    Att(u8),
}

impl HardwareErrorKind {
    /// Map a raw stack error code onto a kind. Unrecognised codes become `Unknown`.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::InvalidParameters,
            2 => Self::InvalidHandle,
            3 => Self::NotConnected,
            4 => Self::OutOfSpace,
            5 => Self::OperationCancelled,
            6 => Self::ConnectionTimeout,
            7 => Self::PeripheralDisconnected,
            8 => Self::UuidNotAllowed,
            9 => Self::AlreadyAdvertising,
            10 => Self::ConnectionFailed,
            11 => Self::ConnectionLimitReached,
            12 => Self::UnknownDevice,
            13 => Self::OperationNotSupported,
            14 => Self::PeerRemovedPairingInformation,
            15 => Self::EncryptionTimedOut,
            16 => Self::TooManyPairedDevices,
            _ => Self::Unknown,
        }
    }

    /// Map an ATT protocol error code onto a kind.
    pub fn from_att_code(code: u8) -> Self {
        match code {
            0x05 => Self::AttAuthentication,
            0x08 => Self::AttAuthorization,
            0x0F => Self::AttEncryption,
            other => Self::Att(other),
        }
    }

    /// True for failures caused by pairing, bonding or encryption. These are
    /// surfaced to the user verbatim ("forget the device and retry").
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            Self::AttAuthentication
                | Self::AttAuthorization
                | Self::AttEncryption
                | Self::PeerRemovedPairingInformation
                | Self::EncryptionTimedOut
        )
    }
}

/// A failure reported by the radio stack for one operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct HardwareError {
    pub kind: HardwareErrorKind,
    pub message: String,
}

impl HardwareError {
    pub fn new(kind: HardwareErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_code(code: i64, message: impl Into<String>) -> Self {
        Self::new(HardwareErrorKind::from_code(code), message)
    }
}

/// The main error type for transport operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Another connect attempt is in flight or a session is already active
    #[error("Transport is busy: already connecting or connected")]
    Busy,

    /// The device is not known to the registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Required service or endpoints missing on the remote radio
    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    /// An I/O operation failed at the radio stack
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    /// The link went away without a stack error (peer hung up, radio powered off)
    #[error("Link lost: {0}")]
    LinkLost(String),

    /// The session was torn down while the operation was pending
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// The operation was abandoned by its caller
    #[error("Operation cancelled")]
    Cancelled,

    /// The connection is not in a state that allows I/O
    #[error("Not connected")]
    NotConnected,

    /// The remote endpoint cannot perform the requested I/O
    #[error("I/O failed: {0}")]
    Io(String),

    /// The Bluetooth stack is off, unauthorized or unsupported
    #[error("Bluetooth unavailable: {0}")]
    StackUnavailable(String),

    /// The backend lacks a capability
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The call is not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The transport manager task has shut down
    #[error("Transport manager is closed")]
    ManagerClosed,
}

impl TransportError {
    pub fn discovery(msg: impl Into<String>) -> Self {
        TransportError::DiscoveryFailed(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        TransportError::Io(msg.into())
    }

    pub fn link_lost(msg: impl Into<String>) -> Self {
        TransportError::LinkLost(msg.into())
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        TransportError::Disconnected(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }

    /// A pairing or encryption failure the user has to resolve by forgetting
    /// the radio and pairing again
    pub fn is_security(&self) -> bool {
        matches!(self, TransportError::Hardware(err) if err.kind.is_security())
    }
}

/// Decide whether a failure is worth reconnecting after.
///
/// Timeouts and peer-initiated disconnects mean the radio went out of range or
/// was power-cycled, so it will likely advertise again. Security, discovery and
/// unknown failures will not fix themselves.
pub fn should_reconnect(cause: &TransportError) -> bool {
    match cause {
        TransportError::Hardware(err) => matches!(
            err.kind,
            HardwareErrorKind::ConnectionTimeout | HardwareErrorKind::PeripheralDisconnected
        ),
        TransportError::LinkLost(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_from_code_known_values() {
        assert_eq!(
            HardwareErrorKind::from_code(6),
            HardwareErrorKind::ConnectionTimeout
        );
        assert_eq!(
            HardwareErrorKind::from_code(7),
            HardwareErrorKind::PeripheralDisconnected
        );
        assert_eq!(
            HardwareErrorKind::from_code(14),
            HardwareErrorKind::PeerRemovedPairingInformation
        );
        assert_eq!(HardwareErrorKind::from_code(0), HardwareErrorKind::Unknown);
        assert_eq!(HardwareErrorKind::from_code(99), HardwareErrorKind::Unknown);
    }

    #[test]
    fn test_att_codes() {
        assert_eq!(
            HardwareErrorKind::from_att_code(0x05),
            HardwareErrorKind::AttAuthentication
        );
        assert_eq!(
            HardwareErrorKind::from_att_code(0x0F),
            HardwareErrorKind::AttEncryption
        );
        assert_eq!(HardwareErrorKind::from_att_code(0x0E), HardwareErrorKind::Att(0x0E));
        assert!(HardwareErrorKind::AttAuthorization.is_security());
        assert!(!HardwareErrorKind::ConnectionTimeout.is_security());
    }

    #[test]
    fn test_transient_errors_reconnect() {
        let timeout = TransportError::from(HardwareError::from_code(6, "timed out"));
        let hangup = TransportError::from(HardwareError::from_code(7, "peer hung up"));
        assert!(should_reconnect(&timeout));
        assert!(should_reconnect(&hangup));
        assert!(should_reconnect(&TransportError::link_lost("powered off")));
    }

    #[test]
    fn test_other_errors_do_not_reconnect() {
        for kind in HardwareErrorKind::iter() {
            if matches!(
                kind,
                HardwareErrorKind::ConnectionTimeout | HardwareErrorKind::PeripheralDisconnected
            ) {
                continue;
            }
            let err = TransportError::Hardware(HardwareError::new(kind, "x"));
            assert!(!should_reconnect(&err), "{kind} should not reconnect");
        }
        assert!(!should_reconnect(&TransportError::discovery("no service")));
        assert!(!should_reconnect(&TransportError::Cancelled));
        assert!(!should_reconnect(&TransportError::Busy));
        assert!(!should_reconnect(&TransportError::io("write")));
    }

    #[test]
    fn test_classification_is_stable() {
        for code in 0..20 {
            let err = TransportError::from(HardwareError::from_code(code, "x"));
            let first = should_reconnect(&err);
            for _ in 0..3 {
                assert_eq!(should_reconnect(&err), first);
            }
        }
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::from(HardwareError::from_code(6, "timed out"));
        assert_eq!(err.to_string(), "Hardware error: connection_timeout: timed out");
        assert_eq!(
            TransportError::Busy.to_string(),
            "Transport is busy: already connecting or connected"
        );
        assert!(TransportError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_security_errors() {
        let pairing = TransportError::from(HardwareError::from_code(14, "Peer removed pairing information"));
        let encryption = TransportError::from(HardwareError::new(
            HardwareErrorKind::from_att_code(0x0F),
            "Encryption is insufficient.",
        ));
        assert!(pairing.is_security());
        assert!(encryption.is_security());
        assert!(!TransportError::from(HardwareError::from_code(6, "timed out")).is_security());
        assert!(!TransportError::link_lost("gone").is_security());
    }
}
