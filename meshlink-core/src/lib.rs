//! Core library for talking to Meshtastic radios over Bluetooth LE
//!
//! This crate provides the transport connection manager: discovery of nearby
//! radios, a single session with one of them, and the framing of the radio's
//! notify-then-read protocol into an ordered stream of opaque frames.
//! Decoding those frames is left to the caller.

#[cfg(feature = "bluetooth")]
pub mod bluetooth;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod events;
pub mod hardware;
pub mod registry;
pub mod state;

// Re-export commonly used types
pub use config::LinkConfig;
pub use connection::{Connection, LogFormatter, RestoredConnection, TransportManager};
pub use device::{Device, DeviceId, DiscoveryEvent};
pub use error::{HardwareError, HardwareErrorKind, TransportError, should_reconnect};
pub use events::{ConnectionEvent, ConnectionEvents, EventStream};
pub use hardware::{HardwareEvent, HardwareEventSink, RadioCentral, StackState};
pub use state::{ConnectionState, TransportStatus};

pub type Result<T> = std::result::Result<T, TransportError>;
