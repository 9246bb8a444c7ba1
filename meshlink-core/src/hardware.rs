//! Boundary between the transport and the radio hardware.
//!
//! The Bluetooth stack is callback driven: a request such as "connect" or
//! "read" returns immediately and its outcome shows up later. [`RadioCentral`]
//! models the request half, [`HardwareEvent`] the callback half. Events are
//! delivered through a [`HardwareEventSink`] into the transport manager task,
//! which routes them to the connection they belong to.

use strum::{Display, EnumIter};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::device::{Device, DeviceId};
use crate::error::HardwareError;

/// Mesh radio GATT service
pub const MESH_SERVICE_UUID: Uuid = Uuid::from_u128(0x6ba1b218_15a8_461f_9fa8_5dcae273eafd);
/// Frames from the phone to the radio
pub const TORADIO_UUID: Uuid = Uuid::from_u128(0xf75c76d2_129e_4dad_a1dd_7866124401e7);
/// Frames from the radio to the phone, read until empty
pub const FROMRADIO_UUID: Uuid = Uuid::from_u128(0x2c55e69e_4993_11ed_b878_0242ac120002);
/// Notifies that FROMRADIO has frames waiting
pub const FROMNUM_UUID: Uuid = Uuid::from_u128(0xed9da18c_a800_4f66_a670_aa7547e34453);
/// Debug log records streamed by the radio firmware
pub const LOGRADIO_UUID: Uuid = Uuid::from_u128(0x5a3d6e49_06e6_4423_9944_e9de8cdf9547);

/// The sub-endpoints of the mesh service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum Endpoint {
    #[strum(serialize = "TORADIO")]
    ToRadio,
    #[strum(serialize = "FROMRADIO")]
    FromRadio,
    #[strum(serialize = "FROMNUM")]
    FromNum,
    #[strum(serialize = "LOGRADIO")]
    LogRadio,
}

impl Endpoint {
    pub fn uuid(&self) -> Uuid {
        match self {
            Endpoint::ToRadio => TORADIO_UUID,
            Endpoint::FromRadio => FROMRADIO_UUID,
            Endpoint::FromNum => FROMNUM_UUID,
            Endpoint::LogRadio => LOGRADIO_UUID,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        match uuid {
            TORADIO_UUID => Some(Endpoint::ToRadio),
            FROMRADIO_UUID => Some(Endpoint::FromRadio),
            FROMNUM_UUID => Some(Endpoint::FromNum),
            LOGRADIO_UUID => Some(Endpoint::LogRadio),
            _ => None,
        }
    }
}

/// What an endpoint advertises it can do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredEndpoint {
    pub endpoint: Endpoint,
    pub properties: EndpointProperties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Power/authorization state of the local Bluetooth stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "camelCase")]
pub enum StackState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

/// Link state of a peripheral handed back by the OS after an interruption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum RestoredLinkState {
    Connecting,
    Connected,
    Disconnected,
}

/// Outcome callbacks from the radio stack
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareEvent {
    StateChanged(StackState),
    Advertisement {
        id: DeviceId,
        name: Option<String>,
        rssi: i16,
    },
    Connected(DeviceId),
    ConnectFailed {
        id: DeviceId,
        error: Option<HardwareError>,
    },
    /// Unsolicited or requested link teardown; `error` is set when the stack
    /// reports a reason
    Disconnected {
        id: DeviceId,
        error: Option<HardwareError>,
    },
    /// Result of service discovery; `Ok(true)` when the mesh service is present
    ServicesDiscovered {
        id: DeviceId,
        result: Result<bool, HardwareError>,
    },
    EndpointsDiscovered {
        id: DeviceId,
        result: Result<Vec<DiscoveredEndpoint>, HardwareError>,
    },
    /// A read completed or a notification arrived
    ValueUpdated {
        id: DeviceId,
        endpoint: Endpoint,
        result: Result<Vec<u8>, HardwareError>,
    },
    WriteCompleted {
        id: DeviceId,
        result: Result<(), HardwareError>,
    },
    SignalRead {
        id: DeviceId,
        result: Result<i16, HardwareError>,
    },
    StateRestored {
        id: DeviceId,
        name: Option<String>,
        state: RestoredLinkState,
    },
}

impl HardwareEvent {
    /// The peripheral an event concerns, if any
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            HardwareEvent::StateChanged(_) => None,
            HardwareEvent::Advertisement { id, .. }
            | HardwareEvent::Connected(id)
            | HardwareEvent::ConnectFailed { id, .. }
            | HardwareEvent::Disconnected { id, .. }
            | HardwareEvent::ServicesDiscovered { id, .. }
            | HardwareEvent::EndpointsDiscovered { id, .. }
            | HardwareEvent::ValueUpdated { id, .. }
            | HardwareEvent::WriteCompleted { id, .. }
            | HardwareEvent::SignalRead { id, .. }
            | HardwareEvent::StateRestored { id, .. } => Some(id),
        }
    }
}

/// Where a backend posts its callbacks
#[derive(Debug, Clone)]
pub struct HardwareEventSink {
    tx: mpsc::UnboundedSender<HardwareEvent>,
}

impl HardwareEventSink {
    pub fn new(tx: mpsc::UnboundedSender<HardwareEvent>) -> Self {
        Self { tx }
    }

    /// Deliver an event. Returns false once the transport has shut down.
    pub fn emit(&self, event: HardwareEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Requests understood by a radio hardware backend.
///
/// Every call must return without waiting on the radio; results are reported
/// later through the sink passed to [`RadioCentral::start`].
pub trait RadioCentral: Send + Sync + 'static {
    /// Bring up the stack. The backend reports readiness with
    /// `StateChanged(PoweredOn)` (or why it cannot).
    fn start(&self, sink: HardwareEventSink);

    /// Scan for radios advertising the mesh service. Duplicate
    /// advertisements must be reported so signal strength stays current.
    fn scan(&self);

    fn stop_scan(&self);

    fn connect(&self, id: &DeviceId);

    /// Abort a pending connect or drop an established link
    fn cancel_connect(&self, id: &DeviceId);

    fn discover_services(&self, id: &DeviceId);

    fn discover_endpoints(&self, id: &DeviceId);

    fn set_notify(&self, id: &DeviceId, endpoint: Endpoint, enabled: bool);

    /// With `WriteMode::WithResponse` the backend must report a
    /// `WriteCompleted`; without response it must not.
    fn write(&self, id: &DeviceId, data: Vec<u8>, mode: WriteMode);

    fn read(&self, id: &DeviceId, endpoint: Endpoint);

    fn read_signal(&self, id: &DeviceId);

    /// Whether radios can be addressed by a typed-in string
    fn supports_manual_connection(&self) -> bool {
        false
    }

    fn device_for_manual_connection(&self, _address: &str) -> Option<Device> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_endpoint_uuid_round_trip() {
        for endpoint in Endpoint::iter() {
            assert_eq!(Endpoint::from_uuid(endpoint.uuid()), Some(endpoint));
        }
        assert_eq!(Endpoint::from_uuid(MESH_SERVICE_UUID), None);
    }

    #[test]
    fn test_endpoint_names() {
        assert_eq!(Endpoint::ToRadio.to_string(), "TORADIO");
        assert_eq!(Endpoint::LogRadio.to_string(), "LOGRADIO");
        assert_eq!(StackState::PoweredOff.to_string(), "poweredOff");
    }

    #[test]
    fn test_sink_reports_closed_transport() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = HardwareEventSink::new(tx);
        assert!(sink.emit(HardwareEvent::StateChanged(StackState::PoweredOn)));
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.emit(HardwareEvent::Connected("a".into())));
    }

    #[test]
    fn test_event_device_id() {
        let event = HardwareEvent::WriteCompleted {
            id: "a".into(),
            result: Ok(()),
        };
        assert_eq!(event.device_id().map(DeviceId::as_str), Some("a"));
        assert!(HardwareEvent::StateChanged(StackState::Unknown).device_id().is_none());
    }
}
