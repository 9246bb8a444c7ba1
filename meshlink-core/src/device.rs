use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a remote radio as reported by the Bluetooth stack
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A radio seen advertising nearby
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// Last known signal strength in dBm
    pub rssi: i16,
    pub discovered_at: DateTime<Utc>,
    /// Set when the OS handed the link back after an interruption
    pub was_restored: bool,
}

impl Device {
    pub fn new(id: impl Into<DeviceId>, name: impl Into<String>, rssi: i16) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rssi,
            discovered_at: Utc::now(),
            was_restored: false,
        }
    }

    pub fn restored(id: impl Into<DeviceId>, name: impl Into<String>) -> Self {
        Self {
            was_restored: true,
            ..Self::new(id, name, 0)
        }
    }

    /// Case-insensitive match against either the identifier or the advertised name
    pub fn matches(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.id.as_str().to_lowercase() == needle || self.name.to_lowercase().contains(&needle)
    }
}

/// Change in the set of visible radios
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    Found(Device),
    Lost(DeviceId),
    SignalUpdated(DeviceId, i16),
}

impl DiscoveryEvent {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            DiscoveryEvent::Found(device) => &device.id,
            DiscoveryEvent::Lost(id) | DiscoveryEvent::SignalUpdated(id, _) => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_matches_name_and_id() {
        let device = Device::new("AA:BB", "Meshtastic_1a2b", -60);
        assert!(device.matches("aa:bb"));
        assert!(device.matches("1A2B"));
        assert!(!device.matches("radio-b"));
    }

    #[test]
    fn test_restored_device() {
        let device = Device::restored("id-1", "Radio-A");
        assert!(device.was_restored);
        assert_eq!(device.rssi, 0);
    }

    #[test]
    fn test_discovery_event_serialization() {
        let event = DiscoveryEvent::SignalUpdated(DeviceId::new("id-1"), -70);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "signal_updated");
        assert_eq!(event.device_id().as_str(), "id-1");
    }
}
