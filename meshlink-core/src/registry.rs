//! In-memory table of radios currently advertising nearby

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::device::{Device, DeviceId, DiscoveryEvent};

struct Entry {
    device: Device,
    last_seen: Instant,
}

/// Visible devices keyed by identifier, each stamped with when it was last heard.
///
/// Owned by the transport manager task, which serialises the advertisement
/// handler and the periodic sweep.
pub struct DeviceRegistry {
    entries: HashMap<DeviceId, Entry>,
    eviction_after: Duration,
}

impl DeviceRegistry {
    pub fn new(eviction_after: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            eviction_after,
        }
    }

    /// Record an advertisement. A first sighting yields `Found`, a repeat
    /// sighting refreshes the entry and yields `SignalUpdated`.
    pub fn observe(
        &mut self,
        id: DeviceId,
        name: Option<String>,
        rssi: i16,
        now: Instant,
    ) -> DiscoveryEvent {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.last_seen = now;
                entry.device.rssi = rssi;
                if let Some(name) = name {
                    entry.device.name = name;
                }
                DiscoveryEvent::SignalUpdated(id, rssi)
            }
            None => {
                let device = Device::new(id.clone(), name.unwrap_or_else(|| "Unknown".into()), rssi);
                self.entries.insert(
                    id,
                    Entry {
                        device: device.clone(),
                        last_seen: now,
                    },
                );
                DiscoveryEvent::Found(device)
            }
        }
    }

    /// Insert a device without going through an advertisement (state restore)
    pub fn insert(&mut self, device: Device, now: Instant) {
        self.entries.insert(
            device.id.clone(),
            Entry {
                device,
                last_seen: now,
            },
        );
    }

    /// Remove every device silent for longer than the eviction threshold and
    /// return their identifiers.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<DeviceId> {
        let stale: Vec<DeviceId> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) > self.eviction_after)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            self.entries.remove(id);
        }
        stale
    }

    pub fn remove(&mut self, id: &DeviceId) -> Option<Device> {
        self.entries.remove(id).map(|entry| entry.device)
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.entries.get(id).map(|entry| &entry.device)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.entries.values().map(|e| e.device.clone()).collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Duration::from_secs(30))
    }

    #[test]
    fn test_first_sighting_is_found() {
        let mut registry = registry();
        let event = registry.observe("a".into(), Some("Radio-A".into()), -60, Instant::now());
        match event {
            DiscoveryEvent::Found(device) => {
                assert_eq!(device.name, "Radio-A");
                assert_eq!(device.rssi, -60);
            }
            other => panic!("expected Found, got {other:?}"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_repeat_sighting_only_updates_signal() {
        let mut registry = registry();
        let now = Instant::now();
        registry.observe("a".into(), Some("Radio-A".into()), -60, now);
        let event = registry.observe("a".into(), None, -72, now + Duration::from_secs(5));
        assert_eq!(event, DiscoveryEvent::SignalUpdated("a".into(), -72));
        let device = registry.get(&"a".into()).cloned();
        assert_eq!(device.map(|d| (d.name, d.rssi)), Some(("Radio-A".into(), -72)));
    }

    #[test]
    fn test_unnamed_device() {
        let mut registry = registry();
        registry.observe("a".into(), None, -60, Instant::now());
        assert_eq!(registry.get(&"a".into()).map(|d| d.name.as_str()), Some("Unknown"));
    }

    #[test]
    fn test_evicts_only_silent_devices() {
        let mut registry = registry();
        let start = Instant::now();
        registry.observe("a".into(), None, -60, start);
        registry.observe("b".into(), None, -60, start);
        registry.observe("b".into(), None, -61, start + Duration::from_secs(20));

        // Exactly at the threshold nothing is evicted
        assert!(registry.evict_stale(start + Duration::from_secs(30)).is_empty());

        let evicted = registry.evict_stale(start + Duration::from_secs(31));
        assert_eq!(evicted, vec![DeviceId::from("a")]);
        assert!(!registry.contains(&"a".into()));
        assert!(registry.contains(&"b".into()));

        // Already evicted devices are not reported twice
        let evicted = registry.evict_stale(start + Duration::from_secs(51));
        assert_eq!(evicted, vec![DeviceId::from("b")]);
        assert!(registry.evict_stale(start + Duration::from_secs(90)).is_empty());
    }

    #[test]
    fn test_clear_and_remove() {
        let mut registry = registry();
        let now = Instant::now();
        registry.observe("a".into(), None, -60, now);
        registry.insert(Device::restored("b", "Radio-B"), now);
        assert_eq!(registry.devices().len(), 2);
        assert!(registry.remove(&"b".into()).is_some_and(|d| d.was_restored));
        registry.clear();
        assert!(registry.is_empty());
    }
}
