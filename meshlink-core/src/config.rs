use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing knobs for discovery and connection liveness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// A device not re-advertised for this long is evicted from the registry
    #[serde(with = "humantime_duration")]
    pub eviction_after: Duration,
    /// How often the registry is swept for stale devices
    #[serde(with = "humantime_duration")]
    pub cleanup_interval: Duration,
    /// How often an active connection polls the signal strength
    #[serde(with = "humantime_duration")]
    pub signal_poll_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            eviction_after: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(15),
            signal_poll_interval: Duration::from_secs(10),
        }
    }
}

impl LinkConfig {
    pub fn with_signal_poll_interval(mut self, interval: Duration) -> Self {
        self.signal_poll_interval = interval;
        self
    }

    pub fn with_eviction(mut self, eviction_after: Duration, cleanup_interval: Duration) -> Self {
        self.eviction_after = eviction_after;
        self.cleanup_interval = cleanup_interval;
        self
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.eviction_after, Duration::from_secs(30));
        assert_eq!(config.cleanup_interval, Duration::from_secs(15));
        assert_eq!(config.signal_poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_deserialize_humantime() -> Result<()> {
        let config: LinkConfig =
            serde_json::from_str(r#"{"eviction_after": "1m", "signal_poll_interval": "500ms"}"#)?;
        assert_eq!(config.eviction_after, Duration::from_secs(60));
        assert_eq!(config.signal_poll_interval, Duration::from_millis(500));
        // Missing fields keep their defaults
        assert_eq!(config.cleanup_interval, Duration::from_secs(15));
        Ok(())
    }

    #[test]
    fn test_serialize_humantime() -> Result<()> {
        let json = serde_json::to_value(LinkConfig::default())?;
        assert_eq!(json["eviction_after"], "30s");
        assert_eq!(json["signal_poll_interval"], "10s");
        Ok(())
    }

    #[test]
    fn test_rejects_garbage_duration() {
        let result: Result<LinkConfig, _> = serde_json::from_str(r#"{"eviction_after": "soon"}"#);
        assert!(result.is_err());
    }
}
