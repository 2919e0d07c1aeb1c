//! Runtime configuration of the per-connection subtree.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use twinbridge_mapping::MapperLimits;

/// Reconnection and handle-recreation backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Factor applied to the delay after each consecutive failure.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            multiplier: 2.0,
        }
    }
}

/// Configuration of the per-connection runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectivityConfig {
    /// Limits on mapper fan-out.
    pub mapper_limits: MapperLimitsConfig,
    /// Bound of the per-stream inbound buffer.
    pub source_buffer_size: usize,
    /// Backoff for publish-handle recreation and reconnects.
    pub backoff: BackoffConfig,
    /// How long to wait for the publisher readiness probe.
    #[serde(with = "duration_millis")]
    pub publisher_ready_timeout: Duration,
    /// How long to wait for consumer streams to terminate on close.
    #[serde(with = "duration_millis")]
    pub stream_termination_timeout: Duration,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            mapper_limits: MapperLimitsConfig::default(),
            source_buffer_size: 100,
            backoff: BackoffConfig::default(),
            publisher_ready_timeout: Duration::from_secs(1),
            stream_termination_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectivityConfig {
    /// The mapper limits as the mapping crate consumes them.
    #[must_use]
    pub fn mapper_limits(&self) -> MapperLimits {
        MapperLimits {
            max_mapped_inbound_messages: self.mapper_limits.max_mapped_inbound_messages,
            max_mapped_outbound_messages: self.mapper_limits.max_mapped_outbound_messages,
        }
    }
}

/// Serde form of [`MapperLimits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MapperLimitsConfig {
    /// Maximum signals one inbound message may map to.
    pub max_mapped_inbound_messages: usize,
    /// Maximum external messages one signal may map to.
    pub max_mapped_outbound_messages: usize,
}

impl Default for MapperLimitsConfig {
    fn default() -> Self {
        let defaults = MapperLimits::default();
        Self {
            max_mapped_inbound_messages: defaults.max_mapped_inbound_messages,
            max_mapped_outbound_messages: defaults.max_mapped_outbound_messages,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectivityConfig::default();
        assert_eq!(config.backoff.initial_delay, Duration::from_secs(1));
        assert_eq!(config.source_buffer_size, 100);
        assert_eq!(config.publisher_ready_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = ConnectivityConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ConnectivityConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let parsed: ConnectivityConfig =
            serde_json::from_str(r#"{"sourceBufferSize": 7}"#).unwrap();
        assert_eq!(parsed.source_buffer_size, 7);
        assert_eq!(parsed.backoff, BackoffConfig::default());
    }
}
