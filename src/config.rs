//! Buffer configuration.
//! Option names follow the camelCase keys used by the host application so a
//! JSON settings blob can be deserialized directly.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BufferError, Result};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BufferConfig {
    /// Number of payload values per record.
    pub record_data_size: usize,
    /// Store a wall-clock timestamp after the mediatime column.
    pub write_timestamp: bool,
    /// Replicate a record into skipped frames.
    pub fill: bool,
    pub chunk_length: usize,
    /// Seconds between scheduler passes.
    pub persist_interval: f64,
    /// Seconds a chunk must stay untouched before it may be queued.
    pub stabilization_threshold: f64,
    /// Queue depth above which the error callback is warned.
    pub backpressure_threshold: usize,
    /// Seconds a background drain may take before it is reported as too slow.
    pub drain_timeout: f64,
    /// `false` builds a no-op buffer.
    pub enabled: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            record_data_size: 1,
            write_timestamp: false,
            fill: true,
            chunk_length: 1000,
            persist_interval: 5.0,
            stabilization_threshold: 2.0,
            backpressure_threshold: 8,
            drain_timeout: 10.0,
            enabled: true,
        }
    }
}

impl BufferConfig {
    /// Load configuration from a JSON file. Missing keys take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BufferError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: BufferConfig = serde_json::from_str(content)
            .map_err(|e| BufferError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_length == 0 {
            return Err(BufferError::InvalidConfig("chunkLength must be > 0".into()));
        }
        if self.record_data_size == 0 {
            return Err(BufferError::InvalidConfig("recordDataSize must be > 0".into()));
        }
        for (name, secs) in [
            ("persistInterval", self.persist_interval),
            ("drainTimeout", self.drain_timeout),
        ] {
            check_seconds(name, secs)?;
            if secs == 0.0 {
                return Err(BufferError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        check_seconds("stabilizationThreshold", self.stabilization_threshold)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs_f64(self.persist_interval)
    }

    pub fn stabilization_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.stabilization_threshold)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.drain_timeout)
    }
}

/// Connection settings for the HTTP delivery transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpTransportConfig {
    /// Resource URL; chunks are POSTed here and the bundle is fetched with GET.
    pub endpoint: String,
    /// Per-request timeout in seconds.
    pub request_timeout: f64,
}

impl HttpTransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(BufferError::InvalidConfig("endpoint must not be empty".into()));
        }
        check_seconds("requestTimeout", self.request_timeout)?;
        if self.request_timeout == 0.0 {
            return Err(BufferError::InvalidConfig("requestTimeout must be > 0".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout)
    }
}

/// Rejects negative, NaN and out-of-range second counts.
fn check_seconds(name: &str, secs: f64) -> Result<()> {
    Duration::try_from_secs_f64(secs).map(|_| ()).map_err(|_| {
        BufferError::InvalidConfig(format!("{name} must be a non-negative number of seconds, got {secs}"))
    })
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/buffer".into(),
            request_timeout: 30.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_case_keys_override_defaults() {
        let config = BufferConfig::from_json(
            r#"{"recordDataSize": 3, "writeTimestamp": true, "chunkLength": 100}"#,
        )
        .unwrap();
        assert_eq!(config.record_data_size, 3);
        assert!(config.write_timestamp);
        assert_eq!(config.chunk_length, 100);
        assert!(config.fill);
    }

    #[test]
    fn zero_chunk_length_is_rejected() {
        let err = BufferConfig::from_json(r#"{"chunkLength": 0}"#).unwrap_err();
        assert!(matches!(err, BufferError::InvalidConfig(_)));
    }

    #[test]
    fn negative_interval_is_rejected() {
        let config = BufferConfig {
            persist_interval: -1.0,
            ..BufferConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unrepresentable_durations_are_rejected() {
        for bad in [f64::NAN, f64::INFINITY, 1e300] {
            let config = BufferConfig {
                stabilization_threshold: bad,
                ..BufferConfig::default()
            };
            assert!(matches!(config.validate(), Err(BufferError::InvalidConfig(_))), "{bad}");
        }
        let zero = BufferConfig {
            drain_timeout: 0.0,
            ..BufferConfig::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn http_config_rejects_bad_timeouts() {
        for raw in [r#"{"requestTimeout": -1}"#, r#"{"requestTimeout": 0}"#, r#"{"endpoint": ""}"#] {
            let config: HttpTransportConfig = serde_json::from_str(raw).unwrap();
            assert!(matches!(config.validate(), Err(BufferError::InvalidConfig(_))), "{raw}");
        }
        let config: HttpTransportConfig = serde_json::from_str(r#"{"requestTimeout": 2.5}"#).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn durations_convert_from_seconds() {
        let config = BufferConfig {
            persist_interval: 0.5,
            ..BufferConfig::default()
        };
        assert_eq!(config.persist_interval(), Duration::from_millis(500));
    }
}
