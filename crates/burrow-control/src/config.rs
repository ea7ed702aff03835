//! Registry configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the tunnel registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Sessions without any call for this long are reaped
    #[serde(with = "duration_secs")]
    pub session_timeout: Duration,
    /// Connections without Read/Write for this long are reaped
    #[serde(with = "duration_secs")]
    pub connection_timeout: Duration,
    /// Period of the idle sweep
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
    /// Upper bound on opening the target socket during Connect
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Time a torn-down connection gets to flush already accepted bytes
    #[serde(with = "duration_secs")]
    pub close_linger: Duration,
    /// Per-direction buffer ceiling in bytes
    pub buffer_capacity: usize,
    /// Maximum bytes returned by one Read
    pub read_chunk_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(12 * 60 * 60),
            connection_timeout: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            close_linger: Duration::from_secs(2),
            buffer_capacity: burrow_proto::DEFAULT_BUFFER_CAPACITY,
            read_chunk_size: burrow_proto::DEFAULT_READ_CHUNK,
        }
    }
}

impl RegistryConfig {
    /// Reject settings the registry cannot run with
    ///
    /// A zero sweep interval would stop the sweeper and a zero chunk size
    /// would keep Read from ever draining.
    pub fn validate(&self) -> Result<(), String> {
        if self.sweep_interval.is_zero() {
            return Err("sweep_interval must be non-zero".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("connect_timeout must be non-zero".to_string());
        }
        if self.buffer_capacity == 0 {
            return Err("buffer_capacity must be non-zero".to_string());
        }
        if self.read_chunk_size == 0 {
            return Err("read_chunk_size must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Durations written as whole seconds in config files
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
