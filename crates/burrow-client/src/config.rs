//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One local port forwarded to a remote target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortForward {
    /// Label used in logs and status output
    pub name: String,
    pub local_port: u16,
    /// Listen on all interfaces instead of loopback only
    #[serde(default)]
    pub shared: bool,
    /// Remote endpoint in "host:port" format, resolved by the server
    pub target: String,
}

impl PortForward {
    pub fn new(name: &str, local_port: u16, target: &str) -> Self {
        Self {
            name: name.to_string(),
            local_port,
            shared: false,
            target: target.to_string(),
        }
    }

    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the tunnel API, e.g. `http://relay.example.com:8080`
    pub server_url: String,
    pub username: String,
    pub password: String,
    pub forwards: Vec<PortForward>,
    /// Wait between empty Read polls and BufferFull retries
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Bounded wait of one accept attempt; upper bound on listener stop latency
    #[serde(with = "duration_millis")]
    pub accept_poll_interval: Duration,
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,
    /// Consecutive unsent Read or Write calls tolerated before a pump gives up
    pub max_transport_retries: u32,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            username: String::new(),
            password: String::new(),
            forwards: Vec::new(),
            poll_interval: Duration::from_millis(50),
            accept_poll_interval: Duration::from_millis(50),
            keepalive_interval: Duration::from_secs(30),
            max_transport_retries: 3,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn server_url(mut self, url: &str) -> Self {
        self.config.server_url = url.to_string();
        self
    }

    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.config.username = username.to_string();
        self.config.password = password.to_string();
        self
    }

    pub fn forward(mut self, forward: PortForward) -> Self {
        self.config.forwards.push(forward);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn accept_poll_interval(mut self, interval: Duration) -> Self {
        self.config.accept_poll_interval = interval;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    pub fn max_transport_retries(mut self, retries: u32) -> Self {
        self.config.max_transport_retries = retries;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ClientConfig, String> {
        if self.config.username.is_empty() {
            return Err("username is required".to_string());
        }
        if self.config.forwards.is_empty() {
            return Err("at least one forward must be configured".to_string());
        }
        if self.config.poll_interval.is_zero() || self.config.accept_poll_interval.is_zero() {
            return Err("poll intervals must be non-zero".to_string());
        }
        Ok(self.config)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::builder()
            .server_url("http://relay:8080")
            .credentials("alice", "pw")
            .forward(PortForward::new("db", 15432, "db.internal:5432"))
            .build()
            .unwrap();

        assert_eq!(config.username, "alice");
        assert_eq!(config.forwards.len(), 1);
        assert!(!config.forwards[0].shared);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_config_builder_no_forwards() {
        let result = ClientConfig::builder().credentials("alice", "pw").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_config_builder_missing_username() {
        let result = ClientConfig::builder()
            .forward(PortForward::new("web", 8000, "web:80"))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_config_from_yaml_uses_defaults() {
        let yaml = r#"
server_url: http://relay:8080
username: alice
password: pw
poll_interval: 20
forwards:
  - name: web
    local_port: 8000
    target: intranet.local:80
  - name: ssh
    local_port: 2222
    shared: true
    target: bastion:22
"#;
        let config: ClientConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.accept_poll_interval, Duration::from_millis(50));
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.forwards[1], PortForward::new("ssh", 2222, "bastion:22").shared());
    }
}
