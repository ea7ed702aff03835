//! Protocol message types

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque session token handed out by Login
pub type SessionId = String;

/// Connection identifier, unique within its owning session
pub type ConnectionId = u32;

/// Lifecycle of a logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Target socket is being opened
    Establishing,
    /// Data flows in both directions
    Open,
    /// Either side signalled end-of-stream or failed; buffered data may remain
    Closing,
    /// Torn down, real socket released
    Closed,
}

impl ConnectionState {
    /// True once the connection no longer accepts writes
    pub fn is_closing(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Establishing => "establishing",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginResponse {
    pub session_id: SessionId,
}

/// Body of calls that only carry the caller's session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRequest {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectRequest {
    pub session_id: SessionId,
    /// Remote endpoint in "host:port" format
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectResponse {
    pub connection_id: ConnectionId,
}

/// Body of calls scoped to one logical connection (Disconnect, Read)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionRequest {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WriteRequest {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
}

/// Result of a Read call
///
/// `data` may be empty while the connection is still open. `end_of_stream`
/// is set once the remote side has finished and every queued byte has been
/// handed out (it may accompany the final chunk).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReadResponse {
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
    pub end_of_stream: bool,
}

impl ReadResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn eof() -> Self {
        Self {
            data: Bytes::new(),
            end_of_stream: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionInfo {
    /// Server crate version
    pub version: String,
    /// Wire protocol version
    pub protocol: u32,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            version: crate::VERSION.to_string(),
            protocol: crate::PROTOCOL_VERSION,
        }
    }
}

/// Administrative request to tear down another session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KillSessionRequest {
    /// Caller's own session
    pub session_id: SessionId,
    pub target_session_id: SessionId,
}

/// Administrative request to tear down a connection of any session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KillConnectionRequest {
    /// Caller's own session
    pub session_id: SessionId,
    pub target_session_id: SessionId,
    pub connection_id: ConnectionId,
}

/// Snapshot of one logical connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub target: String,
    /// Local address of the socket opened towards the target, once connected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_addr: Option<String>,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Bytes delivered to the client through Read
    pub bytes_read: u64,
    /// Bytes accepted from the client through Write
    pub bytes_written: u64,
}

/// Snapshot of one session and its connections
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub owner: String,
    pub admin: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub connections: Vec<ConnectionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorResponse {
    pub sessions: Vec<SessionInfo>,
}

/// Serde helper carrying raw bytes as base64 text
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_request_carries_base64() {
        let req = WriteRequest {
            session_id: "s1".to_string(),
            connection_id: 7,
            data: Bytes::from_static(b"GET / HTTP/1.0\r\n\r\n"),
        };

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["data"], "R0VUIC8gSFRUUC8xLjANCg0K");

        let parsed: WriteRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_read_response_rejects_invalid_base64() {
        let result: Result<ReadResponse, _> =
            serde_json::from_str(r#"{"data":"not base64!!","end_of_stream":false}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_connection_state_is_closing() {
        assert!(!ConnectionState::Establishing.is_closing());
        assert!(!ConnectionState::Open.is_closing());
        assert!(ConnectionState::Closing.is_closing());
        assert!(ConnectionState::Closed.is_closing());
    }

    #[test]
    fn test_connection_state_serializes_lowercase() {
        let json = serde_json::to_string(&ConnectionState::Closing).unwrap();
        assert_eq!(json, "\"closing\"");
        assert_eq!(ConnectionState::Open.to_string(), "open");
    }

    #[test]
    fn test_version_info_current() {
        let info = VersionInfo::current();
        assert_eq!(info.protocol, crate::PROTOCOL_VERSION);
        assert!(!info.version.is_empty());
    }
}
