//! Typed failures of the tunnel contract
//!
//! `TunnelError` is serializable so a failure raised by the registry reaches
//! the client intact whatever transport carries the call.

use crate::messages::{ConnectionId, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for tunnel calls
pub type TunnelResult<T> = Result<T, TunnelError>;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum TunnelError {
    #[error("Authentication failed for user {username}")]
    Authentication { username: String },

    #[error("Unknown session: {session_id}")]
    UnknownSession { session_id: SessionId },

    #[error("Unknown connection {connection_id} in session {session_id}")]
    UnknownConnection {
        session_id: SessionId,
        connection_id: ConnectionId,
    },

    #[error("Target {target} unreachable: {reason}")]
    TargetUnreachable { target: String, reason: String },

    #[error("Connection {connection_id} is closed")]
    ConnectionClosed { connection_id: ConnectionId },

    #[error("Buffer full for connection {connection_id} ({queued} bytes queued)")]
    BufferFull {
        connection_id: ConnectionId,
        queued: usize,
    },

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Tunnel service unavailable")]
    Unavailable,

    /// The call may have reached the service; its effect is unknown
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The call never left the caller, so repeating it is safe
    #[error("Request not sent: {message}")]
    NotSent { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },
}

impl TunnelError {
    pub fn unknown_session(session_id: &str) -> Self {
        TunnelError::UnknownSession {
            session_id: session_id.to_string(),
        }
    }

    pub fn unknown_connection(session_id: &str, connection_id: ConnectionId) -> Self {
        TunnelError::UnknownConnection {
            session_id: session_id.to_string(),
            connection_id,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        TunnelError::Transport {
            message: message.into(),
        }
    }

    pub fn not_sent(message: impl Into<String>) -> Self {
        TunnelError::NotSent {
            message: message.into(),
        }
    }

    /// Stable machine-readable code, matches the serialized `code` tag
    pub fn code(&self) -> &'static str {
        match self {
            TunnelError::Authentication { .. } => "authentication",
            TunnelError::UnknownSession { .. } => "unknown_session",
            TunnelError::UnknownConnection { .. } => "unknown_connection",
            TunnelError::TargetUnreachable { .. } => "target_unreachable",
            TunnelError::ConnectionClosed { .. } => "connection_closed",
            TunnelError::BufferFull { .. } => "buffer_full",
            TunnelError::PermissionDenied { .. } => "permission_denied",
            TunnelError::Unavailable => "unavailable",
            TunnelError::Transport { .. } => "transport",
            TunnelError::NotSent { .. } => "not_sent",
            TunnelError::Protocol { .. } => "protocol",
        }
    }

    /// Failures the caller should retry after a short delay
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TunnelError::BufferFull { .. }
                | TunnelError::Transport { .. }
                | TunnelError::NotSent { .. }
        )
    }

    /// Failures after which a Read or Write may be repeated without losing or
    /// duplicating bytes
    ///
    /// A `Transport` failure is excluded: the service may already have
    /// drained or queued the payload.
    pub fn is_safe_to_repeat(&self) -> bool {
        matches!(
            self,
            TunnelError::BufferFull { .. } | TunnelError::NotSent { .. }
        )
    }

    /// Failures meaning the logical connection is gone for good
    pub fn ends_connection(&self) -> bool {
        matches!(
            self,
            TunnelError::UnknownSession { .. }
                | TunnelError::UnknownConnection { .. }
                | TunnelError::ConnectionClosed { .. }
                | TunnelError::Unavailable
        )
    }
}
