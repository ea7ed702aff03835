//! The remote tunnel service contract
//!
//! One method per remote call. The registry implements it in-process, the
//! HTTP transport implements it over the network; everything on the client
//! side is written against `Arc<dyn TunnelService>`.

use crate::error::TunnelResult;
use crate::messages::{ConnectionId, ReadResponse, SessionId, SessionInfo, VersionInfo};
use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait TunnelService: Send + Sync {
    /// Authenticate and open a session
    async fn login(&self, username: &str, password: &str) -> TunnelResult<SessionId>;

    /// Close the session and every connection it owns
    async fn logout(&self, session_id: &str) -> TunnelResult<()>;

    /// Server and protocol version
    async fn version(&self) -> TunnelResult<VersionInfo>;

    /// Liveness check
    async fn ping(&self) -> TunnelResult<()>;

    /// Open a logical connection towards `target` ("host:port")
    async fn connect(&self, session_id: &str, target: &str) -> TunnelResult<ConnectionId>;

    /// Tear down a logical connection
    async fn disconnect(&self, session_id: &str, connection_id: ConnectionId) -> TunnelResult<()>;

    /// Drain bytes queued for the client, never blocks on socket I/O
    async fn read(&self, session_id: &str, connection_id: ConnectionId)
        -> TunnelResult<ReadResponse>;

    /// Queue bytes for the target socket
    async fn write(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
        data: Bytes,
    ) -> TunnelResult<()>;

    /// Snapshot of sessions visible to the caller
    async fn monitor(&self, session_id: &str) -> TunnelResult<Vec<SessionInfo>>;

    /// Forced teardown of a session
    async fn kill_session(&self, session_id: &str, target_session_id: &str) -> TunnelResult<()>;

    /// Forced teardown of a connection in any session
    async fn kill_connection(
        &self,
        session_id: &str,
        target_session_id: &str,
        connection_id: ConnectionId,
    ) -> TunnelResult<()>;
}
