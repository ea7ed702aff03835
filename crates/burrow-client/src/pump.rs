//! Bridges one accepted local socket to a logical connection
//!
//! After Connect, two tasks run side by side. Egress reads the local socket
//! and issues Write calls; ingress polls Read and writes what comes back to
//! the local socket. Whichever finishes first disconnects the logical
//! connection and cancels the other.

use crate::session::ClientSession;
use burrow_proto::{ConnectionId, SessionId, TunnelError, TunnelService};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Local socket read size of the egress loop
const EGRESS_CHUNK: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct PumpSettings {
    pub poll_interval: Duration,
    pub max_transport_retries: u32,
}

impl From<&crate::config::ClientConfig> for PumpSettings {
    fn from(config: &crate::config::ClientConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            max_transport_retries: config.max_transport_retries,
        }
    }
}

pub struct ConnectionPump {
    session: Arc<ClientSession>,
    target: String,
    settings: PumpSettings,
    state: Mutex<PumpState>,
    /// Cancelled when either loop starts closing
    closing: CancellationToken,
    disconnected: AtomicBool,
}

/// Ids of the logical connection a pump is bound to
#[derive(Debug, Clone)]
struct Link {
    session_id: SessionId,
    connection_id: ConnectionId,
}

impl ConnectionPump {
    pub fn new(session: Arc<ClientSession>, target: &str, settings: PumpSettings) -> Arc<Self> {
        Arc::new(Self {
            session,
            target: target.to_string(),
            settings,
            state: Mutex::new(PumpState::Connecting),
            closing: CancellationToken::new(),
            disconnected: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> PumpState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PumpState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn service(&self) -> &Arc<dyn TunnelService> {
        self.session.service()
    }

    /// Connect and pump until either side closes
    ///
    /// A failed Connect drops `socket` right away, which is how the local
    /// application learns the target could not be reached.
    pub async fn run(self: Arc<Self>, socket: TcpStream) -> Result<(), TunnelError> {
        let peer = socket
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let (session_id, connection_id) = match self.session.connect(&self.target).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Could not open tunnel from {} to {}: {}", peer, self.target, e);
                self.set_state(PumpState::Closed);
                return Err(e);
            }
        };
        let link = Link {
            session_id,
            connection_id,
        };
        self.set_state(PumpState::Open);
        info!(
            connection_id = connection_id,
            "Tunnel open: {} -> {}",
            peer,
            self.target
        );

        if let Err(e) = socket.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let (reader, writer) = socket.into_split();

        let egress = tokio::spawn(self.clone().egress(link.clone(), reader));
        let ingress = tokio::spawn(self.clone().ingress(link.clone(), writer));
        let _ = tokio::join!(egress, ingress);

        // Covers a loop that panicked before closing
        self.begin_closing(&link, "pump finished").await;
        debug!(connection_id = connection_id, "Tunnel closed: {}", peer);
        Ok(())
    }

    /// Disconnect the logical connection once and stop the other loop
    async fn begin_closing(&self, link: &Link, reason: &str) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(PumpState::Closing);
        self.closing.cancel();
        debug!(
            connection_id = link.connection_id,
            reason = reason,
            "Closing tunnel to {}",
            self.target
        );

        match self
            .service()
            .disconnect(&link.session_id, link.connection_id)
            .await
        {
            Ok(()) => {}
            Err(e) if e.ends_connection() => {}
            Err(e) => warn!(
                connection_id = link.connection_id,
                "Disconnect failed: {}", e
            ),
        }
        self.set_state(PumpState::Closed);
    }

    /// Sleep for `duration` unless closing starts first; false if closing
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.closing.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn egress(self: Arc<Self>, link: Link, mut reader: OwnedReadHalf) {
        let mut buffer = vec![0u8; EGRESS_CHUNK];

        let reason = loop {
            let result = tokio::select! {
                _ = self.closing.cancelled() => return,
                result = reader.read(&mut buffer) => result,
            };

            match result {
                Ok(0) => break "local socket closed",
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buffer[..n]);
                    if !self.write_with_retry(&link, chunk).await {
                        break "write failed";
                    }
                }
                Err(e) => {
                    debug!("Local socket read error: {}", e);
                    break "local socket error";
                }
            }
        };

        self.begin_closing(&link, reason).await;
    }

    /// Deliver one chunk, retrying backpressure and calls that never left
    ///
    /// A Write whose outcome is unknown is not repeated, since the service may
    /// already hold the chunk. Returns false once the connection is gone or
    /// retries are exhausted.
    async fn write_with_retry(&self, link: &Link, data: Bytes) -> bool {
        let mut unsent = 0;

        loop {
            let result = tokio::select! {
                _ = self.closing.cancelled() => return false,
                result = self.service().write(&link.session_id, link.connection_id, data.clone()) => result,
            };

            match result {
                Ok(()) => return true,
                Err(TunnelError::BufferFull { .. }) => {}
                Err(e) if e.is_safe_to_repeat() => {
                    unsent += 1;
                    if unsent > self.settings.max_transport_retries {
                        warn!(
                            connection_id = link.connection_id,
                            "Giving up on write after {} failures: {}", unsent, e
                        );
                        return false;
                    }
                    debug!("Write not sent, retrying: {}", e);
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(
                            connection_id = link.connection_id,
                            "Write outcome unknown, closing: {}", e
                        );
                    } else {
                        debug!(connection_id = link.connection_id, "Write rejected: {}", e);
                    }
                    return false;
                }
            }

            if !self.pause(self.settings.poll_interval).await {
                return false;
            }
        }
    }

    async fn ingress(self: Arc<Self>, link: Link, mut writer: OwnedWriteHalf) {
        let mut unsent = 0;

        let reason = loop {
            let result = tokio::select! {
                _ = self.closing.cancelled() => break "closing",
                result = self.service().read(&link.session_id, link.connection_id) => result,
            };

            match result {
                Ok(response) => {
                    unsent = 0;
                    if !response.data.is_empty() {
                        if let Err(e) = writer.write_all(&response.data).await {
                            debug!("Local socket write error: {}", e);
                            break "local socket error";
                        }
                    }
                    if response.end_of_stream {
                        break "remote end of stream";
                    }
                    if !response.data.is_empty() {
                        // More may be queued, poll again right away
                        continue;
                    }
                }
                Err(e) if e.is_safe_to_repeat() => {
                    unsent += 1;
                    if unsent > self.settings.max_transport_retries {
                        warn!(
                            connection_id = link.connection_id,
                            "Giving up on read after {} failures: {}", unsent, e
                        );
                        break "read failed";
                    }
                }
                Err(e) if e.is_transient() => {
                    // The service may have drained bytes we never saw
                    warn!(
                        connection_id = link.connection_id,
                        "Read outcome unknown, closing: {}", e
                    );
                    break "read outcome unknown";
                }
                Err(e) => {
                    debug!(connection_id = link.connection_id, "Read rejected: {}", e);
                    break "connection gone";
                }
            }

            if !self.pause(self.settings.poll_interval).await {
                break "closing";
            }
        };

        let _ = writer.shutdown().await;
        self.begin_closing(&link, reason).await;
    }
}

impl std::fmt::Debug for ConnectionPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPump")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}
