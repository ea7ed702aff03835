//! Logical connections and the socket tasks behind them
//!
//! A `LogicalConnection` owns two relay buffers. `to_client` is filled by the
//! socket reader task and drained by Read calls; `to_target` is filled by
//! Write calls and drained by the socket writer task. RPC handlers only ever
//! touch the buffers, so their latency never depends on the target socket.

use crate::buffer::{BufferError, RelayBuffer};
use crate::config::RegistryConfig;
use burrow_proto::{
    ConnectionId, ConnectionInfo, ConnectionState, ReadResponse, SessionId, TunnelError,
    TunnelResult,
};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Socket read size of the reader task
const SOCKET_READ_SIZE: usize = 16 * 1024;

/// Largest chunk handed to a single socket write
const SOCKET_WRITE_SIZE: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LogicalConnection {
    id: ConnectionId,
    session_id: SessionId,
    target: String,
    local_addr: Mutex<Option<SocketAddr>>,
    state: Mutex<ConnectionState>,
    to_client: RelayBuffer,
    to_target: RelayBuffer,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    /// Cancelled on teardown
    shutdown: CancellationToken,
    read_chunk_size: usize,
    close_linger: Duration,
}

impl LogicalConnection {
    /// Create a connection in `Establishing` state, not yet bound to a socket
    pub fn new(
        id: ConnectionId,
        session_id: &str,
        target: &str,
        config: &RegistryConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            session_id: session_id.to_string(),
            target: target.to_string(),
            local_addr: Mutex::new(None),
            state: Mutex::new(ConnectionState::Establishing),
            to_client: RelayBuffer::new(config.buffer_capacity),
            to_target: RelayBuffer::new(config.buffer_capacity),
            created_at: now,
            last_activity: Mutex::new(now),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            read_chunk_size: config.read_chunk_size,
            close_linger: config.close_linger,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn touch(&self) {
        *lock(&self.last_activity) = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *lock(&self.last_activity)
    }

    /// Time since the last Connect/Read/Write on this connection
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity()).to_std().unwrap_or_default()
    }

    /// Bind the connected target socket and start both socket tasks
    ///
    /// Returns false, dropping the socket, if the connection was torn down
    /// while the target was being opened.
    pub fn attach(self: &Arc<Self>, stream: TcpStream) -> bool {
        {
            let mut state = lock(&self.state);
            if *state != ConnectionState::Establishing {
                return false;
            }
            *state = ConnectionState::Open;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(connection_id = self.id, "Failed to set TCP_NODELAY: {}", e);
        }
        *lock(&self.local_addr) = stream.local_addr().ok();

        let (reader, writer) = stream.into_split();
        tokio::spawn(Self::socket_to_client(self.clone(), reader));
        tokio::spawn(Self::client_to_socket(self.clone(), writer));
        true
    }

    /// Serve a Read call: whatever is queued, up to one chunk
    pub fn read(&self) -> ReadResponse {
        self.touch();
        let drained = self.to_client.drain(self.read_chunk_size);
        self.bytes_read
            .fetch_add(drained.data.len() as u64, Ordering::Relaxed);

        ReadResponse {
            data: drained.data,
            end_of_stream: drained.finished,
        }
    }

    /// Serve a Write call: queue bytes for the target socket
    pub fn write(&self, data: &[u8]) -> TunnelResult<()> {
        self.touch();
        if self.state().is_closing() {
            return Err(TunnelError::ConnectionClosed {
                connection_id: self.id,
            });
        }

        match self.to_target.try_push(data) {
            Ok(()) => {
                self.bytes_written
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(BufferError::Full { queued, .. }) => Err(TunnelError::BufferFull {
                connection_id: self.id,
                queued,
            }),
            Err(BufferError::Closed) => Err(TunnelError::ConnectionClosed {
                connection_id: self.id,
            }),
        }
    }

    /// Move to `Closing` after end-of-stream or a socket failure
    ///
    /// Writes are refused from here on; bytes already queued for the client
    /// stay readable and bytes queued for the target are still flushed.
    pub fn begin_closing(&self, reason: &str) {
        {
            let mut state = lock(&self.state);
            if state.is_closing() {
                return;
            }
            *state = ConnectionState::Closing;
        }

        debug!(
            session_id = %self.session_id,
            connection_id = self.id,
            target = %self.target,
            reason = reason,
            "Connection closing"
        );
        self.to_client.close();
        self.to_target.close();
    }

    /// Tear down: `Closed`, socket reader stopped, writer given the linger
    /// period to flush accepted bytes
    ///
    /// Returns false if the connection was already closed.
    pub fn close(&self) -> bool {
        let previous = std::mem::replace(&mut *lock(&self.state), ConnectionState::Closed);
        self.to_client.close();
        self.to_target.close();
        self.shutdown.cancel();
        previous != ConnectionState::Closed
    }

    pub fn snapshot(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.id,
            target: self.target.clone(),
            local_addr: (*lock(&self.local_addr)).map(|addr| addr.to_string()),
            state: self.state(),
            created_at: self.created_at,
            last_activity: self.last_activity(),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }

    async fn socket_to_client(conn: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut buffer = vec![0u8; SOCKET_READ_SIZE];

        loop {
            let result = tokio::select! {
                _ = conn.shutdown.cancelled() => return,
                result = reader.read(&mut buffer) => result,
            };

            match result {
                Ok(0) => {
                    conn.begin_closing("target closed");
                    return;
                }
                Ok(n) => {
                    let pushed = tokio::select! {
                        _ = conn.shutdown.cancelled() => return,
                        pushed = conn.to_client.push(&buffer[..n]) => pushed,
                    };
                    if pushed.is_err() {
                        // Closing from the other direction, nobody will read this
                        return;
                    }
                }
                Err(e) => {
                    warn!(
                        session_id = %conn.session_id,
                        connection_id = conn.id,
                        "Error reading from target {}: {}",
                        conn.target,
                        e
                    );
                    conn.begin_closing("target read error");
                    return;
                }
            }
        }
    }

    async fn client_to_socket(conn: Arc<Self>, mut writer: OwnedWriteHalf) {
        let flush = async {
            while let Some(chunk) = conn.to_target.pop(SOCKET_WRITE_SIZE).await {
                writer.write_all(&chunk).await?;
            }
            writer.shutdown().await
        };

        let linger_expired = async {
            conn.shutdown.cancelled().await;
            tokio::time::sleep(conn.close_linger).await;
        };

        tokio::select! {
            result = flush => {
                if let Err(e) = result {
                    warn!(
                        session_id = %conn.session_id,
                        connection_id = conn.id,
                        "Error writing to target {}: {}",
                        conn.target,
                        e
                    );
                    conn.begin_closing("target write error");
                }
            }
            _ = linger_expired => {
                debug!(connection_id = conn.id, "Dropping unflushed bytes after linger");
            }
        }
    }
}

impl std::fmt::Debug for LogicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalConnection")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}
