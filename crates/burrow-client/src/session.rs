//! Client side of a tunnel session

use burrow_proto::{ConnectionId, SessionId, TunnelError, TunnelResult, TunnelService};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One login shared by every listener and pump of a client
///
/// If the server forgets the session (idle sweep, kill, restart) the next
/// Connect logs in again once and retries.
pub struct ClientSession {
    service: Arc<dyn TunnelService>,
    username: String,
    password: String,
    session_id: RwLock<SessionId>,
    /// Serializes re-logins so concurrent pumps don't each open a session
    relogin: tokio::sync::Mutex<()>,
}

impl ClientSession {
    /// Check the server version and log in
    pub async fn open(
        service: Arc<dyn TunnelService>,
        username: &str,
        password: &str,
    ) -> TunnelResult<Arc<Self>> {
        let version = service.version().await?;
        if version.protocol != burrow_proto::PROTOCOL_VERSION {
            warn!(
                "Server speaks protocol {} (version {}), this client speaks {}",
                version.protocol,
                version.version,
                burrow_proto::PROTOCOL_VERSION
            );
        } else {
            debug!("Server version {}", version.version);
        }

        let session_id = service.login(username, password).await?;
        info!("Logged in as {}", username);

        Ok(Arc::new(Self {
            service,
            username: username.to_string(),
            password: password.to_string(),
            session_id: RwLock::new(session_id),
            relogin: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn service(&self) -> &Arc<dyn TunnelService> {
        &self.service
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn relogin(&self, stale: &str) -> TunnelResult<()> {
        let _guard = self.relogin.lock().await;
        if self.session_id() != stale {
            // Another pump already replaced it
            return Ok(());
        }

        let session_id = self.service.login(&self.username, &self.password).await?;
        info!("Session expired on server, logged in again as {}", self.username);
        *self
            .session_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = session_id;
        Ok(())
    }

    /// Open a logical connection, returning the session it belongs to
    pub async fn connect(&self, target: &str) -> TunnelResult<(SessionId, ConnectionId)> {
        let session_id = self.session_id();
        match self.service.connect(&session_id, target).await {
            Ok(connection_id) => Ok((session_id, connection_id)),
            Err(TunnelError::UnknownSession { .. }) => {
                self.relogin(&session_id).await?;
                let session_id = self.session_id();
                let connection_id = self.service.connect(&session_id, target).await?;
                Ok((session_id, connection_id))
            }
            Err(e) => Err(e),
        }
    }

    /// Ping the server every `interval` until `stop` fires
    pub fn spawn_keepalive(&self, interval: Duration, stop: CancellationToken) -> JoinHandle<()> {
        let service = self.service.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                match service.ping().await {
                    Ok(()) => debug!("Keepalive ok"),
                    Err(e) => warn!("Keepalive failed: {}", e),
                }
            }
        })
    }

    /// Log out; a session the server already dropped counts as closed
    pub async fn close(&self) -> TunnelResult<()> {
        let session_id = self.session_id();
        match self.service.logout(&session_id).await {
            Ok(()) | Err(TunnelError::UnknownSession { .. }) => {
                info!("Logged out");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("username", &self.username)
            .field("session_id", &self.session_id())
            .finish()
    }
}
