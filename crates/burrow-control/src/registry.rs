//! Tunnel registry
//!
//! Owns every live session and serves the remote contract on top of them.
//! Handlers look sessions and connections up, clone the `Arc` out of the map
//! and release the map guard before doing anything else; no guard is ever
//! held across an `.await`.

use crate::config::RegistryConfig;
use crate::connection::LogicalConnection;
use crate::session::Session;
use async_trait::async_trait;
use burrow_auth::{AuthError, Authenticator};
use burrow_proto::{
    ConnectionId, ReadResponse, SessionId, SessionInfo, TunnelError, TunnelResult, TunnelService,
    VersionInfo,
};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// What one idle sweep tore down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions reaped for inactivity
    pub sessions: usize,
    /// Connections reaped, counting those closed along with a reaped session
    pub connections: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.sessions == 0 && self.connections == 0
    }
}

pub struct TunnelRegistry {
    config: RegistryConfig,
    authenticator: Arc<dyn Authenticator>,
    sessions: DashMap<SessionId, Arc<Session>>,
    available: AtomicBool,
}

impl TunnelRegistry {
    pub fn new(config: RegistryConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            config,
            authenticator,
            sessions: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    fn ensure_available(&self) -> TunnelResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(TunnelError::Unavailable)
        }
    }

    /// Resolve the caller's session and record activity on it
    fn session(&self, session_id: &str) -> TunnelResult<Arc<Session>> {
        self.ensure_available()?;
        let session = self
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TunnelError::unknown_session(session_id))?;
        session.touch();
        Ok(session)
    }

    fn connection(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
    ) -> TunnelResult<Arc<LogicalConnection>> {
        self.session(session_id)?
            .get(connection_id)
            .ok_or_else(|| TunnelError::unknown_connection(session_id, connection_id))
    }

    /// Admins act on any session, everybody else only on their own
    fn authorize(&self, caller: &Session, target_session_id: &str) -> TunnelResult<()> {
        if caller.is_admin() || caller.id() == target_session_id {
            return Ok(());
        }
        warn!(
            "User {} denied access to session {}",
            caller.owner(),
            target_session_id
        );
        Err(TunnelError::PermissionDenied {
            reason: format!(
                "user {} may only manage its own session",
                caller.owner()
            ),
        })
    }

    fn remove_session(&self, session_id: &str) -> Option<usize> {
        let (_, session) = self.sessions.remove(session_id)?;
        Some(session.close())
    }

    /// Tear down sessions and connections idle past their timeouts
    pub fn sweep_idle(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let session_timeout = self.config.session_timeout;

        let idle: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for(chrono::Utc::now()) > session_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for session_id in idle {
            // Recheck under the shard lock in case the session was used since the scan
            if let Some((_, session)) = self.sessions.remove_if(&session_id, |_, s| {
                s.idle_for(chrono::Utc::now()) > session_timeout
            }) {
                let closed = session.close();
                info!(
                    "Reaped idle session {} of {} ({} connections)",
                    session_id,
                    session.owner(),
                    closed
                );
                report.sessions += 1;
                report.connections += closed;
            }
        }

        let live: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in live {
            let reaped = session.reap_idle_connections(self.config.connection_timeout);
            if reaped > 0 {
                debug!(
                    "Reaped {} idle connections in session {}",
                    reaped,
                    session.id()
                );
            }
            report.connections += reaped;
        }

        report
    }

    /// Refuse all further calls and tear down every session
    pub fn shutdown(&self) {
        if !self.available.swap(false, Ordering::AcqRel) {
            return;
        }

        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut connections = 0;
        for session_id in &ids {
            connections += self.remove_session(session_id).unwrap_or(0);
        }
        info!(
            "Registry shut down ({} sessions, {} connections closed)",
            ids.len(),
            connections
        );
    }
}

#[async_trait]
impl TunnelService for TunnelRegistry {
    async fn login(&self, username: &str, password: &str) -> TunnelResult<SessionId> {
        self.ensure_available()?;

        let identity = match self.authenticator.authenticate(username, password).await {
            Ok(identity) => identity,
            Err(AuthError::Backend(e)) => {
                warn!("Authentication backend failed for {}: {}", username, e);
                return Err(TunnelError::Authentication {
                    username: username.to_string(),
                });
            }
            Err(e) => {
                info!("Login rejected for {}: {}", username, e);
                return Err(TunnelError::Authentication {
                    username: username.to_string(),
                });
            }
        };

        let session = Arc::new(Session::new(&identity));
        let session_id = session.id().to_string();
        self.sessions.insert(session_id.clone(), session);

        info!(
            session_id = %session_id,
            admin = identity.admin,
            "User {} logged in",
            identity.username
        );
        Ok(session_id)
    }

    async fn logout(&self, session_id: &str) -> TunnelResult<()> {
        self.ensure_available()?;
        let closed = self
            .remove_session(session_id)
            .ok_or_else(|| TunnelError::unknown_session(session_id))?;
        info!("Session {} logged out ({} connections closed)", session_id, closed);
        Ok(())
    }

    async fn version(&self) -> TunnelResult<VersionInfo> {
        self.ensure_available()?;
        Ok(VersionInfo::current())
    }

    async fn ping(&self) -> TunnelResult<()> {
        self.ensure_available()
    }

    async fn connect(&self, session_id: &str, target: &str) -> TunnelResult<ConnectionId> {
        let session = self.session(session_id)?;
        let connection_id = session.next_connection_id();
        let connection = Arc::new(LogicalConnection::new(
            connection_id,
            session_id,
            target,
            &self.config,
        ));
        session.insert(connection.clone());

        debug!(
            session_id = %session_id,
            connection_id = connection_id,
            "Connecting to {}",
            target
        );

        let stream =
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(target))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    session.remove(connection_id);
                    connection.close();
                    warn!("Failed to connect to {}: {}", target, e);
                    return Err(TunnelError::TargetUnreachable {
                        target: target.to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    session.remove(connection_id);
                    connection.close();
                    warn!("Timed out connecting to {}", target);
                    return Err(TunnelError::TargetUnreachable {
                        target: target.to_string(),
                        reason: format!("timed out after {:?}", self.config.connect_timeout),
                    });
                }
            };

        // The session may have been killed while the target was being opened
        if session.is_closed() || !connection.attach(stream) {
            session.remove(connection_id);
            connection.close();
            return Err(TunnelError::unknown_session(session_id));
        }

        info!(
            session_id = %session_id,
            connection_id = connection_id,
            "Connection opened to {}",
            target
        );
        Ok(connection_id)
    }

    async fn disconnect(&self, session_id: &str, connection_id: ConnectionId) -> TunnelResult<()> {
        let session = self.session(session_id)?;
        let connection = session
            .remove(connection_id)
            .ok_or_else(|| TunnelError::unknown_connection(session_id, connection_id))?;

        if connection.close() {
            info!(
                session_id = %session_id,
                connection_id = connection_id,
                "Connection to {} closed",
                connection.target()
            );
        }
        Ok(())
    }

    async fn read(&self, session_id: &str, connection_id: ConnectionId) -> TunnelResult<ReadResponse> {
        Ok(self.connection(session_id, connection_id)?.read())
    }

    async fn write(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
        data: Bytes,
    ) -> TunnelResult<()> {
        self.connection(session_id, connection_id)?.write(&data)
    }

    async fn monitor(&self, session_id: &str) -> TunnelResult<Vec<SessionInfo>> {
        let caller = self.session(session_id)?;

        let mut sessions: Vec<SessionInfo> = if caller.is_admin() {
            self.sessions
                .iter()
                .map(|entry| entry.value().snapshot())
                .collect()
        } else {
            vec![caller.snapshot()]
        };
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn kill_session(&self, session_id: &str, target_session_id: &str) -> TunnelResult<()> {
        let caller = self.session(session_id)?;
        self.authorize(&caller, target_session_id)?;

        let closed = self
            .remove_session(target_session_id)
            .ok_or_else(|| TunnelError::unknown_session(target_session_id))?;
        info!(
            "Session {} killed by {} ({} connections closed)",
            target_session_id,
            caller.owner(),
            closed
        );
        Ok(())
    }

    async fn kill_connection(
        &self,
        session_id: &str,
        target_session_id: &str,
        connection_id: ConnectionId,
    ) -> TunnelResult<()> {
        let caller = self.session(session_id)?;
        self.authorize(&caller, target_session_id)?;

        let target = self
            .sessions
            .get(target_session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TunnelError::unknown_session(target_session_id))?;
        let connection = target
            .remove(connection_id)
            .ok_or_else(|| TunnelError::unknown_connection(target_session_id, connection_id))?;

        connection.close();
        info!(
            "Connection {} of session {} killed by {}",
            connection_id,
            target_session_id,
            caller.owner()
        );
        Ok(())
    }
}

impl std::fmt::Debug for TunnelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRegistry")
            .field("sessions", &self.sessions.len())
            .field("available", &self.is_available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_auth::{StaticAuthenticator, UserEntry};

    fn registry() -> TunnelRegistry {
        let auth = StaticAuthenticator::new(vec![
            UserEntry::with_password("alice", "pw"),
            UserEntry::with_password("bob", "pw"),
            UserEntry::with_password("root", "secret").admin(),
        ]);
        TunnelRegistry::new(RegistryConfig::default(), Arc::new(auth))
    }

    #[tokio::test]
    async fn test_login_rejects_bad_password() {
        let registry = registry();
        let err = registry.login("alice", "wrong").await.unwrap_err();
        assert_eq!(
            err,
            TunnelError::Authentication {
                username: "alice".to_string()
            }
        );
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_logout_twice_fails() {
        let registry = registry();
        let sid = registry.login("alice", "pw").await.unwrap();

        registry.logout(&sid).await.unwrap();
        assert_eq!(
            registry.logout(&sid).await,
            Err(TunnelError::unknown_session(&sid))
        );
    }

    #[tokio::test]
    async fn test_unknown_session_everywhere() {
        let registry = registry();
        assert!(matches!(
            registry.connect("nope", "127.0.0.1:80").await,
            Err(TunnelError::UnknownSession { .. })
        ));
        assert!(matches!(
            registry.read("nope", 1).await,
            Err(TunnelError::UnknownSession { .. })
        ));
        assert!(matches!(
            registry.monitor("nope").await,
            Err(TunnelError::UnknownSession { .. })
        ));
    }

    #[tokio::test]
    async fn test_non_admin_cannot_kill_others() {
        let registry = registry();
        let alice = registry.login("alice", "pw").await.unwrap();
        let bob = registry.login("bob", "pw").await.unwrap();

        assert!(matches!(
            registry.kill_session(&alice, &bob).await,
            Err(TunnelError::PermissionDenied { .. })
        ));
        assert_eq!(registry.session_count(), 2);

        // Killing one's own session is allowed
        registry.kill_session(&alice, &alice).await.unwrap();
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn test_monitor_visibility() {
        let registry = registry();
        let alice = registry.login("alice", "pw").await.unwrap();
        let _bob = registry.login("bob", "pw").await.unwrap();
        let root = registry.login("root", "secret").await.unwrap();

        let own = registry.monitor(&alice).await.unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].session_id, alice);

        let all = registry.monitor(&root).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_makes_registry_unavailable() {
        let registry = registry();
        let sid = registry.login("alice", "pw").await.unwrap();

        registry.shutdown();
        assert_eq!(registry.session_count(), 0);
        assert_eq!(registry.ping().await, Err(TunnelError::Unavailable));
        assert_eq!(registry.version().await, Err(TunnelError::Unavailable));
        assert_eq!(registry.monitor(&sid).await, Err(TunnelError::Unavailable));
        assert_eq!(
            registry.login("alice", "pw").await,
            Err(TunnelError::Unavailable)
        );
    }

    #[test]
    fn test_sweep_report_is_empty() {
        assert!(SweepReport::default().is_empty());
        assert!(!SweepReport {
            sessions: 0,
            connections: 1
        }
        .is_empty());
    }
}
