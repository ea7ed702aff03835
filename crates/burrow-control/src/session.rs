//! Authenticated sessions and the connections they own

use crate::connection::LogicalConnection;
use burrow_auth::Identity;
use burrow_proto::{ConnectionId, SessionId, SessionInfo};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub struct Session {
    id: SessionId,
    owner: String,
    admin: bool,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    connections: DashMap<ConnectionId, Arc<LogicalConnection>>,
    next_connection_id: AtomicU32,
    closed: AtomicBool,
}

impl Session {
    /// Open a session for an authenticated identity, with a fresh random id
    pub fn new(identity: &Identity) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner: identity.username.clone(),
            admin: identity.admin,
            created_at: now,
            last_activity: Mutex::new(now),
            connections: DashMap::new(),
            next_connection_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_admin(&self) -> bool {
        self.admin
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity()).to_std().unwrap_or_default()
    }

    /// Next connection id; ids start at 1 and are never reused in a session
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, connection: Arc<LogicalConnection>) {
        self.connections.insert(connection.id(), connection);
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<Arc<LogicalConnection>> {
        self.connections
            .get(&connection_id)
            .map(|entry| entry.value().clone())
    }

    pub fn remove(&self, connection_id: ConnectionId) -> Option<Arc<LogicalConnection>> {
        self.connections
            .remove(&connection_id)
            .map(|(_, connection)| connection)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Tear down connections idle for longer than `timeout`
    pub fn reap_idle_connections(&self, timeout: Duration) -> usize {
        let idle: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.value().idle_for(Utc::now()) > timeout)
            .map(|entry| *entry.key())
            .collect();

        let mut reaped = 0;
        for connection_id in idle {
            // Recheck: a Read or Write may have landed since the scan
            if let Some((_, connection)) = self
                .connections
                .remove_if(&connection_id, |_, c| c.idle_for(Utc::now()) > timeout)
            {
                connection.close();
                reaped += 1;
            }
        }
        reaped
    }

    /// Mark the session closed and tear down every connection it owns
    ///
    /// Returns the number of connections closed.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);

        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        let mut closed = 0;
        for connection_id in ids {
            if let Some(connection) = self.remove(connection_id) {
                connection.close();
                closed += 1;
            }
        }
        closed
    }

    pub fn snapshot(&self) -> SessionInfo {
        let mut connections: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        connections.sort_by_key(|c| c.connection_id);

        SessionInfo {
            session_id: self.id.clone(),
            owner: self.owner.clone(),
            admin: self.admin,
            created_at: self.created_at,
            last_activity: self.last_activity(),
            connections,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("admin", &self.admin)
            .field("connections", &self.connections.len())
            .finish()
    }
}
