//! Tunnel client: one session, one listener per forward

use crate::config::ClientConfig;
use crate::listener::{ListenerStatus, LocalListener};
use crate::pump::PumpSettings;
use crate::session::ClientSession;
use burrow_proto::{TunnelError, TunnelService};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

pub struct TunnelClient {
    session: Arc<ClientSession>,
    listeners: Vec<LocalListener>,
    stop: CancellationToken,
    keepalive: JoinHandle<()>,
}

impl TunnelClient {
    /// Log in and start a listener for every configured forward
    ///
    /// Forwards whose port cannot be bound are reported as disabled; the
    /// others keep running.
    pub async fn start(
        config: ClientConfig,
        service: Arc<dyn TunnelService>,
    ) -> Result<Self, ClientError> {
        if config.forwards.is_empty() {
            return Err(ClientError::Config("no forwards configured".to_string()));
        }

        let session = ClientSession::open(service, &config.username, &config.password).await?;
        let stop = CancellationToken::new();
        let settings = PumpSettings::from(&config);

        let mut listeners = Vec::with_capacity(config.forwards.len());
        for forward in &config.forwards {
            let listener = LocalListener::start(
                forward.clone(),
                session.clone(),
                settings,
                config.accept_poll_interval,
                stop.child_token(),
            )
            .await;
            listeners.push(listener);
        }

        let active = listeners
            .iter()
            .filter(|l| matches!(l.status(), ListenerStatus::Listening(_)))
            .count();
        if active == 0 {
            warn!("No forward could be started");
        } else {
            info!("{} of {} forwards active", active, listeners.len());
        }

        let keepalive = session.spawn_keepalive(config.keepalive_interval, stop.child_token());

        Ok(Self {
            session,
            listeners,
            stop,
            keepalive,
        })
    }

    pub fn session(&self) -> &Arc<ClientSession> {
        &self.session
    }

    /// Status of every forward, by name
    pub fn listeners(&self) -> Vec<(String, ListenerStatus)> {
        self.listeners
            .iter()
            .map(|l| (l.forward().name.clone(), l.status()))
            .collect()
    }

    pub fn listener(&self, name: &str) -> Option<&LocalListener> {
        self.listeners.iter().find(|l| l.forward().name == name)
    }

    /// Stop accepting, stop the keepalive and log out
    pub async fn shutdown(mut self) -> Result<(), ClientError> {
        self.stop.cancel();
        for listener in &mut self.listeners {
            listener.stop().await;
        }
        let _ = self.keepalive.await;

        self.session.close().await?;
        Ok(())
    }
}
