//! Local TCP listener feeding connection pumps

use crate::config::PortForward;
use crate::pump::{ConnectionPump, PumpSettings};
use crate::session::ClientSession;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerStatus {
    Listening(SocketAddr),
    /// The port could not be bound; never retried
    Disabled(String),
    Stopped,
}

pub struct LocalListener {
    forward: PortForward,
    status: Arc<Mutex<ListenerStatus>>,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LocalListener {
    /// Bind the forward's port and start accepting
    ///
    /// A bind failure is logged once and leaves the listener `Disabled`.
    pub async fn start(
        forward: PortForward,
        session: Arc<ClientSession>,
        settings: PumpSettings,
        accept_poll_interval: Duration,
        stop: CancellationToken,
    ) -> Self {
        let ip = if forward.shared {
            Ipv4Addr::UNSPECIFIED
        } else {
            Ipv4Addr::LOCALHOST
        };
        let addr = SocketAddr::from((ip, forward.local_port));

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                let err = ListenerError::Bind { addr, source };
                error!("Forward {} disabled: {}", forward.name, err);
                return Self {
                    forward,
                    status: Arc::new(Mutex::new(ListenerStatus::Disabled(err.to_string()))),
                    stop,
                    handle: None,
                };
            }
        };

        let local_addr = listener.local_addr().unwrap_or(addr);
        info!(
            "Forward {} listening on {} -> {}",
            forward.name, local_addr, forward.target
        );

        let status = Arc::new(Mutex::new(ListenerStatus::Listening(local_addr)));
        let handle = tokio::spawn(accept_loop(
            listener,
            forward.clone(),
            session,
            settings,
            accept_poll_interval,
            stop.clone(),
            status.clone(),
        ));

        Self {
            forward,
            status,
            stop,
            handle: Some(handle),
        }
    }

    pub fn forward(&self) -> &PortForward {
        &self.forward
    }

    pub fn status(&self) -> ListenerStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.status() {
            ListenerStatus::Listening(addr) => Some(addr),
            _ => None,
        }
    }

    /// Signal the accept loop and wait for it to release the port
    ///
    /// Pumps already running are left to finish on their own.
    pub async fn stop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Accept loop for {} ended abnormally: {}", self.forward.name, e);
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    forward: PortForward,
    session: Arc<ClientSession>,
    settings: PumpSettings,
    accept_poll_interval: Duration,
    stop: CancellationToken,
    status: Arc<Mutex<ListenerStatus>>,
) {
    while !stop.is_cancelled() {
        let accepted = match tokio::time::timeout(accept_poll_interval, listener.accept()).await {
            Err(_) => continue,
            Ok(accepted) => accepted,
        };

        match accepted {
            Ok((socket, peer)) => {
                debug!("Forward {} accepted {}", forward.name, peer);
                let pump = ConnectionPump::new(session.clone(), &forward.target, settings);
                tokio::spawn(async move {
                    // Failures are logged by the pump
                    let _ = pump.run(socket).await;
                });
            }
            Err(e) => {
                warn!("Forward {} accept error: {}", forward.name, e);
                tokio::time::sleep(accept_poll_interval).await;
            }
        }
    }

    drop(listener);
    *status.lock().unwrap_or_else(PoisonError::into_inner) = ListenerStatus::Stopped;
    info!("Forward {} stopped", forward.name);
}
