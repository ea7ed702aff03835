//! HTTP carriage of the tunnel contract
//!
//! [`ApiServer`] exposes any `TunnelService` as JSON endpoints under `/rpc`,
//! [`HttpTunnelClient`] implements `TunnelService` on top of them.

pub mod client;
pub mod error;
pub mod handlers;

pub use client::HttpTunnelClient;
pub use error::{ApiError, ErrorResponse};

use axum::{
    routing::{get, post},
    Router,
};
use burrow_proto::TunnelService;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Endpoint paths, shared by server and client
pub mod routes {
    pub const LOGIN: &str = "/rpc/login";
    pub const LOGOUT: &str = "/rpc/logout";
    pub const VERSION: &str = "/rpc/version";
    pub const PING: &str = "/rpc/ping";
    pub const CONNECT: &str = "/rpc/connect";
    pub const DISCONNECT: &str = "/rpc/disconnect";
    pub const READ: &str = "/rpc/read";
    pub const WRITE: &str = "/rpc/write";
    pub const MONITOR: &str = "/rpc/monitor";
    pub const KILL_SESSION: &str = "/rpc/kill-session";
    pub const KILL_CONNECTION: &str = "/rpc/kill-connection";
}

/// Application state shared across handlers
pub struct AppState {
    pub service: Arc<dyn TunnelService>,
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, service: Arc<dyn TunnelService>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { service }),
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        Router::new()
            .route(routes::LOGIN, post(handlers::login))
            .route(routes::LOGOUT, post(handlers::logout))
            .route(routes::VERSION, get(handlers::version))
            .route(routes::PING, get(handlers::ping))
            .route(routes::CONNECT, post(handlers::connect))
            .route(routes::DISCONNECT, post(handlers::disconnect))
            .route(routes::READ, post(handlers::read))
            .route(routes::WRITE, post(handlers::write))
            .route(routes::MONITOR, post(handlers::monitor))
            .route(routes::KILL_SESSION, post(handlers::kill_session))
            .route(routes::KILL_CONNECTION, post(handlers::kill_connection))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn start(self, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` fires
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), anyhow::Error> {
        let router = self.build_router();
        info!("Tunnel API listening on {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        info!("Tunnel API stopped");
        Ok(())
    }
}
