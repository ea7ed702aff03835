//! Burrow - TCP tunnels over a request/response API
//!
//! Runs the tunnel server, the port-forwarding client, and the operator
//! commands that list and kill sessions.

mod config;

use anyhow::{Context, Result};
use burrow_api::{ApiServer, ApiServerConfig, HttpTunnelClient};
use burrow_auth::StaticAuthenticator;
use burrow_client::{ListenerStatus, TunnelClient};
use burrow_control::{spawn_sweeper, TunnelRegistry};
use burrow_proto::{SessionInfo, TunnelService};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Burrow - tunnel TCP connections through a remote relay
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Burrow - tunnel TCP connections through a remote relay")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", env = "BURROW_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Credentials for operator commands
#[derive(Args, Debug)]
struct AdminArgs {
    /// Tunnel API base URL
    #[arg(long, env = "BURROW_SERVER", default_value = "http://127.0.0.1:8080")]
    server: String,

    #[arg(long, env = "BURROW_USERNAME")]
    username: String,

    #[arg(long, env = "BURROW_PASSWORD")]
    password: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel server
    #[command(long_about = r#"
Run the tunnel registry behind its HTTP API. Sessions and connections are
kept in memory; idle ones are reaped periodically.

EXAMPLE server.yaml:
  listen: 0.0.0.0:8080
  session_timeout: 43200
  connection_timeout: 3600
  users:
    - username: alice
      password_hash: "$argon2id$..."
    - username: ops
      password_hash: "$argon2id$..."
      admin: true
    "#)]
    Server {
        /// Path to the server config file
        #[arg(short, long, env = "BURROW_CONFIG")]
        config: PathBuf,

        /// Override the listen address from the config file
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Forward local ports through the tunnel server
    #[command(long_about = r#"
Log in to the tunnel server and open one local listener per forward.
Every accepted connection is carried to the forward's target.

EXAMPLE client.yaml:
  server_url: http://relay.example.com:8080
  username: alice
  password: secret
  forwards:
    - name: postgres
      local_port: 15432
      target: db.internal:5432
    - name: intranet
      local_port: 8000
      shared: true
      target: intranet.internal:80
    "#)]
    Client {
        /// Path to the client config file
        #[arg(short, long, env = "BURROW_CONFIG")]
        config: PathBuf,
    },

    /// List sessions and their connections
    Monitor {
        #[command(flatten)]
        admin: AdminArgs,
    },

    /// Tear down a session and all its connections
    KillSession {
        #[command(flatten)]
        admin: AdminArgs,

        /// Session to kill
        session_id: String,
    },

    /// Tear down one connection of a session
    KillConnection {
        #[command(flatten)]
        admin: AdminArgs,

        /// Session owning the connection
        session_id: String,

        /// Connection to kill
        connection_id: u32,
    },

    /// Print an Argon2id hash for the users section of a server config
    HashPassword {
        password: String,
    },
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Server { config, listen } => run_server(config, listen).await,
        Commands::Client { config } => run_client(config).await,
        Commands::Monitor { admin } => run_monitor(admin).await,
        Commands::KillSession { admin, session_id } => {
            with_admin_session(&admin, |client, caller| async move {
                client.kill_session(&caller, &session_id).await?;
                println!("Session {} killed", session_id);
                Ok(())
            })
            .await
        }
        Commands::KillConnection {
            admin,
            session_id,
            connection_id,
        } => {
            with_admin_session(&admin, |client, caller| async move {
                client
                    .kill_connection(&caller, &session_id, connection_id)
                    .await?;
                println!("Connection {} of session {} killed", connection_id, session_id);
                Ok(())
            })
            .await
        }
        Commands::HashPassword { password } => {
            let hash = burrow_auth::hash_password(&password)
                .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?;
            println!("{}", hash);
            Ok(())
        }
    }
}

async fn run_server(config_path: PathBuf, listen: Option<SocketAddr>) -> Result<()> {
    let mut config = config::load_server_config(&config_path)?;
    if let Some(listen) = listen {
        config.listen = listen;
    }
    if config.users.is_empty() {
        warn!("No users configured, every login will be rejected");
    }

    let authenticator = StaticAuthenticator::new(config.users.clone());
    info!("Loaded {} users", authenticator.user_count());

    let registry = Arc::new(TunnelRegistry::new(
        config.registry.clone(),
        Arc::new(authenticator),
    ));
    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(registry.clone(), shutdown.clone());

    let server = ApiServer::new(
        ApiServerConfig {
            bind_addr: config.listen,
        },
        registry.clone(),
    );
    let mut api = tokio::spawn(server.start(shutdown.clone()));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Shutting down");
        }
        result = &mut api => {
            // The API only returns early when it failed to start
            shutdown.cancel();
            registry.shutdown();
            return result.context("API task panicked")?;
        }
    }

    shutdown.cancel();
    registry.shutdown();
    if let Err(e) = api.await.context("API task panicked")? {
        error!("API server error: {}", e);
    }
    if let Err(e) = sweeper.await {
        error!("Idle sweeper failed: {}", e);
    }
    Ok(())
}

async fn run_client(config_path: PathBuf) -> Result<()> {
    let config = config::load_client_config(&config_path)?;
    let transport = HttpTunnelClient::new(&config.server_url, config.request_timeout)
        .context("Failed to create API client")?;

    let client = TunnelClient::start(config, Arc::new(transport))
        .await
        .context("Failed to start tunnel client")?;

    for (name, status) in client.listeners() {
        match status {
            ListenerStatus::Listening(addr) => println!("✅ {} listening on {}", name, addr),
            ListenerStatus::Disabled(reason) => println!("❌ {} disabled: {}", name, reason),
            ListenerStatus::Stopped => println!("⏹  {} stopped", name),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutting down");

    client.shutdown().await.context("Failed to log out")?;
    Ok(())
}

/// Log in as an operator, run `action`, and log out again
async fn with_admin_session<F, Fut>(admin: &AdminArgs, action: F) -> Result<()>
where
    F: FnOnce(Arc<HttpTunnelClient>, String) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let client = Arc::new(
        HttpTunnelClient::new(&admin.server, Duration::from_secs(30))
            .context("Failed to create API client")?,
    );
    let session_id = client
        .login(&admin.username, &admin.password)
        .await
        .context("Login failed")?;

    let result = action(client.clone(), session_id.clone()).await;

    if let Err(e) = client.logout(&session_id).await {
        // The action may have killed our own session
        warn!("Logout failed: {}", e);
    }
    result
}

async fn run_monitor(admin: AdminArgs) -> Result<()> {
    with_admin_session(&admin, |client, caller| async move {
        let sessions = client.monitor(&caller).await?;
        print_sessions(&sessions, &caller);
        Ok(())
    })
    .await
}

fn print_sessions(sessions: &[SessionInfo], caller: &str) {
    if sessions.is_empty() {
        println!("No active sessions");
        return;
    }

    for session in sessions {
        let marker = if session.session_id == caller { " (this)" } else { "" };
        let role = if session.admin { " [admin]" } else { "" };
        println!(
            "Session {}{} owner={}{} since={} last_activity={}",
            session.session_id,
            marker,
            session.owner,
            role,
            session.created_at.format("%Y-%m-%d %H:%M:%S"),
            session.last_activity.format("%Y-%m-%d %H:%M:%S"),
        );
        for conn in &session.connections {
            println!(
                "  #{:<5} {:<12} {} from {} read={}B written={}B last_activity={}",
                conn.connection_id,
                conn.state,
                conn.target,
                conn.local_addr.as_deref().unwrap_or("-"),
                conn.bytes_read,
                conn.bytes_written,
                conn.last_activity.format("%H:%M:%S"),
            );
        }
    }
}
