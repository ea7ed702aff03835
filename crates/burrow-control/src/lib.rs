//! Server side of the tunnel: sessions, logical connections and the registry
//! that serves the remote contract
pub mod buffer;
pub mod config;
pub mod connection;
pub mod registry;
pub mod session;
pub mod sweeper;

pub use buffer::{BufferError, Drained, RelayBuffer};
pub use config::RegistryConfig;
pub use connection::LogicalConnection;
pub use registry::{SweepReport, TunnelRegistry};
pub use session::Session;
pub use sweeper::spawn_sweeper;
