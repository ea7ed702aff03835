//! Client side of the tunnel
//!
//! Accepts local TCP connections and carries each one over a logical tunnel
//! connection, using any [`burrow_proto::TunnelService`] as transport.

pub mod client;
pub mod config;
pub mod listener;
pub mod pump;
pub mod session;

pub use client::{ClientError, TunnelClient};
pub use config::{ClientConfig, ClientConfigBuilder, PortForward};
pub use listener::{ListenerError, ListenerStatus, LocalListener};
pub use pump::{ConnectionPump, PumpSettings, PumpState};
pub use session::ClientSession;
