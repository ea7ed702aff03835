//! Tunnel Protocol Definitions
//!
//! This crate defines the request/response contract spoken between the burrow
//! client and the tunnel registry. It is transport-agnostic: the same
//! [`TunnelService`] trait is implemented by the in-process registry and by the
//! HTTP client, so the connection pump never knows how calls are carried.

pub mod error;
pub mod messages;
pub mod service;

pub use error::{TunnelError, TunnelResult};
pub use messages::*;
pub use service::TunnelService;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum number of bytes returned by a single Read call (64KB)
pub const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// Per-direction relay buffer ceiling (256KB)
pub const DEFAULT_BUFFER_CAPACITY: usize = 256 * 1024;

/// Crate version reported by the Version call
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
