//! Config files for the server and client commands

use anyhow::{Context, Result};
use burrow_auth::UserEntry;
use burrow_client::ClientConfig;
use burrow_control::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address of the HTTP API
    pub listen: SocketAddr,
    /// Timeouts and buffer sizes, at the top level of the file
    #[serde(flatten)]
    pub registry: RegistryConfig,
    pub users: Vec<UserEntry>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            registry: RegistryConfig::default(),
            users: Vec::new(),
        }
    }
}

pub fn load_server_config(path: &Path) -> Result<ServerConfig> {
    let yaml = fs::read_to_string(path)
        .context(format!("Failed to read config file: {:?}", path))?;
    parse_server_config(&yaml).context(format!("Invalid config file: {:?}", path))
}

fn parse_server_config(yaml: &str) -> Result<ServerConfig> {
    let config: ServerConfig = serde_yaml::from_str(yaml).context("Failed to parse YAML")?;

    config
        .registry
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid registry settings: {}", e))?;
    for user in &config.users {
        if user.password_hash.is_none() && user.password.is_none() {
            anyhow::bail!("User {} has neither password nor password_hash", user.username);
        }
    }
    Ok(config)
}

pub fn load_client_config(path: &Path) -> Result<ClientConfig> {
    let yaml = fs::read_to_string(path)
        .context(format!("Failed to read config file: {:?}", path))?;
    let config: ClientConfig = serde_yaml::from_str(&yaml)
        .context(format!("Failed to parse config file: {:?}", path))?;

    if config.forwards.is_empty() {
        anyhow::bail!("No forwards configured in {:?}", path);
    }
    Ok(config)
}
