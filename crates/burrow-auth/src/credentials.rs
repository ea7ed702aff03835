//! Login credential checks
//!
//! The registry only sees the [`Authenticator`] trait. [`StaticAuthenticator`]
//! is the default backend, fed from the `users` section of the server config.

use crate::password::verify_password;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Unknown user or wrong password (deliberately indistinguishable)
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account disabled: {0}")]
    Disabled(String),

    #[error("Authentication backend error: {0}")]
    Backend(String),
}

/// Who a session belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    /// Admins may monitor and kill any session
    pub admin: bool,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Identity, AuthError>;
}

/// A configured user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    /// Argon2id PHC string, preferred over `password`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    /// Plaintext password, for development configs only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl UserEntry {
    pub fn with_password(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password_hash: None,
            password: Some(password.to_string()),
            admin: false,
            enabled: true,
        }
    }

    pub fn with_hash(username: &str, password_hash: &str) -> Self {
        Self {
            username: username.to_string(),
            password_hash: Some(password_hash.to_string()),
            password: None,
            admin: false,
            enabled: true,
        }
    }

    pub fn admin(mut self) -> Self {
        self.admin = true;
        self
    }

    fn matches(&self, password: &str) -> Result<bool, AuthError> {
        if let Some(hash) = &self.password_hash {
            return verify_password(password, hash).map_err(|e| AuthError::Backend(e.to_string()));
        }
        Ok(self.password.as_deref() == Some(password))
    }
}

/// Authenticator over a fixed user list
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    users: Vec<UserEntry>,
}

impl StaticAuthenticator {
    pub fn new(users: Vec<UserEntry>) -> Self {
        Self { users }
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Identity, AuthError> {
        let Some(user) = self.users.iter().find(|u| u.username == username) else {
            tracing::debug!(username = %username, "Login for unknown user");
            return Err(AuthError::InvalidCredentials);
        };

        if !user.matches(password)? {
            tracing::debug!(username = %username, "Login with wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        if !user.enabled {
            return Err(AuthError::Disabled(username.to_string()));
        }

        Ok(Identity {
            username: user.username.clone(),
            admin: user.admin,
        })
    }
}
