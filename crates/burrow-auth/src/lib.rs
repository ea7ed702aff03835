//! Credential verification for tunnel logins

pub mod credentials;
pub mod password;

pub use credentials::{AuthError, Authenticator, Identity, StaticAuthenticator, UserEntry};
pub use password::{hash_password, verify_password, PasswordError};

// Re-export so implementors don't need their own dependency
pub use async_trait::async_trait;
