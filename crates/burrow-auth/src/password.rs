//! Argon2id password hashes for user entries

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use thiserror::Error;

/// Failures of hashing or checking a password
///
/// A wrong password is not one of them: [`verify_password`] reports it as
/// `Ok(false)`.
#[derive(Error, Debug)]
pub enum PasswordError {
    /// Argon2 could not produce a hash, e.g. the OS RNG failed
    #[error("Failed to hash password: {0}")]
    HashingFailed(String),

    /// The stored hash parsed but Argon2 could not run the comparison
    /// (unsupported algorithm or parameters)
    #[error("Failed to verify password: {0}")]
    VerificationFailed(String),

    /// The stored `password_hash` is not a PHC string
    #[error("Invalid password hash format: {0}")]
    InvalidHashFormat(String),
}

/// Produce a PHC string (`$argon2id$v=19$...`) with a fresh random salt
///
/// This is what `burrow hash-password` prints for the `password_hash` field of
/// a server user entry. Argon2 runs with its default parameters.
///
/// # Example
/// ```
/// use burrow_auth::password::{hash_password, verify_password};
///
/// let hash = hash_password("hunter2").unwrap();
/// assert!(hash.starts_with("$argon2id$"));
/// assert!(verify_password("hunter2", &hash).unwrap());
/// ```
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| PasswordError::HashingFailed(e.to_string()))
}

/// Check a plain password against a stored PHC string
///
/// # Arguments
/// * `password` - plain password sent with Login
/// * `hash` - the user's configured `password_hash`
///
/// # Returns
/// * `Ok(true)` - the password matches
/// * `Ok(false)` - it does not
/// * `Err(PasswordError)` - the hash is malformed or Argon2 failed
pub fn verify_password(password: &str, hash: &str) -> Result<bool, PasswordError> {
    let parsed =
        PasswordHash::new(hash).map_err(|e| PasswordError::InvalidHashFormat(e.to_string()))?;

    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(PasswordError::VerificationFailed(e.to_string())),
    }
}
