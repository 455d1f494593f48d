//! Password hashing
//!
//! Argon2id with the crate's default parameters and a fresh random salt per
//! hash. Verification compares in constant time inside the argon2 crate.
//!
//! Hashing is CPU bound; async callers should go through
//! [`verify_password_blocking`] / [`hash_password_blocking`] so the work
//! runs on tokio's blocking pool.

use anyhow::{Context, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use std::sync::OnceLock;

/// Minimum accepted password length (characters)
pub const MIN_PASSWORD_LEN: usize = 8;

/// Maximum accepted password length (characters)
pub const MAX_PASSWORD_LEN: usize = 128;

/// Hash a password using Argon2id, returning a PHC string.
///
/// ```ignore
/// let hash = hash_password("correct horse battery")?;
/// assert!(hash.starts_with("$argon2id$"));
/// ```
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))
        .context("Password hashing failed")?;

    Ok(password_hash.to_string())
}

/// Verify a password against a stored PHC hash.
///
/// Returns `Ok(false)` on mismatch and `Err` only for a malformed hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| anyhow::anyhow!("Invalid password hash format: {}", e))
        .context("Failed to parse password hash")?;

    match Argon2::default().verify_password(password.as_bytes(), &parsed_hash) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(anyhow::anyhow!("Password verification failed: {}", e)),
    }
}

/// Burn the same work as a real verification.
///
/// Used when the account does not exist so response timing does not reveal
/// which emails are registered.
pub fn dummy_verify(password: &str) {
    static DUMMY_HASH: OnceLock<Option<String>> = OnceLock::new();

    let hash = DUMMY_HASH.get_or_init(|| hash_password("tradepost-timing-equalizer").ok());
    if let Some(hash) = hash {
        let _ = verify_password(password, hash);
    }
}

/// Length check shared by signup and password reset
pub fn validate_password_length(password: &str) -> Result<(), String> {
    let len = password.chars().count();
    if len < MIN_PASSWORD_LEN {
        return Err(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        ));
    }
    if len > MAX_PASSWORD_LEN {
        return Err(format!(
            "Password must be at most {} characters",
            MAX_PASSWORD_LEN
        ));
    }
    Ok(())
}

/// [`hash_password`] on the blocking pool
pub async fn hash_password_blocking(password: String) -> Result<String> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .context("Password hashing task failed")?
}

/// [`verify_password`] on the blocking pool
pub async fn verify_password_blocking(password: String, hash: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .context("Password verification task failed")?
}

/// [`dummy_verify`] on the blocking pool
pub async fn dummy_verify_blocking(password: String) {
    let _ = tokio::task::spawn_blocking(move || dummy_verify(&password)).await;
}
