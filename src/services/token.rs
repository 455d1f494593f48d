//! Opaque token generation
//!
//! Session and password reset tokens are 32 bytes from the OS CSPRNG,
//! rendered as lowercase hex. Raw tokens never reach the logs; use
//! [`fingerprint`] to correlate log lines instead.

use anyhow::Result;
use argon2::password_hash::rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

/// Token entropy in bytes
pub const TOKEN_BYTES: usize = 32;

/// Length of a rendered token
pub const TOKEN_LEN: usize = TOKEN_BYTES * 2;

const FINGERPRINT_LEN: usize = 12;

/// Generate a new random token (64 hex chars)
pub fn generate_token() -> Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| anyhow::anyhow!("Failed to read from OS random source: {}", e))?;
    Ok(hex::encode(bytes))
}

/// SHA-256 of a token as hex; what gets stored for single-use secrets
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Short, non-reversible identifier for a token, safe to log
pub fn fingerprint(token: &str) -> String {
    let mut digest = hash_token(token);
    digest.truncate(FINGERPRINT_LEN);
    digest
}

/// Cheap shape check before touching any store
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LEN && token.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
