//! Password reset model

use chrono::{DateTime, Utc};

/// A pending password reset. Only the token digest is stored.
#[derive(Debug, Clone)]
pub struct PasswordReset {
    pub token_hash: String,
    pub user_id: i64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl PasswordReset {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
