//! Session model
//!
//! A session is immutable once issued. The same logical session is stored in
//! the database (authoritative) and optionally mirrored into the volatile
//! cache as a flat field map; conversion to and from that map happens only
//! here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum stored length of a client user-agent string (in characters)
pub const MAX_USER_AGENT_LEN: usize = 512;

/// Session entity for user authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque token (64 hex chars)
    #[serde(skip_serializing)]
    pub id: String,
    /// Owning user ID
    pub user_id: i64,
    /// Client IP address as reported by the request (not validated)
    pub ip_address: Option<String>,
    /// Client user agent, truncated to `MAX_USER_AGENT_LEN`
    pub user_agent: Option<String>,
    /// Expiration timestamp
    pub expires_at: DateTime<Utc>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Build a new session. The user agent is truncated to the storage bound.
    pub fn new(
        id: String,
        user_id: i64,
        ip_address: Option<String>,
        user_agent: Option<String>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            ip_address,
            user_agent: user_agent.map(|ua| truncate_user_agent(&ua)),
            expires_at,
            created_at,
        }
    }

    /// A session is valid only while `now < expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, or `None` once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        (self.expires_at - now)
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
    }

    /// Flatten into the field map stored in the volatile cache.
    pub fn to_cache_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::with_capacity(5);
        fields.insert("user_id".to_string(), self.user_id.to_string());
        fields.insert("created_at".to_string(), self.created_at.to_rfc3339());
        fields.insert("expires_at".to_string(), self.expires_at.to_rfc3339());
        if let Some(ip) = &self.ip_address {
            fields.insert("ip_address".to_string(), ip.clone());
        }
        if let Some(ua) = &self.user_agent {
            fields.insert("user_agent".to_string(), ua.clone());
        }
        fields
    }

    /// Rebuild a session from a cached field map.
    ///
    /// Returns `None` if any required field is missing or unparsable; callers
    /// treat that as a cache miss.
    pub fn from_cache_fields(token: &str, fields: &HashMap<String, String>) -> Option<Self> {
        let user_id = fields.get("user_id")?.parse::<i64>().ok()?;
        let created_at = parse_timestamp(fields.get("created_at")?)?;
        let expires_at = parse_timestamp(fields.get("expires_at")?)?;

        Some(Self {
            id: token.to_string(),
            user_id,
            ip_address: fields.get("ip_address").cloned(),
            user_agent: fields.get("user_agent").cloned(),
            expires_at,
            created_at,
        })
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn truncate_user_agent(ua: &str) -> String {
    match ua.char_indices().nth(MAX_USER_AGENT_LEN) {
        Some((idx, _)) => ua[..idx].to_string(),
        None => ua.to_string(),
    }
}
