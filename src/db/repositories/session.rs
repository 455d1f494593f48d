//! Session repository
//!
//! Durable storage for user sessions. This table is the authoritative
//! answer to "does this session exist"; every read filters on the caller's
//! notion of `now` so an expired row is never returned, even before the
//! cleanup task has removed it.
//!
//! This module provides:
//! - `SessionRepository` trait defining the interface for session data access
//! - `SqlxSessionRepository` implementing the trait for SQLite and MySQL

use crate::config::DatabaseDriver;
use crate::db::pool::{mysql, sqlite};
use crate::db::DynDatabasePool;
use crate::models::Session;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row, SqlitePool};
use std::sync::Arc;

/// Session repository trait
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Insert a new session
    async fn create(&self, session: &Session) -> Result<()>;

    /// Get a session by token if it is still valid at `now`
    async fn get_active(&self, token: &str, now: DateTime<Utc>) -> Result<Option<Session>>;

    /// List a user's sessions still valid at `now`, newest first
    async fn list_active_by_user(&self, user_id: i64, now: DateTime<Utc>) -> Result<Vec<Session>>;

    /// Delete a session. Deleting a missing session is not an error.
    async fn delete(&self, token: &str) -> Result<()>;

    /// Delete every session that expired at or before `now`; returns the count
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// SQLx-based session repository implementation
///
/// Supports both SQLite and MySQL databases.
pub struct SqlxSessionRepository {
    pool: DynDatabasePool,
}

impl SqlxSessionRepository {
    /// Create a new SQLx session repository
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    /// Create a boxed repository for use with dependency injection
    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn SessionRepository> {
        Arc::new(Self::new(pool))
    }
}

#[async_trait]
impl SessionRepository for SqlxSessionRepository {
    async fn create(&self, session: &Session) -> Result<()> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => create_session_sqlite(sqlite(&self.pool)?, session).await,
            DatabaseDriver::Mysql => create_session_mysql(mysql(&self.pool)?, session).await,
        }
    }

    async fn get_active(&self, token: &str, now: DateTime<Utc>) -> Result<Option<Session>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => get_active_sqlite(sqlite(&self.pool)?, token, now).await,
            DatabaseDriver::Mysql => get_active_mysql(mysql(&self.pool)?, token, now).await,
        }
    }

    async fn list_active_by_user(&self, user_id: i64, now: DateTime<Utc>) -> Result<Vec<Session>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                list_active_by_user_sqlite(sqlite(&self.pool)?, user_id, now).await
            }
            DatabaseDriver::Mysql => {
                list_active_by_user_mysql(mysql(&self.pool)?, user_id, now).await
            }
        }
    }

    async fn delete(&self, token: &str) -> Result<()> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => delete_session_sqlite(sqlite(&self.pool)?, token).await,
            DatabaseDriver::Mysql => delete_session_mysql(mysql(&self.pool)?, token).await,
        }
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => delete_expired_sqlite(sqlite(&self.pool)?, now).await,
            DatabaseDriver::Mysql => delete_expired_mysql(mysql(&self.pool)?, now).await,
        }
    }
}

const SELECT_COLUMNS: &str = "SELECT id, user_id, ip_address, user_agent, expires_at, created_at FROM sessions";

// ============================================================================
// SQLite implementations
// ============================================================================

async fn create_session_sqlite(pool: &SqlitePool, session: &Session) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sessions (id, user_id, ip_address, user_agent, expires_at, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&session.id)
    .bind(session.user_id)
    .bind(&session.ip_address)
    .bind(&session.user_agent)
    .bind(session.expires_at)
    .bind(session.created_at)
    .execute(pool)
    .await
    .context("Failed to create session")?;

    Ok(())
}

async fn get_active_sqlite(
    pool: &SqlitePool,
    token: &str,
    now: DateTime<Utc>,
) -> Result<Option<Session>> {
    let row = sqlx::query(&format!("{} WHERE id = ? AND expires_at > ?", SELECT_COLUMNS))
        .bind(token)
        .bind(now)
        .fetch_optional(pool)
        .await
        .context("Failed to get session")?;

    row.as_ref().map(row_to_session_sqlite).transpose()
}

async fn list_active_by_user_sqlite(
    pool: &SqlitePool,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<Session>> {
    let rows = sqlx::query(&format!(
        "{} WHERE user_id = ? AND expires_at > ? ORDER BY created_at DESC",
        SELECT_COLUMNS
    ))
    .bind(user_id)
    .bind(now)
    .fetch_all(pool)
    .await
    .context("Failed to list sessions")?;

    rows.iter().map(row_to_session_sqlite).collect()
}

async fn delete_session_sqlite(pool: &SqlitePool, token: &str) -> Result<()> {
    sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(token)
        .execute(pool)
        .await
        .context("Failed to delete session")?;

    Ok(())
}

async fn delete_expired_sqlite(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(now)
        .execute(pool)
        .await
        .context("Failed to delete expired sessions")?;

    Ok(result.rows_affected())
}

fn row_to_session_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<Session> {
    Ok(Session {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn create_session_mysql(pool: &MySqlPool, session: &Session) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sessions (id, user_id, ip_address, user_agent, expires_at, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&session.id)
    .bind(session.user_id)
    .bind(&session.ip_address)
    .bind(&session.user_agent)
    .bind(session.expires_at)
    .bind(session.created_at)
    .execute(pool)
    .await
    .context("Failed to create session")?;

    Ok(())
}

async fn get_active_mysql(
    pool: &MySqlPool,
    token: &str,
    now: DateTime<Utc>,
) -> Result<Option<Session>> {
    let row = sqlx::query(&format!("{} WHERE id = ? AND expires_at > ?", SELECT_COLUMNS))
        .bind(token)
        .bind(now)
        .fetch_optional(pool)
        .await
        .context("Failed to get session")?;

    row.as_ref().map(row_to_session_mysql).transpose()
}

async fn list_active_by_user_mysql(
    pool: &MySqlPool,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<Session>> {
    let rows = sqlx::query(&format!(
        "{} WHERE user_id = ? AND expires_at > ? ORDER BY created_at DESC",
        SELECT_COLUMNS
    ))
    .bind(user_id)
    .bind(now)
    .fetch_all(pool)
    .await
    .context("Failed to list sessions")?;

    rows.iter().map(row_to_session_mysql).collect()
}

async fn delete_session_mysql(pool: &MySqlPool, token: &str) -> Result<()> {
    sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(token)
        .execute(pool)
        .await
        .context("Failed to delete session")?;

    Ok(())
}

async fn delete_expired_mysql(pool: &MySqlPool, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(now)
        .execute(pool)
        .await
        .context("Failed to delete expired sessions")?;

    Ok(result.rows_affected())
}

fn row_to_session_mysql(row: &sqlx::mysql::MySqlRow) -> Result<Session> {
    Ok(Session {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}
