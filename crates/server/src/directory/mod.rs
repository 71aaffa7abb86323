//! Identity and user directory
//!
//! Accounts and sessions are owned by the account service. The messaging core
//! only needs two lookups from it: bearer token -> user id, and user id ->
//! display profile.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::Result;
use crate::models::UserProfile;

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// User id for a live session token, `None` if unknown or expired.
    async fn resolve_token(&self, token: &str) -> Result<Option<String>>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>>;
}

/// Reads the account service's SQLite database.
pub struct SqliteDirectory {
    pool: SqlitePool,
}

impl SqliteDirectory {
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("open users database {:?}", db_path))?;

        let directory = Self { pool };
        directory.init_db().await?;
        info!("[Directory] Opened {:?}", db_path);
        Ok(directory)
    }

    /// Private in-memory database; one connection so every query sees the same data.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let directory = Self { pool };
        directory.init_db().await?;
        Ok(directory)
    }

    /// Tables are created if the account service has not done so yet.
    async fn init_db(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                avatar_url TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn upsert_user(&self, profile: &UserProfile) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, username, avatar_url) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET username = excluded.username, avatar_url = excluded.avatar_url",
        )
        .bind(&profile.id)
        .bind(&profile.username)
        .bind(&profile.avatar_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_session(
        &self,
        token: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO sessions (token, user_id, expires_at) VALUES (?, ?, ?)")
            .bind(token)
            .bind(user_id)
            .bind(expires_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityResolver for SqliteDirectory {
    async fn resolve_token(&self, token: &str) -> Result<Option<String>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT user_id, expires_at FROM sessions WHERE token = ?")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;

        let Some((user_id, expires_at)) = row else {
            return Ok(None);
        };

        match DateTime::parse_from_rfc3339(&expires_at) {
            Ok(expires_at) if expires_at.with_timezone(&Utc) > Utc::now() => Ok(Some(user_id)),
            Ok(_) => {
                debug!("[Directory] Session for {} expired", user_id);
                Ok(None)
            }
            Err(_) => {
                debug!("[Directory] Session for {} has malformed expiry", user_id);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl UserDirectory for SqliteDirectory {
    async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let row: Option<(String, String, Option<String>)> =
            sqlx::query_as("SELECT id, username, avatar_url FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id, username, avatar_url)| UserProfile {
            id,
            username,
            avatar_url,
        }))
    }
}

/// Fixed in-memory tokens and profiles, for tests and local runs.
#[derive(Default)]
pub struct StaticDirectory {
    tokens: RwLock<HashMap<String, String>>,
    profiles: RwLock<HashMap<String, UserProfile>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, profile: UserProfile) -> Self {
        self.profiles.write().insert(profile.id.clone(), profile);
        self
    }

    pub fn with_token(self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.write().insert(token.into(), user_id.into());
        self
    }
}

#[async_trait]
impl IdentityResolver for StaticDirectory {
    async fn resolve_token(&self, token: &str) -> Result<Option<String>> {
        Ok(self.tokens.read().get(token).cloned())
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.profiles.read().get(user_id).cloned())
    }
}
