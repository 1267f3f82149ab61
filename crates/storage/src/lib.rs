use std::{collections::HashMap, fs, path::Path, str::FromStr};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::{CredentialPair, TokenSlot};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite,
};
use tokio::sync::RwLock;
use tracing::debug;
use zeroize::Zeroize;

/// Durable home of the bearer credentials. No validation of token content.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, slot: TokenSlot) -> Result<Option<String>>;
    async fn set(&self, slot: TokenSlot, value: &str) -> Result<()>;
    /// Empties every slot at once.
    async fn clear(&self) -> Result<()>;
}

/// Both halves of the session credential, or `None` if either is missing.
pub async fn credential_pair(store: &dyn CredentialStore) -> Result<Option<CredentialPair>> {
    let access_token = store.get(TokenSlot::Access).await?;
    let identity_token = store.get(TokenSlot::Identity).await?;
    Ok(match (access_token, identity_token) {
        (Some(access_token), Some(identity_token)) => Some(CredentialPair {
            access_token,
            identity_token,
        }),
        _ => None,
    })
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    slots: RwLock<HashMap<TokenSlot, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, slot: TokenSlot) -> Result<Option<String>> {
        Ok(self.slots.read().await.get(&slot).cloned())
    }

    async fn set(&self, slot: TokenSlot, value: &str) -> Result<()> {
        if let Some(mut previous) = self.slots.write().await.insert(slot, value.to_string()) {
            previous.zeroize();
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut slots = self.slots.write().await;
        for (_, mut value) in slots.drain() {
            value.zeroize();
        }
        Ok(())
    }
}

/// Credential slots persisted in a small SQLite table so a session survives restarts.
#[derive(Clone)]
pub struct SqliteCredentialStore {
    pool: Pool<Sqlite>,
}

impl SqliteCredentialStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid credentials database url '{database_url}'"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open credentials database '{database_url}'"))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credential_slots (
                slot       TEXT PRIMARY KEY NOT NULL,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to ensure credential_slots table exists")?;

        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn get(&self, slot: TokenSlot) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM credential_slots WHERE slot = ?")
                .bind(slot.storage_key())
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("failed to read credential slot {}", slot.storage_key()))?;
        Ok(value)
    }

    async fn set(&self, slot: TokenSlot, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credential_slots (slot, value) VALUES (?, ?)
            ON CONFLICT(slot) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(slot.storage_key())
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write credential slot {}", slot.storage_key()))?;
        debug!(slot = slot.storage_key(), "credential slot updated");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM credential_slots")
            .execute(&self.pool)
            .await
            .context("failed to clear credential slots")?;
        debug!("credential slots cleared");
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return Ok(());
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return Ok(());
    }

    let Some(parent) = Path::new(path).parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
