use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::SessionCredentials;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::info;

mod saver;
mod snapshot;

pub use saver::{SaveOutcome, StateSaver};
pub use snapshot::{AppStateSnapshot, GroupSettings, SharedState};

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read(&self) -> Result<Option<AppStateSnapshot>>;
    async fn write(&self, snapshot: &AppStateSnapshot) -> Result<()>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_credentials(&self) -> Result<Option<SessionCredentials>>;
    async fn save_credentials(&self, credentials: &SessionCredentials) -> Result<()>;
    async fn clear_credentials(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // every in-memory connection is a separate database
        let max_connections = if database_url.starts_with("sqlite::memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }
}

/// Reads the stored snapshot, or seeds the store with an empty one on first start.
pub async fn load_or_init(store: &dyn StateStore) -> Result<AppStateSnapshot> {
    let snapshot = store
        .read()
        .await
        .context("failed to read application state")?
        .unwrap_or_default();
    if snapshot.is_empty() {
        store
            .write(&snapshot)
            .await
            .context("failed to seed application state")?;
        info!("initialised empty application state");
    }
    Ok(snapshot)
}

#[async_trait]
impl StateStore for Storage {
    async fn read(&self) -> Result<Option<AppStateSnapshot>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT snapshot FROM app_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("failed to load application state")?;
        raw.map(|raw| {
            serde_json::from_str(&raw).context("stored application state is not valid JSON")
        })
        .transpose()
    }

    async fn write(&self, snapshot: &AppStateSnapshot) -> Result<()> {
        let raw = serde_json::to_string(snapshot).context("failed to encode application state")?;
        sqlx::query(
            r#"
            INSERT INTO app_state (id, snapshot, updated_at)
            VALUES (1, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                snapshot = excluded.snapshot,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(raw)
        .execute(&self.pool)
        .await
        .context("failed to save application state")?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for Storage {
    async fn load_credentials(&self) -> Result<Option<SessionCredentials>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT credentials FROM session_credentials WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .context("failed to load session credentials")?;
        raw.map(|raw| {
            serde_json::from_str(&raw).context("stored session credentials are not valid JSON")
        })
        .transpose()
    }

    async fn save_credentials(&self, credentials: &SessionCredentials) -> Result<()> {
        let raw =
            serde_json::to_string(credentials).context("failed to encode session credentials")?;
        sqlx::query(
            r#"
            INSERT INTO session_credentials (id, credentials, updated_at)
            VALUES (1, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                credentials = excluded.credentials,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(raw)
        .execute(&self.pool)
        .await
        .context("failed to save session credentials")?;
        Ok(())
    }

    async fn clear_credentials(&self) -> Result<()> {
        sqlx::query("DELETE FROM session_credentials")
            .execute(&self.pool)
            .await
            .context("failed to clear session credentials")?;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
