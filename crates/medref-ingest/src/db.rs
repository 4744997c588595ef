//! SQLite connection pool and schema migrations
//!
//! The fingerprint store and the SQLite record store share one pool.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{IngestError, IngestResult};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://medref.db";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// How long SQLite waits on a locked database before reporting busy
    pub busy_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    pub max_lifetime_secs: Option<u64>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout_secs: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            busy_timeout_secs: DEFAULT_BUSY_TIMEOUT_SECS,
            idle_timeout_secs: Some(600),
            max_lifetime_secs: Some(1800),
        }
    }
}

impl DbConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> IngestResult<()> {
        if self.url.trim().is_empty() {
            return Err(IngestError::config("database.url must not be empty"));
        }
        if self.max_connections == 0 {
            return Err(IngestError::config("database.max_connections must be at least 1"));
        }
        if self.acquire_timeout_secs == 0 {
            return Err(IngestError::config("database.acquire_timeout_secs must be at least 1"));
        }
        Ok(())
    }
}

/// Open a bounded pool, creating the database file when missing
pub async fn create_pool(config: &DbConfig) -> IngestResult<SqlitePool> {
    config.validate()?;

    let connect_options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| IngestError::config(format!("invalid database url '{}': {}", config.url, e)))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

    let mut options = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));

    if let Some(idle_timeout) = config.idle_timeout_secs {
        options = options.idle_timeout(Duration::from_secs(idle_timeout));
    }

    if let Some(max_lifetime) = config.max_lifetime_secs {
        options = options.max_lifetime(Duration::from_secs(max_lifetime));
    }

    let pool = options
        .connect_with(connect_options)
        .await
        .map_err(|e| IngestError::from_store(e, None))?;

    info!(
        url = %config.url,
        max_connections = config.max_connections,
        "Database pool created"
    );

    Ok(pool)
}

/// Apply pending schema migrations
pub async fn migrate(pool: &SqlitePool) -> IngestResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Pool plus schema, ready for the stores
pub async fn connect(config: &DbConfig) -> IngestResult<SqlitePool> {
    let pool = create_pool(config).await?;
    migrate(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("medref.db").display());
        let pool = connect(&DbConfig::with_url(url)).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE '\\_%' ESCAPE '\\' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert!(names.contains(&"file_fingerprints"));
        assert!(names.contains(&"reference_records"));
    }

    #[test]
    fn test_validate_rejects_zero_connections() {
        let config = DbConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(IngestError::Configuration(_))));
    }
}
