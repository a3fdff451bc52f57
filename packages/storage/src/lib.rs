// ABOUTME: Data layer and persistence for Kernel
// ABOUTME: SQLite-backed storage of agents, code versions, secrets and run records

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

pub mod agents;
pub mod models;
pub mod runs;
pub mod secrets;

pub use models::{
    Agent, AgentStatus, AgentVersion, RunRecord, RunStatus, Secret, DEFAULT_DEPENDENCIES,
};
pub use runs::RunStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("Duplicate value: {0}")]
    Duplicate(String),
    #[error("Run {0} is already terminal")]
    TerminalRun(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Open (creating if needed) the database at `url` and apply pending migrations.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);

    // Every in-memory connection would be its own database
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    info!("Database ready at {}", url);
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// SQLite-backed store shared by the API layer and the run engine.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn new_id() -> String {
    nanoid::nanoid!(12)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidTimestamp(value.to_string()))
}

pub(crate) fn parse_optional_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}

/// Map a UNIQUE constraint violation to `Duplicate`, everything else to `Database`.
pub(crate) fn map_unique_violation(err: sqlx::Error, what: &str) -> StorageError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            StorageError::Duplicate(what.to_string())
        }
        _ => StorageError::Database(err),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub async fn setup_test_store() -> SqliteStore {
        let pool = connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");
        SqliteStore::new(pool)
    }
}
