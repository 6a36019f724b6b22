//! SQLite connection pool of the record store
//!
//! File databases run in WAL mode so watchers merging changes and the sync
//! driver reading the change feed do not block each other. The schema is
//! applied on every open; statements are idempotent.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use tandem_core::config::StoreConfig;

use crate::CacheError;

const SCHEMA: &str = include_str!("migrations/0001_records.sql");

/// Connections of a file database
const MAX_CONNECTIONS: u32 = 5;

/// Wait for a writer holding the database lock before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool of SQLite connections backing [`crate::SqliteMetadataStore`]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens the database configured in the `store` section
    pub async fn open(config: &StoreConfig) -> Result<Self, CacheError> {
        Self::new(&config.path).await
    }

    /// Opens (creating it and its folder if needed) the database at `db_path`
    ///
    /// # Errors
    ///
    /// `CacheError::ConnectionFailed` when the file cannot be opened,
    /// `CacheError::MigrationFailed` when the schema cannot be applied.
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "cannot create folder {} for the record store: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "cannot open record store {}: {e}",
                    db_path.display()
                ))
            })?;

        Self::apply_schema(&pool).await?;
        tracing::info!(path = %db_path.display(), "Record store opened");
        Ok(Self { pool })
    }

    /// Database living as long as the pool, for tests
    ///
    /// An in-memory SQLite database belongs to one connection, so the pool
    /// holds exactly one and never recycles it.
    pub async fn in_memory() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CacheError::ConnectionFailed(format!("in-memory record store: {e}")))?;

        Self::apply_schema(&pool).await?;
        tracing::debug!("In-memory record store opened");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn apply_schema(pool: &SqlitePool) -> Result<(), CacheError> {
        sqlx::raw_sql(SCHEMA)
            .execute(pool)
            .await
            .map_err(|e| CacheError::MigrationFailed(format!("record store schema: {e}")))?;
        tracing::debug!("Record store schema applied");
        Ok(())
    }
}
