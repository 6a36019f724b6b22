//! Tandem Cache - SQLite record store
//!
//! Implements the `IMetadataStore` port of `tandem-core`. One table holds
//! the live record of every identity, another keeps each persisted revision
//! under a monotonic sequence number, which is what the change feed and the
//! sync driver checkpoint are expressed in.
//!
//! Writes are optimistic: a record is stored only if its `target` still
//! matches the stored one, otherwise the caller gets a revision conflict and
//! re-reads.
//!
//! ```no_run
//! use tandem_cache::{DatabasePool, SqliteMetadataStore};
//! use tandem_core::config::Config;
//!
//! # async fn example(config: Config) -> anyhow::Result<()> {
//! let pool = DatabasePool::open(&config.store).await?;
//! let store = SqliteMetadataStore::open(pool.pool().clone()).await?;
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod store;

pub use pool::DatabasePool;
pub use store::SqliteMetadataStore;

/// Failures of the SQLite backend
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("record store unavailable: {0}")]
    ConnectionFailed(String),

    #[error("record store query failed: {0}")]
    QueryFailed(String),

    #[error("record store schema failed: {0}")]
    MigrationFailed(String),

    /// A stored record body does not decode
    #[error("undecodable record: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}
