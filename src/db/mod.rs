pub mod migrations;
pub mod records_db;

use thiserror::Error;

pub use migrations::{MigrationReport, MigrationRunner, SCHEMA_VERSION};
pub use records_db::{PageWindow, PagedQuery, RecordPage, RecordStore, SortKey, StatusBreakdownRow};

/// Result type for local store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the local record store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Field '{0}' has no secondary index")]
    NotIndexed(String),

    #[error("Migration {version} failed: {message}")]
    Migration { version: u32, message: String },

    #[error("Timeout waiting for database lock in {0}")]
    LockTimeout(&'static str),
}
