// Local test-record store: streaming NDJSON ingestion into SQLite,
// paginated/filtered queries and cached reference lists.

pub mod cache;
pub mod config;
pub mod db;
pub mod models;
pub mod query;
pub mod remote;
pub mod streaming;

pub use config::{AppConfig, ConfigError};
pub use db::RecordStore;
pub use models::{generate_record_id, TestRecord};
pub use query::QueryEngine;
pub use streaming::{StreamCoordinator, StreamIngestor};
