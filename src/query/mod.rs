// Read-side query layer over the local record store
//
// - `filters`: filter, sort and pagination descriptors built per call
// - `cursor`: opaque keyset cursors for cursor-based paging
// - `planner`: chooses between index-range queries and filtered index scans
// - `engine`: table pages, statistics and filter dropdown values

pub mod cursor;
pub mod engine;
pub mod filters;
pub mod planner;

use crate::db::StoreError;
use thiserror::Error;

pub use engine::{QueryEngine, RecordStatistics, StationStatistics, TablePage};
pub use filters::{Pagination, QueryOptions, RecordFilter};
pub use planner::QueryPlan;

/// Largest page a single query may request
pub const MAX_PAGE_SIZE: u64 = 5_000;

pub type QueryResult<T> = Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Invalid pagination: {0}")]
    InvalidPagination(String),
}
