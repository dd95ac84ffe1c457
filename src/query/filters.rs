use super::{QueryError, QueryResult, MAX_PAGE_SIZE};
use crate::models::{IndexFilter, SortSpec, TestRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Table filter: index-backed predicates plus residual predicates that can
/// only be evaluated in memory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFilter {
    #[serde(flatten)]
    pub index: IndexFilter,
    /// Case-insensitive substring match on the ISN
    #[serde(default)]
    pub isn_contains: Option<String>,
    /// Top-level payload fields that must equal the given JSON values
    #[serde(default)]
    pub payload_equals: BTreeMap<String, Value>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_station(mut self, station: impl Into<String>) -> Self {
        self.index.station = Some(station.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.index.test_status = Some(status.into());
        self
    }

    pub fn with_date_range(mut self, from: Option<String>, to: Option<String>) -> Self {
        self.index.date_from = from;
        self.index.date_to = to;
        self
    }

    pub fn with_isn_contains(mut self, needle: impl Into<String>) -> Self {
        self.isn_contains = Some(needle.into());
        self
    }

    pub fn with_payload_equals(mut self, field: impl Into<String>, value: Value) -> Self {
        self.payload_equals.insert(field.into(), value);
        self
    }

    /// True when some predicate cannot be answered by the secondary indices
    pub fn has_residual(&self) -> bool {
        self.isn_contains.is_some() || !self.payload_equals.is_empty()
    }

    pub fn matches_residual(&self, record: &TestRecord) -> bool {
        if let Some(needle) = &self.isn_contains {
            if !record
                .isn
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase())
            {
                return false;
            }
        }

        self.payload_equals
            .iter()
            .all(|(field, expected)| record.payload.get(field) == Some(expected))
    }

    pub fn matches(&self, record: &TestRecord) -> bool {
        self.index.matches(record) && self.matches_residual(record)
    }
}

/// Page number + size, or an opaque cursor from a previous page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Pagination {
    /// 1-based page number
    Page { page: u64, page_size: u64 },
    /// `cursor: None` requests the first page
    Cursor {
        cursor: Option<String>,
        page_size: u64,
    },
}

impl Pagination {
    pub fn page(page: u64, page_size: u64) -> Self {
        Pagination::Page { page, page_size }
    }

    pub fn page_size(&self) -> u64 {
        match self {
            Pagination::Page { page_size, .. } | Pagination::Cursor { page_size, .. } => {
                *page_size
            }
        }
    }

    pub fn validate(&self) -> QueryResult<()> {
        let size = self.page_size();
        if size == 0 || size > MAX_PAGE_SIZE {
            return Err(QueryError::InvalidPagination(format!(
                "page size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, size
            )));
        }
        if let Pagination::Page { page: 0, .. } = self {
            return Err(QueryError::InvalidPagination(
                "page numbers start at 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Pagination::page(1, 100)
    }
}

/// Everything one table query needs. Constructed per call, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub filter: RecordFilter,
    #[serde(default)]
    pub sort: SortSpec,
    #[serde(default)]
    pub pagination: Pagination,
}
