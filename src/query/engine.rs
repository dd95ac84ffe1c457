use super::cursor::{decode_cursor, encode_cursor};
use super::filters::{Pagination, QueryOptions, RecordFilter};
use super::planner::{plan_query, QueryPlan};
use super::{QueryError, QueryResult};
use crate::db::{PageWindow, PagedQuery, RecordStore, SortKey};
use crate::models::{RecordField, SortDirection, SortSpec, TestOutcome, TestRecord};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;

/// One page of the records table
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TablePage {
    pub items: Vec<TestRecord>,
    pub total_items: u64,
    pub possibly_truncated: bool,
    pub has_more: bool,
    /// Cursor for the following page, present when `has_more`
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StationStatistics {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub other: u64,
}

impl StationStatistics {
    fn add(&mut self, outcome: TestOutcome, count: u64) {
        self.total += count;
        match outcome {
            TestOutcome::Pass => self.passed += count,
            TestOutcome::Fail => self.failed += count,
            TestOutcome::Other => self.other += count,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordStatistics {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub other: u64,
    /// Passed records as a fraction of all matching records
    pub pass_rate: f64,
    pub by_station: BTreeMap<String, StationStatistics>,
}

impl RecordStatistics {
    fn add(&mut self, station: &str, outcome: TestOutcome, count: u64) {
        self.total += count;
        match outcome {
            TestOutcome::Pass => self.passed += count,
            TestOutcome::Fail => self.failed += count,
            TestOutcome::Other => self.other += count,
        }
        self.by_station
            .entry(station.to_string())
            .or_default()
            .add(outcome, count);
    }

    fn finish(mut self) -> Self {
        self.pass_rate = if self.total == 0 {
            0.0
        } else {
            self.passed as f64 / self.total as f64
        };
        self
    }
}

/// Read-only query layer over the record store.
///
/// Pages are stable: the same inputs against an unmodified store return the
/// same rows in the same order, ties broken by record id.
pub struct QueryEngine {
    store: Arc<RecordStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn query_records_for_table(&self, options: &QueryOptions) -> QueryResult<TablePage> {
        options.pagination.validate()?;

        let mut page = match plan_query(&self.store, &options.filter)? {
            QueryPlan::IndexRange => self.index_range_page(options)?,
            QueryPlan::FilteredScan { index } => self.filtered_scan_page(options, index)?,
        };
        page.possibly_truncated = self.store.possibly_truncated()?;

        Ok(page)
    }

    /// Offset-paged convenience form; `page` is 1-based
    pub fn query_page(
        &self,
        filter: &RecordFilter,
        sort: SortSpec,
        page: u64,
        page_size: u64,
    ) -> QueryResult<TablePage> {
        self.query_records_for_table(&QueryOptions {
            filter: filter.clone(),
            sort,
            pagination: Pagination::page(page, page_size),
        })
    }

    /// Count and pass/fail breakdown of matching records.
    ///
    /// Index-only filters are answered with a grouped count; residual filters
    /// tally rows one at a time during an index-bounded scan.
    pub fn get_record_statistics(&self, filter: &RecordFilter) -> QueryResult<RecordStatistics> {
        let mut stats = RecordStatistics::default();

        match plan_query(&self.store, filter)? {
            QueryPlan::IndexRange => {
                for row in self.store.status_breakdown(&filter.index)? {
                    stats.add(&row.station, TestOutcome::classify(&row.test_status), row.count);
                }
            }
            QueryPlan::FilteredScan { index } => {
                self.store.scan_records(
                    &filter.index,
                    &SortSpec::primary_key(),
                    index,
                    |record| {
                        if filter.matches_residual(&record) {
                            stats.add(&record.station, record.outcome(), 1);
                        }
                        ControlFlow::Continue(())
                    },
                )?;
            }
        }

        Ok(stats.finish())
    }

    /// Values for a filter dropdown, read from the store's current contents
    pub fn get_distinct_values(&self, field: RecordField) -> QueryResult<Vec<String>> {
        Ok(self.store.get_distinct_values(field)?)
    }

    fn window(options: &QueryOptions) -> QueryResult<PageWindow> {
        Ok(match &options.pagination {
            Pagination::Page { page, page_size } => PageWindow::Offset {
                offset: (page - 1).checked_mul(*page_size).ok_or_else(|| {
                    QueryError::InvalidPagination(format!(
                        "page {} of size {} is out of range",
                        page, page_size
                    ))
                })?,
                limit: *page_size,
            },
            Pagination::Cursor {
                cursor: None,
                page_size,
            } => PageWindow::Offset {
                offset: 0,
                limit: *page_size,
            },
            Pagination::Cursor {
                cursor: Some(cursor),
                page_size,
            } => PageWindow::After {
                key: decode_cursor(cursor, &options.sort)?,
                limit: *page_size,
            },
        })
    }

    fn index_range_page(&self, options: &QueryOptions) -> QueryResult<TablePage> {
        let result = self.store.get_paged_records(&PagedQuery {
            filter: options.filter.index.clone(),
            sort: options.sort,
            window: Self::window(options)?,
        })?;

        let next_cursor = next_cursor(&result.records, result.has_more, &options.sort);
        Ok(TablePage {
            items: result.records,
            total_items: result.total_count,
            possibly_truncated: false,
            has_more: result.has_more,
            next_cursor,
        })
    }

    /// Fallback path: stream the index range in sort order, keep the rows that
    /// pass the residual predicates and fall inside the window, count the rest.
    fn filtered_scan_page(
        &self,
        options: &QueryOptions,
        index: Option<RecordField>,
    ) -> QueryResult<TablePage> {
        let (skip, after, limit) = match Self::window(options)? {
            PageWindow::Offset { offset, limit } => (offset, None, limit),
            PageWindow::After { key, limit } => (0, Some(key), limit),
        };

        let mut total = 0u64;
        let mut eligible = 0u64;
        let mut items = Vec::new();

        self.store
            .scan_records(&options.filter.index, &options.sort, index, |record| {
                if !options.filter.matches_residual(&record) {
                    return ControlFlow::Continue(());
                }
                total += 1;

                if let Some(key) = &after {
                    if !is_after(&record, key, &options.sort) {
                        return ControlFlow::Continue(());
                    }
                }

                eligible += 1;
                if eligible > skip && (items.len() as u64) < limit {
                    items.push(record);
                }
                ControlFlow::Continue(())
            })?;

        let has_more = eligible > skip.saturating_add(items.len() as u64);
        let next_cursor = next_cursor(&items, has_more, &options.sort);

        Ok(TablePage {
            items,
            total_items: total,
            possibly_truncated: false,
            has_more,
            next_cursor,
        })
    }
}

fn next_cursor(records: &[TestRecord], has_more: bool, sort: &SortSpec) -> Option<String> {
    if !has_more {
        return None;
    }
    records
        .last()
        .map(|last| encode_cursor(sort, &SortKey::of(last, sort)))
}

/// Whether `record` sorts strictly after `key` under `sort`
fn is_after(record: &TestRecord, key: &SortKey, sort: &SortSpec) -> bool {
    let ordering = if sort.field == RecordField::Id {
        let by_id = record.id.as_str().cmp(key.id.as_str());
        match sort.direction {
            SortDirection::Asc => by_id,
            SortDirection::Desc => by_id.reverse(),
        }
    } else {
        let by_value = record.field_value(sort.field).cmp(key.value.as_str());
        let by_value = match sort.direction {
            SortDirection::Asc => by_value,
            SortDirection::Desc => by_value.reverse(),
        };
        by_value.then_with(|| record.id.as_str().cmp(key.id.as_str()))
    };
    ordering == Ordering::Greater
}
