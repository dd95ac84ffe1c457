use super::filters::RecordFilter;
use crate::db::{RecordStore, StoreResult};
use crate::models::{IndexFilter, RecordField};

/// How a table query is executed against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPlan {
    /// Every predicate is answered by SQL over the secondary indices
    IndexRange,
    /// Scan one index (or the primary key when `index` is `None`) and apply
    /// residual predicates in memory, row by row
    FilteredScan { index: Option<RecordField> },
}

/// Pick the execution strategy for `filter`.
///
/// Filters made only of station/status/date predicates run as index-range
/// queries. Anything else scans the most selective indexed predicate, judged
/// by its current row count.
pub fn plan_query(store: &RecordStore, filter: &RecordFilter) -> StoreResult<QueryPlan> {
    if !filter.has_residual() {
        return Ok(QueryPlan::IndexRange);
    }

    let index = most_selective_index(store, &filter.index)?;
    log::debug!("[QUERY PLANNER] Residual filter, scanning via {:?}", index);
    Ok(QueryPlan::FilteredScan { index })
}

fn most_selective_index(
    store: &RecordStore,
    filter: &IndexFilter,
) -> StoreResult<Option<RecordField>> {
    let mut candidates: Vec<(RecordField, u64)> = Vec::new();

    if let Some(station) = &filter.station {
        candidates.push((
            RecordField::Station,
            store.get_count_by_index(RecordField::Station, station)?,
        ));
    }
    if let Some(status) = &filter.test_status {
        candidates.push((
            RecordField::TestStatus,
            store.get_count_by_index(RecordField::TestStatus, status)?,
        ));
    }
    if filter.date_from.is_some() || filter.date_to.is_some() {
        let date_only = IndexFilter {
            date_from: filter.date_from.clone(),
            date_to: filter.date_to.clone(),
            ..Default::default()
        };
        candidates.push((RecordField::TestDate, store.count_matching(&date_only)?));
    }

    Ok(candidates
        .into_iter()
        .min_by_key(|(_, count)| *count)
        .map(|(field, _)| field))
}
