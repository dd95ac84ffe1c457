use super::{MigrationRunner, StoreError, StoreResult};
use crate::models::{IndexFilter, RecordField, SortDirection, SortSpec, TestRecord};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
// Metadata writes happen on async workers; they wait out at most one batch commit
const META_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

pub const META_POSSIBLY_TRUNCATED: &str = "possibly_truncated";
pub const META_TOTAL_ESTIMATED: &str = "total_estimated";

const RECORD_COLUMNS: &str = "id, isn, test_start_time, station, test_status, test_date, payload";

const UPSERT_RECORD: &str = "INSERT INTO records
        (id, isn, test_start_time, station, test_status, test_date, payload, ingested_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
     ON CONFLICT(id) DO UPDATE SET
        station = excluded.station,
        test_status = excluded.test_status,
        test_date = excluded.test_date,
        payload = excluded.payload,
        ingested_at = excluded.ingested_at";

/// Keyset position: sort-column value and id of the last row already returned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub value: String,
    pub id: String,
}

impl SortKey {
    pub fn of(record: &TestRecord, sort: &SortSpec) -> Self {
        Self {
            value: record.field_value(sort.field).to_string(),
            id: record.id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageWindow {
    Offset { offset: u64, limit: u64 },
    After { key: SortKey, limit: u64 },
}

#[derive(Debug, Clone)]
pub struct PagedQuery {
    pub filter: IndexFilter,
    pub sort: SortSpec,
    pub window: PageWindow,
}

#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    pub records: Vec<TestRecord>,
    /// Rows matching the filter, independent of the window
    pub total_count: u64,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusBreakdownRow {
    pub station: String,
    pub test_status: String,
    pub count: u64,
}

/// WHERE clause assembled from index predicates, with positional parameters
#[derive(Debug, Clone, Default)]
struct WhereClause {
    clauses: Vec<String>,
    params: Vec<SqlValue>,
}

impl WhereClause {
    fn from_filter(filter: &IndexFilter) -> Self {
        let mut clause = Self::default();
        if let Some(station) = &filter.station {
            clause.push("station = ?", [station.clone()]);
        }
        if let Some(status) = &filter.test_status {
            clause.push("test_status = ?", [status.clone()]);
        }
        if let Some(from) = &filter.date_from {
            clause.push("test_date >= ?", [from.clone()]);
        }
        if let Some(to) = &filter.date_to {
            clause.push("test_date <= ?", [to.clone()]);
        }
        clause
    }

    fn push<const N: usize>(&mut self, sql: &str, values: [String; N]) {
        self.clauses.push(sql.to_string());
        self.params.extend(values.into_iter().map(SqlValue::Text));
    }

    /// Restrict to rows strictly after `key` in `sort` order
    fn after(&mut self, sort: &SortSpec, key: &SortKey) {
        if sort.field == RecordField::Id {
            let sql = match sort.direction {
                SortDirection::Asc => "id > ?",
                SortDirection::Desc => "id < ?",
            };
            self.push(sql, [key.id.clone()]);
            return;
        }

        let column = sort.field.column();
        let cmp = match sort.direction {
            SortDirection::Asc => ">",
            SortDirection::Desc => "<",
        };
        let sql = format!(
            "({column} {cmp} ? OR ({column} = ? AND id > ?))",
            column = column,
            cmp = cmp
        );
        self.push(&sql, [key.value.clone(), key.value.clone(), key.id.clone()]);
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn order_by(sort: &SortSpec) -> String {
    if sort.field == RecordField::Id {
        format!(" ORDER BY id {}", sort.direction.sql())
    } else {
        format!(
            " ORDER BY {} {}, id ASC",
            sort.field.column(),
            sort.direction.sql()
        )
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<TestRecord> {
    let payload_json: String = row.get(6)?;
    let payload = serde_json::from_str(&payload_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

    Ok(TestRecord {
        id: row.get(0)?,
        isn: row.get(1)?,
        test_start_time: row.get(2)?,
        station: row.get(3)?,
        test_status: row.get(4)?,
        test_date: row.get(5)?,
        payload,
    })
}

fn truncation_flag(truncated: bool) -> &'static str {
    if truncated {
        "1"
    } else {
        "0"
    }
}

fn count_where(conn: &Connection, clause: &WhereClause) -> StoreResult<u64> {
    let sql = format!("SELECT COUNT(*) FROM records{}", clause.sql());
    let count: i64 = conn.query_row(&sql, params_from_iter(clause.params.iter()), |row| {
        row.get(0)
    })?;
    Ok(count as u64)
}

fn select_records(
    conn: &Connection,
    clause: &WhereClause,
    sort: &SortSpec,
    limit: u64,
    offset: u64,
) -> StoreResult<Vec<TestRecord>> {
    let sql = format!(
        "SELECT {} FROM records{}{} LIMIT {} OFFSET {}",
        RECORD_COLUMNS,
        clause.sql(),
        order_by(sort),
        limit,
        // SQLite integers are signed 64-bit; anything past that is past the end
        offset.min(i64::MAX as u64)
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(params_from_iter(clause.params.iter()), record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

fn open_connection(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;

    // Set busy timeout so the reader waits out checkpoints instead of failing
    conn.busy_timeout(BUSY_TIMEOUT)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -64000;
         PRAGMA temp_store = MEMORY;",
    )?;

    Ok(conn)
}

/// Disk-backed record table with secondary indices on station, status and test date.
///
/// Writes go through a dedicated writer connection, one transaction per batch.
/// Reads use a separate query-only connection; with WAL journaling a read sees
/// the database as of its own start, so it observes either the state before or
/// after a concurrent batch, never part of one.
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl RecordStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> StoreResult<Self> {
        let path = db_path.as_ref().to_path_buf();

        let mut writer = open_connection(&path)?;
        let report = MigrationRunner::new(&mut writer).run_pending()?;
        if report.applied > 0 || report.wiped {
            log::info!(
                "[RECORD STORE] Schema v{} -> v{} ({} migrations applied, wiped: {})",
                report.from_version,
                report.to_version,
                report.applied,
                report.wiped
            );
        }

        let reader = open_connection(&path)?;
        reader.pragma_update(None, "query_only", true)?;

        log::info!("[RECORD STORE] Opened '{}'", path.display());

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Upsert a batch of records in a single transaction.
    ///
    /// Either every record of the batch becomes visible or none does.
    pub fn put_records_batch(&self, records: &[TestRecord]) -> StoreResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut conn = self
            .writer
            .try_lock_for(WRITE_LOCK_TIMEOUT)
            .ok_or(StoreError::LockTimeout("put_records_batch"))?;

        let now = chrono::Utc::now().to_rfc3339();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_RECORD)?;
            for record in records {
                let payload = serde_json::to_string(&record.payload)?;
                stmt.execute(params![
                    record.id,
                    record.isn,
                    record.test_start_time,
                    record.station,
                    record.test_status,
                    record.test_date,
                    payload,
                    now,
                ])?;
            }
        }
        tx.commit()?;

        log::debug!("[RECORD STORE] Committed batch of {} records", records.len());
        Ok(records.len())
    }

    /// One page of records plus the total number of matching rows.
    ///
    /// Count and page are read inside one read transaction so they describe
    /// the same snapshot.
    pub fn get_paged_records(&self, query: &PagedQuery) -> StoreResult<RecordPage> {
        let mut conn = self.reader.lock();
        let tx = conn.transaction()?;

        let filter_clause = WhereClause::from_filter(&query.filter);
        let total_count = count_where(&tx, &filter_clause)?;

        let page = match &query.window {
            PageWindow::Offset { offset, limit } => {
                let records = select_records(&tx, &filter_clause, &query.sort, *limit, *offset)?;
                let has_more = offset.saturating_add(records.len() as u64) < total_count;
                RecordPage {
                    records,
                    total_count,
                    has_more,
                }
            }
            PageWindow::After { key, limit } => {
                let mut clause = filter_clause.clone();
                clause.after(&query.sort, key);
                let mut records = select_records(&tx, &clause, &query.sort, limit + 1, 0)?;
                let has_more = records.len() as u64 > *limit;
                records.truncate(*limit as usize);
                RecordPage {
                    records,
                    total_count,
                    has_more,
                }
            }
        };

        tx.commit()?;
        Ok(page)
    }

    /// Stream matching rows in sort order through `visit` without collecting them.
    ///
    /// `index_hint` forces the scan onto one secondary index. The hinted field
    /// must carry a predicate in `filter`, otherwise the hint is ignored.
    /// Returns the number of rows visited.
    pub fn scan_records<F>(
        &self,
        filter: &IndexFilter,
        sort: &SortSpec,
        index_hint: Option<RecordField>,
        mut visit: F,
    ) -> StoreResult<u64>
    where
        F: FnMut(TestRecord) -> ControlFlow<()>,
    {
        let clause = WhereClause::from_filter(filter);
        let hint = index_hint
            .filter(|field| filter_constrains(filter, *field))
            .and_then(RecordField::index_name)
            .map(|name| format!(" INDEXED BY {}", name))
            .unwrap_or_default();

        let sql = format!(
            "SELECT {} FROM records{}{}{}",
            RECORD_COLUMNS,
            hint,
            clause.sql(),
            order_by(sort)
        );

        let conn = self.reader.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(clause.params.iter()))?;

        let mut visited = 0u64;
        while let Some(row) = rows.next()? {
            let record = record_from_row(row)?;
            visited += 1;
            if visit(record).is_break() {
                break;
            }
        }

        Ok(visited)
    }

    pub fn get_total_count(&self) -> StoreResult<u64> {
        let conn = self.reader.lock();
        count_where(&conn, &WhereClause::default())
    }

    /// Number of rows whose indexed `field` equals `value`
    pub fn get_count_by_index(&self, field: RecordField, value: &str) -> StoreResult<u64> {
        if !field.is_indexed() {
            return Err(StoreError::NotIndexed(field.to_string()));
        }

        let mut clause = WhereClause::default();
        clause.push(&format!("{} = ?", field.column()), [value.to_string()]);

        let conn = self.reader.lock();
        count_where(&conn, &clause)
    }

    pub fn count_matching(&self, filter: &IndexFilter) -> StoreResult<u64> {
        let conn = self.reader.lock();
        count_where(&conn, &WhereClause::from_filter(filter))
    }

    /// Row counts grouped by station and raw status
    pub fn status_breakdown(&self, filter: &IndexFilter) -> StoreResult<Vec<StatusBreakdownRow>> {
        let clause = WhereClause::from_filter(filter);
        let sql = format!(
            "SELECT station, test_status, COUNT(*) FROM records{}
             GROUP BY station, test_status
             ORDER BY station, test_status",
            clause.sql()
        );

        let conn = self.reader.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(clause.params.iter()), |row| {
                Ok(StatusBreakdownRow {
                    station: row.get(0)?,
                    test_status: row.get(1)?,
                    count: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Distinct values of a column, sorted ascending, read from the live table
    pub fn get_distinct_values(&self, field: RecordField) -> StoreResult<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT {col} FROM records ORDER BY {col}",
            col = field.column()
        );

        let conn = self.reader.lock();
        let mut stmt = conn.prepare(&sql)?;
        let values = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(values)
    }

    pub fn get_record(&self, id: &str) -> StoreResult<Option<TestRecord>> {
        let conn = self.reader.lock();
        let sql = format!("SELECT {} FROM records WHERE id = ?1", RECORD_COLUMNS);
        let record = conn
            .query_row(&sql, params![id], record_from_row)
            .optional()?;
        Ok(record)
    }

    /// Remove every record and dataset flag. Returns the number of records removed.
    pub fn clear_all_records(&self) -> StoreResult<u64> {
        let mut conn = self
            .writer
            .try_lock_for(WRITE_LOCK_TIMEOUT)
            .ok_or(StoreError::LockTimeout("clear_all_records"))?;

        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM records", [])?;
        tx.execute("DELETE FROM store_meta", [])?;
        tx.commit()?;

        log::info!("[RECORD STORE] Cleared {} records", removed);
        Ok(removed as u64)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        self.set_meta_entries(&[(key, value.to_string())])
    }

    /// Write several `store_meta` keys in one transaction
    pub fn set_meta_entries(&self, entries: &[(&str, String)]) -> StoreResult<()> {
        let mut conn = self
            .writer
            .try_lock_for(META_LOCK_TIMEOUT)
            .ok_or(StoreError::LockTimeout("set_meta"))?;

        let now = chrono::Utc::now().to_rfc3339();
        let tx = conn.transaction()?;
        for (key, value) in entries {
            tx.execute(
                "INSERT INTO store_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
        let value = self
            .reader
            .lock()
            .query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_possibly_truncated(&self, truncated: bool) -> StoreResult<()> {
        self.set_meta(META_POSSIBLY_TRUNCATED, truncation_flag(truncated))
    }

    /// Persist what a stream's metadata frame reported
    pub fn record_stream_metadata(
        &self,
        truncated: bool,
        total_estimated: Option<u64>,
    ) -> StoreResult<()> {
        let mut entries = vec![(META_POSSIBLY_TRUNCATED, truncation_flag(truncated).to_string())];
        if let Some(total) = total_estimated {
            entries.push((META_TOTAL_ESTIMATED, total.to_string()));
        }
        self.set_meta_entries(&entries)
    }

    /// Whether the last accepted stream reported that the server truncated its result
    pub fn possibly_truncated(&self) -> StoreResult<bool> {
        Ok(self
            .get_meta(META_POSSIBLY_TRUNCATED)?
            .map(|v| v == "1")
            .unwrap_or(false))
    }
}

fn filter_constrains(filter: &IndexFilter, field: RecordField) -> bool {
    match field {
        RecordField::Station => filter.station.is_some(),
        RecordField::TestStatus => filter.test_status.is_some(),
        RecordField::TestDate => filter.date_from.is_some() || filter.date_to.is_some(),
        _ => false,
    }
}
