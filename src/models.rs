// Core record types shared by the store, the ingestor and the query engine

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Separator between ISN and test start time in a composite record id
pub const RECORD_ID_SEPARATOR: char = '|';

/// Deterministic primary key for a test record.
///
/// Re-ingesting the same `(isn, test_start_time)` pair always produces the same
/// id, which is what makes batch writes idempotent upserts.
pub fn generate_record_id(isn: &str, test_start_time: &str) -> String {
    format!("{}{}{}", isn, RECORD_ID_SEPARATOR, test_start_time)
}

/// One manufacturing test record as held by the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
    pub id: String,
    pub isn: String,
    pub test_start_time: String,
    pub station: String,
    pub test_status: String,
    /// Calendar date (`YYYY-MM-DD`) used for range filtering
    pub test_date: String,
    /// Opaque measurement data
    pub payload: Map<String, Value>,
}

impl TestRecord {
    pub fn new(
        isn: impl Into<String>,
        test_start_time: impl Into<String>,
        station: impl Into<String>,
        test_status: impl Into<String>,
        test_date: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        let isn = isn.into();
        let test_start_time = test_start_time.into();
        Self {
            id: generate_record_id(&isn, &test_start_time),
            isn,
            test_start_time,
            station: station.into(),
            test_status: test_status.into(),
            test_date: test_date.into(),
            payload,
        }
    }

    pub fn outcome(&self) -> TestOutcome {
        TestOutcome::classify(&self.test_status)
    }

    /// Value of a column by field, as stored in the table
    pub fn field_value(&self, field: RecordField) -> &str {
        match field {
            RecordField::Id => &self.id,
            RecordField::Isn => &self.isn,
            RecordField::TestStartTime => &self.test_start_time,
            RecordField::Station => &self.station,
            RecordField::TestStatus => &self.test_status,
            RecordField::TestDate => &self.test_date,
        }
    }
}

/// A data line as delivered by the remote test-data API.
///
/// Everything that is not one of the indexed columns ends up in `payload`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRecord {
    #[serde(alias = "ISN")]
    pub isn: String,
    #[serde(alias = "TestStartTime")]
    pub test_start_time: String,
    #[serde(default, alias = "Station")]
    pub station: Option<String>,
    #[serde(default, alias = "TestStatus")]
    pub test_status: Option<String>,
    #[serde(default, alias = "TestDate")]
    pub test_date: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl From<WireRecord> for TestRecord {
    fn from(wire: WireRecord) -> Self {
        let test_date = wire
            .test_date
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| wire.test_start_time.chars().take(10).collect());

        TestRecord::new(
            wire.isn,
            wire.test_start_time,
            wire.station.unwrap_or_default(),
            wire.test_status.unwrap_or_default(),
            test_date,
            wire.payload,
        )
    }
}

/// Pass/fail classification of a raw status string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Pass,
    Fail,
    Other,
}

impl TestOutcome {
    pub fn classify(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "PASS" | "PASSED" | "P" => TestOutcome::Pass,
            "FAIL" | "FAILED" | "F" => TestOutcome::Fail,
            _ => TestOutcome::Other,
        }
    }
}

/// Columns of the record table that can be sorted on or enumerated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordField {
    Id,
    Isn,
    TestStartTime,
    Station,
    TestStatus,
    TestDate,
}

impl RecordField {
    pub const INDEXED: [RecordField; 3] = [
        RecordField::Station,
        RecordField::TestStatus,
        RecordField::TestDate,
    ];

    pub fn column(self) -> &'static str {
        match self {
            RecordField::Id => "id",
            RecordField::Isn => "isn",
            RecordField::TestStartTime => "test_start_time",
            RecordField::Station => "station",
            RecordField::TestStatus => "test_status",
            RecordField::TestDate => "test_date",
        }
    }

    /// Secondary index backing this field, if any
    pub fn index_name(self) -> Option<&'static str> {
        match self {
            RecordField::Station => Some("idx_records_station"),
            RecordField::TestStatus => Some("idx_records_status"),
            RecordField::TestDate => Some("idx_records_test_date"),
            _ => None,
        }
    }

    pub fn is_indexed(self) -> bool {
        self.index_name().is_some()
    }
}

impl fmt::Display for RecordField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordField::Id => "id",
            RecordField::Isn => "isn",
            RecordField::TestStartTime => "testStartTime",
            RecordField::Station => "station",
            RecordField::TestStatus => "testStatus",
            RecordField::TestDate => "testDate",
        };
        f.write_str(name)
    }
}

impl FromStr for RecordField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "id" | "pk" => Ok(RecordField::Id),
            "isn" | "ISN" => Ok(RecordField::Isn),
            "testStartTime" | "test_start_time" => Ok(RecordField::TestStartTime),
            "station" => Ok(RecordField::Station),
            "testStatus" | "test_status" | "status" => Ok(RecordField::TestStatus),
            "testDate" | "test_date" | "date" => Ok(RecordField::TestDate),
            other => Err(format!("Unknown record field: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// Sort specification; ties are always broken by the record id (ascending)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: RecordField,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn new(field: RecordField, direction: SortDirection) -> Self {
        Self { field, direction }
    }

    /// Primary key ascending
    pub fn primary_key() -> Self {
        Self::new(RecordField::Id, SortDirection::Asc)
    }
}

impl Default for SortSpec {
    fn default() -> Self {
        Self::primary_key()
    }
}

/// Predicates that map onto the store's secondary indices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexFilter {
    #[serde(default)]
    pub station: Option<String>,
    #[serde(default)]
    pub test_status: Option<String>,
    /// Inclusive lower bound (`YYYY-MM-DD`)
    #[serde(default)]
    pub date_from: Option<String>,
    /// Inclusive upper bound (`YYYY-MM-DD`)
    #[serde(default)]
    pub date_to: Option<String>,
}

impl IndexFilter {
    pub fn is_empty(&self) -> bool {
        self.station.is_none()
            && self.test_status.is_none()
            && self.date_from.is_none()
            && self.date_to.is_none()
    }

    pub fn matches(&self, record: &TestRecord) -> bool {
        if let Some(station) = &self.station {
            if &record.station != station {
                return false;
            }
        }
        if let Some(status) = &self.test_status {
            if &record.test_status != status {
                return false;
            }
        }
        if let Some(from) = &self.date_from {
            if record.test_date.as_str() < from.as_str() {
                return false;
            }
        }
        if let Some(to) = &self.date_to {
            if record.test_date.as_str() > to.as_str() {
                return false;
            }
        }
        true
    }
}
