// Common types for the streaming module

use crate::db::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for ingestion operations
pub type IngestResult<T> = Result<T, IngestError>;

/// Errors that end a stream run.
///
/// Malformed lines are not represented here: they are counted and skipped.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Ingest task failed: {0}")]
    Task(String),

    #[error("Stream cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for IngestError {
    fn from(e: reqwest::Error) -> Self {
        IngestError::Transport(e.to_string())
    }
}

/// Lifecycle of a stream run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Streaming,
    Completed,
    Aborted,
    Errored,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Aborted | RunStatus::Errored
        )
    }
}

/// What to stream: one site/project, optionally narrowed, over a time range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub site: String,
    pub project: String,
    #[serde(default)]
    pub station: Option<String>,
    #[serde(default)]
    pub test_status: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl StreamRequest {
    /// Human-readable identity of the logical stream target, used in logs
    pub fn target_key(&self) -> String {
        format!(
            "{}::{}::{}::{}..{}",
            self.site,
            self.project,
            self.station.as_deref().unwrap_or("*"),
            self.start_time.to_rfc3339(),
            self.end_time.to_rfc3339()
        )
    }

    /// Query-string parameters for the remote stream endpoint
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("site", self.site.clone()),
            ("project", self.project.clone()),
            ("from", self.start_time.to_rfc3339()),
            ("to", self.end_time.to_rfc3339()),
        ];
        if let Some(station) = &self.station {
            params.push(("station", station.clone()));
        }
        if let Some(status) = &self.test_status {
            params.push(("status", status.clone()));
        }
        params
    }
}

/// Contents of the leading metadata frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadata {
    #[serde(default)]
    pub total_records: Option<u64>,
    #[serde(default)]
    pub possibly_truncated: bool,
    #[serde(default)]
    pub chunks_fetched: Option<u64>,
    #[serde(default)]
    pub total_chunks: Option<u64>,
}

/// Running counters of one ingestion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestProgress {
    pub records_processed: u64,
    pub records_written: u64,
    pub bytes_received: u64,
    pub parse_errors: u64,
    pub total_estimated: Option<u64>,
}

/// Events an ingestor reports while a run is in flight
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    Metadata(StreamMetadata),
    Progress(IngestProgress),
}

/// Final counters of a run that reached the end of its stream
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub records_processed: u64,
    pub records_written: u64,
    pub bytes_received: u64,
    pub parse_errors: u64,
    pub batches_committed: u64,
    pub metadata: Option<StreamMetadata>,
}

/// Progress payload delivered to UI listeners, tagged with its run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub run_id: u64,
    pub records_processed: u64,
    pub records_written: u64,
    pub bytes_received: u64,
    pub total_estimated: Option<u64>,
}

/// State exposed by the coordinator, derived only from the active run's events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: u64,
    pub status: RunStatus,
    pub records_processed: u64,
    pub records_written: u64,
    pub bytes_received: u64,
    pub total_estimated: Option<u64>,
    pub parse_errors: u64,
    pub possibly_truncated: bool,
    pub error: Option<String>,
}

impl RunSnapshot {
    pub fn started(run_id: u64) -> Self {
        Self {
            run_id,
            status: RunStatus::Streaming,
            ..Default::default()
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.status == RunStatus::Streaming
    }

    pub fn progress_event(&self) -> ProgressEvent {
        ProgressEvent {
            run_id: self.run_id,
            records_processed: self.records_processed,
            records_written: self.records_written,
            bytes_received: self.bytes_received,
            total_estimated: self.total_estimated,
        }
    }
}
