#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use futures_util::stream;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use testdata_core::streaming::{
    ByteStream, IngestError, IngestResult, RecordSource, RunSnapshot, StreamCoordinator,
    StreamRequest,
};
use testdata_core::RecordStore;

/// One NDJSON record line; `n` also determines the start time so ids sort by `n`
pub fn record_line(prefix: &str, n: usize, station: &str, status: &str) -> String {
    format!(
        r#"{{"isn":"{}{:05}","testStartTime":"2024-05-{:02}T{:02}:{:02}:00Z","station":"{}","testStatus":"{}","voltage":{}}}"#,
        prefix,
        n,
        1 + (n / 1440) % 28,
        (n / 60) % 24,
        n % 60,
        station,
        status,
        3.0 + (n % 10) as f64 / 10.0
    )
}

pub fn record_lines(prefix: &str, count: usize, station: &str) -> Vec<String> {
    (0..count)
        .map(|n| {
            let status = if n % 4 == 3 { "FAIL" } else { "PASS" };
            record_line(prefix, n, station, status)
        })
        .collect()
}

pub fn metadata_line(total: u64, truncated: bool) -> String {
    format!(
        r#"{{"_type":"metadata","totalRecords":{},"possiblyTruncated":{}}}"#,
        total, truncated
    )
}

pub fn request(station: Option<&str>) -> StreamRequest {
    StreamRequest {
        site: "PTB".to_string(),
        project: "ProjectX".to_string(),
        station: station.map(str::to_string),
        test_status: None,
        start_time: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        end_time: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
    }
}

pub fn temp_store() -> (TempDir, Arc<RecordStore>) {
    let dir = tempdir().unwrap();
    let store = Arc::new(RecordStore::open(dir.path().join("records.db")).unwrap());
    (dir, store)
}

/// How a scripted stream delivers its body
#[derive(Clone, Debug)]
pub struct Script {
    pub chunks: Vec<Bytes>,
    pub delay: Duration,
    pub fail_at_end: bool,
}

impl Script {
    /// Every line in its own chunk
    pub fn per_line(lines: &[String], delay: Duration) -> Self {
        Self {
            chunks: lines
                .iter()
                .map(|l| Bytes::from(format!("{}\n", l)))
                .collect(),
            delay,
            fail_at_end: false,
        }
    }

    /// The whole body cut into fixed-size chunks, ignoring line boundaries
    pub fn sliced(lines: &[String], chunk_size: usize) -> Self {
        let body = lines.join("\n") + "\n";
        Self {
            chunks: body
                .as_bytes()
                .chunks(chunk_size)
                .map(Bytes::copy_from_slice)
                .collect(),
            delay: Duration::ZERO,
            fail_at_end: false,
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail_at_end = true;
        self
    }
}

/// In-memory record source choosing a script per request
pub struct ScriptedSource {
    script_for: Box<dyn Fn(&StreamRequest) -> Script + Send + Sync>,
}

impl ScriptedSource {
    pub fn new<F>(script_for: F) -> Self
    where
        F: Fn(&StreamRequest) -> Script + Send + Sync + 'static,
    {
        Self {
            script_for: Box::new(script_for),
        }
    }

    pub fn fixed(script: Script) -> Self {
        Self::new(move |_| script.clone())
    }
}

#[async_trait]
impl RecordSource for ScriptedSource {
    async fn open(&self, request: &StreamRequest) -> IngestResult<ByteStream> {
        let script = (self.script_for)(request);
        let delay = script.delay;
        let fail_at_end = script.fail_at_end;

        let chunks = stream::unfold(
            (script.chunks.into_iter(), fail_at_end),
            move |(mut chunks, fail)| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match chunks.next() {
                    Some(chunk) => Some((Ok(chunk), (chunks, fail))),
                    None if fail => Some((
                        Err(IngestError::Transport("connection reset by peer".to_string())),
                        (chunks, false),
                    )),
                    None => None,
                }
            },
        );
        Ok(Box::pin(chunks))
    }
}

/// Poll the coordinator until `predicate` holds or the timeout passes
pub async fn wait_for<F>(coordinator: &StreamCoordinator, timeout: Duration, predicate: F) -> RunSnapshot
where
    F: Fn(&RunSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snapshot = coordinator.snapshot();
        if predicate(&snapshot) || tokio::time::Instant::now() >= deadline {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
