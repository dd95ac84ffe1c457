// Stream ingestor - decodes an NDJSON byte stream into batched store writes
//
// - Lines are parsed only once their terminator has arrived
// - The metadata frame is reported, never stored
// - Records accumulate into a batch that is committed in one transaction
// - The cancellation token is checked before every line and every flush;
//   an unflushed batch is dropped on cancellation
// - A malformed or oversized line is counted and skipped

use super::ndjson::{parse_frame, DecodedLine, Frame, LineDecoder, DEFAULT_MAX_LINE_BYTES};
use super::source::{ByteStream, RecordSource};
use super::types::{
    IngestError, IngestEvent, IngestProgress, IngestResult, IngestSummary, StreamMetadata,
    StreamRequest,
};
use crate::db::RecordStore;
use crate::models::TestRecord;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestConfig {
    /// Records per committed batch
    pub batch_size: usize,
    /// Emit a progress event every this many processed records
    pub progress_interval: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Mutable state of one ingestion
#[derive(Default)]
struct RunState {
    progress: IngestProgress,
    batch: Vec<TestRecord>,
    batches_committed: u64,
    metadata: Option<StreamMetadata>,
}

impl RunState {
    fn summary(&self) -> IngestSummary {
        IngestSummary {
            records_processed: self.progress.records_processed,
            records_written: self.progress.records_written,
            bytes_received: self.progress.bytes_received,
            parse_errors: self.progress.parse_errors,
            batches_committed: self.batches_committed,
            metadata: self.metadata.clone(),
        }
    }
}

pub struct StreamIngestor {
    store: Arc<RecordStore>,
    config: IngestConfig,
    max_line_bytes: usize,
}

impl StreamIngestor {
    pub fn new(store: Arc<RecordStore>, config: IngestConfig) -> Self {
        Self {
            store,
            config,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    /// Longest line accepted before it is skipped as a parse error
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    pub fn config(&self) -> IngestConfig {
        self.config
    }

    /// Open `request` on `source` and ingest it to completion
    pub async fn run(
        &self,
        source: &dyn RecordSource,
        request: &StreamRequest,
        cancel: &CancellationToken,
        on_event: &(dyn Fn(IngestEvent) + Send + Sync),
    ) -> IngestResult<IngestSummary> {
        let stream = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                log::info!("[INGEST] Cancelled before stream opened");
                return Err(IngestError::Cancelled);
            }

            stream = source.open(request) => stream?,
        };

        self.ingest(stream, cancel, on_event).await
    }

    /// Consume an already-open byte stream.
    ///
    /// Returns the run summary on normal completion, `IngestError::Cancelled`
    /// when the token fired, or the transport/storage error that ended the
    /// run. Batches committed before an error stay in the store.
    pub async fn ingest(
        &self,
        mut stream: ByteStream,
        cancel: &CancellationToken,
        on_event: &(dyn Fn(IngestEvent) + Send + Sync),
    ) -> IngestResult<IngestSummary> {
        let mut decoder = LineDecoder::with_max_line_bytes(self.max_line_bytes);
        let mut state = RunState {
            batch: Vec::with_capacity(self.config.batch_size),
            ..Default::default()
        };

        loop {
            let next = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    return Err(self.abort(&mut state, on_event));
                }

                next = stream.next() => next,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    log::error!(
                        "[INGEST] Stream failed after {} records written: {}",
                        state.progress.records_written,
                        e
                    );
                    on_event(IngestEvent::Progress(state.progress));
                    return Err(e);
                }
                None => break,
            };

            state.progress.bytes_received += chunk.len() as u64;

            for line in decoder.push(&chunk) {
                if cancel.is_cancelled() {
                    return Err(self.abort(&mut state, on_event));
                }

                self.handle_line(&line, &mut state, on_event);

                if state.batch.len() >= self.config.batch_size {
                    self.flush(&mut state, cancel, on_event).await?;
                }
            }
        }

        // A trailing line without terminator is kept only if it parses
        if let Some(line) = decoder.finish() {
            if cancel.is_cancelled() {
                return Err(self.abort(&mut state, on_event));
            }
            match parse_frame(&line.bytes) {
                Ok(frame) => self.handle_frame(frame, &mut state, on_event),
                Err(e) => log::debug!(
                    "[INGEST] Discarding incomplete trailing line {}: {}",
                    line.number,
                    e
                ),
            }
        }

        self.flush(&mut state, cancel, on_event).await?;
        on_event(IngestEvent::Progress(state.progress));

        let summary = state.summary();
        log::info!(
            "[INGEST] Stream complete: {} written in {} batches, {} parse errors, {} bytes",
            summary.records_written,
            summary.batches_committed,
            summary.parse_errors,
            summary.bytes_received
        );

        Ok(summary)
    }

    fn handle_line(
        &self,
        line: &DecodedLine,
        state: &mut RunState,
        on_event: &(dyn Fn(IngestEvent) + Send + Sync),
    ) {
        if line.oversized {
            state.progress.records_processed += 1;
            state.progress.parse_errors += 1;
            log::warn!(
                "[INGEST] Skipping line {}: longer than {} bytes",
                line.number,
                self.max_line_bytes
            );
            self.maybe_report_progress(state, on_event);
            return;
        }

        match parse_frame(&line.bytes) {
            Ok(frame) => self.handle_frame(frame, state, on_event),
            Err(e) => {
                state.progress.records_processed += 1;
                state.progress.parse_errors += 1;
                log::warn!("[INGEST] Skipping malformed line {}: {}", line.number, e);
                self.maybe_report_progress(state, on_event);
            }
        }
    }

    fn handle_frame(
        &self,
        frame: Frame,
        state: &mut RunState,
        on_event: &(dyn Fn(IngestEvent) + Send + Sync),
    ) {
        match frame {
            Frame::Metadata(metadata) => {
                if state.metadata.is_some() {
                    log::warn!("[INGEST] Additional metadata frame received, replacing estimate");
                }
                log::info!(
                    "[INGEST] Metadata: ~{:?} records, possibly truncated: {}",
                    metadata.total_records,
                    metadata.possibly_truncated
                );
                state.progress.total_estimated = metadata.total_records;
                state.metadata = Some(metadata.clone());
                on_event(IngestEvent::Metadata(metadata));
            }
            Frame::Record(record) => {
                state.progress.records_processed += 1;
                state.batch.push(record);
                self.maybe_report_progress(state, on_event);
            }
        }
    }

    fn maybe_report_progress(
        &self,
        state: &RunState,
        on_event: &(dyn Fn(IngestEvent) + Send + Sync),
    ) {
        let interval = self.config.progress_interval.max(1);
        if state.progress.records_processed % interval == 0 {
            on_event(IngestEvent::Progress(state.progress));
        }
    }

    /// Commit the pending batch as one transaction
    async fn flush(
        &self,
        state: &mut RunState,
        cancel: &CancellationToken,
        on_event: &(dyn Fn(IngestEvent) + Send + Sync),
    ) -> IngestResult<()> {
        if state.batch.is_empty() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(self.abort(state, on_event));
        }

        let batch = std::mem::replace(
            &mut state.batch,
            Vec::with_capacity(self.config.batch_size),
        );
        let store = Arc::clone(&self.store);

        let written = tokio::task::spawn_blocking(move || store.put_records_batch(&batch))
            .await
            .map_err(|e| IngestError::Task(e.to_string()))?
            .map_err(|e| {
                log::error!(
                    "[INGEST] Batch write failed after {} records written: {}",
                    state.progress.records_written,
                    e
                );
                IngestError::Storage(e)
            })?;

        state.progress.records_written += written as u64;
        state.batches_committed += 1;
        on_event(IngestEvent::Progress(state.progress));

        Ok(())
    }

    /// Drop the unflushed batch and report final counters
    fn abort(
        &self,
        state: &mut RunState,
        on_event: &(dyn Fn(IngestEvent) + Send + Sync),
    ) -> IngestError {
        log::info!(
            "[INGEST] Cancelled: discarding {} unflushed records ({} already written)",
            state.batch.len(),
            state.progress.records_written
        );
        state.batch.clear();
        on_event(IngestEvent::Progress(state.progress));
        IngestError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;
    use parking_lot::Mutex;
    use tempfile::{tempdir, TempDir};

    fn ndjson_lines(count: usize) -> Vec<String> {
        (0..count)
            .map(|i| {
                format!(
                    r#"{{"isn":"ISN{:04}","testStartTime":"2024-05-01T10:{:02}:00Z","station":"FCT","testStatus":"PASS"}}"#,
                    i,
                    i % 60
                )
            })
            .collect()
    }

    fn byte_stream(body: String, chunk_size: usize) -> ByteStream {
        let chunks: Vec<IngestResult<Bytes>> = body
            .into_bytes()
            .chunks(chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Box::pin(stream::iter(chunks))
    }

    fn ingestor(batch_size: usize) -> (TempDir, StreamIngestor) {
        let dir = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(dir.path().join("ingest.db")).unwrap());
        let config = IngestConfig {
            batch_size,
            progress_interval: 50,
        };
        (dir, StreamIngestor::new(store, config))
    }

    #[tokio::test]
    async fn test_batches_are_flushed_and_counted() {
        let (_dir, ingestor) = ingestor(100);
        let body = ndjson_lines(250).join("\n") + "\n";
        let events = Mutex::new(Vec::new());

        let summary = ingestor
            .ingest(byte_stream(body, 37), &CancellationToken::new(), &|e| {
                events.lock().push(e)
            })
            .await
            .unwrap();

        assert_eq!(summary.records_written, 250);
        assert_eq!(summary.batches_committed, 3);
        assert_eq!(ingestor.store.get_total_count().unwrap(), 250);

        let written: Vec<u64> = events
            .lock()
            .iter()
            .filter_map(|e| match e {
                IngestEvent::Progress(p) => Some(p.records_written),
                _ => None,
            })
            .collect();
        assert_eq!(written.last(), Some(&250));
        assert!(written.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_metadata_frame_is_reported_not_stored() {
        let (_dir, ingestor) = ingestor(10);
        let mut lines = vec![
            r#"{"_type":"metadata","totalRecords":5,"possiblyTruncated":true}"#.to_string(),
        ];
        lines.extend(ndjson_lines(5));
        let body = lines.join("\n") + "\n";
        let events = Mutex::new(Vec::new());

        let summary = ingestor
            .ingest(byte_stream(body, 64), &CancellationToken::new(), &|e| {
                events.lock().push(e)
            })
            .await
            .unwrap();

        assert_eq!(summary.records_written, 5);
        assert!(summary.metadata.unwrap().possibly_truncated);
        assert!(events
            .lock()
            .iter()
            .any(|e| matches!(e, IngestEvent::Metadata(m) if m.total_records == Some(5))));
    }

    #[tokio::test]
    async fn test_incomplete_trailing_line_is_discarded() {
        let (_dir, ingestor) = ingestor(100);
        let body = ndjson_lines(3).join("\n") + "\n{\"isn\":\"trunc";

        let summary = ingestor
            .ingest(byte_stream(body, 16), &CancellationToken::new(), &|_| {})
            .await
            .unwrap();

        assert_eq!(summary.records_written, 3);
        assert_eq!(summary.parse_errors, 0);
    }

    #[tokio::test]
    async fn test_complete_trailing_line_is_kept() {
        let (_dir, ingestor) = ingestor(100);
        let body = ndjson_lines(4).join("\n");

        let summary = ingestor
            .ingest(byte_stream(body, 16), &CancellationToken::new(), &|_| {})
            .await
            .unwrap();

        assert_eq!(summary.records_written, 4);
    }

    #[tokio::test]
    async fn test_oversized_line_counts_as_parse_error() {
        let (_dir, ingestor) = ingestor(100);
        let ingestor = ingestor.with_max_line_bytes(512);
        let mut lines = ndjson_lines(4);
        lines.insert(
            2,
            format!(
                r#"{{"isn":"BIG","testStartTime":"2024-05-01T11:00:00Z","blob":"{}"}}"#,
                "z".repeat(4096)
            ),
        );
        let body = lines.join("\n") + "\n";

        let summary = ingestor
            .ingest(byte_stream(body, 64), &CancellationToken::new(), &|_| {})
            .await
            .unwrap();

        assert_eq!(summary.records_written, 4);
        assert_eq!(summary.records_processed, 5);
        assert_eq!(summary.parse_errors, 1);
        assert!(ingestor.store.get_record("BIG|2024-05-01T11:00:00Z").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transport_error_keeps_committed_batches() {
        let (_dir, ingestor) = ingestor(10);
        let first = ndjson_lines(15).join("\n") + "\n";
        let chunks: Vec<IngestResult<Bytes>> = vec![
            Ok(Bytes::from(first)),
            Err(IngestError::Transport("connection reset".to_string())),
        ];

        let result = ingestor
            .ingest(
                Box::pin(stream::iter(chunks)),
                &CancellationToken::new(),
                &|_| {},
            )
            .await;

        assert!(matches!(result, Err(IngestError::Transport(_))));
        assert_eq!(ingestor.store.get_total_count().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_cancelled_token_writes_nothing() {
        let (_dir, ingestor) = ingestor(10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = ingestor
            .ingest(byte_stream(ndjson_lines(30).join("\n"), 64), &cancel, &|_| {})
            .await;

        assert!(matches!(result, Err(IngestError::Cancelled)));
        assert_eq!(ingestor.store.get_total_count().unwrap(), 0);
    }
}
