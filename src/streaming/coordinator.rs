// Stream coordinator - owns the lifecycle of stream runs
//
// Every run gets a monotonically increasing run id. Events from the ingestor
// are tagged with the id of the run that produced them and are applied to the
// exposed snapshot only while that id is still the active one. Starting a new
// run cancels the previous run's token and switches the active id at once;
// whatever the old run still delivers afterwards is dropped at the gate.

use super::ingestor::StreamIngestor;
use super::source::RecordSource;
use super::types::{
    IngestError, IngestEvent, IngestResult, IngestSummary, ProgressEvent, RunSnapshot, RunStatus,
    StreamMetadata, StreamRequest,
};
use crate::db::RecordStore;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type ProgressListener = Box<dyn Fn(ProgressEvent) + Send + Sync>;

/// State shared between the coordinator and its spawned run tasks
struct CoordinatorShared {
    store: Arc<RecordStore>,
    active_run_id: AtomicU64,
    snapshot: RwLock<RunSnapshot>,
    listeners: RwLock<Vec<ProgressListener>>,
}

impl CoordinatorShared {
    /// Lock the snapshot for `run_id`, or `None` if that run has been superseded
    fn gate(&self, run_id: u64) -> Option<RwLockWriteGuard<'_, RunSnapshot>> {
        let snapshot = self.snapshot.write();
        if snapshot.run_id != run_id || self.active_run_id.load(Ordering::SeqCst) != run_id {
            log::debug!(
                "[COORDINATOR] Dropping event from stale run {} (active: {})",
                run_id,
                snapshot.run_id
            );
            return None;
        }
        Some(snapshot)
    }

    fn handle_event(&self, run_id: u64, event: IngestEvent) {
        match event {
            IngestEvent::Metadata(metadata) => self.apply_metadata(run_id, metadata),
            IngestEvent::Progress(progress) => {
                let Some(mut snapshot) = self.gate(run_id) else {
                    return;
                };
                snapshot.records_processed = progress.records_processed;
                snapshot.records_written = progress.records_written;
                snapshot.bytes_received = progress.bytes_received;
                snapshot.parse_errors = progress.parse_errors;
                if progress.total_estimated.is_some() {
                    snapshot.total_estimated = progress.total_estimated;
                }

                // Listeners run under a read lock so no newer run can start
                // between the gate check and delivery
                let snapshot = RwLockWriteGuard::downgrade(snapshot);
                let event = snapshot.progress_event();
                for listener in self.listeners.read().iter() {
                    listener(event.clone());
                }
            }
        }
    }

    fn apply_metadata(&self, run_id: u64, metadata: StreamMetadata) {
        let Some(mut snapshot) = self.gate(run_id) else {
            return;
        };
        snapshot.total_estimated = metadata.total_records;
        snapshot.possibly_truncated = metadata.possibly_truncated;

        // Written inside the gate so a superseded run cannot overwrite the
        // flag after the next run reset it; the write waits at most briefly
        if let Err(e) = self
            .store
            .record_stream_metadata(metadata.possibly_truncated, metadata.total_records)
        {
            log::error!("[COORDINATOR] Failed to record stream metadata: {}", e);
        }
    }

    fn finish(&self, run_id: u64, result: &IngestResult<IngestSummary>) {
        let (status, error) = match result {
            Ok(_) => (RunStatus::Completed, None),
            Err(IngestError::Cancelled) => (RunStatus::Aborted, None),
            Err(e) => (RunStatus::Errored, Some(e.to_string())),
        };

        let Some(mut snapshot) = self.gate(run_id) else {
            log::debug!(
                "[COORDINATOR] Run {} finished as {:?} after being superseded",
                run_id,
                status
            );
            return;
        };

        if let Ok(summary) = result {
            snapshot.records_processed = summary.records_processed;
            snapshot.records_written = summary.records_written;
            snapshot.bytes_received = summary.bytes_received;
            snapshot.parse_errors = summary.parse_errors;
        }
        snapshot.status = status;
        snapshot.error = error;

        log::info!(
            "[COORDINATOR] Run {} {:?}: {} records written",
            run_id,
            status,
            snapshot.records_written
        );
    }
}

/// Final state of one run as seen by whoever started it
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: u64,
    pub status: RunStatus,
    pub summary: Option<IngestSummary>,
    pub error: Option<String>,
}

pub struct RunHandle {
    run_id: u64,
    join: JoinHandle<IngestResult<IngestSummary>>,
}

impl RunHandle {
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Wait for the run task to end.
    ///
    /// The outcome describes this run even if a newer run has since replaced
    /// it in the coordinator's snapshot.
    pub async fn wait(self) -> RunOutcome {
        let run_id = self.run_id;
        match self.join.await {
            Ok(Ok(summary)) => RunOutcome {
                run_id,
                status: RunStatus::Completed,
                summary: Some(summary),
                error: None,
            },
            Ok(Err(IngestError::Cancelled)) => RunOutcome {
                run_id,
                status: RunStatus::Aborted,
                summary: None,
                error: None,
            },
            Ok(Err(e)) => RunOutcome {
                run_id,
                status: RunStatus::Errored,
                summary: None,
                error: Some(e.to_string()),
            },
            Err(e) => RunOutcome {
                run_id,
                status: RunStatus::Errored,
                summary: None,
                error: Some(format!("Run task failed: {}", e)),
            },
        }
    }
}

pub struct StreamCoordinator {
    next_run_id: AtomicU64,
    shared: Arc<CoordinatorShared>,
    active_token: Mutex<Option<CancellationToken>>,
    source: Arc<dyn RecordSource>,
    ingestor: Arc<StreamIngestor>,
}

impl StreamCoordinator {
    pub fn new(
        store: Arc<RecordStore>,
        source: Arc<dyn RecordSource>,
        ingestor: StreamIngestor,
    ) -> Self {
        Self {
            next_run_id: AtomicU64::new(0),
            shared: Arc::new(CoordinatorShared {
                store,
                active_run_id: AtomicU64::new(0),
                snapshot: RwLock::new(RunSnapshot::default()),
                listeners: RwLock::new(Vec::new()),
            }),
            active_token: Mutex::new(None),
            source,
            ingestor: Arc::new(ingestor),
        }
    }

    /// Register a listener for progress of the active run
    pub fn on_progress<F>(&self, listener: F)
    where
        F: Fn(ProgressEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.write().push(Box::new(listener));
    }

    /// Start a new run, superseding any run still in flight.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_stream(&self, request: StreamRequest) -> RunHandle {
        let token = CancellationToken::new();
        let mut active = self.active_token.lock();

        if let Some(previous) = active.replace(token.clone()) {
            previous.cancel();
        }

        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut snapshot = self.shared.snapshot.write();
            self.shared.active_run_id.store(run_id, Ordering::SeqCst);
            *snapshot = RunSnapshot::started(run_id);
        }

        // Older runs are gated out from here on, and this run's metadata
        // cannot arrive before it is spawned below
        if let Err(e) = self.shared.store.set_possibly_truncated(false) {
            log::error!("[COORDINATOR] Failed to reset truncation flag: {}", e);
        }

        log::info!(
            "[COORDINATOR] Starting run {} for {}",
            run_id,
            request.target_key()
        );

        let shared = Arc::clone(&self.shared);
        let source = Arc::clone(&self.source);
        let ingestor = Arc::clone(&self.ingestor);

        let join = tokio::spawn(async move {
            let on_event = |event: IngestEvent| shared.handle_event(run_id, event);
            let result = ingestor
                .run(source.as_ref(), &request, &token, &on_event)
                .await;
            shared.finish(run_id, &result);
            result
        });

        drop(active);
        RunHandle { run_id, join }
    }

    /// Signal cancellation to the active run. Repeated calls are no-ops.
    pub fn cancel(&self) {
        if let Some(token) = self.active_token.lock().as_ref() {
            if !token.is_cancelled() {
                log::info!(
                    "[COORDINATOR] Cancelling run {}",
                    self.shared.active_run_id.load(Ordering::SeqCst)
                );
                token.cancel();
            }
        }
    }

    /// State derived from the active run's accepted events
    pub fn snapshot(&self) -> RunSnapshot {
        self.shared.snapshot.read_recursive().clone()
    }

    pub fn active_run_id(&self) -> u64 {
        self.shared.active_run_id.load(Ordering::SeqCst)
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.snapshot.read_recursive().is_streaming()
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.shared.store
    }
}

impl Drop for StreamCoordinator {
    fn drop(&mut self) {
        if let Some(token) = self.active_token.lock().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::ingestor::IngestConfig;
    use crate::streaming::source::ByteStream;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use futures_util::stream;
    use tempfile::{tempdir, TempDir};

    /// Serves a fixed body, or a stream that never yields when `body` is None
    struct FixedSource {
        body: Option<String>,
    }

    #[async_trait]
    impl RecordSource for FixedSource {
        async fn open(&self, _request: &StreamRequest) -> IngestResult<ByteStream> {
            match &self.body {
                Some(body) => {
                    let chunks: Vec<IngestResult<Bytes>> = vec![Ok(Bytes::from(body.clone()))];
                    Ok(Box::pin(stream::iter(chunks)))
                }
                None => Ok(Box::pin(stream::pending::<IngestResult<Bytes>>())),
            }
        }
    }

    fn request() -> StreamRequest {
        StreamRequest {
            site: "PTB".to_string(),
            project: "ProjectX".to_string(),
            station: None,
            test_status: None,
            start_time: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap(),
        }
    }

    fn coordinator(body: Option<String>) -> (TempDir, StreamCoordinator) {
        let dir = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(dir.path().join("coord.db")).unwrap());
        let ingestor = StreamIngestor::new(Arc::clone(&store), IngestConfig::default());
        let source = Arc::new(FixedSource { body });
        (dir, StreamCoordinator::new(store, source, ingestor))
    }

    #[tokio::test]
    async fn test_completed_run_updates_snapshot() {
        let body = concat!(
            r#"{"_type":"metadata","totalRecords":2,"possiblyTruncated":true}"#,
            "\n",
            r#"{"isn":"A1","testStartTime":"2024-05-01T10:00:00Z","testStatus":"PASS"}"#,
            "\n",
            r#"{"isn":"A2","testStartTime":"2024-05-01T11:00:00Z","testStatus":"FAIL"}"#,
            "\n",
        );
        let (_dir, coordinator) = coordinator(Some(body.to_string()));

        let outcome = coordinator.start_stream(request()).wait().await;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.run_id, 1);

        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.records_written, 2);
        assert_eq!(snapshot.total_estimated, Some(2));
        assert!(snapshot.possibly_truncated);
        assert!(coordinator.store().possibly_truncated().unwrap());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (_dir, coordinator) = coordinator(None);

        let handle = coordinator.start_stream(request());
        coordinator.cancel();
        coordinator.cancel();

        let outcome = handle.wait().await;
        assert_eq!(outcome.status, RunStatus::Aborted);
        assert_eq!(coordinator.snapshot().status, RunStatus::Aborted);

        coordinator.cancel();
        assert_eq!(coordinator.snapshot().status, RunStatus::Aborted);
    }

    #[tokio::test]
    async fn test_new_run_supersedes_previous() {
        let (_dir, coordinator) = coordinator(None);

        let first = coordinator.start_stream(request());
        let second = coordinator.start_stream(request());
        assert_eq!(coordinator.active_run_id(), 2);

        let first = first.wait().await;
        assert_eq!(first.status, RunStatus::Aborted);

        // The aborted run must not overwrite the active run's state
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.run_id, 2);
        assert!(snapshot.is_streaming());

        coordinator.cancel();
        assert_eq!(second.wait().await.status, RunStatus::Aborted);
    }

    #[test]
    fn test_stale_events_are_dropped() {
        let dir = tempdir().unwrap();
        let shared = CoordinatorShared {
            store: Arc::new(RecordStore::open(dir.path().join("gate.db")).unwrap()),
            active_run_id: AtomicU64::new(2),
            snapshot: RwLock::new(RunSnapshot::started(2)),
            listeners: RwLock::new(Vec::new()),
        };

        shared.handle_event(
            1,
            IngestEvent::Progress(crate::streaming::types::IngestProgress {
                records_written: 99,
                ..Default::default()
            }),
        );
        shared.finish(1, &Err(IngestError::Cancelled));

        let snapshot = shared.snapshot.read().clone();
        assert_eq!(snapshot.records_written, 0);
        assert_eq!(snapshot.status, RunStatus::Streaming);
    }
}
