mod common;

use common::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use testdata_core::query::RecordFilter;
use testdata_core::streaming::{IngestConfig, RunStatus, StreamCoordinator, StreamIngestor};
use testdata_core::QueryEngine;

fn coordinator_with(source: ScriptedSource, batch_size: usize) -> (tempfile::TempDir, StreamCoordinator) {
    let (dir, store) = temp_store();
    let ingestor = StreamIngestor::new(
        Arc::clone(&store),
        IngestConfig {
            batch_size,
            progress_interval: 5,
        },
    );
    (dir, StreamCoordinator::new(store, Arc::new(source), ingestor))
}

/// Station FCT streams slowly, anything else streams fast
fn two_speed_source() -> ScriptedSource {
    ScriptedSource::new(|request| match request.station.as_deref() {
        Some("FCT") => Script::per_line(&record_lines("A", 400, "FCT"), Duration::from_millis(2)),
        _ => Script::sliced(&record_lines("B", 50, "SWDL"), 512),
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_c_superseded_run_never_leaks_into_state() {
    let (_dir, coordinator) = coordinator_with(two_speed_source(), 10);
    let run_ids = Arc::new(Mutex::new(Vec::new()));
    {
        let run_ids = Arc::clone(&run_ids);
        coordinator.on_progress(move |event| run_ids.lock().push(event.run_id));
    }

    let run_a = coordinator.start_stream(request(Some("FCT")));
    assert_eq!(run_a.run_id(), 1);
    let during_a = wait_for(&coordinator, Duration::from_secs(10), |s| {
        s.records_written >= 20
    })
    .await;
    assert_eq!(during_a.run_id, 1);

    let run_b = coordinator.start_stream(request(Some("SWDL")));
    assert_eq!(run_b.run_id(), 2);

    let outcome_b = run_b.wait().await;
    let outcome_a = run_a.wait().await;
    assert_eq!(outcome_b.status, RunStatus::Completed);
    assert_eq!(outcome_a.status, RunStatus::Aborted);

    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.run_id, 2);
    assert_eq!(snapshot.status, RunStatus::Completed);
    assert_eq!(snapshot.records_written, 50);
    assert_eq!(snapshot.records_processed, 50);

    // Once run 2 delivered anything, run 1 never did again
    let run_ids = run_ids.lock();
    let first_b = run_ids.iter().position(|&id| id == 2).unwrap();
    assert!(run_ids[first_b..].iter().all(|&id| id == 2));
    assert!(run_ids[..first_b].iter().all(|&id| id == 1));

    // The store keeps A's committed batches alongside all of B
    let store = coordinator.store();
    let total = store.get_total_count().unwrap();
    assert!(total >= 70);
    let engine = QueryEngine::new(Arc::clone(store));
    let b_only = engine
        .get_record_statistics(&RecordFilter::new().with_station("SWDL"))
        .unwrap();
    assert_eq!(b_only.total, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rapid_restarts_keep_only_the_latest_run() {
    let (_dir, coordinator) = coordinator_with(two_speed_source(), 10);

    let mut handles = Vec::new();
    for _ in 0..5 {
        handles.push(coordinator.start_stream(request(Some("FCT"))));
    }
    let last = coordinator.start_stream(request(None));
    assert_eq!(last.run_id(), 6);

    for handle in handles {
        assert_eq!(handle.wait().await.status, RunStatus::Aborted);
    }
    let outcome = last.wait().await;
    assert_eq!(outcome.status, RunStatus::Completed);

    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.run_id, 6);
    assert_eq!(snapshot.records_written, 50);
}

#[tokio::test]
async fn truncation_flag_follows_the_latest_run() {
    let source = ScriptedSource::new(|request| {
        let truncated = request.station.is_none();
        let mut lines = vec![metadata_line(5_000, truncated)];
        lines.extend(record_lines("T", 30, "FCT"));
        Script::sliced(&lines, 1024)
    });
    let (_dir, coordinator) = coordinator_with(source, 10);
    let engine = QueryEngine::new(Arc::clone(coordinator.store()));

    coordinator.start_stream(request(None)).wait().await;
    assert!(coordinator.snapshot().possibly_truncated);
    assert_eq!(coordinator.snapshot().total_estimated, Some(5_000));
    let page = engine
        .query_page(&RecordFilter::new(), Default::default(), 1, 10)
        .unwrap();
    assert!(page.possibly_truncated);

    coordinator.start_stream(request(Some("FCT"))).wait().await;
    assert!(!coordinator.snapshot().possibly_truncated);
    let page = engine
        .query_page(&RecordFilter::new(), Default::default(), 1, 10)
        .unwrap();
    assert!(!page.possibly_truncated);
}

#[tokio::test]
async fn cancel_without_active_run_is_a_no_op() {
    let (_dir, coordinator) = coordinator_with(two_speed_source(), 10);
    coordinator.cancel();
    assert_eq!(coordinator.snapshot().status, RunStatus::Idle);
    assert_eq!(coordinator.active_run_id(), 0);

    let outcome = coordinator.start_stream(request(None)).wait().await;
    assert_eq!(outcome.status, RunStatus::Completed);
    coordinator.cancel();
    coordinator.cancel();
    assert_eq!(coordinator.snapshot().status, RunStatus::Completed);
}
