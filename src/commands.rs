use crate::cli::{DistinctArgs, FilterArgs, IngestArgs, QueryArgs, StationsArgs};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::sync::Arc;
use testdata_core::cache::ReferenceCatalog;
use testdata_core::models::{SortDirection, SortSpec};
use testdata_core::query::{Pagination, QueryOptions, RecordFilter};
use testdata_core::remote::{StaticToken, TestDataClient};
use testdata_core::streaming::{RunStatus, StreamRequest};
use testdata_core::{AppConfig, QueryEngine, RecordStore, StreamCoordinator, StreamIngestor};

fn print_json<T: Serialize>(value: &T, compact: bool) -> Result<()> {
    let json = if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    }
    .context("JSON serialization failed")?;
    println!("{}", json);
    Ok(())
}

fn open_store(config: &AppConfig) -> Result<Arc<RecordStore>> {
    let store = RecordStore::open(&config.db_path)
        .with_context(|| format!("Failed to open store at {}", config.db_path.display()))?;
    Ok(Arc::new(store))
}

fn client(config: &AppConfig) -> Result<TestDataClient> {
    let client = TestDataClient::with_connect_timeout(
        config.require_api_url()?,
        Arc::new(StaticToken(config.api_token.clone())),
        config.connect_timeout,
    )?;
    Ok(client)
}

impl From<FilterArgs> for RecordFilter {
    fn from(args: FilterArgs) -> Self {
        let mut filter = RecordFilter::new().with_date_range(args.date_from, args.date_to);
        if let Some(station) = args.station {
            filter = filter.with_station(station);
        }
        if let Some(status) = args.status {
            filter = filter.with_status(status);
        }
        if let Some(needle) = args.isn_contains {
            filter = filter.with_isn_contains(needle);
        }
        filter
    }
}

pub async fn ingest(config: &AppConfig, args: IngestArgs) -> Result<()> {
    if args.from >= args.to {
        bail!("--from must be earlier than --to");
    }

    let store = open_store(config)?;
    let source = Arc::new(client(config)?);
    let ingestor = StreamIngestor::new(Arc::clone(&store), config.ingest_config());
    let coordinator = StreamCoordinator::new(store, source, ingestor);

    coordinator.on_progress(|event| {
        log::info!(
            "[INGEST] run {}: {} processed, {} written{}",
            event.run_id,
            event.records_processed,
            event.records_written,
            event
                .total_estimated
                .map(|t| format!(" of ~{}", t))
                .unwrap_or_default()
        );
    });

    let handle = coordinator.start_stream(StreamRequest {
        site: args.site,
        project: args.project,
        station: args.station,
        test_status: args.status,
        start_time: args.from,
        end_time: args.to,
    });

    let wait = handle.wait();
    tokio::pin!(wait);

    let outcome = tokio::select! {
        outcome = &mut wait => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, cancelling stream...");
            coordinator.cancel();
            wait.await
        }
    };

    let snapshot = coordinator.snapshot();
    print_json(&snapshot, false)?;

    match outcome.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Aborted => bail!("Stream aborted"),
        _ => bail!(
            "Stream failed: {}",
            outcome.error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}

pub fn query(config: &AppConfig, args: QueryArgs) -> Result<()> {
    let engine = QueryEngine::new(open_store(config)?);
    let direction = if args.desc {
        SortDirection::Desc
    } else {
        SortDirection::Asc
    };
    let pagination = match args.cursor {
        Some(cursor) => Pagination::Cursor {
            cursor: Some(cursor),
            page_size: args.page_size,
        },
        None => Pagination::page(args.page, args.page_size),
    };

    let page = engine.query_records_for_table(&QueryOptions {
        filter: args.filter.into(),
        sort: SortSpec::new(args.sort, direction),
        pagination,
    })?;
    print_json(&page, args.compact)
}

pub fn stats(config: &AppConfig, args: FilterArgs) -> Result<()> {
    let engine = QueryEngine::new(open_store(config)?);
    let stats = engine.get_record_statistics(&args.into())?;
    print_json(&stats, false)
}

pub fn distinct(config: &AppConfig, args: DistinctArgs) -> Result<()> {
    let engine = QueryEngine::new(open_store(config)?);
    for value in engine.get_distinct_values(args.field)? {
        println!("{}", value);
    }
    Ok(())
}

pub fn count(config: &AppConfig) -> Result<()> {
    let store = open_store(config)?;
    println!("{}", store.get_total_count()?);
    Ok(())
}

pub fn clear(config: &AppConfig) -> Result<()> {
    let store = open_store(config)?;
    let removed = store.clear_all_records()?;
    println!("Removed {} records", removed);
    Ok(())
}

pub async fn stations(config: &AppConfig, args: StationsArgs) -> Result<()> {
    let catalog = ReferenceCatalog::new(Arc::new(client(config)?), config.cache_ttl);
    let stations = catalog
        .stations(&args.site, &args.project, false)
        .await
        .with_context(|| format!("Failed to list stations of {}::{}", args.site, args.project))?;
    for station in stations {
        println!("{}", station);
    }
    Ok(())
}
