use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use testdata_core::models::RecordField;

#[derive(Parser)]
#[command(
    name = "testdata",
    version,
    about = "Stream manufacturing test records into a local store and query them",
    long_about = "Streams NDJSON test records from the test-data API into a local SQLite store\n\
                  and answers paginated queries against it. Configure with TESTDATA_* \n\
                  environment variables or a .env file."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Local store path (overrides $TESTDATA_DB_PATH)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Stream records from the API into the local store
    Ingest(IngestArgs),
    /// Show one page of stored records
    Query(QueryArgs),
    /// Pass/fail statistics of stored records
    Stats(FilterArgs),
    /// Distinct values of a field, as used by filter dropdowns
    Distinct(DistinctArgs),
    /// Number of stored records
    Count,
    /// Remove every stored record
    Clear,
    /// List stations of a site/project from the API
    Stations(StationsArgs),
}

#[derive(Args)]
pub struct IngestArgs {
    #[arg(long)]
    pub site: String,

    #[arg(long)]
    pub project: String,

    #[arg(long)]
    pub station: Option<String>,

    #[arg(long)]
    pub status: Option<String>,

    /// Range start (RFC 3339)
    #[arg(long)]
    pub from: DateTime<Utc>,

    /// Range end (RFC 3339)
    #[arg(long)]
    pub to: DateTime<Utc>,
}

#[derive(Args, Clone, Default)]
pub struct FilterArgs {
    #[arg(long)]
    pub station: Option<String>,

    #[arg(long)]
    pub status: Option<String>,

    /// Earliest test date (YYYY-MM-DD, inclusive)
    #[arg(long)]
    pub date_from: Option<String>,

    /// Latest test date (YYYY-MM-DD, inclusive)
    #[arg(long)]
    pub date_to: Option<String>,

    /// Substring of the ISN
    #[arg(long)]
    pub isn_contains: Option<String>,
}

#[derive(Args)]
pub struct QueryArgs {
    #[command(flatten)]
    pub filter: FilterArgs,

    /// Sort field (id, isn, testStartTime, station, testStatus, testDate)
    #[arg(long, default_value = "id")]
    pub sort: RecordField,

    /// Sort descending
    #[arg(long)]
    pub desc: bool,

    /// 1-based page number
    #[arg(long, default_value_t = 1, conflicts_with = "cursor")]
    pub page: u64,

    #[arg(long, default_value_t = 100)]
    pub page_size: u64,

    /// Continue from a cursor returned by a previous query
    #[arg(long)]
    pub cursor: Option<String>,

    /// Compact JSON output
    #[arg(long)]
    pub compact: bool,
}

#[derive(Args)]
pub struct DistinctArgs {
    /// Field name (station, testStatus, testDate, ...)
    pub field: RecordField,
}

#[derive(Args)]
pub struct StationsArgs {
    #[arg(long)]
    pub site: String,

    #[arg(long)]
    pub project: String,
}
