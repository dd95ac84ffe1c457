// Streaming ingestion of remote NDJSON record streams
//
// Data flow:
// - `StreamCoordinator::start_stream` allocates a run id and cancels the previous run
// - `StreamIngestor` pulls byte chunks from a `RecordSource`, decodes lines and
//   commits records to the `RecordStore` in batches
// - progress flows back through the coordinator's run-id gate to listeners

pub mod coordinator;
pub mod ingestor;
pub mod ndjson;
pub mod source;
pub mod types;

pub use coordinator::{ProgressListener, RunHandle, RunOutcome, StreamCoordinator};
pub use ingestor::{IngestConfig, StreamIngestor};
pub use source::{ByteStream, RecordSource};
pub use types::*;
