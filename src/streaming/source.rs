// Pluggable byte sources for record streams
//
// The ingestor only sees a stream of byte chunks. `TestDataClient` (see
// `crate::remote`) implements `RecordSource` over HTTP; tests plug in
// scripted in-memory sources.

use super::types::{IngestResult, StreamRequest};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;

/// Chunked response body of one record stream
pub type ByteStream = Pin<Box<dyn Stream<Item = IngestResult<Bytes>> + Send>>;

#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Open the NDJSON stream for `request`. Errors here are transport errors.
    async fn open(&self, request: &StreamRequest) -> IngestResult<ByteStream>;
}
