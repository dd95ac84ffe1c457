// HTTP client for the test-data API
//
// Serves both the reference lists (sites, projects, stations) and the
// chunked NDJSON record stream consumed by the ingestor.

use crate::cache::ReferenceSource;
use crate::streaming::{ByteStream, IngestError, IngestResult, RecordSource, StreamRequest};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Failures talking to the test-data API
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("Request failed: {0}")]
    Request(#[source] Arc<reqwest::Error>),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid API base URL '{0}'")]
    InvalidBaseUrl(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        RemoteError::Request(Arc::new(err))
    }
}

/// Supplies the bearer token attached to every request
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// A token fixed at startup (or none)
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Clone)]
pub struct TestDataClient {
    client: Client,
    base_url: Url,
    credentials: Arc<dyn CredentialProvider>,
}

impl TestDataClient {
    pub fn new(base_url: &str, credentials: Arc<dyn CredentialProvider>) -> RemoteResult<Self> {
        Self::with_connect_timeout(base_url, credentials, DEFAULT_CONNECT_TIMEOUT)
    }

    /// No overall request timeout is set: record streams may run for minutes
    /// and are bounded by cancellation instead.
    pub fn with_connect_timeout(
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
        connect_timeout: Duration,
    ) -> RemoteResult<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|_| RemoteError::InvalidBaseUrl(base_url.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteError::InvalidBaseUrl(base_url.to_string()));
        }

        let client = Client::builder().connect_timeout(connect_timeout).build()?;

        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Base URL with `segments` appended, each percent-encoded
    fn endpoint(&self, segments: &[&str]) -> RemoteResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credentials.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> RemoteResult<T> {
        let url = self.endpoint(segments)?;
        log::debug!("[REMOTE] GET {}", url);

        let response = self.authorized(self.client.get(url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            log::error!("[REMOTE] {} from {:?}: {}", status, segments, message);
            return Err(RemoteError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl ReferenceSource for TestDataClient {
    async fn fetch_sites(&self) -> RemoteResult<Vec<String>> {
        self.get_json(&["sites"]).await
    }

    async fn fetch_projects(&self, site: &str) -> RemoteResult<Vec<String>> {
        self.get_json(&["sites", site, "projects"]).await
    }

    async fn fetch_stations(&self, site: &str, project: &str) -> RemoteResult<Vec<String>> {
        self.get_json(&["sites", site, "projects", project, "stations"])
            .await
    }
}

#[async_trait]
impl RecordSource for TestDataClient {
    async fn open(&self, request: &StreamRequest) -> IngestResult<ByteStream> {
        let url = self
            .endpoint(&["records", "stream"])
            .map_err(|e| IngestError::Transport(e.to_string()))?;
        log::info!("[REMOTE] Opening record stream {}", request.target_key());

        let response = self
            .authorized(self.client.get(url))
            .query(&request.query_params())
            .header(ACCEPT, NDJSON_CONTENT_TYPE)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(IngestError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(IngestError::from));
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> TestDataClient {
        TestDataClient::new(base, Arc::new(StaticToken::default())).unwrap()
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let client = client("http://localhost:8080/api/");
        let url = client
            .endpoint(&["sites", "PTB 2", "projects", "X/Y", "stations"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/api/sites/PTB%202/projects/X%2FY/stations"
        );
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        let result = TestDataClient::new("not a url", Arc::new(StaticToken::default()));
        assert!(matches!(result, Err(RemoteError::InvalidBaseUrl(_))));
    }

    #[test]
    fn test_static_token() {
        assert_eq!(
            StaticToken(Some("abc".to_string())).bearer_token().as_deref(),
            Some("abc")
        );
        assert!(StaticToken::default().bearer_token().is_none());
    }
}
