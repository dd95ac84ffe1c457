use crate::streaming::IngestConfig;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Base URL of the test-data API (required for network commands)
    pub api_url: Option<String>,
    /// Optional bearer token for the API
    pub api_token: Option<String>,
    /// Path of the local SQLite store
    pub db_path: PathBuf,
    /// Records per committed batch
    pub batch_size: usize,
    /// Progress event every N processed records
    pub progress_interval: u64,
    /// Reference list cache TTL
    pub cache_ttl: Duration,
    pub connect_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_token: None,
            db_path: PathBuf::from("./testdata.db"),
            batch_size: 100,
            progress_interval: 50,
            cache_ttl: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl AppConfig {
    /// Load configuration from the environment (and `.env`, if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Ok(Self {
            api_url: non_empty("TESTDATA_API_URL"),
            api_token: non_empty("TESTDATA_API_TOKEN"),
            db_path: non_empty("TESTDATA_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            batch_size: parse_positive(&lookup, "TESTDATA_BATCH_SIZE", defaults.batch_size)?,
            progress_interval: parse_positive(
                &lookup,
                "TESTDATA_PROGRESS_INTERVAL",
                defaults.progress_interval,
            )?,
            cache_ttl: Duration::from_secs(parse_positive(
                &lookup,
                "TESTDATA_CACHE_TTL_SECS",
                defaults.cache_ttl.as_secs(),
            )?),
            connect_timeout: Duration::from_secs(parse_positive(
                &lookup,
                "TESTDATA_HTTP_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )?),
        })
    }

    pub fn require_api_url(&self) -> Result<&str, ConfigError> {
        self.api_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("TESTDATA_API_URL".to_string()))
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            batch_size: self.batch_size,
            progress_interval: self.progress_interval,
        }
    }
}

fn parse_positive<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialEq + Default,
{
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    let value: T = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{} must be a number, got '{}'", name, raw)))?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue(format!("{} must be greater than 0", name)));
    }
    Ok(value)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}
