//! Ingestion run configuration

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Public dump archive used when no URL is configured.
pub const DEFAULT_DUMP_URL: &str = "https://fiber-challenges.s3.amazonaws.com/dump.tar.gz";

/// Working directory holding downloaded archives and extraction trees.
pub const DEFAULT_WORK_DIR: &str = "tmp";

/// Output directory holding the database.
pub const DEFAULT_OUT_DIR: &str = "out";

/// Database file name inside the output directory.
pub const DEFAULT_DATABASE_FILE: &str = "database.sqlite";

/// Records written per transaction.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Store connection pool size.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// Whole-request HTTP timeout (large archives take a while).
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 600;

pub const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Download attempts before giving up.
pub const DEFAULT_HTTP_MAX_RETRIES: u32 = 3;

/// Delay before the second attempt; doubled for each further attempt.
pub const DEFAULT_HTTP_RETRY_BACKOFF_MS: u64 = 1000;

pub const DEFAULT_USER_AGENT: &str = concat!("dump-ingest/", env!("CARGO_PKG_VERSION"));

/// What to do when a record file's header differs from its schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderCheck {
    /// Header mismatch is a configuration error
    #[default]
    Enforce,
    /// Trust column positions and only log the mismatch
    Ignore,
}

impl FromStr for HeaderCheck {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "enforce" | "strict" => Ok(HeaderCheck::Enforce),
            "ignore" | "lenient" => Ok(HeaderCheck::Ignore),
            other => Err(IngestError::config(format!("invalid header check '{}'", other))),
        }
    }
}

/// HTTP download settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Total attempts, including the first
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub user_agent: String,
    /// Hex SHA-256 the downloaded archive must match
    pub expected_sha256: Option<String>,
    /// Draw a download progress bar on the terminal
    pub show_progress: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_HTTP_CONNECT_TIMEOUT_SECS,
            max_retries: DEFAULT_HTTP_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_HTTP_RETRY_BACKOFF_MS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            expected_sha256: None,
            show_progress: true,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Backoff before retry number `attempt` (1-based attempt that just failed)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(IngestError::config("HTTP timeouts must be greater than 0"));
        }
        if self.max_retries == 0 {
            return Err(IngestError::config("HTTP max_retries must be at least 1"));
        }
        if let Some(digest) = &self.expected_sha256 {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(IngestError::config(
                    "expected_sha256 must be 64 hexadecimal characters",
                ));
            }
        }
        Ok(())
    }
}

/// Configuration for one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Remote gzip-compressed tar archive
    pub dump_url: String,

    /// Per-run subdirectories are created here
    pub work_dir: PathBuf,

    pub out_dir: PathBuf,

    /// SQLite database file; created if missing
    pub database_path: PathBuf,

    pub batch_size: usize,

    pub max_connections: u32,

    pub header_check: HeaderCheck,

    /// Leave the downloaded archive and extraction tree in place after the run
    pub keep_work_files: bool,

    /// Cancel the run when it takes longer than this
    pub run_timeout_secs: Option<u64>,

    pub http: HttpConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let out_dir = PathBuf::from(DEFAULT_OUT_DIR);
        Self {
            dump_url: DEFAULT_DUMP_URL.to_string(),
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            database_path: out_dir.join(DEFAULT_DATABASE_FILE),
            out_dir,
            batch_size: DEFAULT_BATCH_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            header_check: HeaderCheck::default(),
            keep_work_files: true,
            run_timeout_secs: None,
            http: HttpConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder::default()
    }

    /// Load configuration from `DUMP_*` environment variables
    ///
    /// Unset variables keep their defaults; unparsable values are rejected.
    /// Loading a `.env` file is left to the binary.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = env_var("DUMP_URL") {
            config.dump_url = url;
        }
        if let Some(dir) = env_var("DUMP_OUT_DIR") {
            config.out_dir = PathBuf::from(dir);
            config.database_path = config.out_dir.join(DEFAULT_DATABASE_FILE);
        }
        if let Some(dir) = env_var("DUMP_WORK_DIR") {
            config.work_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_var("DUMP_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(size) = parse_env("DUMP_BATCH_SIZE")? {
            config.batch_size = size;
        }
        if let Some(connections) = parse_env("DUMP_MAX_CONNECTIONS")? {
            config.max_connections = connections;
        }
        if let Some(check) = env_var("DUMP_HEADER_CHECK") {
            config.header_check = check.parse()?;
        }
        if let Some(keep) = parse_env("DUMP_KEEP_WORK_FILES")? {
            config.keep_work_files = keep;
        }
        if let Some(secs) = parse_env("DUMP_RUN_TIMEOUT_SECS")? {
            config.run_timeout_secs = Some(secs);
        }
        if let Some(secs) = parse_env("DUMP_HTTP_TIMEOUT_SECS")? {
            config.http.timeout_secs = secs;
        }
        if let Some(retries) = parse_env("DUMP_HTTP_MAX_RETRIES")? {
            config.http.max_retries = retries;
        }
        if let Some(ms) = parse_env("DUMP_HTTP_RETRY_BACKOFF_MS")? {
            config.http.retry_backoff_ms = ms;
        }
        if let Some(digest) = env_var("DUMP_EXPECTED_SHA256") {
            config.http.expected_sha256 = Some(digest);
        }
        if let Some(show) = parse_env("DUMP_SHOW_PROGRESS")? {
            config.http.show_progress = show;
        }

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.dump_url.trim();
        if url.is_empty() {
            return Err(IngestError::config("dump URL cannot be empty"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(IngestError::config(format!(
                "dump URL must use http or https: {}",
                url
            )));
        }
        if self.batch_size == 0 {
            return Err(IngestError::config("batch_size must be greater than 0"));
        }
        if self.max_connections == 0 {
            return Err(IngestError::config("max_connections must be greater than 0"));
        }
        if self.run_timeout_secs == Some(0) {
            return Err(IngestError::config("run_timeout_secs must be greater than 0"));
        }

        self.http.validate()
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_var(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| IngestError::config(format!("{} has invalid value '{}': {}", key, raw, e)))
        })
        .transpose()
}

/// Builder for [`IngestConfig`]
#[derive(Debug, Default)]
pub struct IngestConfigBuilder {
    config: IngestConfig,
}

impl IngestConfigBuilder {
    pub fn dump_url(mut self, url: impl Into<String>) -> Self {
        self.config.dump_url = url.into();
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = dir.into();
        self
    }

    /// Also moves the database into the new directory
    pub fn out_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.out_dir = dir.into();
        self.config.database_path = self.config.out_dir.join(DEFAULT_DATABASE_FILE);
        self
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.database_path = path.into();
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn max_connections(mut self, connections: u32) -> Self {
        self.config.max_connections = connections;
        self
    }

    pub fn header_check(mut self, check: HeaderCheck) -> Self {
        self.config.header_check = check;
        self
    }

    pub fn keep_work_files(mut self, keep: bool) -> Self {
        self.config.keep_work_files = keep;
        self
    }

    pub fn run_timeout_secs(mut self, secs: u64) -> Self {
        self.config.run_timeout_secs = Some(secs);
        self
    }

    pub fn http_timeout_secs(mut self, secs: u64) -> Self {
        self.config.http.timeout_secs = secs;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.http.max_retries = retries;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.http.retry_backoff_ms = ms;
        self
    }

    pub fn expected_sha256(mut self, digest: impl Into<String>) -> Self {
        self.config.http.expected_sha256 = Some(digest.into());
        self
    }

    pub fn show_progress(mut self, show: bool) -> Self {
        self.config.http.show_progress = show;
        self
    }

    pub fn build(self) -> IngestConfig {
        self.config
    }
}
