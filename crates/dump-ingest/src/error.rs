//! Error types for dump ingestion
//!
//! Each pipeline stage has its own error type so a failure report names the
//! stage and carries the context needed to diagnose it (URL, archive path,
//! dataset, line number, batch and record position). [`IngestError`] wraps
//! them all and is what every public operation returns.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Top-level ingestion error
#[derive(Error, Debug)]
pub enum IngestError {
    /// Archive download failed
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Archive could not be decompressed or unpacked
    #[error("Extraction failed: {0}")]
    Extract(#[from] ExtractError),

    /// A single record line is malformed (recoverable)
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// A batch write violated a table constraint
    #[error("Load failed: {0}")]
    Load(#[from] LoadError),

    /// Configuration is missing or invalid, including dataset files missing
    /// from the extracted archive
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store connection or schema failure outside a batch write
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was cancelled or timed out
    #[error("Run cancelled during {stage}")]
    Cancelled { stage: &'static str },
}

impl IngestError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a cancellation error for the given stage
    pub fn cancelled(stage: &'static str) -> Self {
        Self::Cancelled { stage }
    }

    /// Only per-line parse errors let ingestion continue
    pub fn is_recoverable(&self) -> bool {
        matches!(self, IngestError::Parse(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestError::Cancelled { .. })
    }

    /// Pipeline stage the error belongs to
    pub fn stage(&self) -> &'static str {
        match self {
            IngestError::Fetch(_) => "fetch",
            IngestError::Extract(_) => "extract",
            IngestError::Parse(_) => "parse",
            IngestError::Load(_) => "load",
            IngestError::Config(_) => "config",
            IngestError::Database(_) => "store",
            IngestError::Io(_) => "io",
            IngestError::Cancelled { stage } => *stage,
        }
    }
}

/// Network or transport failure while downloading the archive
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("failed writing {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

impl FetchError {
    /// Transport failures, 5xx and 429 are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport { .. } => true,
            FetchError::Status { status, .. } => *status >= 500 || *status == 429,
            FetchError::Io { .. } | FetchError::ChecksumMismatch { .. } => false,
        }
    }
}

/// Corrupt, incomplete or unexpected archive
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("destination {} already exists and is not empty", .0.display())]
    DestinationNotEmpty(PathBuf),

    #[error("archive {} is corrupt or truncated: {source}", .archive.display())]
    Corrupt {
        archive: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed accessing {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive {} contains no files", .0.display())]
    Empty(PathBuf),
}

/// Why a record line was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseErrorReason {
    FieldCount { expected: usize, found: usize },
    InvalidUtf8 { field: usize },
}

impl fmt::Display for ParseErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseErrorReason::FieldCount { expected, found } => {
                write!(f, "expected {} fields, found {}", expected, found)
            },
            ParseErrorReason::InvalidUtf8 { field } => {
                write!(f, "field {} is not valid UTF-8", field + 1)
            },
        }
    }
}

/// A malformed record line
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{dataset} line {line}: {reason} (raw: {raw:?})")]
pub struct ParseError {
    pub dataset: String,
    /// 1-based line number where the record starts
    pub line: u64,
    /// The record as the reader tokenized it, fields re-joined with the delimiter
    pub raw: String,
    pub reason: ParseErrorReason,
}

/// A batch write rejected by the store
#[derive(Error, Debug)]
#[error(
    "{dataset}: batch {batch} rejected at record {position} (key {key:?}) after {rows_committed} committed rows: {source}"
)]
pub struct LoadError {
    pub dataset: String,
    pub table: String,
    /// 1-based batch number within the dataset
    pub batch: u64,
    /// 0-based position of the offending record inside the batch
    pub position: usize,
    /// Primary-key value of the offending record
    pub key: Option<String>,
    /// Rows committed by earlier batches of the same dataset
    pub rows_committed: u64,
    #[source]
    pub source: sqlx::Error,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_only_parse_errors_are_recoverable() {
        let parse = IngestError::from(ParseError {
            dataset: "customers".into(),
            line: 4,
            raw: "1,2".into(),
            reason: ParseErrorReason::FieldCount {
                expected: 12,
                found: 2,
            },
        });
        assert!(parse.is_recoverable());
        assert_eq!(parse.stage(), "parse");

        let config = IngestError::config("missing file");
        assert!(!config.is_recoverable());
        assert_eq!(config.stage(), "config");

        let cancelled = IngestError::cancelled("fetch");
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.stage(), "fetch");
    }

    #[test]
    fn test_fetch_error_retry_policy() {
        let status = |status| FetchError::Status {
            url: "http://example.test/dump.tar.gz".into(),
            status,
        };
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!FetchError::ChecksumMismatch {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_parse_error_display_names_line_and_content() {
        let err = ParseError {
            dataset: "organizations".into(),
            line: 17,
            raw: "x,y".into(),
            reason: ParseErrorReason::FieldCount {
                expected: 9,
                found: 2,
            },
        };
        let message = err.to_string();
        assert!(message.contains("organizations line 17"));
        assert!(message.contains("expected 9 fields, found 2"));
        assert!(message.contains("x,y"));
    }
}
