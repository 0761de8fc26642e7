//! Streaming archive download
//!
//! The response body is written to disk chunk by chunk and hashed on the way,
//! so the archive is never held in memory. Any failed attempt removes its
//! partial file before the next attempt (or before returning).

use crate::config::HttpConfig;
use crate::error::{FetchError, IngestError, Result};
use dump_common::checksum::{verify_checksum, StreamingChecksum};
use dump_common::CommonError;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A fully written, closed archive on local disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchedArchive {
    pub path: PathBuf,
    pub bytes: u64,
    /// Lowercase hex SHA-256 of the file contents
    pub sha256: String,
}

/// HTTP downloader for the dump archive
#[derive(Debug, Clone)]
pub struct ArchiveFetcher {
    client: reqwest::Client,
    config: HttpConfig,
}

impl ArchiveFetcher {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| IngestError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Download `url` to `dest`, retrying transient failures
    #[instrument(skip(self, dest, cancel), fields(dest = %dest.display()))]
    pub async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedArchive> {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 1;

        loop {
            let result = self.fetch_once(url, dest, cancel).await;

            match result {
                Ok(archive) => {
                    info!(
                        bytes = archive.bytes,
                        sha256 = %archive.sha256,
                        attempt,
                        "Downloaded archive"
                    );
                    return Ok(archive);
                },
                Err(err) => {
                    remove_partial(dest).await;

                    let retryable = matches!(&err, IngestError::Fetch(f) if f.is_retryable());
                    if !retryable || attempt >= max_attempts {
                        warn!(error = %err, attempt, "Download failed");
                        return Err(err);
                    }

                    let delay = self.config.backoff(attempt);
                    warn!(
                        error = %err,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Download attempt failed, retrying"
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(IngestError::cancelled("fetch")),
                        _ = tokio::time::sleep(delay) => {},
                    }
                    attempt += 1;
                },
            }
        }
    }

    async fn fetch_once(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedArchive> {
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let write_failed = |source| FetchError::Io {
            path: dest.to_path_buf(),
            source,
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::cancelled("fetch")),
            response = self.client.get(url).send() => response.map_err(transport)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }
            .into());
        }

        let progress = self.progress_bar(response.content_length(), dest);
        let mut file = tokio::fs::File::create(dest).await.map_err(write_failed)?;
        let mut checksum = StreamingChecksum::new();
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    progress.abandon();
                    return Err(IngestError::cancelled("fetch"));
                }
                next = stream.next() => next,
            };

            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(transport)?;
            file.write_all(&chunk).await.map_err(write_failed)?;
            checksum.update(&chunk);
            progress.set_position(checksum.bytes());
        }

        file.flush().await.map_err(write_failed)?;
        file.sync_all().await.map_err(write_failed)?;
        drop(file);
        progress.finish_and_clear();

        let bytes = checksum.bytes();
        let sha256 = checksum.finalize_hex();
        debug!(bytes, sha256 = %sha256, "Archive written");

        if let Some(expected) = &self.config.expected_sha256 {
            verify_checksum(expected, &sha256).map_err(|e| match e {
                CommonError::ChecksumMismatch { expected, actual } => {
                    IngestError::from(FetchError::ChecksumMismatch { expected, actual })
                },
                other => IngestError::config(other.to_string()),
            })?;
        }

        Ok(FetchedArchive {
            path: dest.to_path_buf(),
            bytes,
            sha256,
        })
    }

    fn progress_bar(&self, total: Option<u64>, dest: &Path) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }

        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let pb = match total {
            Some(size) => {
                let pb = ProgressBar::new(size);
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("#>-"),
                );
                pb
            },
            None => {
                let pb = ProgressBar::new_spinner();
                pb.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner:.green} {msg} {bytes}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                pb
            },
        };
        pb.set_message(format!("Downloading {}", name));
        pb
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial download"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use dump_common::checksum::compute_checksum;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY: &[u8] = b"not really a tarball, but bytes are bytes";

    fn http_config() -> HttpConfig {
        HttpConfig {
            max_retries: 3,
            retry_backoff_ms: 1,
            show_progress: false,
            ..HttpConfig::default()
        }
    }

    fn fetcher(config: HttpConfig) -> ArchiveFetcher {
        ArchiveFetcher::new(config).unwrap()
    }

    /// Raw HTTP server whose first `truncated` responses close mid-body
    async fn truncating_server(truncated: usize) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connections);

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let served = counter.fetch_add(1, Ordering::SeqCst);
                let mut request = [0u8; 4096];
                let _ = socket.read(&mut request).await;

                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    BODY.len()
                );
                let body = if served < truncated {
                    &BODY[..BODY.len() / 2]
                } else {
                    BODY
                };
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}/dump.tar.gz", addr), connections)
    }

    #[tokio::test]
    async fn test_fetch_streams_body_to_disk() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dump.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("dump.tar.gz");
        let url = format!("{}/dump.tar.gz", server.uri());

        let archive = fetcher(http_config())
            .fetch(&url, &dest, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(archive.path, dest);
        assert_eq!(archive.bytes, BODY.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), BODY);
        assert_eq!(archive.sha256, compute_checksum(&mut &BODY[..]).unwrap());
    }

    #[tokio::test]
    async fn test_not_found_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("dump.tar.gz");
        let url = format!("{}/missing.tar.gz", server.uri());

        let err = fetcher(http_config())
            .fetch(&url, &dest, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Fetch(FetchError::Status { status: 404, .. })));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .with_priority(2)
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("dump.tar.gz");

        let archive = fetcher(http_config())
            .fetch(&server.uri(), &dest, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(archive.bytes, BODY.len() as u64);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("dump.tar.gz");

        let err = fetcher(http_config())
            .fetch(&server.uri(), &dest, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "fetch");
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_body_cut_short_removes_partial_file() {
        let (url, connections) = truncating_server(usize::MAX).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("dump.tar.gz");
        let config = HttpConfig {
            max_retries: 2,
            ..http_config()
        };

        let err = fetcher(config)
            .fetch(&url, &dest, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Fetch(FetchError::Transport { .. })));
        assert_eq!(connections.load(Ordering::SeqCst), 2);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_body_cut_short_is_retried_from_scratch() {
        let (url, connections) = truncating_server(1).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("dump.tar.gz");

        let archive = fetcher(http_config())
            .fetch(&url, &dest, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(connections.load(Ordering::SeqCst), 2);
        assert_eq!(archive.bytes, BODY.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), BODY);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_removes_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("dump.tar.gz");
        let config = HttpConfig {
            expected_sha256: Some("0".repeat(64)),
            ..http_config()
        };

        let err = fetcher(config)
            .fetch(&server.uri(), &dest, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Fetch(FetchError::ChecksumMismatch { .. })));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_matching_checksum_is_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("dump.tar.gz");
        let expected = compute_checksum(&mut &BODY[..]).unwrap().to_uppercase();
        let config = HttpConfig {
            expected_sha256: Some(expected),
            ..http_config()
        };

        assert!(fetcher(config)
            .fetch(&server.uri(), &dest, &CancellationToken::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_fetch_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("dump.tar.gz");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetcher(http_config())
            .fetch(&server.uri(), &dest, &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("dump.tar.gz");
        let config = HttpConfig {
            max_retries: 1,
            ..http_config()
        };

        // Port 9 (discard) is closed on test machines
        let err = fetcher(config)
            .fetch("http://127.0.0.1:9/dump.tar.gz", &dest, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Fetch(FetchError::Transport { .. })));
    }
}
