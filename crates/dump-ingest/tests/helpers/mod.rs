//! Test helpers for dump ingestion integration tests
//!
//! - Fixture archives built in memory with `tar` + `flate2`
//! - A `wiremock` server serving them as the remote dump
//! - A temporary working/output layout per test

#![allow(dead_code)]

pub mod fixtures;

pub use fixtures::*;

use dump_ingest::config::IngestConfigBuilder;
use dump_ingest::{IngestConfig, Store};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::PathBuf;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const ARCHIVE_PATH: &str = "/dump.tar.gz";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,dump_ingest=debug,sqlx=warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Gzip-compressed tar holding `entries` as regular files
pub fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *data)
            .expect("Failed to append fixture entry");
    }
    builder
        .into_inner()
        .expect("Failed to finish tar stream")
        .finish()
        .expect("Failed to finish gzip stream")
}

/// Archive laid out like the real dump
pub fn dump_archive(customers: &str, organizations: &str) -> Vec<u8> {
    tar_gz(&[
        ("dump/customers.csv", customers.as_bytes()),
        ("dump/organizations.csv", organizations.as_bytes()),
    ])
}

/// Archive with the standard 3 customers and 2 organizations
pub fn fixture_archive() -> Vec<u8> {
    dump_archive(CUSTOMERS_CSV, ORGANIZATIONS_CSV)
}

/// Mock dump server plus a scratch directory
pub struct TestEnv {
    pub server: MockServer,
    pub dir: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self {
            server: MockServer::start().await,
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    /// Serve `archive` at [`ARCHIVE_PATH`]
    pub async fn serve(archive: Vec<u8>) -> Self {
        let env = Self::new().await;
        Mock::given(method("GET"))
            .and(path(ARCHIVE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(archive))
            .mount(&env.server)
            .await;
        env
    }

    pub fn url(&self) -> String {
        format!("{}{}", self.server.uri(), ARCHIVE_PATH)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.dir.path().join("tmp")
    }

    /// Builder preset for this environment writing to `out/<name>`
    pub fn config_named(&self, name: &str) -> IngestConfigBuilder {
        IngestConfig::builder()
            .dump_url(self.url())
            .work_dir(self.work_dir())
            .out_dir(self.dir.path().join("out").join(name))
            .show_progress(false)
            .max_retries(2)
            .retry_backoff_ms(1)
    }

    pub fn config(&self) -> IngestConfigBuilder {
        self.config_named("default")
    }
}

/// Open the database a run wrote to
pub async fn open_store(config: &IngestConfig) -> Store {
    Store::open(&config.database_path, 1)
        .await
        .expect("Failed to open result store")
}
