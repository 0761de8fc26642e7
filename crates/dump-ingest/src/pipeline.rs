//! Pipeline orchestration
//!
//! One run walks `Init -> Fetching -> Extracting -> Loading -> Done`, or ends
//! in `Failed` from any of those states. Each dataset gets its own load task
//! (parser + loader) once every dataset file has been resolved and its header
//! checked; the tasks share the store pool and run concurrently.
//!
//! A run never panics or returns early on failure: it always produces a
//! [`RunReport`] that names the first fatal error and carries whatever counts
//! were committed before it.

use crate::config::IngestConfig;
use crate::dataset::{default_datasets, DatasetSpec};
use crate::error::{IngestError, ParseError, Result};
use crate::extractor;
use crate::fetcher::{ArchiveFetcher, FetchedArchive};
use crate::loader::{BatchLoader, LoadStats};
use crate::parser::RecordStream;
use crate::store::Store;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Downloaded archive name inside the run directory
pub const ARCHIVE_FILE_NAME: &str = "dump.tar.gz";
/// Extraction directory inside the run directory
pub const EXTRACT_DIR_NAME: &str = "extracted";

/// Run lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Fetching,
    Extracting,
    Loading,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

/// Per-dataset lifecycle inside the `Loading` state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetState {
    Pending,
    Loading,
    Loaded,
    Failed,
}

/// Outcome of one dataset load
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetReport {
    pub name: String,
    pub table: String,
    pub state: DatasetState,
    pub rows_written: u64,
    pub batches_committed: u64,
    pub parse_errors: u64,
    pub parse_error_samples: Vec<ParseError>,
    pub error: Option<String>,
}

impl DatasetReport {
    fn pending(spec: &DatasetSpec) -> Self {
        Self {
            name: spec.name.clone(),
            table: spec.table.clone(),
            state: DatasetState::Pending,
            rows_written: 0,
            batches_committed: 0,
            parse_errors: 0,
            parse_error_samples: Vec::new(),
            error: None,
        }
    }

    fn apply(&mut self, stats: LoadStats) {
        self.rows_written = stats.rows_written;
        self.batches_committed = stats.batches_committed;
        self.parse_errors = stats.parse_errors;
        self.parse_error_samples = stats.parse_error_samples;
    }
}

/// Full record of one pipeline run
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Every state entered, in order
    pub states: Vec<RunState>,
    pub archive: Option<FetchedArchive>,
    pub datasets: Vec<DatasetReport>,
    /// First fatal error, in completion order
    pub error: Option<IngestError>,
}

impl RunReport {
    fn new(run_id: Uuid, source_url: &str, datasets: &[DatasetSpec]) -> Self {
        Self {
            run_id,
            source_url: source_url.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            states: vec![RunState::Init],
            archive: None,
            datasets: datasets.iter().map(DatasetReport::pending).collect(),
            error: None,
        }
    }

    fn enter(&mut self, state: RunState) {
        info!(from = ?self.final_state(), to = ?state, "Run state change");
        self.states.push(state);
    }

    pub fn final_state(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Init)
    }

    pub fn is_success(&self) -> bool {
        self.final_state() == RunState::Done
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetReport> {
        self.datasets.iter().find(|d| d.name == name)
    }

    /// Rows committed for the named dataset
    pub fn rows_loaded(&self, name: &str) -> Option<u64> {
        self.dataset(name).map(|d| d.rows_written)
    }

    /// Recoverable parse errors across all datasets
    pub fn parse_error_count(&self) -> u64 {
        self.datasets.iter().map(|d| d.parse_errors).sum()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            source_url: self.source_url.clone(),
            state: self.final_state(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: self
                .finished_at
                .map(|end| (end - self.started_at).num_milliseconds()),
            archive_bytes: self.archive.as_ref().map(|a| a.bytes),
            archive_sha256: self.archive.as_ref().map(|a| a.sha256.clone()),
            datasets: self.datasets.clone(),
            parse_errors: self.parse_error_count(),
            error: self.error.as_ref().map(|e| e.to_string()),
            error_stage: self.error.as_ref().map(|e| e.stage()),
        }
    }
}

/// Serializable view of a [`RunReport`]
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source_url: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub archive_bytes: Option<u64>,
    pub archive_sha256: Option<String>,
    pub datasets: Vec<DatasetReport>,
    pub parse_errors: u64,
    pub error: Option<String>,
    pub error_stage: Option<&'static str>,
}

/// Dump ingestion pipeline
pub struct Pipeline {
    config: IngestConfig,
    datasets: Vec<DatasetSpec>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Create a pipeline for the standard customers + organizations dump
    pub fn new(config: IngestConfig) -> Self {
        Self {
            config,
            datasets: default_datasets(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the dataset list
    pub fn with_datasets(mut self, datasets: Vec<DatasetSpec>) -> Self {
        self.datasets = datasets;
        self
    }

    /// Cancelling this token stops the current (or next) run
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn datasets(&self) -> &[DatasetSpec] {
        &self.datasets
    }

    /// Working directory of a run
    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.config.work_dir.join(run_id.to_string())
    }

    /// Execute one run
    pub async fn run(&self) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id);
        self.run_with_id(run_id).instrument(span).await
    }

    async fn run_with_id(&self, run_id: Uuid) -> RunReport {
        let mut report = RunReport::new(run_id, &self.config.dump_url, &self.datasets);
        let run_dir = self.run_dir(run_id);
        let cancel = self.cancel.child_token();

        info!(
            url = %self.config.dump_url,
            database = %self.config.database_path.display(),
            datasets = self.datasets.len(),
            "Starting ingestion run"
        );

        let timer = self.config.run_timeout().map(|timeout| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {},
                    _ = tokio::time::sleep(timeout) => {
                        warn!(timeout_secs = timeout.as_secs(), "Run timed out, cancelling");
                        cancel.cancel();
                    }
                }
            })
        });

        let result = self.execute(&run_dir, &cancel, &mut report).await;

        if let Some(timer) = timer {
            timer.abort();
        }

        match result {
            Ok(()) => report.enter(RunState::Done),
            Err(err) => {
                error!(stage = err.stage(), error = %err, "Run failed");
                report.error = Some(err);
                report.enter(RunState::Failed);
            },
        }

        if !self.config.keep_work_files {
            remove_run_dir(&run_dir).await;
        }

        report.finished_at = Some(Utc::now());
        info!(
            state = ?report.final_state(),
            parse_errors = report.parse_error_count(),
            "Ingestion run finished"
        );
        report
    }

    async fn execute(
        &self,
        run_dir: &Path,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> Result<()> {
        self.config.validate()?;
        if self.datasets.is_empty() {
            return Err(IngestError::config("no datasets configured"));
        }

        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        tokio::fs::create_dir_all(&self.config.out_dir).await?;
        tokio::fs::create_dir_all(run_dir).await?;
        if let Some(parent) = self.config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let store = Store::open(&self.config.database_path, self.config.max_connections).await?;
        let result = self.execute_with_store(&store, run_dir, cancel, report).await;
        store.close().await;
        result
    }

    async fn execute_with_store(
        &self,
        store: &Store,
        run_dir: &Path,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> Result<()> {
        for spec in &self.datasets {
            store.ensure_table(spec).await?;
        }

        report.enter(RunState::Fetching);
        let fetcher = ArchiveFetcher::new(self.config.http.clone())?;
        let archive = fetcher
            .fetch(&self.config.dump_url, &run_dir.join(ARCHIVE_FILE_NAME), cancel)
            .await?;
        report.archive = Some(archive.clone());

        report.enter(RunState::Extracting);
        let extracted =
            extractor::extract(&archive.path, &run_dir.join(EXTRACT_DIR_NAME), cancel).await?;

        let mut streams = Vec::with_capacity(self.datasets.len());
        for spec in &self.datasets {
            let path = extracted.resolve(spec)?;
            let stream = RecordStream::open(&path, Arc::new(spec.clone()), self.config.header_check)?
                .with_cancellation(cancel.clone());
            streams.push(stream);
        }

        report.enter(RunState::Loading);
        self.load_all(store, streams, cancel, report).await
    }

    /// Run one load task per dataset and wait for all of them
    async fn load_all(
        &self,
        store: &Store,
        streams: Vec<RecordStream>,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> Result<()> {
        let mut tasks = FuturesUnordered::new();

        for (index, stream) in streams.into_iter().enumerate() {
            let spec = Arc::clone(stream.spec());
            let loader = BatchLoader::new(store.pool().clone(), self.config.batch_size)
                .with_cancellation(cancel.clone());
            report.datasets[index].state = DatasetState::Loading;

            let span = info_span!("dataset", dataset = %spec.name);
            let handle = tokio::spawn(
                async move {
                    let records = stream.into_channel(loader.batch_size());
                    let mut stats = LoadStats::default();
                    let result = loader.load(records, &spec, &mut stats).await;
                    (stats, result)
                }
                .instrument(span),
            );
            tasks.push(async move { (index, handle.await) });
        }

        let mut first_error: Option<IngestError> = None;

        while let Some((index, joined)) = tasks.next().await {
            let dataset = &mut report.datasets[index];

            let result = match joined {
                Ok((stats, result)) => {
                    dataset.apply(stats);
                    result
                },
                Err(join_err) => Err(IngestError::Io(std::io::Error::other(join_err))),
            };

            match result {
                Ok(rows) => {
                    dataset.state = DatasetState::Loaded;
                    info!(dataset = %dataset.name, rows, parse_errors = dataset.parse_errors, "Dataset complete");
                },
                Err(err) => {
                    error!(dataset = %dataset.name, error = %err, "Dataset load failed");
                    dataset.state = DatasetState::Failed;
                    dataset.error = Some(err.to_string());
                    first_error.get_or_insert(err);
                },
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn remove_run_dir(run_dir: &Path) {
    match tokio::fs::remove_dir_all(run_dir).await {
        Ok(()) => info!(path = %run_dir.display(), "Removed working files"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!(path = %run_dir.display(), error = %e, "Failed to remove working files"),
    }
}
