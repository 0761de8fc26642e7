//! Batched, transactional persistence of parsed records
//!
//! The loader pulls records from a [`RecordStream`](crate::parser::RecordStream)
//! channel (or any stream of record results) into a buffer of at most `batch_size`
//! records. A full buffer, and the final partial one, is written as a single
//! transaction and awaited before the next record is pulled, so batches land
//! in file order and memory stays bounded by one batch.
//!
//! Parse errors are counted and skipped. A constraint violation rolls back the
//! in-flight batch and ends the dataset load with a [`LoadError`]; batches
//! committed before it stay committed.

use crate::dataset::{DatasetSpec, Record};
use crate::error::{IngestError, LoadError, ParseError, Result};
use futures::{Stream, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Parse errors kept verbatim per dataset; the rest are only counted
pub const MAX_PARSE_ERROR_SAMPLES: usize = 10;

/// Running totals for one dataset load
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub rows_written: u64,
    pub batches_committed: u64,
    pub parse_errors: u64,
    pub parse_error_samples: Vec<ParseError>,
}

impl LoadStats {
    fn record_parse_error(&mut self, err: ParseError) {
        self.parse_errors += 1;
        if self.parse_error_samples.len() < MAX_PARSE_ERROR_SAMPLES {
            self.parse_error_samples.push(err);
        }
    }
}

/// Writes record sequences into their dataset's table
#[derive(Debug, Clone)]
pub struct BatchLoader {
    pool: SqlitePool,
    batch_size: usize,
    cancel: CancellationToken,
}

impl BatchLoader {
    pub fn new(pool: SqlitePool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Abort between records, and mid-batch, once the token is cancelled
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Load every record of `records` into `spec`'s table
    ///
    /// Returns the number of rows written. `stats` is updated as batches
    /// commit, so it still holds the committed counts when an error is
    /// returned.
    #[instrument(skip_all, fields(dataset = %spec.name, batch_size = self.batch_size))]
    pub async fn load<S>(&self, mut records: S, spec: &DatasetSpec, stats: &mut LoadStats) -> Result<u64>
    where
        S: Stream<Item = Result<Record>> + Unpin,
    {
        let insert_sql = spec.insert_sql();
        let mut buffer: Vec<Record> = Vec::with_capacity(self.batch_size);

        while let Some(item) = records.next().await {
            if self.cancel.is_cancelled() {
                debug!(discarded = buffer.len(), "Load cancelled, dropping buffered records");
                return Err(IngestError::cancelled("load"));
            }

            match item {
                Ok(record) => {
                    buffer.push(record);
                    if buffer.len() >= self.batch_size {
                        self.flush(spec, &insert_sql, &buffer, stats).await?;
                        buffer.clear();
                    }
                },
                Err(IngestError::Parse(err)) => {
                    warn!(line = err.line, reason = %err.reason, raw = %err.raw, "Skipping malformed record");
                    stats.record_parse_error(err);
                },
                Err(e) => return Err(e),
            }
        }

        if !buffer.is_empty() {
            self.flush(spec, &insert_sql, &buffer, stats).await?;
        }

        info!(
            rows = stats.rows_written,
            batches = stats.batches_committed,
            parse_errors = stats.parse_errors,
            "Dataset loaded"
        );
        Ok(stats.rows_written)
    }

    async fn flush(
        &self,
        spec: &DatasetSpec,
        insert_sql: &str,
        batch: &[Record],
        stats: &mut LoadStats,
    ) -> Result<()> {
        let batch_no = stats.batches_committed + 1;

        // Dropping the write future drops its transaction, which rolls it back.
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(batch = batch_no, "Load cancelled during batch write");
                return Err(IngestError::cancelled("load"));
            }
            result = self.write_batch(spec, insert_sql, batch, batch_no, stats.rows_written) => result?,
        }

        stats.rows_written += batch.len() as u64;
        stats.batches_committed = batch_no;
        debug!(batch = batch_no, rows = batch.len(), total = stats.rows_written, "Committed batch");
        Ok(())
    }

    async fn write_batch(
        &self,
        spec: &DatasetSpec,
        insert_sql: &str,
        batch: &[Record],
        batch_no: u64,
        rows_committed: u64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for (position, record) in batch.iter().enumerate() {
            let mut query = sqlx::query(insert_sql);
            for value in record.values() {
                query = query.bind(value.as_deref());
            }

            if let Err(source) = query.execute(&mut *tx).await {
                warn!(
                    batch = batch_no,
                    position,
                    line = record.line(),
                    key = ?record.primary_key(),
                    error = %source,
                    "Batch rejected, rolling back"
                );
                return Err(LoadError {
                    dataset: spec.name.clone(),
                    table: spec.table.clone(),
                    batch: batch_no,
                    position,
                    key: record.primary_key().map(str::to_string),
                    rows_committed,
                    source,
                }
                .into());
            }
        }

        tx.commit().await?;
        Ok(())
    }
}
