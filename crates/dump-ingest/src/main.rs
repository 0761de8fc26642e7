//! Dump Ingest - load a remote data dump into SQLite
//!
//! Takes no arguments. Settings come from `DUMP_*` and `LOG_*` environment
//! variables (a `.env` file is honored).

use anyhow::{bail, Context, Result};
use dump_common::logging::{init_logging, LogConfig};
use dump_ingest::{IngestConfig, Pipeline};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let log_config = LogConfig::builder()
        .log_file_prefix("dump-ingest")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    let config = IngestConfig::from_env().context("Invalid ingestion configuration")?;
    let pipeline = Pipeline::new(config);

    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let report = pipeline.run().await;
    let summary = serde_json::to_string(&report.summary())?;
    info!(summary = %summary, "Run summary");

    if let Some(err) = &report.error {
        error!(stage = err.stage(), "Ingestion failed");
        bail!("ingestion run {} failed: {}", report.run_id, err);
    }

    for dataset in &report.datasets {
        info!(
            dataset = %dataset.name,
            rows = dataset.rows_written,
            parse_errors = dataset.parse_errors,
            "Loaded"
        );
    }
    Ok(())
}
