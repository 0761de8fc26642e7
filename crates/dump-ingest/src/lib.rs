//! Dump Ingest Library
//!
//! Downloads a gzip-compressed tar dump, unpacks it, and streams its
//! comma-delimited record files into SQLite tables in fixed-size
//! transactional batches.
//!
//! # Stages
//!
//! - **Fetch**: [`fetcher::ArchiveFetcher`] streams the archive to disk
//! - **Extract**: [`extractor::extract`] unpacks it into a fresh directory
//! - **Parse**: [`parser::RecordStream`] yields one record per line
//! - **Load**: [`loader::BatchLoader`] writes batches to the [`store::Store`]
//!
//! [`pipeline::Pipeline`] wires them together for every dataset.
//!
//! # Example
//!
//! ```no_run
//! use dump_ingest::{IngestConfig, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::builder()
//!         .dump_url("https://example.com/dump.tar.gz")
//!         .out_dir("./out")
//!         .build();
//!
//!     let report = Pipeline::new(config).run().await;
//!     println!("customers: {:?}", report.rows_loaded("customers"));
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod dataset;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod loader;
pub mod parser;
pub mod pipeline;
pub mod store;

pub use config::{HeaderCheck, HttpConfig, IngestConfig};
pub use dataset::{DatasetSpec, FieldSpec, FieldType, Record};
pub use error::{IngestError, Result};
pub use pipeline::{DatasetReport, DatasetState, Pipeline, RunReport, RunState, RunSummary};
pub use store::Store;
