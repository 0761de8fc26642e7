//! Dump Common Library
//!
//! Shared utilities for the dump ingestion workspace.
//!
//! - **Error Handling**: [`CommonError`] and its result alias
//! - **Checksums**: streaming SHA-256 digests for downloaded archives
//! - **Logging**: one place to configure `tracing` for binaries and tests
//!
//! # Example
//!
//! ```no_run
//! use dump_common::checksum::{verify_checksum, StreamingChecksum};
//!
//! fn check(chunks: &[&[u8]], expected: &str) -> dump_common::Result<()> {
//!     let mut checksum = StreamingChecksum::new();
//!     for chunk in chunks {
//!         checksum.update(chunk);
//!     }
//!     verify_checksum(expected, &checksum.finalize_hex())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
