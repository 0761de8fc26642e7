//! SHA-256 checksums for downloaded archives
//!
//! The fetcher hashes bytes as they arrive, so the digest is ready the moment
//! the last chunk hits the disk.

use crate::error::{CommonError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;

const READ_BUFFER_SIZE: usize = 8192;

/// Incremental SHA-256 digest
#[derive(Clone, Default)]
pub struct StreamingChecksum {
    hasher: Sha256,
    bytes: u64,
}

impl StreamingChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of data
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes hashed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finish hashing and return the lowercase hex digest
    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Compute the SHA-256 checksum of any readable source
pub fn compute_checksum<R: Read>(reader: &mut R) -> Result<String> {
    let mut checksum = StreamingChecksum::new();
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        checksum.update(&buffer[..bytes_read]);
    }

    Ok(checksum.finalize_hex())
}

/// Compare a digest against the expected value (case-insensitive hex)
pub fn verify_checksum(expected: &str, actual: &str) -> Result<()> {
    if expected.trim().eq_ignore_ascii_case(actual) {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            expected: expected.trim().to_lowercase(),
            actual: actual.to_string(),
        })
    }
}
