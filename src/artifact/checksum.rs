//! Artifact checksum verification.
//!
//! The registry publishes the expected digest as a side-channel text asset. Legacy
//! releases use MD5 (32 hex digits); a 64-digit value is treated as SHA-256. Either way
//! this only detects corruption, not tampering.

use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::InstallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    /// Pick the algorithm from the length of an already-normalized hex digest.
    pub fn for_digest(hex: &str) -> Self {
        if hex.len() == 64 {
            ChecksumAlgorithm::Sha256
        } else {
            ChecksumAlgorithm::Md5
        }
    }
}

/// Normalize checksum asset content: first whitespace-separated token, lowercase.
///
/// Accepts both a bare digest and `md5sum` output (`<digest>  <file name>`).
pub fn normalize_digest(raw: &str) -> String {
    raw.split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Hash the whole file with `algorithm`, returning lowercase hex.
pub async fn file_digest(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String, InstallError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| InstallError::io(path, e))?;

    let mut md5 = Md5::new();
    let mut sha256 = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| InstallError::io(path, e))?;
        if n == 0 {
            break;
        }
        match algorithm {
            ChecksumAlgorithm::Md5 => md5.update(&buf[..n]),
            ChecksumAlgorithm::Sha256 => sha256.update(&buf[..n]),
        }
    }

    Ok(match algorithm {
        ChecksumAlgorithm::Md5 => hex::encode(md5.finalize()),
        ChecksumAlgorithm::Sha256 => hex::encode(sha256.finalize()),
    })
}

/// Outcome of comparing a file against an expected digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumReport {
    pub expected: String,
    pub actual: String,
}

impl ChecksumReport {
    pub fn matches(&self) -> bool {
        !self.expected.is_empty() && self.expected == self.actual
    }
}

pub async fn check_file(path: &Path, expected_raw: &str) -> Result<ChecksumReport, InstallError> {
    let expected = normalize_digest(expected_raw);
    let actual = file_digest(path, ChecksumAlgorithm::for_digest(&expected)).await?;
    Ok(ChecksumReport { expected, actual })
}

/// `true` when the file's digest equals `expected_hex` (case-insensitive, trimmed).
pub async fn verify_checksum(path: &Path, expected_hex: &str) -> Result<bool, InstallError> {
    Ok(check_file(path, expected_hex).await?.matches())
}
