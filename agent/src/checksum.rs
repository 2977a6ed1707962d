//! Checksum computation for media files.
//!
//! Two modes, selected by file size:
//! - Files below the threshold get a full streaming hash of their contents.
//! - Files at or above the threshold get a *partial* signature: a hash of
//!   the first megabyte, the last megabyte, and the file size.
//!
//! The partial signature is a deliberate trade-off. Fully hashing every
//! multi-gigabyte clip on every watch tick would make the watcher useless,
//! while head + tail + size is enough to catch truncation, corruption and
//! swapped files in this workflow. It is NOT cryptographically strong
//! against deliberate tampering; it is an integrity assist, not a security
//! control. Partial and full values carry distinct labels so the two can
//! never compare equal.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::Digest;

use crate::error::AgentError;

/// Size at or above which files get the partial signature.
pub const DEFAULT_FULL_HASH_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Bytes hashed from each end of a large file.
const PARTIAL_CHUNK_SIZE: u64 = 1024 * 1024;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// BLAKE3 (modern, fast, 256-bit) — the default
    Blake3,
    /// SHA-256 (slower, kept for deployments that require it)
    Sha256,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blake3 => write!(f, "blake3"),
            Self::Sha256 => write!(f, "sha256"),
        }
    }
}

impl HashAlgorithm {
    /// Parse an algorithm name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "blake3" => Some(Self::Blake3),
            "sha256" => Some(Self::Sha256),
            _ => None,
        }
    }
}

/// A computed checksum.
///
/// `partial` records whether this is a head+tail+size signature rather than
/// a hash of the whole file. Equality covers the algorithm, the mode and
/// the digest, so a partial signature never matches a full hash even on the
/// same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumValue {
    pub algorithm: HashAlgorithm,
    pub partial: bool,
    pub hex: String,
}

impl ChecksumValue {
    pub fn full(algorithm: HashAlgorithm, hex: String) -> Self {
        ChecksumValue {
            algorithm,
            partial: false,
            hex,
        }
    }

    pub fn partial(algorithm: HashAlgorithm, hex: String) -> Self {
        ChecksumValue {
            algorithm,
            partial: true,
            hex,
        }
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.partial {
            write!(f, "{}/partial:{}", self.algorithm, self.hex)
        } else {
            write!(f, "{}:{}", self.algorithm, self.hex)
        }
    }
}

/// Incremental hasher over the configured algorithm.
enum Hasher {
    Blake3(Box<blake3::Hasher>),
    Sha256(sha2::Sha256),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
            HashAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::default()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Blake3(h) => {
                h.update(data);
            }
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Blake3(h) => h.finalize().to_hex().to_string(),
            Hasher::Sha256(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Computes file checksums with the size-based full/partial split.
///
/// The threshold is a constructor parameter so tests can exercise the
/// partial path without hundred-megabyte fixtures.
#[derive(Debug, Clone, Copy)]
pub struct ChecksumEngine {
    algorithm: HashAlgorithm,
    full_hash_threshold: u64,
}

impl Default for ChecksumEngine {
    fn default() -> Self {
        ChecksumEngine {
            algorithm: HashAlgorithm::Blake3,
            full_hash_threshold: DEFAULT_FULL_HASH_THRESHOLD,
        }
    }
}

impl ChecksumEngine {
    pub fn new(algorithm: HashAlgorithm, full_hash_threshold: u64) -> Self {
        ChecksumEngine {
            algorithm,
            full_hash_threshold,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Compute the checksum for a file.
    ///
    /// Files smaller than the threshold are hashed in full; larger files
    /// get the head+tail+size signature described in the module docs.
    ///
    /// # Errors
    /// Returns `AgentError::Read` if the file cannot be opened or read.
    pub fn checksum_file(&self, path: &Path) -> Result<ChecksumValue, AgentError> {
        let metadata = std::fs::metadata(path).map_err(|e| AgentError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        if metadata.len() < self.full_hash_threshold {
            self.full_checksum(path)
        } else {
            self.partial_checksum(path, metadata.len())
        }
    }

    fn full_checksum(&self, path: &Path) -> Result<ChecksumValue, AgentError> {
        let mut file = File::open(path).map_err(|e| AgentError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut hasher = Hasher::new(self.algorithm);
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        loop {
            match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => hasher.update(&buffer[..n]),
                Err(e) => {
                    return Err(AgentError::Read {
                        path: path.to_path_buf(),
                        source: e,
                    })
                }
            }
        }

        Ok(ChecksumValue::full(self.algorithm, hasher.finalize_hex()))
    }

    fn partial_checksum(&self, path: &Path, size: u64) -> Result<ChecksumValue, AgentError> {
        let mut file = File::open(path).map_err(|e| AgentError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        let read_err = |e| AgentError::Read {
            path: path.to_path_buf(),
            source: e,
        };

        let mut hasher = Hasher::new(self.algorithm);
        let head_len = PARTIAL_CHUNK_SIZE.min(size);
        copy_chunk(&mut file, &mut hasher, head_len).map_err(read_err)?;

        let tail_start = size.saturating_sub(PARTIAL_CHUNK_SIZE);
        file.seek(SeekFrom::Start(tail_start)).map_err(read_err)?;
        copy_chunk(&mut file, &mut hasher, size - tail_start).map_err(read_err)?;

        hasher.update(&size.to_le_bytes());

        Ok(ChecksumValue::partial(self.algorithm, hasher.finalize_hex()))
    }
}

/// Feed up to `limit` bytes from `file` into `hasher`.
fn copy_chunk(file: &mut File, hasher: &mut Hasher, limit: u64) -> Result<(), std::io::Error> {
    let mut remaining = limit;
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    while remaining > 0 {
        let want = (remaining as usize).min(READ_BUFFER_SIZE);
        let n = file.read(&mut buffer[..want])?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        remaining -= n as u64;
    }
    Ok(())
}
