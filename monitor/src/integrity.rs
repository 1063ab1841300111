//! Critical file verification
//!
//! Each configured critical file is checked for presence, non-zero size and,
//! when an expected digest is configured, content checksum.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use blake3::Hasher as Blake3Hasher;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Blake3,
}

/// Expected digest of a critical file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedChecksum {
    pub algorithm: ChecksumAlgorithm,
    /// Hex encoded digest, compared case-insensitively
    pub digest: String,
}

/// A file whose presence and content the monitor verifies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalFile {
    /// Path, relative to the workspace root unless absolute
    pub path: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<ExpectedChecksum>,
}

impl CriticalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), checksum: None }
    }

    pub fn with_checksum(mut self, algorithm: ChecksumAlgorithm, digest: impl Into<String>) -> Self {
        self.checksum = Some(ExpectedChecksum { algorithm, digest: digest.into() });
        self
    }
}

/// Observed state of one critical file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FileState {
    Present { size: u64 },
    Missing,
    Empty,
    ChecksumMismatch { expected: String, actual: String },
    Unreadable { error: String },
}

impl FileState {
    /// Missing, tampered or unreadable files
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            FileState::Missing | FileState::ChecksumMismatch { .. } | FileState::Unreadable { .. }
        )
    }

    pub fn is_empty_file(&self) -> bool {
        matches!(self, FileState::Empty)
    }
}

/// Digest `data` with the given algorithm, returning lowercase hex
pub fn calculate_checksum(data: &[u8], algorithm: ChecksumAlgorithm) -> String {
    match algorithm {
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(data);
            hex::encode(hasher.finalize())
        }
        ChecksumAlgorithm::Blake3 => {
            let mut hasher = Blake3Hasher::new();
            hasher.update(data);
            hasher.finalize().to_hex().to_string()
        }
    }
}

/// Verify a single file
pub fn verify_file(path: &Path, expected: Option<&ExpectedChecksum>) -> FileState {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return FileState::Missing,
        Err(e) => return FileState::Unreadable { error: e.to_string() },
    };

    if !metadata.is_file() {
        return FileState::Unreadable { error: "not a regular file".to_string() };
    }
    if metadata.len() == 0 {
        return FileState::Empty;
    }

    let Some(expected) = expected else {
        return FileState::Present { size: metadata.len() };
    };

    match fs::read(path) {
        Ok(data) => {
            let actual = calculate_checksum(&data, expected.algorithm);
            if actual.eq_ignore_ascii_case(expected.digest.trim()) {
                FileState::Present { size: metadata.len() }
            } else {
                FileState::ChecksumMismatch { expected: expected.digest.clone(), actual }
            }
        }
        Err(e) => FileState::Unreadable { error: e.to_string() },
    }
}

/// Verify every critical file, keyed by the configured path
pub fn verify_all(root: &Path, files: &[CriticalFile]) -> BTreeMap<String, FileState> {
    files
        .iter()
        .map(|file| {
            let full_path = if file.path.is_absolute() { file.path.clone() } else { root.join(&file.path) };
            let state = verify_file(&full_path, file.checksum.as_ref());
            (file.path.to_string_lossy().to_string(), state)
        })
        .collect()
}
