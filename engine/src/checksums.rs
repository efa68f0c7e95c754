//! Checksum computation.
//!
//! Every file is hashed twice in a single streaming pass:
//! - xxHash64, a fast non-cryptographic digest for operational checks
//! - SHA-256, the cryptographic digest that decides pass/fail
//!
//! The xxHash64 slot is filled only when the `xxhash` feature is enabled.
//! Without it the slot is an empty string and all comparisons fall back to
//! SHA-256 alone.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Streaming chunk size: 32 MiB.
pub const CHUNK_SIZE: usize = 32 * 1024 * 1024;

/// Dual digest of one file's bytes. Hex encoded, lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChecksum {
    pub xxhash64: String,
    pub sha256: String,
}

impl FileChecksum {
    pub fn new(xxhash64: impl Into<String>, sha256: impl Into<String>) -> Self {
        FileChecksum {
            xxhash64: xxhash64.into(),
            sha256: sha256.into(),
        }
    }

    /// Pass/fail comparison. SHA-256 equality decides.
    pub fn matches(&self, other: &FileChecksum) -> bool {
        !self.sha256.is_empty() && self.sha256 == other.sha256
    }

    /// True when both fast digests are present and disagree.
    ///
    /// With matching SHA-256 this should never happen; callers surface it as
    /// a warning rather than a failure.
    pub fn fast_hash_conflicts(&self, other: &FileChecksum) -> bool {
        !self.xxhash64.is_empty() && !other.xxhash64.is_empty() && self.xxhash64 != other.xxhash64
    }

    /// Digest for the given algorithm, if this checksum carries it.
    pub fn digest(&self, algorithm: HashAlgorithm) -> Option<&str> {
        let hex = match algorithm {
            HashAlgorithm::Xxh64 => self.xxhash64.as_str(),
            HashAlgorithm::Sha256 => self.sha256.as_str(),
            HashAlgorithm::Md5 => return None,
        };
        if hex.is_empty() {
            None
        } else {
            Some(hex)
        }
    }
}

impl fmt::Display for FileChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.xxhash64.is_empty() {
            write!(f, "sha256:{}", self.sha256)
        } else {
            write!(f, "xxh64:{} sha256:{}", self.xxhash64, self.sha256)
        }
    }
}

/// Hash algorithm selector for checksum manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// xxHash64 (fast, non-cryptographic)
    Xxh64,
    /// SHA-256 (cryptographic, 256-bit)
    Sha256,
    /// MD5 (legacy, still requested by some post houses)
    Md5,
}

impl HashAlgorithm {
    /// File extension used for checksum list files.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Xxh64 => "xxh64",
            Self::Sha256 => "sha256",
            Self::Md5 => "md5",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for HashAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "xxh64" | "xxhash64" | "xxhash" => Ok(Self::Xxh64),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "md5" => Ok(Self::Md5),
            other => Err(EngineError::Config(format!(
                "unknown hash algorithm '{}', expected xxh64, sha256 or md5",
                other
            ))),
        }
    }
}

/// Incremental dual hasher. Feed bytes with `update`, then `finalize`.
pub struct DualHasher {
    #[cfg(feature = "xxhash")]
    fast: xxhash_rust::xxh64::Xxh64,
    sha256: sha2::Sha256,
}

impl DualHasher {
    pub fn new() -> Self {
        DualHasher {
            #[cfg(feature = "xxhash")]
            fast: xxhash_rust::xxh64::Xxh64::new(0),
            sha256: sha2::Sha256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        #[cfg(feature = "xxhash")]
        self.fast.update(data);
        self.sha256.update(data);
    }

    pub fn finalize(self) -> FileChecksum {
        #[cfg(feature = "xxhash")]
        let fast = format!("{:016x}", self.fast.digest());
        #[cfg(not(feature = "xxhash"))]
        let fast = String::new();

        FileChecksum {
            xxhash64: fast,
            sha256: format!("{:x}", self.sha256.finalize()),
        }
    }
}

impl Default for DualHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress callback: `(bytes_read_so_far, total_size)`.
pub type ChunkProgress<'a> = &'a mut dyn FnMut(u64, u64);

/// Compute both digests of a file in one pass.
///
/// `progress` is invoked after every chunk. Any read error aborts the pass and
/// the partial hash state is dropped.
pub fn compute_file_checksum(path: &Path, progress: Option<ChunkProgress<'_>>) -> Result<FileChecksum, EngineError> {
    let file = File::open(path).map_err(|e| EngineError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    compute_checksum_from(file, path, progress)
}

/// Hash an already opened file. `path` is only used for error reporting.
///
/// Verification reads go through here so the hash is read from the exact
/// handle the cache bypass was applied to.
pub fn compute_checksum_from(
    mut file: File,
    path: &Path,
    mut progress: Option<ChunkProgress<'_>>,
) -> Result<FileChecksum, EngineError> {
    let read_err = |e| EngineError::Read {
        path: path.to_path_buf(),
        source: e,
    };

    let total = file.metadata().map_err(read_err)?.len();

    let mut hasher = DualHasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE.min(total.max(1) as usize)];
    let mut read_so_far = 0u64;

    loop {
        let n = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_err(e)),
        };
        hasher.update(&buffer[..n]);
        read_so_far += n as u64;
        if let Some(cb) = progress.as_mut() {
            cb(read_so_far, total);
        }
    }

    Ok(hasher.finalize())
}

/// Compute a single digest of a file with the given algorithm.
///
/// Used by checksum-list generation, where MD5 may be requested.
pub fn compute_file_digest(path: &Path, algorithm: HashAlgorithm) -> Result<String, EngineError> {
    if algorithm != HashAlgorithm::Md5 {
        let checksum = compute_file_checksum(path, None)?;
        return checksum
            .digest(algorithm)
            .map(str::to_string)
            .ok_or_else(|| EngineError::Config(format!("{} support is not compiled in", algorithm)));
    }

    let mut file = File::open(path).map_err(|e| EngineError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => context.consume(&buffer[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(EngineError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }
    }
    Ok(format!("{:x}", context.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_dual_hasher_known_sha256() {
        let mut hasher = DualHasher::new();
        hasher.update(b"hel");
        hasher.update(b"lo");
        let checksum = hasher.finalize();
        assert_eq!(checksum.sha256, HELLO_SHA256);
        #[cfg(feature = "xxhash")]
        assert_eq!(checksum.xxhash64.len(), 16);
        #[cfg(not(feature = "xxhash"))]
        assert!(checksum.xxhash64.is_empty());
    }

    #[test]
    fn test_compute_file_checksum_is_idempotent() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("clip.mov");
        let mut file = File::create(&path).expect("Failed to create file");
        file.write_all(&vec![7u8; 300_000]).expect("Failed to write file");
        drop(file);

        let first = compute_file_checksum(&path, None).expect("first hash");
        let second = compute_file_checksum(&path, None).expect("second hash");
        assert_eq!(first, second);
    }

    #[test]
    fn test_compute_file_checksum_reports_progress() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").expect("Failed to write file");

        let mut calls = Vec::new();
        let mut cb = |done: u64, total: u64| calls.push((done, total));
        let checksum = compute_file_checksum(&path, Some(&mut cb)).expect("hash");

        assert_eq!(checksum.sha256, HELLO_SHA256);
        assert_eq!(calls.last(), Some(&(5, 5)));
    }

    #[test]
    fn test_compute_file_checksum_empty_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("empty.bin");
        File::create(&path).expect("Failed to create file");

        let checksum = compute_file_checksum(&path, None).expect("hash");
        assert_eq!(
            checksum.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_compute_file_checksum_missing_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = compute_file_checksum(&temp_dir.path().join("missing"), None);
        assert!(matches!(result, Err(ref e) if e.is_not_found()));
    }

    #[test]
    fn test_matches_uses_sha256() {
        let a = FileChecksum::new("aaaa", "1234");
        let b = FileChecksum::new("bbbb", "1234");
        assert!(a.matches(&b));
        assert!(a.fast_hash_conflicts(&b));
        assert_ne!(a, b);

        let no_fast = FileChecksum::new("", "1234");
        assert!(a.matches(&no_fast));
        assert!(!a.fast_hash_conflicts(&no_fast));

        assert!(!FileChecksum::new("", "").matches(&FileChecksum::new("", "")));
    }

    #[test]
    fn test_hash_algorithm_parse_and_display() {
        assert_eq!("XXH64".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Xxh64);
        assert_eq!("sha256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert_eq!("md5".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Md5);
        assert!("crc32".parse::<HashAlgorithm>().is_err());
        assert_eq!(HashAlgorithm::Sha256.to_string(), "sha256");
    }

    #[test]
    fn test_compute_file_digest_md5() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").expect("Failed to write file");

        let md5 = compute_file_digest(&path, HashAlgorithm::Md5).expect("md5");
        assert_eq!(md5, "5d41402abc4b2a76b9719d911017c592");
        let sha = compute_file_digest(&path, HashAlgorithm::Sha256).expect("sha256");
        assert_eq!(sha, HELLO_SHA256);
    }
}
