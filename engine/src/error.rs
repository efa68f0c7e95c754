//! Error types for the offload engine.
//!
//! `EngineError` represents conditions that stop an operation from producing a
//! result. Per-file integrity problems (checksum mismatch, source drift, a
//! destination that disappeared) are recorded on the `RobustFileEntry` and
//! never surface as `EngineError` from a running job.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The expected input file or directory does not exist
    #[error("Source not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Failed to read from a file
    #[error("Failed to read file: {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write, flush, sync or rename a file
    #[error("Failed to write file: {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to create a directory
    #[error("Failed to create directory: {}", path.display())]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The resume journal could not be written. Fatal to the run.
    #[error("Failed to persist journal {}: {reason}", path.display())]
    JournalPersist { path: PathBuf, reason: String },

    /// The resume journal could not be read or parsed
    #[error("Failed to load journal {}: {reason}", path.display())]
    JournalLoad { path: PathBuf, reason: String },

    /// The journal was written by a newer engine
    #[error("Journal {} has version {found}, this engine supports up to {supported}", path.display())]
    UnsupportedJournalVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    /// A new job was started with the id of an existing journal
    #[error("Job {job_id} already has a journal at {}; resume it instead", path.display())]
    JobExists { job_id: String, path: PathBuf },

    /// Another run already holds the lock for this job
    #[error("Job {job_id} is already running (lock held on {})", path.display())]
    JobLocked { job_id: String, path: PathBuf },

    /// The job description is unusable (no destinations, bad paths, ...)
    #[error("Invalid job: {reason}")]
    InvalidJob { reason: String },

    /// The background worker could not start or died
    #[error("Offload worker failed: {0}")]
    Worker(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Read { source, .. }
            | Self::Write { source, .. }
            | Self::DirectoryCreationFailed { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// True when the error means the file simply is not there.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::SourceNotFound { .. } => true,
            Self::Read { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
