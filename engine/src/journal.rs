//! Durable job journal.
//!
//! One JSON file per job, `<dir>/<job_id>.json`, rewritten with the
//! temp-fsync-rename discipline after every state transition so a crash never
//! leaves a torn resume record. A sibling `<job_id>.lock` file carries an
//! advisory lock while a run is in progress; the OS releases it if the process
//! dies, so a crash never blocks a later resume.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::EngineError;
use crate::fs_ops;
use crate::model::{OffloadJournal, JOURNAL_VERSION};

/// Directory of job journals.
#[derive(Debug, Clone)]
pub struct JournalStore {
    dir: PathBuf,
}

impl JournalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JournalStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the journal for `job_id`.
    pub fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }

    fn lock_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", job_id))
    }

    pub fn exists(&self, job_id: &str) -> bool {
        self.path_for(job_id).is_file()
    }

    /// Atomically persist the journal.
    ///
    /// # Errors
    /// `JournalPersist` on any failure. Callers treat this as fatal.
    pub fn save(&self, journal: &OffloadJournal) -> Result<PathBuf, EngineError> {
        validate_job_id(&journal.job_id)?;
        let path = self.path_for(&journal.job_id);
        let persist_err = |reason: String| EngineError::JournalPersist {
            path: path.clone(),
            reason,
        };

        let bytes = serde_json::to_vec_pretty(journal).map_err(|e| persist_err(e.to_string()))?;
        fs_ops::atomic_write_bytes(&path, &bytes).map_err(|e| persist_err(e.to_string()))?;
        debug!(job_id = %journal.job_id, phase = %journal.phase, "journal saved");
        Ok(path)
    }

    /// Load the journal for `job_id`.
    pub fn load(&self, job_id: &str) -> Result<OffloadJournal, EngineError> {
        validate_job_id(job_id)?;
        load_journal(&self.path_for(job_id))
    }

    /// Job ids of all journals in the store, sorted.
    pub fn list(&self) -> Result<Vec<String>, EngineError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(EngineError::Read {
                    path: self.dir.clone(),
                    source: e,
                })
            }
        };

        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".json").map(str::to_string)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Open the lock file for `job_id`. Hold a write guard on the result for
    /// the duration of a run.
    pub fn open_lock(&self, job_id: &str) -> Result<fd_lock::RwLock<File>, EngineError> {
        validate_job_id(job_id)?;
        let path = self.lock_path(job_id);
        fs::create_dir_all(&self.dir).map_err(|e| EngineError::DirectoryCreationFailed {
            path: self.dir.clone(),
            source: e,
        })?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| EngineError::Write { path, source: e })?;
        Ok(fd_lock::RwLock::new(file))
    }

    /// The error reported when another run holds the lock.
    pub fn locked_error(&self, job_id: &str) -> EngineError {
        EngineError::JobLocked {
            job_id: job_id.to_string(),
            path: self.lock_path(job_id),
        }
    }
}

/// Check that `job_id` can name files inside the journal directory.
///
/// Rejects empty ids, path separators, NUL and a leading `.` (which also
/// covers `.` and `..`).
pub fn validate_job_id(job_id: &str) -> Result<(), EngineError> {
    let reason = if job_id.is_empty() {
        "job id is empty"
    } else if job_id.starts_with('.') {
        "job id must not start with '.'"
    } else if job_id.contains(['/', '\\', '\0']) {
        "job id must not contain path separators"
    } else {
        return Ok(());
    };
    Err(EngineError::InvalidJob {
        reason: format!("{} ({:?})", reason, job_id),
    })
}

/// Load and validate a journal file.
///
/// Journals without `manifest_version` are version 1. Newer versions are
/// rejected rather than misread.
pub fn load_journal(path: &Path) -> Result<OffloadJournal, EngineError> {
    let load_err = |reason: String| EngineError::JournalLoad {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EngineError::SourceNotFound {
                path: path.to_path_buf(),
            }
        } else {
            load_err(e.to_string())
        }
    })?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| load_err(e.to_string()))?;

    let version = match value.get("manifest_version") {
        None => 1,
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| load_err("manifest_version is not an integer".to_string()))?,
    };
    if version > JOURNAL_VERSION {
        return Err(EngineError::UnsupportedJournalVersion {
            path: path.to_path_buf(),
            found: version,
            supported: JOURNAL_VERSION,
        });
    }

    let mut journal: OffloadJournal = serde_json::from_value(value).map_err(|e| load_err(e.to_string()))?;
    journal.manifest_version = JOURNAL_VERSION;
    Ok(journal)
}

/// Job-wide signature.
///
/// SHA-256 over `"<name>:<sha256>\n"` for every file with an authoritative
/// checksum, sorted by name, so processing order never changes the result.
pub fn compute_job_signature(journal: &OffloadJournal) -> String {
    let mut pairs: Vec<(String, &str)> = journal
        .files
        .iter()
        .filter_map(|f| {
            f.source_checksum_on_copy
                .as_ref()
                .map(|c| (f.display_name(), c.sha256.as_str()))
        })
        .collect();
    pairs.sort();

    let mut hasher = Sha256::new();
    for (name, sha256) in pairs {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(sha256.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
