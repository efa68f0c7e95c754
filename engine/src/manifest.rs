//! Audit manifests and checksum lists.
//!
//! Two outputs live here:
//! - The audit manifest: a standalone JSON document summarizing a job's
//!   integrity results, sealed with a checksum of its own content.
//! - Per-folder checksum lists, produced through the `MhlGenerator` trait so
//!   a real MHL implementation can be injected. `ChecksumListGenerator` is
//!   the built-in one: `<hex>  <name>` lines with a comment header.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::checksums::{compute_file_digest, HashAlgorithm};
use crate::error::EngineError;
use crate::fs_ops;
use crate::model::{FileState, OffloadJournal, OffloadPhase};

/// Audit manifest schema version.
pub const AUDIT_MANIFEST_VERSION: u32 = 1;

/// Verification status of one destination copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDestination {
    pub path: PathBuf,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// One file in the audit manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub file_name: String,
    pub relative_path: Option<String>,
    pub file_size: u64,
    pub state: FileState,
    pub xxhash64: Option<String>,
    pub sha256: Option<String>,
    pub source_verified: bool,
    pub safe_to_delete_source: bool,
    pub destinations: Vec<ManifestDestination>,
}

/// Human- and machine-readable summary of an offload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditManifest {
    pub manifest_version: u32,
    pub generated_at: DateTime<Utc>,
    pub job_id: String,
    pub source_path: PathBuf,
    pub destination_paths: Vec<PathBuf>,
    pub project_id: Option<String>,
    pub camera_label: Option<String>,
    pub roll_name: Option<String>,
    pub phase: OffloadPhase,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub required_copies: usize,
    pub total_files: usize,
    pub total_bytes: u64,
    pub job_signature: Option<String>,
    pub safe_to_format: bool,
    pub files: Vec<ManifestFile>,
    /// SHA-256 of this document serialized with this field set to null.
    pub manifest_checksum: Option<String>,
}

impl AuditManifest {
    /// Build an unsealed manifest from a journal.
    pub fn from_journal(journal: &OffloadJournal) -> Self {
        let files = journal
            .files
            .iter()
            .map(|f| {
                let checksum = f.source_checksum_on_copy.as_ref();
                ManifestFile {
                    file_name: f.file_name.clone(),
                    relative_path: f.relative_path.clone(),
                    file_size: f.file_size,
                    state: f.state,
                    xxhash64: checksum
                        .map(|c| c.xxhash64.clone())
                        .filter(|h| !h.is_empty()),
                    sha256: checksum.map(|c| c.sha256.clone()),
                    source_verified: f.source_verified,
                    safe_to_delete_source: f.is_safe_to_delete_source(journal.required_copies),
                    destinations: f
                        .destination_copies
                        .iter()
                        .map(|c| ManifestDestination {
                            path: c.path.clone(),
                            verified: c.verified,
                            verified_at: c.verified_at,
                            error: c.error.clone(),
                        })
                        .collect(),
                }
            })
            .collect();

        AuditManifest {
            manifest_version: AUDIT_MANIFEST_VERSION,
            generated_at: Utc::now(),
            job_id: journal.job_id.clone(),
            source_path: journal.source_path.clone(),
            destination_paths: journal.destination_paths.clone(),
            project_id: journal.project_id.clone(),
            camera_label: journal.camera_label.clone(),
            roll_name: journal.roll_name.clone(),
            phase: journal.phase,
            created_at: journal.created_at,
            completed_at: journal.completed_at,
            required_copies: journal.required_copies,
            total_files: journal.files.len(),
            total_bytes: journal.total_bytes(),
            job_signature: journal.job_signature.clone(),
            safe_to_format: journal.safe_to_format(),
            files,
            manifest_checksum: None,
        }
    }

    fn content_checksum(&self) -> Result<String, EngineError> {
        let value = serde_json::to_value(self)
            .map_err(|e| EngineError::Config(format!("manifest serialization failed: {}", e)))?;
        document_checksum(value)
    }

    /// Compute and store the self-checksum.
    pub fn seal(&mut self) -> Result<(), EngineError> {
        self.manifest_checksum = Some(self.content_checksum()?);
        Ok(())
    }

    /// True when the stored self-checksum matches the content.
    pub fn is_intact(&self) -> Result<bool, EngineError> {
        match &self.manifest_checksum {
            Some(stored) => Ok(*stored == self.content_checksum()?),
            None => Ok(false),
        }
    }
}

/// SHA-256 over the whole JSON document with `manifest_checksum` nulled.
///
/// Works on the raw value so keys the struct does not know about are covered.
fn document_checksum(mut document: serde_json::Value) -> Result<String, EngineError> {
    if let Some(fields) = document.as_object_mut() {
        fields.insert("manifest_checksum".to_string(), serde_json::Value::Null);
    }
    let bytes = serde_json::to_vec_pretty(&document)
        .map_err(|e| EngineError::Config(format!("manifest serialization failed: {}", e)))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Build, seal and atomically write the audit manifest for `journal`.
pub fn export_audit_manifest(journal: &OffloadJournal, path: &Path) -> Result<AuditManifest, EngineError> {
    let mut manifest = AuditManifest::from_journal(journal);
    manifest.seal()?;
    let bytes = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| EngineError::Config(format!("manifest serialization failed: {}", e)))?;
    fs_ops::atomic_write_bytes(path, &bytes)?;
    Ok(manifest)
}

/// Re-read an audit manifest and check its self-checksum.
pub fn verify_audit_manifest(path: &Path) -> Result<bool, EngineError> {
    let bytes = fs::read(path).map_err(|e| EngineError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let parse_error = |e: serde_json::Error| EngineError::JournalLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let document: serde_json::Value = serde_json::from_slice(&bytes).map_err(parse_error)?;
    let manifest = AuditManifest::deserialize(&document).map_err(parse_error)?;

    match manifest.manifest_checksum {
        Some(stored) => Ok(stored == document_checksum(document)?),
        None => Ok(false),
    }
}

/// Result of one manifest-generation request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MhlOutcome {
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub errors: Vec<String>,
}

/// Produces a checksum manifest for one destination folder.
pub trait MhlGenerator: Send {
    fn generate(&self, folder: &Path, algorithm: HashAlgorithm) -> MhlOutcome;
}

/// Writes `<folder-name>_<timestamp>.<algo>` into the folder, listing every
/// regular file directly inside it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChecksumListGenerator;

impl ChecksumListGenerator {
    fn is_list_file(name: &str) -> bool {
        [HashAlgorithm::Xxh64, HashAlgorithm::Sha256, HashAlgorithm::Md5]
            .iter()
            .any(|a| name.ends_with(&format!(".{}", a.extension())))
    }
}

impl MhlGenerator for ChecksumListGenerator {
    fn generate(&self, folder: &Path, algorithm: HashAlgorithm) -> MhlOutcome {
        let mut outcome = MhlOutcome::default();

        let entries = match fs::read_dir(folder) {
            Ok(entries) => entries,
            Err(e) => {
                outcome.errors.push(format!("{}: {}", folder.display(), e));
                return outcome;
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| !fs_ops::is_engine_temp_file(n) && !Self::is_list_file(n))
            .collect();
        names.sort();

        let mut lines = Vec::with_capacity(names.len());
        for name in names {
            match compute_file_digest(&folder.join(&name), algorithm) {
                Ok(hex) => lines.push(format!("{}  {}", hex, name)),
                Err(e) => outcome.errors.push(format!("{}: {}", name, e)),
            }
        }
        if !outcome.errors.is_empty() {
            return outcome;
        }

        let folder_name = folder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "offload".to_string());
        let output = folder.join(format!(
            "{}_{}.{}",
            folder_name,
            Utc::now().format("%Y%m%d_%H%M%S"),
            algorithm.extension()
        ));

        let mut content = String::new();
        content.push_str("; Checksum list generated by offload\n");
        content.push_str(&format!("; Algorithm: {}\n", algorithm));
        content.push_str(&format!("; Created: {}\n\n", Utc::now().to_rfc3339()));
        for line in lines {
            content.push_str(&line);
            content.push('\n');
        }

        match fs_ops::atomic_write_bytes(&output, content.as_bytes()) {
            Ok(()) => {
                outcome.success = true;
                outcome.output_path = Some(output);
            }
            Err(e) => outcome.errors.push(e.to_string()),
        }
        outcome
    }
}
