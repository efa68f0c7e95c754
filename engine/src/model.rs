//! Core data model for offload jobs.
//!
//! This module defines the main data structures for representing an offload:
//! - OffloadJournal: the whole operation, persisted for resume and audit
//! - RobustFileEntry: one source file tracked across all destinations
//! - DestinationCopy: one physical copy at one destination root
//! - FileState, OffloadPhase: closed state enums

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksums::{FileChecksum, HashAlgorithm};

/// Minimum number of verified copies before a source may be erased.
pub const DEFAULT_REQUIRED_COPIES: usize = 2;

/// Current journal schema version.
pub const JOURNAL_VERSION: u32 = 1;

fn default_journal_version() -> u32 {
    1
}

fn default_required_copies() -> usize {
    DEFAULT_REQUIRED_COPIES
}

fn default_true() -> bool {
    true
}

/// Lifecycle of a single file.
///
/// `Pending -> Copying -> CopyComplete -> VerifyingDest -> DestVerified ->
/// VerifyingSource -> FullyVerified`, with `Failed` reachable from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Pending,
    Copying,
    CopyComplete,
    VerifyingDest,
    DestVerified,
    VerifyingSource,
    FullyVerified,
    Failed,
}

impl FileState {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileState::FullyVerified | FileState::Failed)
    }

    /// True once every destination holds a complete copy.
    pub fn is_copied(&self) -> bool {
        match self {
            FileState::Pending | FileState::Copying | FileState::Failed => false,
            FileState::CopyComplete
            | FileState::VerifyingDest
            | FileState::DestVerified
            | FileState::VerifyingSource
            | FileState::FullyVerified => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Pending => "pending",
            FileState::Copying => "copying",
            FileState::CopyComplete => "copy_complete",
            FileState::VerifyingDest => "verifying_dest",
            FileState::DestVerified => "dest_verified",
            FileState::VerifyingSource => "verifying_source",
            FileState::FullyVerified => "fully_verified",
            FileState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Overall phase of an offload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffloadPhase {
    Pending,
    Copying,
    Verifying,
    Finalizing,
    Complete,
    Failed,
    Cancelled,
}

impl std::fmt::Display for OffloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OffloadPhase::Pending => "pending",
            OffloadPhase::Copying => "copying",
            OffloadPhase::Verifying => "verifying",
            OffloadPhase::Finalizing => "finalizing",
            OffloadPhase::Complete => "complete",
            OffloadPhase::Failed => "failed",
            OffloadPhase::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One physical copy of a file at one destination root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationCopy {
    pub path: PathBuf,
    pub checksum: Option<FileChecksum>,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DestinationCopy {
    pub fn new(path: PathBuf) -> Self {
        DestinationCopy {
            path,
            checksum: None,
            verified: false,
            verified_at: None,
            error: None,
        }
    }

    /// Record a successful verification.
    pub fn mark_verified(&mut self, checksum: FileChecksum) {
        self.checksum = Some(checksum);
        self.verified = true;
        self.verified_at = Some(Utc::now());
        self.error = None;
    }

    /// Record a verification failure. The copy stays in the list for audit.
    pub fn mark_unverified(&mut self, checksum: Option<FileChecksum>, error: impl Into<String>) {
        if checksum.is_some() {
            self.checksum = checksum;
        }
        self.verified = false;
        self.verified_at = None;
        self.error = Some(error.into());
    }
}

/// One source file, tracked across all of its destination copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustFileEntry {
    pub file_name: String,
    pub relative_path: Option<String>,
    pub file_size: u64,
    pub state: FileState,
    /// Ground truth: digest of the first successful destination write.
    pub source_checksum_on_copy: Option<FileChecksum>,
    pub source_checksum_reread: Option<FileChecksum>,
    pub destination_copies: Vec<DestinationCopy>,
    pub source_verified: bool,
    pub all_copies_verified: bool,
    pub error_message: Option<String>,
    pub copy_started_at: Option<DateTime<Utc>>,
    pub copy_completed_at: Option<DateTime<Utc>>,
    pub verification_completed_at: Option<DateTime<Utc>>,
}

impl RobustFileEntry {
    pub fn new(file_name: impl Into<String>, relative_path: Option<String>, file_size: u64) -> Self {
        RobustFileEntry {
            file_name: file_name.into(),
            relative_path: relative_path.filter(|p| !p.is_empty()),
            file_size,
            state: FileState::Pending,
            source_checksum_on_copy: None,
            source_checksum_reread: None,
            destination_copies: Vec::new(),
            source_verified: false,
            all_copies_verified: false,
            error_message: None,
            copy_started_at: None,
            copy_completed_at: None,
            verification_completed_at: None,
        }
    }

    /// Relative path joined with the file name, `/` separated.
    pub fn display_name(&self) -> String {
        match &self.relative_path {
            Some(rel) => format!("{}/{}", rel.trim_end_matches('/'), self.file_name),
            None => self.file_name.clone(),
        }
    }

    /// Location of this file below `root`, preserving sub-folders.
    pub fn path_under(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        if let Some(rel) = &self.relative_path {
            for part in rel.split('/').filter(|p| !p.is_empty()) {
                path.push(part);
            }
        }
        path.push(&self.file_name);
        path
    }

    /// Number of destination copies individually verified.
    pub fn verified_copy_count(&self) -> usize {
        self.destination_copies.iter().filter(|c| c.verified).count()
    }

    /// The only gate that may tell an operator to erase the source card.
    ///
    /// Requires a verified source, every copy verified, and at least
    /// `required_copies` of them. Values below the default are raised to it,
    /// so a single-destination offload is never safe to delete.
    pub fn is_safe_to_delete_source(&self, required_copies: usize) -> bool {
        self.source_verified
            && self.all_copies_verified
            && self.verified_copy_count() >= required_copies.max(DEFAULT_REQUIRED_COPIES)
    }

    /// Record a failure with its message.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.state = FileState::Failed;
        self.error_message = Some(message.into());
    }
}

/// The aggregate root of one offload operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffloadJournal {
    #[serde(default = "default_journal_version")]
    pub manifest_version: u32,
    pub job_id: String,
    pub source_path: PathBuf,
    pub destination_paths: Vec<PathBuf>,
    pub phase: OffloadPhase,
    /// Progress display only.
    pub current_file_index: usize,
    pub files: Vec<RobustFileEntry>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub camera_label: Option<String>,
    #[serde(default)]
    pub roll_name: Option<String>,
    #[serde(default)]
    pub generate_mhl: bool,
    #[serde(default = "default_mhl_format")]
    pub mhl_format: HashAlgorithm,
    #[serde(default)]
    pub mhl_paths: Vec<PathBuf>,
    #[serde(default = "default_required_copies")]
    pub required_copies: usize,
    #[serde(default = "default_true")]
    pub verify_source: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub job_signature: Option<String>,
}

fn default_mhl_format() -> HashAlgorithm {
    HashAlgorithm::Xxh64
}

impl OffloadJournal {
    /// A fresh journal with no files yet.
    pub fn new(job_id: impl Into<String>, source_path: PathBuf, destination_paths: Vec<PathBuf>) -> Self {
        let now = Utc::now();
        OffloadJournal {
            manifest_version: JOURNAL_VERSION,
            job_id: job_id.into(),
            source_path,
            destination_paths,
            phase: OffloadPhase::Pending,
            current_file_index: 0,
            files: Vec::new(),
            project_id: None,
            camera_label: None,
            roll_name: None,
            generate_mhl: false,
            mhl_format: default_mhl_format(),
            mhl_paths: Vec::new(),
            required_copies: DEFAULT_REQUIRED_COPIES,
            verify_source: true,
            created_at: now,
            updated_at: now,
            completed_at: None,
            job_signature: None,
        }
    }

    /// Append an entry for a source file.
    pub fn add_file(&mut self, file_name: impl Into<String>, relative_path: Option<String>, file_size: u64) {
        self.files.push(RobustFileEntry::new(file_name, relative_path, file_size));
    }

    /// Sum of all file sizes.
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.file_size).sum()
    }

    pub fn failed_count(&self) -> usize {
        self.files.iter().filter(|f| f.state == FileState::Failed).count()
    }

    /// True only with zero failures and every file safe to delete.
    ///
    /// An empty job is never safe: nothing was verified.
    pub fn safe_to_format(&self) -> bool {
        !self.files.is_empty()
            && self.failed_count() == 0
            && self
                .files
                .iter()
                .all(|f| f.is_safe_to_delete_source(self.required_copies))
    }

    /// Re-queue failed files so the next run copies them again.
    ///
    /// Returns how many entries were reset. Their destination copies and
    /// checksums are cleared; the old error is dropped.
    pub fn reset_failed(&mut self) -> usize {
        let mut reset = 0;
        for entry in self.files.iter_mut().filter(|f| f.state == FileState::Failed) {
            let name = entry.file_name.clone();
            let rel = entry.relative_path.clone();
            *entry = RobustFileEntry::new(name, rel, entry.file_size);
            reset += 1;
        }
        if reset > 0 && self.phase == OffloadPhase::Failed {
            self.phase = OffloadPhase::Pending;
            self.completed_at = None;
        }
        reset
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verified_copy(path: &str) -> DestinationCopy {
        let mut copy = DestinationCopy::new(PathBuf::from(path));
        copy.mark_verified(FileChecksum::new("00", "ab"));
        copy
    }

    fn entry_with(copies: Vec<DestinationCopy>, source_verified: bool) -> RobustFileEntry {
        let mut entry = RobustFileEntry::new("clip001.mov", None, 10);
        entry.all_copies_verified = copies.iter().all(|c| c.verified);
        entry.destination_copies = copies;
        entry.source_verified = source_verified;
        entry.state = FileState::FullyVerified;
        entry
    }

    #[test]
    fn test_single_destination_is_never_safe() {
        let entry = entry_with(vec![verified_copy("/a/clip001.mov")], true);
        assert_eq!(entry.verified_copy_count(), 1);
        assert!(!entry.is_safe_to_delete_source(DEFAULT_REQUIRED_COPIES));
        assert!(!entry.is_safe_to_delete_source(1));
    }

    #[test]
    fn test_two_verified_destinations_are_safe() {
        let entry = entry_with(
            vec![verified_copy("/a/clip001.mov"), verified_copy("/b/clip001.mov")],
            true,
        );
        assert!(entry.is_safe_to_delete_source(DEFAULT_REQUIRED_COPIES));
        assert!(!entry.is_safe_to_delete_source(3));
    }

    #[test]
    fn test_mismatched_copy_blocks_safety() {
        let mut bad = DestinationCopy::new(PathBuf::from("/b/clip001.mov"));
        bad.mark_unverified(Some(FileChecksum::new("11", "cd")), "Checksum mismatch");
        let entry = entry_with(vec![verified_copy("/a/clip001.mov"), bad], true);

        assert_eq!(entry.verified_copy_count(), 1);
        assert!(!entry.all_copies_verified);
        assert!(!entry.is_safe_to_delete_source(DEFAULT_REQUIRED_COPIES));
    }

    #[test]
    fn test_unverified_source_blocks_safety() {
        let entry = entry_with(
            vec![verified_copy("/a/clip001.mov"), verified_copy("/b/clip001.mov")],
            false,
        );
        assert!(!entry.is_safe_to_delete_source(DEFAULT_REQUIRED_COPIES));
    }

    #[test]
    fn test_path_under_preserves_relative_structure() {
        let entry = RobustFileEntry::new("clip.mov", Some("CLIPS/A001".to_string()), 1);
        assert_eq!(
            entry.path_under(Path::new("/dest")),
            Path::new("/dest").join("CLIPS").join("A001").join("clip.mov")
        );
        assert_eq!(entry.display_name(), "CLIPS/A001/clip.mov");

        let flat = RobustFileEntry::new("clip.mov", Some(String::new()), 1);
        assert_eq!(flat.relative_path, None);
        assert_eq!(flat.path_under(Path::new("/dest")), Path::new("/dest").join("clip.mov"));
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&FileState::VerifyingSource).unwrap();
        assert_eq!(json, "\"verifying_source\"");
        let phase: OffloadPhase = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(phase, OffloadPhase::Cancelled);
        assert!(FileState::CopyComplete.is_copied());
        assert!(!FileState::Failed.is_copied());
        assert!(FileState::Failed.is_terminal());
    }

    #[test]
    fn test_reset_failed_requeues_entries() {
        let mut journal = OffloadJournal::new("job", PathBuf::from("/card"), vec![PathBuf::from("/a")]);
        journal.add_file("a.mov", None, 1);
        journal.add_file("b.mov", Some("sub".to_string()), 2);
        journal.files[1].fail("Source file not found");
        journal.phase = OffloadPhase::Failed;

        assert_eq!(journal.reset_failed(), 1);
        assert_eq!(journal.files[1].state, FileState::Pending);
        assert_eq!(journal.files[1].error_message, None);
        assert_eq!(journal.files[1].relative_path.as_deref(), Some("sub"));
        assert_eq!(journal.phase, OffloadPhase::Pending);
    }

    #[test]
    fn test_safe_to_format_requires_zero_failures() {
        let mut journal = OffloadJournal::new("job", PathBuf::from("/card"), vec![]);
        journal.files.push(entry_with(
            vec![verified_copy("/a/x"), verified_copy("/b/x")],
            true,
        ));
        assert!(journal.safe_to_format());

        journal.add_file("broken.mov", None, 3);
        journal.files[1].fail("boom");
        assert!(!journal.safe_to_format());
    }
}
