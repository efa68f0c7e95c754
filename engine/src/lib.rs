//! # Offload Engine - Verified Camera-Card Offload Library
//!
//! A crash-resumable copy-and-verify engine for moving camera media to
//! several destinations with cryptographic proof that every copy is intact.
//! Designed as the foundation for multiple front ends (CLI, GUI, automation).
//!
//! ## Overview
//!
//! - Dual checksums (xxHash64 + SHA-256) computed in one streaming pass
//! - Atomic copies: a destination path never holds a partial file
//! - Verification re-reads with the OS page cache dropped
//! - Per-file state machine across N destination copies
//! - A durable JSON journal, rewritten atomically after every file
//! - Job signature, audit manifest and per-folder checksum lists
//!
//! ## Basic Usage
//!
//! ```no_run
//! use offload_engine::{create_journal, JournalStore, OffloadWorker};
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let destinations = vec![PathBuf::from("/Volumes/RAID"), PathBuf::from("/Volumes/Shuttle")];
//! let journal = create_journal(None, "/Volumes/A001", &destinations)?;
//! println!("Will offload {} files", journal.files.len());
//!
//! let mut worker = OffloadWorker::new(journal, JournalStore::new("/var/lib/offload"));
//! let outcome = worker.run(None)?;
//!
//! if outcome.report().safe_to_format {
//!     println!("Card may be formatted");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **checksums**: Dual-digest checksum engine
//! - **fs_ops**: Source enumeration, atomic copies and writes
//! - **cache**: Page-cache bypass for verification reads
//! - **model**: Journal, file entries, destination copies, state enums
//! - **journal**: Journal persistence, locking, job signature
//! - **manifest**: Audit manifest and checksum-list generation
//! - **offload**: Orchestration (create, run, resume, report)
//! - **progress**: Observer trait and channel adapter
//! - **worker**: Background thread runner
//! - **error**: Error types

pub mod cache;
pub mod checksums;
pub mod error;
pub mod fs_ops;
pub mod journal;
pub mod manifest;
pub mod model;
pub mod offload;
pub mod progress;
pub mod worker;

// Re-export main types and functions
pub use cache::{platform_dropper, CacheDropper, NoopDropper};
pub use checksums::{compute_checksum_from, compute_file_checksum, FileChecksum, HashAlgorithm};
pub use error::EngineError;
pub use journal::{compute_job_signature, load_journal, validate_job_id, JournalStore};
pub use manifest::{
    export_audit_manifest, verify_audit_manifest, AuditManifest, ChecksumListGenerator, MhlGenerator,
    MhlOutcome,
};
pub use model::{
    DestinationCopy, FileState, OffloadJournal, OffloadPhase, RobustFileEntry, DEFAULT_REQUIRED_COPIES,
    JOURNAL_VERSION,
};
pub use offload::{create_journal, OffloadOutcome, OffloadReport, OffloadWorker};
pub use progress::{ChannelObserver, OffloadEvent, OffloadObserver};
pub use worker::{spawn_offload, OffloadHandle};
