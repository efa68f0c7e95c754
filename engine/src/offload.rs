//! Offload orchestration.
//!
//! This module drives a journal through the offload lifecycle:
//! - Creating a journal from a source card and destination roots
//! - Phase 1: atomic copy of every file to every destination
//! - Phase 2: cache-bypassed re-read of every copy, then of the source
//! - Finalization: job signature, checksum lists, audit manifest, report
//!
//! Files are processed strictly one after another and the journal is
//! persisted after each one. Re-running a journal skips everything that
//! already passed the current phase, so resume is a plain re-run.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::{platform_dropper, verified_reread, CacheDropper};
use crate::error::EngineError;
use crate::fs_ops::{self, atomic_copy};
use crate::journal::{compute_job_signature, validate_job_id, JournalStore};
use crate::manifest::{export_audit_manifest, MhlGenerator};
use crate::model::{DestinationCopy, FileState, OffloadJournal, OffloadPhase, RobustFileEntry};
use crate::progress::OffloadObserver;

/// Aggregate statistics of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct OffloadReport {
    pub job_id: String,
    pub phase: OffloadPhase,
    pub total_files: usize,
    pub copied_files: usize,
    pub verified_files: usize,
    pub failed_files: usize,
    pub total_bytes: u64,
    pub copied_bytes: u64,
    /// The only signal that the source card may be erased.
    pub safe_to_format: bool,
    pub job_signature: Option<String>,
    pub audit_manifest: Option<PathBuf>,
}

impl OffloadReport {
    fn from_journal(journal: &OffloadJournal) -> Self {
        let copied: Vec<&RobustFileEntry> = journal
            .files
            .iter()
            .filter(|f| f.copy_completed_at.is_some())
            .collect();

        OffloadReport {
            job_id: journal.job_id.clone(),
            phase: journal.phase,
            total_files: journal.files.len(),
            copied_files: copied.len(),
            verified_files: journal
                .files
                .iter()
                .filter(|f| f.state == FileState::FullyVerified)
                .count(),
            failed_files: journal.failed_count(),
            total_bytes: journal.total_bytes(),
            copied_bytes: copied.iter().map(|f| f.file_size).sum(),
            safe_to_format: journal.safe_to_format(),
            job_signature: journal.job_signature.clone(),
            audit_manifest: None,
        }
    }
}

/// How a run ended. Failures of individual files are inside the report.
#[derive(Debug, Clone, PartialEq)]
pub enum OffloadOutcome {
    /// Both phases ran to the end (the report says whether files failed)
    Completed(OffloadReport),
    /// Stopped on request at a file boundary
    Cancelled(OffloadReport),
}

impl OffloadOutcome {
    pub fn report(&self) -> &OffloadReport {
        match self {
            OffloadOutcome::Completed(r) | OffloadOutcome::Cancelled(r) => r,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OffloadOutcome::Cancelled(_))
    }
}

/// Create a journal for copying `source` to every root in `destinations`.
///
/// Validates the paths and enumerates the source. A missing `job_id` gets a
/// fresh UUID. Source and destinations are stored resolved, so `raid/../raid`,
/// relative paths and symlinks to the same folder all compare equal.
///
/// # Errors
/// Returns EngineError if the source is missing, the job id is not file-name
/// safe, there are no destinations, or a destination overlaps the source or
/// another destination.
pub fn create_journal<P: AsRef<Path>>(
    job_id: Option<String>,
    source: P,
    destinations: &[PathBuf],
) -> Result<OffloadJournal, EngineError> {
    if let Some(id) = &job_id {
        validate_job_id(id)?;
    }
    if destinations.is_empty() {
        return Err(EngineError::InvalidJob {
            reason: "at least one destination is required".to_string(),
        });
    }
    if destinations.iter().any(|d| d.as_os_str().is_empty()) {
        return Err(EngineError::InvalidJob {
            reason: "destination path is empty".to_string(),
        });
    }

    let source = fs_ops::resolve_path(source.as_ref())?;
    let resolved = destinations
        .iter()
        .map(|d| fs_ops::resolve_path(d))
        .collect::<Result<Vec<_>, _>>()?;

    for (i, dest) in resolved.iter().enumerate() {
        if dest.starts_with(&source) || source.starts_with(dest) {
            return Err(EngineError::InvalidJob {
                reason: format!(
                    "destination {} overlaps source {}",
                    dest.display(),
                    source.display()
                ),
            });
        }
        if resolved[..i].contains(dest) {
            return Err(EngineError::InvalidJob {
                reason: format!("destination {} listed twice", dest.display()),
            });
        }
    }

    let files = fs_ops::enumerate_source(&source)?;
    let job_id = job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut journal = OffloadJournal::new(job_id, source, resolved);
    for file in files {
        journal.add_file(file.file_name, file.relative_path, file.file_size);
    }
    Ok(journal)
}

/// Runs one offload job.
///
/// Collaborators are injected: the cache dropper defaults to the platform
/// implementation, checksum-list generation is off unless a generator is set.
pub struct OffloadWorker {
    journal: OffloadJournal,
    store: JournalStore,
    cache_dropper: Box<dyn CacheDropper>,
    mhl_generator: Option<Box<dyn MhlGenerator>>,
    manifest_path: Option<PathBuf>,
    cancel: Arc<AtomicBool>,
    /// Built from a fresh journal; must not replace one already on disk.
    new_job: bool,
}

impl OffloadWorker {
    pub fn new(journal: OffloadJournal, store: JournalStore) -> Self {
        OffloadWorker {
            journal,
            store,
            cache_dropper: platform_dropper(),
            mhl_generator: None,
            manifest_path: None,
            cancel: Arc::new(AtomicBool::new(false)),
            new_job: true,
        }
    }

    /// Rebuild a worker from a persisted journal.
    pub fn resume(store: JournalStore, job_id: &str) -> Result<Self, EngineError> {
        let journal = store.load(job_id)?;
        info!(job_id, phase = %journal.phase, files = journal.files.len(), "resuming offload");
        let mut worker = Self::new(journal, store);
        worker.new_job = false;
        Ok(worker)
    }

    pub fn with_cache_dropper(mut self, dropper: Box<dyn CacheDropper>) -> Self {
        self.cache_dropper = dropper;
        self
    }

    pub fn with_mhl_generator(mut self, generator: Box<dyn MhlGenerator>) -> Self {
        self.mhl_generator = Some(generator);
        self
    }

    /// Write an audit manifest to `path` when the run finishes.
    pub fn with_audit_manifest(mut self, path: PathBuf) -> Self {
        self.manifest_path = Some(path);
        self
    }

    /// Flag checked between files. Set it to stop the run.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn journal(&self) -> &OffloadJournal {
        &self.journal
    }

    pub fn journal_mut(&mut self) -> &mut OffloadJournal {
        &mut self.journal
    }

    pub fn into_journal(self) -> OffloadJournal {
        self.journal
    }

    /// Run both phases and finalize.
    ///
    /// Individual file errors are recorded in the journal and never stop the
    /// job.
    ///
    /// # Errors
    /// Only job-level problems: another run holds the lock, a new job would
    /// overwrite an existing journal, or the journal cannot be persisted.
    pub fn run(&mut self, observer: Option<&dyn OffloadObserver>) -> Result<OffloadOutcome, EngineError> {
        let job_id = self.journal.job_id.clone();
        if self.journal.destination_paths.is_empty() {
            return Err(EngineError::InvalidJob {
                reason: "journal has no destinations".to_string(),
            });
        }

        let mut lock = self.store.open_lock(&job_id)?;
        let _guard = lock.try_write().map_err(|_| self.store.locked_error(&job_id))?;
        if self.new_job && self.store.exists(&job_id) {
            return Err(EngineError::JobExists {
                path: self.store.path_for(&job_id),
                job_id,
            });
        }
        self.new_job = false;

        info!(
            job_id = %job_id,
            source = %self.journal.source_path.display(),
            destinations = self.journal.destination_paths.len(),
            files = self.journal.files.len(),
            bytes = self.journal.total_bytes(),
            "starting offload"
        );
        self.journal.completed_at = None;

        self.set_phase(OffloadPhase::Copying, observer)?;
        for index in 0..self.journal.files.len() {
            if self.is_cancelled() {
                return self.finish_cancelled(observer);
            }
            self.journal.current_file_index = index;
            copy_entry(
                &mut self.journal.files[index],
                index,
                &self.journal.source_path,
                &self.journal.destination_paths,
                observer,
            );
            self.persist()?;
        }

        self.set_phase(OffloadPhase::Verifying, observer)?;
        for index in 0..self.journal.files.len() {
            if self.is_cancelled() {
                return self.finish_cancelled(observer);
            }
            self.journal.current_file_index = index;
            verify_entry(
                &mut self.journal.files[index],
                index,
                &self.journal.source_path,
                self.journal.verify_source,
                self.cache_dropper.as_ref(),
                observer,
            );
            self.persist()?;
        }

        self.finalize(observer)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn persist(&mut self) -> Result<(), EngineError> {
        self.journal.touch();
        self.store.save(&self.journal).map(|_| ())
    }

    fn set_phase(&mut self, phase: OffloadPhase, observer: Option<&dyn OffloadObserver>) -> Result<(), EngineError> {
        self.journal.phase = phase;
        self.persist()?;
        info!(job_id = %self.journal.job_id, %phase, "phase changed");
        if let Some(o) = observer {
            o.on_phase_changed(phase);
        }
        Ok(())
    }

    fn finish_cancelled(&mut self, observer: Option<&dyn OffloadObserver>) -> Result<OffloadOutcome, EngineError> {
        warn!(job_id = %self.journal.job_id, file_index = self.journal.current_file_index, "offload cancelled");
        self.set_phase(OffloadPhase::Cancelled, observer)?;
        let report = OffloadReport::from_journal(&self.journal);
        if let Some(o) = observer {
            o.on_job_completed(&report);
        }
        Ok(OffloadOutcome::Cancelled(report))
    }

    fn finalize(&mut self, observer: Option<&dyn OffloadObserver>) -> Result<OffloadOutcome, EngineError> {
        self.set_phase(OffloadPhase::Finalizing, observer)?;
        self.journal.job_signature = Some(compute_job_signature(&self.journal));

        if self.journal.generate_mhl {
            self.generate_checksum_lists();
        }

        let final_phase = if self.journal.failed_count() == 0 {
            OffloadPhase::Complete
        } else {
            OffloadPhase::Failed
        };
        self.journal.completed_at = Some(Utc::now());
        self.set_phase(final_phase, observer)?;

        let mut report = OffloadReport::from_journal(&self.journal);
        if let Some(path) = &self.manifest_path {
            match export_audit_manifest(&self.journal, path) {
                Ok(_) => report.audit_manifest = Some(path.clone()),
                Err(e) => error!(path = %path.display(), error = %e, "audit manifest export failed"),
            }
        }

        info!(
            job_id = %report.job_id,
            verified = report.verified_files,
            failed = report.failed_files,
            safe_to_format = report.safe_to_format,
            "offload finished"
        );
        if let Some(o) = observer {
            o.on_job_completed(&report);
        }
        Ok(OffloadOutcome::Completed(report))
    }

    /// One checksum list per folder that holds verified copies and has no
    /// list from an earlier run yet.
    fn generate_checksum_lists(&mut self) {
        let Some(generator) = self.mhl_generator.as_ref() else {
            warn!(job_id = %self.journal.job_id, "checksum lists requested but no generator configured");
            return;
        };

        let folders: BTreeSet<PathBuf> = self
            .journal
            .files
            .iter()
            .flat_map(|f| f.destination_copies.iter())
            .filter(|c| c.verified)
            .filter_map(|c| c.path.parent().map(Path::to_path_buf))
            .filter(|folder| {
                !self
                    .journal
                    .mhl_paths
                    .iter()
                    .any(|p| p.parent() == Some(folder.as_path()))
            })
            .collect();

        for folder in folders {
            let outcome = generator.generate(&folder, self.journal.mhl_format);
            match outcome.output_path {
                Some(path) if outcome.success => {
                    info!(folder = %folder.display(), output = %path.display(), "checksum list written");
                    if !self.journal.mhl_paths.contains(&path) {
                        self.journal.mhl_paths.push(path);
                    }
                }
                _ => {
                    for err in &outcome.errors {
                        warn!(folder = %folder.display(), error = %err, "checksum list generation failed");
                    }
                }
            }
        }
    }
}

/// Phase 1 for one entry: copy to every destination in order.
fn copy_entry(
    entry: &mut RobustFileEntry,
    index: usize,
    source_root: &Path,
    destination_roots: &[PathBuf],
    observer: Option<&dyn OffloadObserver>,
) {
    if entry.state.is_copied() || entry.state == FileState::Failed {
        return;
    }

    let name = entry.display_name();
    if let Some(o) = observer {
        o.on_file_started(index, &name);
    }

    let source = entry.path_under(source_root);
    if !source.is_file() {
        warn!(file = %name, source = %source.display(), "source file not found");
        entry.fail("Source file not found");
        notify_completed(observer, index, &name, entry);
        return;
    }

    entry.state = FileState::Copying;
    entry.copy_started_at = Some(Utc::now());
    entry.destination_copies = destination_roots
        .iter()
        .map(|root| DestinationCopy::new(entry.path_under(root)))
        .collect();

    let copies = destination_roots.len() as u64;
    for d in 0..entry.destination_copies.len() {
        let dest = entry.destination_copies[d].path.clone();
        let mut on_progress = |done: u64, total: u64| {
            if let Some(o) = observer {
                o.on_file_progress(index, d as u64 * total + done, total * copies);
            }
        };

        match atomic_copy(&source, &dest, Some(&mut on_progress)) {
            Ok(checksum) => {
                // Set once; a resumed entry keeps the digest of its first write.
                let first = entry
                    .source_checksum_on_copy
                    .get_or_insert_with(|| checksum.clone());
                if !first.matches(&checksum) {
                    warn!(
                        file = %name,
                        dest = %dest.display(),
                        expected = %first.sha256,
                        actual = %checksum.sha256,
                        "copy-time checksum differs from first destination"
                    );
                }
            }
            Err(e) => {
                warn!(file = %name, dest = %dest.display(), error = %e, "copy failed");
                let message = match e {
                    EngineError::SourceNotFound { .. } => "Source file not found".to_string(),
                    other => format!("Copy to {} failed: {}", dest.display(), error_chain(&other)),
                };
                entry.destination_copies[d].error = Some(message.clone());
                entry.fail(message);
                notify_completed(observer, index, &name, entry);
                return;
            }
        }
    }

    entry.state = FileState::CopyComplete;
    entry.copy_completed_at = Some(Utc::now());
    notify_completed(observer, index, &name, entry);
}

/// Phase 2 for one entry: verify every copy, then the source.
fn verify_entry(
    entry: &mut RobustFileEntry,
    index: usize,
    source_root: &Path,
    verify_source: bool,
    dropper: &dyn CacheDropper,
    observer: Option<&dyn OffloadObserver>,
) {
    if !entry.state.is_copied() || entry.state == FileState::FullyVerified {
        return;
    }

    let name = entry.display_name();
    if let Some(o) = observer {
        o.on_file_started(index, &name);
    }

    let Some(expected) = entry.source_checksum_on_copy.clone() else {
        entry.fail("No checksum recorded during copy");
        notify_completed(observer, index, &name, entry);
        return;
    };

    entry.state = FileState::VerifyingDest;
    let reads = entry.destination_copies.len() as u64 + u64::from(verify_source);
    let mut step = 0u64;

    for copy in entry.destination_copies.iter_mut() {
        let mut on_progress = |done: u64, total: u64| {
            if let Some(o) = observer {
                o.on_file_progress(index, step * total + done, total * reads);
            }
        };

        if !copy.path.is_file() {
            warn!(file = %name, dest = %copy.path.display(), "destination copy missing");
            copy.mark_unverified(None, "File not found");
        } else {
            match verified_reread(dropper, &copy.path, Some(&mut on_progress)) {
                Ok(actual) if expected.matches(&actual) => {
                    if expected.fast_hash_conflicts(&actual) {
                        warn!(file = %name, dest = %copy.path.display(), "xxhash64 disagrees while sha256 matches");
                    }
                    copy.mark_verified(actual);
                }
                Ok(actual) => {
                    warn!(
                        file = %name,
                        dest = %copy.path.display(),
                        expected = %expected.sha256,
                        actual = %actual.sha256,
                        "checksum mismatch"
                    );
                    copy.mark_unverified(Some(actual), "Checksum mismatch");
                }
                Err(e) if e.is_not_found() => copy.mark_unverified(None, "File not found"),
                Err(e) => copy.mark_unverified(None, error_chain(&e)),
            }
        }
        step += 1;
    }

    entry.state = FileState::DestVerified;
    entry.all_copies_verified =
        !entry.destination_copies.is_empty() && entry.destination_copies.iter().all(|c| c.verified);

    let mut source_problem = None;
    if verify_source {
        entry.state = FileState::VerifyingSource;
        let source = entry.path_under(source_root);
        let mut on_progress = |done: u64, total: u64| {
            if let Some(o) = observer {
                o.on_file_progress(index, step * total + done, total * reads);
            }
        };
        match verified_reread(dropper, &source, Some(&mut on_progress)) {
            Ok(actual) => {
                entry.source_verified = expected.matches(&actual);
                if !entry.source_verified {
                    warn!(
                        file = %name,
                        expected = %expected.sha256,
                        actual = %actual.sha256,
                        "source changed during offload"
                    );
                    source_problem = Some("Source changed during offload".to_string());
                }
                entry.source_checksum_reread = Some(actual);
            }
            Err(e) => {
                warn!(file = %name, error = %e, "source re-read failed");
                entry.source_verified = false;
                source_problem = Some(format!("Source re-read failed: {}", error_chain(&e)));
            }
        }
    } else {
        entry.source_verified = true;
    }

    if entry.source_verified && entry.all_copies_verified {
        entry.state = FileState::FullyVerified;
        entry.error_message = None;
        entry.verification_completed_at = Some(Utc::now());
    } else {
        let mut problems = Vec::new();
        if let Some(p) = source_problem {
            problems.push(p);
        }
        if !entry.all_copies_verified {
            problems.push(format!(
                "Only {} of {} copies verified",
                entry.verified_copy_count(),
                entry.destination_copies.len()
            ));
        }
        entry.fail(problems.join("; "));
    }
    notify_completed(observer, index, &name, entry);
}

fn notify_completed(observer: Option<&dyn OffloadObserver>, index: usize, name: &str, entry: &RobustFileEntry) {
    if let Some(o) = observer {
        o.on_file_completed(
            index,
            name,
            entry.state != FileState::Failed,
            entry.error_message.as_deref(),
        );
    }
}

/// `error: cause: cause` in one line.
fn error_chain(err: &EngineError) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoopDropper;
    use std::fs;
    use std::sync::Mutex;

    struct Setup {
        _dir: tempfile::TempDir,
        source: PathBuf,
        dests: Vec<PathBuf>,
        store: JournalStore,
    }

    fn setup(dest_count: usize) -> Setup {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = dir.path().join("card");
        fs::create_dir_all(source.join("A001")).expect("mkdir");
        fs::write(source.join("clip001.mov"), vec![1u8; 4096]).expect("write");
        fs::write(source.join("A001").join("clip002.mov"), vec![2u8; 2048]).expect("write");
        let dests = (0..dest_count)
            .map(|i| dir.path().join(format!("dest{}", i)))
            .collect();
        let store = JournalStore::new(dir.path().join("journals"));
        Setup {
            _dir: dir,
            source,
            dests,
            store,
        }
    }

    fn worker(s: &Setup) -> OffloadWorker {
        let journal = create_journal(Some("job".to_string()), &s.source, &s.dests).expect("create journal");
        OffloadWorker::new(journal, s.store.clone()).with_cache_dropper(Box::new(NoopDropper))
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl OffloadObserver for Recorder {
        fn on_phase_changed(&self, phase: OffloadPhase) {
            self.calls.lock().unwrap().push(format!("phase:{}", phase));
        }

        fn on_file_completed(&self, index: usize, _name: &str, success: bool, _error: Option<&str>) {
            self.calls.lock().unwrap().push(format!("file:{}:{}", index, success));
        }

        fn on_job_completed(&self, report: &OffloadReport) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("done:{}", report.safe_to_format));
        }
    }

    #[test]
    fn test_create_journal_enumerates_source() {
        let s = setup(2);
        let journal = create_journal(None, &s.source, &s.dests).expect("create journal");

        assert_eq!(journal.files.len(), 2);
        assert_eq!(journal.total_bytes(), 6144);
        assert_eq!(journal.phase, OffloadPhase::Pending);
        assert!(Uuid::parse_str(&journal.job_id).is_ok());
    }

    #[test]
    fn test_create_journal_rejects_bad_destinations() {
        let s = setup(1);
        assert!(create_journal(None, &s.source, &[]).is_err());
        assert!(create_journal(None, &s.source, &[s.source.join("backup")]).is_err());
        let twice = vec![s.dests[0].clone(), s.dests[0].clone()];
        assert!(create_journal(None, &s.source, &twice).is_err());
        assert!(create_journal(Some("../x".to_string()), &s.source, &s.dests).is_err());
    }

    #[test]
    fn test_create_journal_rejects_aliased_destinations() {
        let s = setup(1);
        let root = s.source.parent().unwrap().to_path_buf();
        fs::create_dir(root.join("x")).expect("mkdir");

        let dotdot = vec![root.join("a"), root.join("x").join("..").join("a")];
        assert!(matches!(
            create_journal(None, &s.source, &dotdot),
            Err(EngineError::InvalidJob { .. })
        ));

        let inside_source = vec![root.join("x").join("..").join("card").join("backup")];
        assert!(create_journal(None, &s.source, &inside_source).is_err());

        // Checking paths must not create them.
        assert!(!root.join("a").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_create_journal_rejects_symlinked_duplicate() {
        let s = setup(1);
        let root = s.source.parent().unwrap().to_path_buf();
        fs::create_dir(root.join("raid")).expect("mkdir");
        std::os::unix::fs::symlink(root.join("raid"), root.join("raid-link")).expect("symlink");

        let aliased = vec![root.join("raid"), root.join("raid-link")];
        assert!(create_journal(None, &s.source, &aliased).is_err());
    }

    #[test]
    fn test_create_journal_stores_resolved_paths() {
        let s = setup(1);
        let root = s.source.parent().unwrap().to_path_buf();
        let dest = root.join("card").join("..").join("dest0");

        let journal = create_journal(None, root.join(".").join("card"), &[dest]).expect("create journal");

        let canonical_root = fs::canonicalize(&root).expect("canonicalize");
        assert_eq!(journal.source_path, canonical_root.join("card"));
        assert_eq!(journal.destination_paths, vec![canonical_root.join("dest0")]);
    }

    #[test]
    fn test_new_job_does_not_replace_existing_journal() {
        let s = setup(2);
        worker(&s).run(None).expect("first run");
        let before = s.store.load("job").expect("load");

        fs::write(s.source.join("clip003.mov"), vec![3u8; 512]).expect("write");
        let result = worker(&s).run(None);

        assert!(matches!(result, Err(EngineError::JobExists { .. })));
        let after = s.store.load("job").expect("load");
        assert_eq!(after.files.len(), 2);
        assert_eq!(after.job_signature, before.job_signature);
        assert_eq!(after.phase, OffloadPhase::Complete);

        let mut resumed = OffloadWorker::resume(s.store.clone(), "job")
            .expect("resume")
            .with_cache_dropper(Box::new(NoopDropper));
        assert!(resumed.run(None).is_ok());
    }

    #[test]
    fn test_run_copies_and_verifies_everything() {
        let s = setup(2);
        let mut w = worker(&s);
        let recorder = Recorder::default();

        let outcome = w.run(Some(&recorder)).expect("run");

        let report = outcome.report();
        assert!(!outcome.is_cancelled());
        assert_eq!(report.phase, OffloadPhase::Complete);
        assert_eq!(report.verified_files, 2);
        assert_eq!(report.copied_bytes, 6144);
        assert!(report.safe_to_format);
        for dest in &s.dests {
            assert_eq!(fs::read(dest.join("A001").join("clip002.mov")).unwrap(), vec![2u8; 2048]);
        }
        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls.first().map(String::as_str), Some("phase:copying"));
        assert_eq!(calls.last().map(String::as_str), Some("done:true"));

        let persisted = s.store.load("job").expect("load");
        assert_eq!(persisted.phase, OffloadPhase::Complete);
        assert!(persisted.completed_at.is_some());
    }

    #[test]
    fn test_single_destination_is_not_safe_to_format() {
        let s = setup(1);
        let mut w = worker(&s);

        let outcome = w.run(None).expect("run");

        assert_eq!(outcome.report().verified_files, 2);
        assert!(!outcome.report().safe_to_format);
        assert!(w.journal().files.iter().all(|f| f.state == FileState::FullyVerified));
    }

    #[test]
    fn test_missing_source_fails_only_that_file() {
        let s = setup(2);
        let mut w = worker(&s);
        fs::remove_file(s.source.join("clip001.mov")).expect("remove");

        let outcome = w.run(None).expect("run");

        let journal = w.journal();
        let missing = journal.files.iter().find(|f| f.file_name == "clip001.mov").unwrap();
        assert_eq!(missing.state, FileState::Failed);
        assert_eq!(missing.error_message.as_deref(), Some("Source file not found"));
        let other = journal.files.iter().find(|f| f.file_name == "clip002.mov").unwrap();
        assert_eq!(other.state, FileState::FullyVerified);
        assert_eq!(outcome.report().phase, OffloadPhase::Failed);
        assert!(!outcome.report().safe_to_format);
    }

    #[test]
    fn test_cancel_before_start_persists_cancelled() {
        let s = setup(2);
        let mut w = worker(&s);
        w.cancel_handle().store(true, Ordering::SeqCst);

        let outcome = w.run(None).expect("run");

        assert!(outcome.is_cancelled());
        assert_eq!(outcome.report().copied_files, 0);
        assert_eq!(s.store.load("job").unwrap().phase, OffloadPhase::Cancelled);
        assert!(!s.dests[0].join("clip001.mov").exists());
    }

    #[test]
    fn test_corrupted_copy_is_detected() {
        struct Corrupting(PathBuf);
        impl CacheDropper for Corrupting {
            fn open_uncached(&self, path: &Path) -> std::io::Result<fs::File> {
                // Simulates a bad sector: the copy on this drive rots before verify.
                if path.starts_with(&self.0) {
                    fs::write(path, b"rotten")?;
                }
                fs::File::open(path)
            }
            fn name(&self) -> &'static str {
                "corrupting"
            }
        }

        let s = setup(2);
        let journal = create_journal(Some("job".to_string()), &s.source, &s.dests).unwrap();
        let bad_drive = journal.destination_paths[1].clone();
        let mut w = OffloadWorker::new(journal, s.store.clone()).with_cache_dropper(Box::new(Corrupting(bad_drive)));

        let outcome = w.run(None).expect("run");

        for entry in &w.journal().files {
            assert_eq!(entry.state, FileState::Failed);
            assert!(entry.destination_copies[0].verified);
            assert_eq!(entry.destination_copies[1].error.as_deref(), Some("Checksum mismatch"));
            assert_eq!(entry.error_message.as_deref(), Some("Only 1 of 2 copies verified"));
        }
        assert!(!outcome.report().safe_to_format);
    }

    #[test]
    fn test_disabled_source_verify_trusts_source() {
        let s = setup(2);
        let mut w = worker(&s);
        w.journal_mut().verify_source = false;

        w.run(None).expect("run");

        for entry in &w.journal().files {
            assert!(entry.source_verified);
            assert!(entry.source_checksum_reread.is_none());
        }
    }

    #[test]
    fn test_second_concurrent_run_is_rejected() {
        let s = setup(2);
        let mut w = worker(&s);
        let mut lock = s.store.open_lock("job").expect("lock");
        let _guard = lock.try_write().expect("hold lock");

        let result = w.run(None);
        assert!(matches!(result, Err(EngineError::JobLocked { .. })));
    }

    #[test]
    fn test_error_chain_includes_io_cause() {
        let err = EngineError::Write {
            path: PathBuf::from("/x"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        assert_eq!(error_chain(&err), "Failed to write file: /x: disk full");
    }
}
