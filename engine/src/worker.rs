//! Background execution of an offload job.
//!
//! One dedicated thread per job. Progress is streamed over a crossbeam
//! channel; the caller keeps the cancel flag and the receiver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver};
use tracing::error;

use crate::error::EngineError;
use crate::model::OffloadJournal;
use crate::offload::{OffloadOutcome, OffloadWorker};
use crate::progress::{ChannelObserver, OffloadEvent};

type WorkerResult = Result<(OffloadOutcome, OffloadJournal), EngineError>;

/// Handle to an offload running on its own thread.
pub struct OffloadHandle {
    cancel: Arc<AtomicBool>,
    events: Receiver<OffloadEvent>,
    thread: JoinHandle<WorkerResult>,
}

impl OffloadHandle {
    /// Ask the worker to stop at the next file boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Progress events. The channel closes when the worker exits.
    pub fn events(&self) -> &Receiver<OffloadEvent> {
        &self.events
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the worker and return its outcome plus the final journal.
    pub fn join(self) -> WorkerResult {
        self.thread.join().unwrap_or_else(|_| {
            error!("offload worker thread panicked");
            Err(EngineError::Worker("thread panicked".to_string()))
        })
    }
}

/// Spawn a background thread that runs `worker` to completion.
///
/// # Errors
/// Returns EngineError if the OS refuses to start the thread.
pub fn spawn_offload(mut worker: OffloadWorker) -> Result<OffloadHandle, EngineError> {
    let cancel = worker.cancel_handle();
    let (tx, rx) = unbounded::<OffloadEvent>();

    let thread = thread::Builder::new()
        .name(format!("offload-{}", worker.journal().job_id))
        .spawn(move || -> WorkerResult {
            let observer = ChannelObserver::new(tx);
            let outcome = worker.run(Some(&observer))?;
            Ok((outcome, worker.into_journal()))
        })
        .map_err(|e| EngineError::Worker(format!("could not start thread: {}", e)))?;

    Ok(OffloadHandle {
        cancel,
        events: rx,
        thread,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoopDropper;
    use crate::journal::JournalStore;
    use crate::model::OffloadPhase;
    use crate::offload::create_journal;
    use std::fs;

    #[test]
    fn test_spawn_offload_streams_events_and_returns_journal() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = dir.path().join("card");
        fs::create_dir(&source).expect("mkdir");
        fs::write(source.join("clip001.mov"), b"frames").expect("write");
        let dests = vec![dir.path().join("a"), dir.path().join("b")];

        let journal = create_journal(Some("bg".to_string()), &source, &dests).expect("journal");
        let worker = OffloadWorker::new(journal, JournalStore::new(dir.path().join("journals")))
            .with_cache_dropper(Box::new(NoopDropper));

        let handle = spawn_offload(worker).expect("spawn");
        let events: Vec<OffloadEvent> = handle.events().iter().collect();
        let (outcome, journal) = handle.join().expect("worker result");

        assert!(outcome.report().safe_to_format);
        assert_eq!(journal.phase, OffloadPhase::Complete);
        assert!(matches!(events.last(), Some(OffloadEvent::JobCompleted { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, OffloadEvent::PhaseChanged { phase: OffloadPhase::Verifying })));
    }
}
