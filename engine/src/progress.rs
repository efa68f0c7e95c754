//! Progress reporting.
//!
//! `OffloadObserver` decouples the engine from any UI technology.
//! `ChannelObserver` forwards everything as `OffloadEvent`s over a crossbeam
//! channel for consumers on another thread, which is how the CLI renders
//! progress.
//!
//! All methods are called synchronously from the worker thread.

use crossbeam_channel::Sender;

use crate::model::OffloadPhase;
use crate::offload::OffloadReport;

/// Receives progress updates from a running offload.
pub trait OffloadObserver: Send + Sync {
    /// The job moved to a new phase.
    fn on_phase_changed(&self, _phase: OffloadPhase) {}

    /// A file is about to be copied or verified in the current phase.
    fn on_file_started(&self, _file_index: usize, _name: &str) {}

    /// Bytes processed for the current file in the current phase.
    fn on_file_progress(&self, _file_index: usize, _bytes_done: u64, _total_bytes: u64) {}

    /// A file finished the current phase.
    fn on_file_completed(&self, _file_index: usize, _name: &str, _success: bool, _error: Option<&str>) {}

    /// The run ended (completed, failed or cancelled).
    fn on_job_completed(&self, _report: &OffloadReport) {}
}

/// Events pushed by `ChannelObserver`.
#[derive(Debug, Clone, PartialEq)]
pub enum OffloadEvent {
    PhaseChanged {
        phase: OffloadPhase,
    },
    FileStarted {
        index: usize,
        name: String,
    },
    FileProgress {
        index: usize,
        bytes_done: u64,
        total_bytes: u64,
    },
    FileCompleted {
        index: usize,
        name: String,
        success: bool,
        error: Option<String>,
    },
    JobCompleted {
        report: OffloadReport,
    },
}

/// An `OffloadObserver` that sends updates to a channel.
///
/// Send errors are ignored: a consumer that went away must not stop the
/// offload.
pub struct ChannelObserver {
    sender: Sender<OffloadEvent>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<OffloadEvent>) -> Self {
        ChannelObserver { sender }
    }
}

impl OffloadObserver for ChannelObserver {
    fn on_phase_changed(&self, phase: OffloadPhase) {
        let _ = self.sender.send(OffloadEvent::PhaseChanged { phase });
    }

    fn on_file_started(&self, file_index: usize, name: &str) {
        let _ = self.sender.send(OffloadEvent::FileStarted {
            index: file_index,
            name: name.to_string(),
        });
    }

    fn on_file_progress(&self, file_index: usize, bytes_done: u64, total_bytes: u64) {
        let _ = self.sender.send(OffloadEvent::FileProgress {
            index: file_index,
            bytes_done,
            total_bytes,
        });
    }

    fn on_file_completed(&self, file_index: usize, name: &str, success: bool, error: Option<&str>) {
        let _ = self.sender.send(OffloadEvent::FileCompleted {
            index: file_index,
            name: name.to_string(),
            success,
            error: error.map(str::to_string),
        });
    }

    fn on_job_completed(&self, report: &OffloadReport) {
        let _ = self.sender.send(OffloadEvent::JobCompleted {
            report: report.clone(),
        });
    }
}
